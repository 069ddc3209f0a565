//! Headless broadcast bus for host-facing messages.
//!
//! Uses a [`tokio::sync::broadcast`] channel under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  Workers push screen updates and speech; the host loop is the
//! usual subscriber and forwards each event to stdout.

use skybridge_types::{BridgeError, HostEvent, HostMessage};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 256;

/// Shared host-message bus.  Clone it cheaply – all clones share the same
/// underlying broadcast channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<HostEvent>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero (a Tokio broadcast restriction).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish `event` to every current subscriber.
    ///
    /// Returns the number of receivers that were handed the event.  Having no
    /// subscribers is a normal condition and yields `Ok(0)`.
    pub fn publish(&self, event: HostEvent) -> Result<usize, BridgeError> {
        match self.tx.send(event) {
            Ok(n) => Ok(n),
            Err(broadcast::error::SendError(event)) => {
                trace!(worker = %event.worker, "host event dropped: no subscribers");
                Ok(0)
            }
        }
    }

    /// Convenience wrapper building the [`HostEvent`] for `worker`.
    pub fn push(&self, worker: &str, message: HostMessage) -> Result<usize, BridgeError> {
        self.publish(HostEvent::new(worker, message))
    }

    /// Subscribe to every event published after this call.
    ///
    /// `Err(Lagged(n))` from the receiver means `n` events were dropped for
    /// this subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skybridge_types::SpeechType;

    fn speech(text: &str) -> HostMessage {
        HostMessage::Speech {
            text: text.to_string(),
            speech_type: SpeechType::Text,
        }
    }

    fn screen(screen_id: &str) -> HostMessage {
        HostMessage::ScreenUpdate {
            screen_id: screen_id.to_string(),
            panel_id: None,
            values: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let event = HostEvent::new("camera", speech("picture taken"));
        bus.publish(event.clone())?;

        let received = rx.recv().await?;
        assert_eq!(received.id, event.id);
        assert_eq!(received.worker, "camera");
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_ok_zero() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.push("camera", speech("nobody listens")).unwrap(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_message_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut host = bus.subscribe();
        let mut other = bus.clone().subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        assert_eq!(bus.push("launch_drone", screen("video"))?, 2);
        assert_eq!(bus.push("camera", speech("picture taken"))?, 2);

        for rx in [&mut host, &mut other] {
            assert_eq!(rx.recv().await?.message, screen("video"));
            assert_eq!(rx.recv().await?.message, speech("picture taken"));
        }
        Ok(())
    }

    #[tokio::test]
    async fn lagging_subscriber_reports_lag() {
        let bus = EventBus::new(8);
        let mut slow = bus.subscribe();
        for i in 0..100 {
            let _ = bus.push("camera", speech(&format!("msg {i}")));
        }
        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
