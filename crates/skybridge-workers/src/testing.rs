//! Shared fixtures for worker tests: a scratch scripts directory, a bus
//! subscriber and bounded waits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use skybridge_middleware::EventBus;
use skybridge_supervisor::SupervisorOptions;
use skybridge_types::{HostEvent, HostMessage, StatusUpdate};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::registry::relay;
use crate::worker::{ScriptSet, Worker, WorkerContext};

const WAIT: Duration = Duration::from_secs(5);

pub struct TestBench {
    pub dir: TempDir,
    pub ctx: WorkerContext,
    events: broadcast::Receiver<HostEvent>,
    relays: Vec<JoinHandle<()>>,
}

impl TestBench {
    /// Write `(name, body)` scripts into a fresh directory.
    pub fn new(scripts: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in scripts {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        let bus = EventBus::default();
        let events = bus.subscribe();
        let mut ctx = WorkerContext::new(ScriptSet::new(dir.path(), "sh"), bus);
        ctx.supervisor_options = SupervisorOptions {
            exit_drain: Duration::from_millis(50),
        };
        Self {
            dir,
            ctx,
            events,
            relays: Vec::new(),
        }
    }

    pub fn relay_into(
        &mut self,
        worker: Arc<dyn Worker>,
        updates: mpsc::UnboundedReceiver<StatusUpdate>,
    ) {
        self.relays.push(relay(worker, updates));
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub async fn next_event(&mut self) -> HostMessage {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for a host event")
            .expect("bus closed")
            .message
    }

    /// Collect events up to and including the first one matching `pred`.
    pub async fn events_until(&mut self, pred: impl Fn(&HostMessage) -> bool) -> Vec<HostMessage> {
        let mut seen = Vec::new();
        loop {
            let message = self.next_event().await;
            let done = pred(&message);
            seen.push(message);
            if done {
                return seen;
            }
        }
    }

    /// Poll `file` until it has at least `min` lines; returns the final count.
    pub async fn wait_for_lines(&self, file: &str, min: usize) -> usize {
        let path = self.path(file);
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let count = std::fs::read_to_string(&path)
                .map(|s| s.lines().count())
                .unwrap_or(0);
            if count >= min || tokio::time::Instant::now() >= deadline {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestBench {
    fn drop(&mut self) {
        for handle in &self.relays {
            handle.abort();
        }
    }
}

pub fn speech_texts(events: &[HostMessage]) -> Vec<String> {
    events
        .iter()
        .filter_map(|m| match m {
            HostMessage::Speech { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}
