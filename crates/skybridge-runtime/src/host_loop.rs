//! [`HostLoop`] – the line-oriented JSON bridge between the GCS host and the
//! worker registry.
//!
//! The host writes one request per line:
//!
//! ```text
//! {"worker":"camera","id":"take_picture","image_mode":"video"}
//! ```
//!
//! Every request gets exactly one reply line, and every host message a worker
//! pushes on the [`EventBus`] is written as it arrives:
//!
//! ```text
//! {"type":"reply","worker":"camera","ok":true,"message":"picture requested"}
//! {"type":"screen_update","worker":"camera","screen_id":"flight",...}
//! {"type":"speech","worker":"camera","text":"picture taken","speech_type":"text",...}
//! ```

use std::future::Future;

use serde::Serialize;
use skybridge_middleware::EventBus;
use skybridge_types::{BridgeError, HostEvent, WorkerReply, WorkerRequest};
use skybridge_workers::WorkerRegistry;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info, warn};

/// Reply line written for every request.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Reply {
        #[serde(skip_serializing_if = "Option::is_none")]
        worker: Option<&'a str>,
        #[serde(flatten)]
        reply: &'a WorkerReply,
    },
}

/// Why [`HostLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The host closed its end of the input stream.
    InputClosed,
    /// The shutdown future completed.
    Shutdown,
}

pub struct HostLoop {
    registry: WorkerRegistry,
    bus: EventBus,
}

impl HostLoop {
    pub fn new(registry: WorkerRegistry, bus: EventBus) -> Self {
        Self { registry, bus }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Serve `input` until it closes or `shutdown` resolves.
    ///
    /// On the way out every pending operation is stopped and any host messages
    /// already queued are flushed to `output`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Channel`] when reading `input` or writing `output`
    /// fails.
    pub async fn run<R, W, F>(
        &self,
        input: R,
        mut output: W,
        shutdown: F,
    ) -> Result<ExitReason, BridgeError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        let mut lines = input.lines();
        let mut events = self.bus.subscribe();
        tokio::pin!(shutdown);

        info!(workers = ?self.registry.worker_ids(), "host loop started");
        let reason = loop {
            tokio::select! {
                () = &mut shutdown => break ExitReason::Shutdown,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let reply = self.handle_line(&line);
                        write_line(&mut output, &reply).await?;
                    }
                    Ok(None) => break ExitReason::InputClosed,
                    Err(e) => return Err(BridgeError::Channel(format!("reading host input: {e}"))),
                },
                event = events.recv() => match event {
                    Ok(event) => write_line(&mut output, &encode_event(&event)?).await?,
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "host output lagged behind the bus"),
                    Err(RecvError::Closed) => break ExitReason::InputClosed,
                },
            }
        };

        info!(?reason, "host loop stopping");
        let stopped = self.registry.shutdown();
        if stopped > 0 {
            info!(stopped, "stopped running operations");
        }

        loop {
            match events.try_recv() {
                Ok(event) => write_line(&mut output, &encode_event(&event)?).await?,
                Err(TryRecvError::Lagged(n)) => warn!(skipped = n, "host output lagged behind the bus"),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        output
            .flush()
            .await
            .map_err(|e| BridgeError::Channel(format!("flushing host output: {e}")))?;
        Ok(reason)
    }

    /// Decode one request line, dispatch it and encode the reply.
    pub fn handle_line(&self, line: &str) -> String {
        match serde_json::from_str::<WorkerRequest>(line) {
            Ok(request) => {
                debug!(worker = %request.worker, id = %request.id, "host request");
                let reply = self.registry.dispatch(&request);
                encode_reply(Some(&request.worker), &reply)
            }
            Err(e) => {
                warn!(error = %e, "malformed host request");
                let reply: WorkerReply = BridgeError::Serialization(e.to_string()).into();
                encode_reply(None, &reply)
            }
        }
    }
}

fn encode_reply(worker: Option<&str>, reply: &WorkerReply) -> String {
    let outbound = Outbound::Reply { worker, reply };
    // A reply is a string and a bool; serialisation cannot fail.
    serde_json::to_string(&outbound).unwrap_or_else(|_| r#"{"type":"reply","ok":false}"#.to_string())
}

fn encode_event(event: &HostEvent) -> Result<String, BridgeError> {
    serde_json::to_string(event).map_err(|e| BridgeError::Serialization(e.to_string()))
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> Result<(), BridgeError> {
    let write = async {
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await
    };
    write
        .await
        .map_err(|e| BridgeError::Channel(format!("writing host output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use skybridge_workers::{ScriptSet, WorkerContext};
    use std::time::Duration;
    use tokio::io::{BufReader, DuplexStream, Lines};

    fn host_loop(scripts: &std::path::Path) -> HostLoop {
        let bus = EventBus::default();
        let ctx = WorkerContext::new(ScriptSet::new(scripts, "sh"), bus.clone());
        let registry =
            WorkerRegistry::with_builtin(&ctx, &skybridge_workers::BUILTIN_WORKERS).unwrap();
        HostLoop::new(registry, bus)
    }

    async fn next_json(lines: &mut Lines<BufReader<DuplexStream>>) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("timed out waiting for output")
            .unwrap()
            .expect("output closed");
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn handle_line_replies_for_unknown_worker() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_loop(dir.path());
        let reply: Value =
            serde_json::from_str(&host.handle_line(r#"{"worker":"joystick","id":"left"}"#))
                .unwrap();
        assert_eq!(reply["type"], "reply");
        assert_eq!(reply["worker"], "joystick");
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["message"], "No worker with id joystick");
    }

    #[tokio::test]
    async fn handle_line_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_loop(dir.path());
        let reply: Value = serde_json::from_str(&host.handle_line("{not json")).unwrap();
        assert_eq!(reply["ok"], false);
        assert!(reply.get("worker").is_none());
        assert!(reply["message"].as_str().unwrap().starts_with("Serialization Error"));
    }

    #[tokio::test]
    async fn replies_and_events_are_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_loop(dir.path());

        let (mut host_in, bridge_in) = tokio::io::duplex(4096);
        let (bridge_out, host_out) = tokio::io::duplex(4096);
        let mut out_lines = BufReader::new(host_out).lines();

        let served = tokio::spawn(async move {
            host.run(BufReader::new(bridge_in), bridge_out, std::future::pending())
                .await
        });

        host_in
            .write_all(b"\n{\"worker\":\"start_panel\",\"id\":\"ros_mavros_start\"}\n")
            .await
            .unwrap();

        let mut seen = vec![next_json(&mut out_lines).await, next_json(&mut out_lines).await];
        seen.sort_by_key(|v| v["type"].as_str().unwrap_or_default().to_string());
        assert_eq!(seen[0]["type"], "reply");
        assert_eq!(seen[0]["ok"], true);
        assert_eq!(seen[1]["type"], "screen_update");
        assert_eq!(seen[1]["worker"], "start_panel");
        assert_eq!(seen[1]["values"]["do_dialog3"]["background"], "#ff39aa00");

        drop(host_in);
        let reason = served.await.unwrap().unwrap();
        assert_eq!(reason, ExitReason::InputClosed);
    }

    #[tokio::test]
    async fn shutdown_future_stops_running_operations() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("takepicture.sh"),
            "case \"$1\" in stop) ;; *) sleep 30 ;; esac",
        )
        .unwrap();
        let host = host_loop(dir.path());

        let (mut host_in, bridge_in) = tokio::io::duplex(4096);
        let (bridge_out, host_out) = tokio::io::duplex(4096);
        let mut out_lines = BufReader::new(host_out).lines();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let served = tokio::spawn(async move {
            let reason = host
                .run(BufReader::new(bridge_in), bridge_out, async {
                    let _ = stop_rx.await;
                })
                .await;
            (reason, host)
        });

        host_in
            .write_all(b"{\"worker\":\"camera\",\"id\":\"take_picture\"}\n")
            .await
            .unwrap();
        loop {
            let line = next_json(&mut out_lines).await;
            if line["type"] == "reply" {
                assert_eq!(line["ok"], true);
                break;
            }
        }

        stop_tx.send(()).unwrap();
        let (reason, host) = served.await.unwrap();
        assert_eq!(reason.unwrap(), ExitReason::Shutdown);

        let camera = host.registry().get("camera").unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while camera.supervisor().is_running("picture") {
            assert!(tokio::time::Instant::now() < deadline, "picture slot never released");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
