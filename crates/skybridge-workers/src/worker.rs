//! Generic [`Worker`] trait and the plumbing every worker shares.

use std::path::PathBuf;
use std::sync::Arc;

use skybridge_middleware::EventBus;
use skybridge_supervisor::{CommandSpec, Supervisor, SupervisorOptions};
use skybridge_types::{HostMessage, SpeechType, StatusUpdate, WorkerReply, WorkerRequest};
use tokio::sync::mpsc;
use tracing::warn;

/// A GCS worker: maps host requests onto its own supervisor's slots and
/// turns the supervisor's status updates into host messages.
///
/// Workers register themselves with a
/// [`WorkerRegistry`][crate::registry::WorkerRegistry].
pub trait Worker: Send + Sync {
    /// Stable identifier the host addresses, e.g. `"camera"`.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Handle one request synchronously.  Unknown ids reply `ok: false`.
    fn handle_request(&self, request: &WorkerRequest) -> WorkerReply;

    /// React to a transition reported by this worker's supervisor.
    fn on_status(&self, update: &StatusUpdate);

    /// The supervisor owning this worker's slots.
    fn supervisor(&self) -> &Supervisor;
}

/// Reply for a request id the worker does not know.
pub fn unknown_request(request: &WorkerRequest) -> WorkerReply {
    WorkerReply::error(format!("No message with id {}", request.id))
}

// ────────────────────────────────────────────────────────────────────────────
// Scripts
// ────────────────────────────────────────────────────────────────────────────

/// Where worker scripts live and how they are run.
#[derive(Debug, Clone)]
pub struct ScriptSet {
    pub dir: PathBuf,
    pub shell: String,
}

impl ScriptSet {
    pub fn new(dir: impl Into<PathBuf>, shell: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            shell: shell.into(),
        }
    }

    /// `<shell> <dir>/<script> <args…>`
    pub fn command(&self, script: &str, args: &[&str]) -> CommandSpec {
        CommandSpec::script(
            &self.shell,
            self.dir.join(script).to_string_lossy().into_owned(),
            args.iter().copied(),
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Context
// ────────────────────────────────────────────────────────────────────────────

/// Everything a worker needs at construction.
#[derive(Clone)]
pub struct WorkerContext {
    pub scripts: ScriptSet,
    pub bus: EventBus,
    pub supervisor_options: SupervisorOptions,
    /// Applied to every slot policy the workers register.
    pub fail_on_nonzero_exit: bool,
}

impl WorkerContext {
    pub fn new(scripts: ScriptSet, bus: EventBus) -> Self {
        Self {
            scripts,
            bus,
            supervisor_options: SupervisorOptions::default(),
            fail_on_nonzero_exit: false,
        }
    }

    /// A fresh supervisor plus the receiver its updates arrive on.
    pub fn supervisor(&self) -> (Supervisor, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Supervisor::with_options(Arc::new(tx), self.supervisor_options.clone()),
            rx,
        )
    }

    pub fn link(&self, worker: &str) -> HostLink {
        HostLink {
            worker: worker.to_string(),
            bus: self.bus.clone(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Host link
// ────────────────────────────────────────────────────────────────────────────

/// Pushes host messages stamped with one worker's id.
#[derive(Clone)]
pub struct HostLink {
    worker: String,
    bus: EventBus,
}

impl HostLink {
    pub fn say(&self, text: impl Into<String>) {
        self.push(HostMessage::Speech {
            text: text.into(),
            speech_type: SpeechType::Text,
        });
    }

    pub fn error(&self, text: impl Into<String>) {
        self.push(HostMessage::Speech {
            text: text.into(),
            speech_type: SpeechType::Error,
        });
    }

    pub fn screen_update(&self, screen_id: &str, panel_id: Option<&str>, values: serde_json::Value) {
        self.push(HostMessage::ScreenUpdate {
            screen_id: screen_id.to_string(),
            panel_id: panel_id.map(str::to_string),
            values,
        });
    }

    fn push(&self, message: HostMessage) {
        if let Err(e) = self.bus.push(&self.worker, message) {
            warn!(worker = %self.worker, error = %e, "failed to push host message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_command_joins_dir_and_args() {
        let scripts = ScriptSet::new("/opt/skybridge/scripts", "sh");
        let cmd = scripts.command("takepicture.sh", &["stop"]);
        assert_eq!(cmd.program, "sh");
        assert_eq!(cmd.args, vec!["/opt/skybridge/scripts/takepicture.sh", "stop"]);
    }

    #[test]
    fn unknown_request_names_the_id() {
        let reply = unknown_request(&WorkerRequest::new("camera", "open_settings"));
        assert!(!reply.ok);
        assert_eq!(reply.message.as_deref(), Some("No message with id open_settings"));
    }

    #[tokio::test]
    async fn host_link_stamps_worker_id() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let link = WorkerContext::new(ScriptSet::new(".", "sh"), bus).link("camera");

        link.error("Process already running!");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.worker, "camera");
        assert_eq!(
            event.message,
            HostMessage::Speech {
                text: "Process already running!".into(),
                speech_type: SpeechType::Error,
            }
        );
    }
}
