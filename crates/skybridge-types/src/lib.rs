use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Which standard stream of a child process a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Lifecycle state of the operation bound to a slot.
///
/// `Succeeded` and `Failed` are transient: once the handle is released the
/// slot is back to `Idle` and immediately startable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum OperationState {
    Idle,
    Running,
    Succeeded,
    Failed(String),
}

/// Notification emitted by the supervisor on every slot transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub slot: String,
    pub operation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: StatusKind,
}

impl StatusUpdate {
    pub fn new(slot: impl Into<String>, operation_id: Uuid, kind: StatusKind) -> Self {
        Self {
            slot: slot.into(),
            operation_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// The runtime failure carried by a `Failed` update.
    pub fn as_error(&self) -> Option<BridgeError> {
        match &self.kind {
            StatusKind::Failed { reason, .. } => Some(BridgeError::RuntimeFailure {
                slot: self.slot.clone(),
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// What happened to an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusKind {
    /// The child process was spawned and the slot is now `Running`.
    Started { command: String },
    /// A success pattern matched `line`.
    Succeeded { line: String },
    /// A failure pattern matched, or the process exited with a non-zero code
    /// under a policy that treats that as a failure.
    Failed {
        reason: String,
        /// The output line that matched, if the failure came from output.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<String>,
    },
    /// `stop` was accepted for a running operation.
    StopRequested,
    /// The slot's stop command was launched automatically after a failure.
    CompensatingStop,
    /// The process exited while still owning its slot.
    Released { exit_code: Option<i32> },
}

/// Severity of a speech/toast message shown by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechType {
    Text,
    Error,
}

/// Host-facing message pushed by a worker.
///
/// The schema of `values` belongs to the host; workers only fill in the keys
/// their panels declare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    ScreenUpdate {
        screen_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        panel_id: Option<String>,
        values: serde_json::Value,
    },
    Speech {
        text: String,
        speech_type: SpeechType,
    },
}

/// A [`HostMessage`] stamped with its originating worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"camera"`
    pub worker: String,
    #[serde(flatten)]
    pub message: HostMessage,
}

impl HostEvent {
    pub fn new(worker: impl Into<String>, message: HostMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            worker: worker.into(),
            message,
        }
    }
}

/// A structured request delivered by the host: `{worker, id, ...payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub worker: String,
    pub id: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl WorkerRequest {
    pub fn new(worker: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            id: id.into(),
            payload: serde_json::Map::new(),
        }
    }

    /// Builder-style helper to attach a payload field.
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Whether any payload value (at any depth) contains `needle`.
    ///
    /// Panels encode the selected mode in free-form fields, so workers only
    /// look for the mode keyword.
    pub fn mentions(&self, needle: &str) -> bool {
        fn walk(value: &serde_json::Value, needle: &str) -> bool {
            match value {
                serde_json::Value::String(s) => s.contains(needle),
                serde_json::Value::Array(items) => items.iter().any(|v| walk(v, needle)),
                serde_json::Value::Object(map) => {
                    map.iter().any(|(k, v)| k.contains(needle) || walk(v, needle))
                }
                _ => false,
            }
        }
        self.payload
            .iter()
            .any(|(k, v)| k.contains(needle) || walk(v, needle))
    }
}

/// Synchronous answer to a [`WorkerRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkerReply {
    pub fn ok() -> Self {
        Self { ok: true, message: None }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
        }
    }
}

impl From<BridgeError> for WorkerReply {
    fn from(err: BridgeError) -> Self {
        WorkerReply::error(err.to_string())
    }
}

/// Error type shared by the supervisor, the workers and the host loop.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("Slot '{slot}' is already running")]
    AlreadyRunning { slot: String },

    #[error("Slot '{slot}' is not running")]
    NotRunning { slot: String },

    #[error("Failed to spawn process for slot '{slot}': {details}")]
    SpawnFailure { slot: String, details: String },

    #[error("Runtime failure on slot '{slot}': {reason}")]
    RuntimeFailure { slot: String, reason: String },

    #[error("No worker with id {0}")]
    UnknownWorker(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),
}
