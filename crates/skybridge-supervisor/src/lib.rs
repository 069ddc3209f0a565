//! `skybridge-supervisor` – Single-Slot Task Supervisor
//!
//! Serialises access to named background tasks so that only one process runs
//! per slot, relays progress and error lines from that process to a status
//! sink, and exposes idempotent start/stop.
//!
//! # Modules
//!
//! - [`supervisor`] – [`Supervisor`][supervisor::Supervisor]: the slot table,
//!   `start`/`stop`/`status`, and the per-operation monitor task that owns the
//!   child process.
//! - [`classifier`] – [`OutputClassifier`][classifier::OutputClassifier]:
//!   ordered `(pattern, outcome)` rules; the first rule contained in a line
//!   decides whether the operation succeeded, failed, or carries on.
//! - [`sink`] – [`StatusSink`][sink::StatusSink]: where status transitions are
//!   delivered (usually a Tokio channel drained by a worker).
//! - [`command`] – [`CommandSpec`][command::CommandSpec]: program and argument
//!   list of a supervised or detached process.

pub mod classifier;
pub mod command;
pub mod sink;
pub mod supervisor;

pub use classifier::{LineOutcome, OutputClassifier, OutputRule};
pub use command::CommandSpec;
pub use sink::StatusSink;
pub use supervisor::{
    DEFAULT_EXIT_DRAIN, OperationHandle, SlotPolicy, SlotStatus, Supervisor, SupervisorOptions,
};
