//! Status subscription for the supervisor.
//!
//! The supervisor never calls back into worker code directly.  It hands every
//! [`StatusUpdate`] to a [`StatusSink`], and the usual sink is the sending half
//! of an unbounded Tokio channel whose receiver is drained by the owning
//! worker's relay task.

use skybridge_types::StatusUpdate;
use tokio::sync::mpsc;
use tracing::debug;

/// Receives every status transition of a [`Supervisor`][crate::Supervisor].
///
/// # Contract
///
/// * `notify` must not block: it is invoked from the supervisor's monitor
///   tasks and from `start`/`stop` callers.
/// * A sink whose consumer has gone away drops updates silently.
pub trait StatusSink: Send + Sync {
    fn notify(&self, update: StatusUpdate);
}

impl StatusSink for mpsc::UnboundedSender<StatusUpdate> {
    fn notify(&self, update: StatusUpdate) {
        if let Err(mpsc::error::SendError(update)) = self.send(update) {
            debug!(slot = %update.slot, kind = ?update.kind, "status receiver dropped");
        }
    }
}
