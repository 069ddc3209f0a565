//! [`WorkerRegistry`] – worker lookup and request dispatcher.
//!
//! The registry owns every registered [`Worker`] and one relay task per
//! worker.  The relay drains the worker's supervisor updates and hands them
//! to [`Worker::on_status`], which turns them into host messages.
//!
//! Requests arrive as `{worker, id, ...payload}`; the registry resolves the
//! worker by id and forwards the request.  Unknown workers get an
//! `ok: false` reply.

use std::collections::HashMap;
use std::sync::Arc;

use skybridge_types::{BridgeError, StatusUpdate, WorkerReply, WorkerRequest};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::camera::CameraWorker;
use crate::launch::LaunchWorker;
use crate::start_panel::StartPanelWorker;
use crate::worker::{Worker, WorkerContext};

/// Ids accepted by [`WorkerRegistry::with_builtin`].
pub const BUILTIN_WORKERS: [&str; 3] = [
    crate::camera::ID,
    crate::launch::ID,
    crate::start_panel::ID,
];

/// Spawn the task feeding `updates` into `worker`.
pub fn relay(
    worker: Arc<dyn Worker>,
    mut updates: mpsc::UnboundedReceiver<StatusUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            if let Some(err) = update.as_error() {
                warn!(worker = worker.id(), operation_id = %update.operation_id, error = %err, "runtime failure");
            }
            worker.on_status(&update);
        }
        debug!(worker = worker.id(), "status relay finished");
    })
}

/// Central worker registry.
///
/// Must be used from within a Tokio runtime: registering a worker spawns its
/// relay task.  Dropping the registry aborts the relays.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
    relays: Vec<JoinHandle<()>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry with the named built-in workers.
    ///
    /// # Errors
    ///
    /// [`BridgeError::UnknownWorker`] for an id outside [`BUILTIN_WORKERS`].
    pub fn with_builtin<S: AsRef<str>>(
        ctx: &WorkerContext,
        ids: &[S],
    ) -> Result<Self, BridgeError> {
        let mut registry = Self::new();
        for id in ids {
            match id.as_ref() {
                crate::camera::ID => {
                    let (worker, updates) = CameraWorker::new(ctx)?;
                    registry.register(Arc::new(worker), updates);
                }
                crate::launch::ID => {
                    let (worker, updates) = LaunchWorker::new(ctx)?;
                    registry.register(Arc::new(worker), updates);
                }
                crate::start_panel::ID => {
                    let (worker, updates) = StartPanelWorker::new(ctx)?;
                    registry.register(Arc::new(worker), updates);
                }
                other => return Err(BridgeError::UnknownWorker(other.to_string())),
            }
        }
        Ok(registry)
    }

    /// Register `worker` and start relaying `updates` to it.  A previously
    /// registered worker with the same id is replaced.
    pub fn register(
        &mut self,
        worker: Arc<dyn Worker>,
        updates: mpsc::UnboundedReceiver<StatusUpdate>,
    ) {
        info!(worker = worker.id(), name = worker.name(), "worker registered");
        self.relays.push(relay(Arc::clone(&worker), updates));
        self.workers.insert(worker.id().to_string(), worker);
    }

    /// Route `request` to its worker.
    pub fn dispatch(&self, request: &WorkerRequest) -> WorkerReply {
        let Some(worker) = self.workers.get(&request.worker) else {
            warn!(worker = %request.worker, id = %request.id, "request for unknown worker");
            return BridgeError::UnknownWorker(request.worker.clone()).into();
        };
        debug!(worker = %request.worker, id = %request.id, "dispatching request");
        let reply = worker.handle_request(request);
        if !reply.ok {
            info!(worker = %request.worker, id = %request.id, message = ?reply.message, "request rejected");
        }
        reply
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Worker>> {
        self.workers.get(id)
    }

    /// Registered worker ids, sorted.
    pub fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every pending operation of every worker.  Returns how many stops
    /// were issued.  Nodes that already reported keep running.
    pub fn shutdown(&self) -> usize {
        let mut stopped = 0;
        for worker in self.workers.values() {
            let slots = worker.supervisor().stop_all();
            if !slots.is_empty() {
                info!(worker = worker.id(), ?slots, "stopped running slots");
            }
            stopped += slots.len();
        }
        stopped
    }
}

impl Drop for WorkerRegistry {
    fn drop(&mut self) {
        for handle in &self.relays {
            handle.abort();
        }
    }
}
