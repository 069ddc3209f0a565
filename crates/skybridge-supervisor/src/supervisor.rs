//! [`Supervisor`] – single-slot task supervisor.
//!
//! A *slot* is a named category of background task (`"picture"`,
//! `"recording"`, `"launch"` …) that may own at most one running child process
//! at a time.  [`Supervisor::start`] spawns the process and returns
//! immediately; a monitor task then classifies every output line with the
//! slot's [`OutputClassifier`] and reports transitions to the
//! [`StatusSink`] given at construction.
//!
//! ```text
//!            start                 success line
//!   Idle ───────────▶ Running ───────────────────▶ Succeeded ─┐
//!    ▲                  │  │       failure line                │ release
//!    │                  │  └──────────────────────▶ Failed ────┤
//!    │                  │ exit, nothing matched                │
//!    └──────────────────┴──────────────────────────────────────┘
//! ```
//!
//! Terminal states release the slot immediately, so a slot is startable again
//! as soon as its outcome is known, even if the process itself keeps running.
//! Slots whose process *is* the long-running thing (a ROS node, a recorder)
//! set [`SlotPolicy::hold_until_exit`]: the outcome is still reported at once,
//! but the slot stays owned until the process exits.
//!
//! A process is killed when the supervisor goes away only while its outcome
//! is still pending.  Once an operation has reported success or failure its
//! process is left alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use skybridge_types::{BridgeError, OperationState, OutputStream, StatusKind, StatusUpdate};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{LineOutcome, OutputClassifier};
use crate::command::{forward_lines, launch_detached, CommandSpec};
use crate::sink::StatusSink;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// How long output is still read after the process has exited.  Grandchildren
/// that inherited the pipes may keep them open indefinitely.
pub const DEFAULT_EXIT_DRAIN: Duration = Duration::from_millis(250);

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Per-slot behaviour.
#[derive(Debug, Clone)]
pub struct SlotPolicy {
    /// Rules applied to every output line.
    pub classifier: OutputClassifier,
    /// Command launched by [`Supervisor::stop`] and by the compensating stop.
    pub stop_command: Option<CommandSpec>,
    /// Whether [`Supervisor::stop`] kills the running process.
    pub kill_on_stop: bool,
    /// Launch `stop_command` automatically when the operation fails.
    pub compensate_on_failure: bool,
    /// Treat a non-zero exit without a classified outcome as a failure.
    pub fail_on_nonzero_exit: bool,
    /// Keep the slot owned after a success or failure line until the process
    /// exits.
    pub hold_until_exit: bool,
}

impl Default for SlotPolicy {
    fn default() -> Self {
        Self {
            classifier: OutputClassifier::default(),
            stop_command: None,
            kill_on_stop: true,
            compensate_on_failure: false,
            fail_on_nonzero_exit: false,
            hold_until_exit: false,
        }
    }
}

impl SlotPolicy {
    pub fn new(classifier: OutputClassifier) -> Self {
        Self {
            classifier,
            ..Self::default()
        }
    }

    pub fn with_stop_command(mut self, command: CommandSpec) -> Self {
        self.stop_command = Some(command);
        self
    }

    pub fn kill_on_stop(mut self, kill: bool) -> Self {
        self.kill_on_stop = kill;
        self
    }

    pub fn compensate_on_failure(mut self, compensate: bool) -> Self {
        self.compensate_on_failure = compensate;
        self
    }

    pub fn fail_on_nonzero_exit(mut self, fail: bool) -> Self {
        self.fail_on_nonzero_exit = fail;
        self
    }

    pub fn hold_until_exit(mut self, hold: bool) -> Self {
        self.hold_until_exit = hold;
        self
    }
}

/// Supervisor-wide options.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// See [`DEFAULT_EXIT_DRAIN`].
    pub exit_drain: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            exit_drain: DEFAULT_EXIT_DRAIN,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public views
// ─────────────────────────────────────────────────────────────────────────────

/// Returned by [`Supervisor::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    pub slot: String,
    pub operation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub command: String,
}

/// Snapshot returned by [`Supervisor::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    pub slot: String,
    /// `Running` while an operation owns the slot, `Idle` otherwise.
    pub state: OperationState,
    pub operation_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    /// How the most recent finished operation ended.
    pub last_outcome: Option<OperationState>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal state
// ─────────────────────────────────────────────────────────────────────────────

struct ActiveOperation {
    id: Uuid,
    started_at: DateTime<Utc>,
    /// Dropping the sender (on release) never kills the process; only an
    /// explicit send does.
    kill_tx: Option<oneshot::Sender<()>>,
    stop_requested: bool,
    /// Outcome already reported; only set while a held slot waits for exit.
    settled: bool,
}

#[derive(Default)]
struct SlotEntry {
    policy: Arc<SlotPolicy>,
    active: Option<ActiveOperation>,
    last_outcome: Option<OperationState>,
}

struct Shared {
    slots: Mutex<HashMap<String, SlotEntry>>,
    sink: Arc<dyn StatusSink>,
    options: SupervisorOptions,
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

/// Owns zero or one running operation per slot.
///
/// Cloning is cheap; all clones share the same slot table.  Independent
/// `Supervisor` instances never interfere with each other.
///
/// [`start`][Self::start] and [`stop`][Self::stop] spawn Tokio tasks and must
/// be called from within a Tokio runtime.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    /// Create a supervisor reporting to `sink`.
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self::with_options(sink, SupervisorOptions::default())
    }

    pub fn with_options(sink: Arc<dyn StatusSink>, options: SupervisorOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(HashMap::new()),
                sink,
                options,
            }),
        }
    }

    /// Convenience: a supervisor whose updates arrive on the returned
    /// receiver.
    pub fn with_channel() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(Arc::new(tx)), rx)
    }

    /// Install `policy` for `slot`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::AlreadyRunning`] if the slot currently owns an
    /// operation; policies are never swapped under a running process.
    pub fn register_slot(&self, slot: &str, policy: SlotPolicy) -> Result<(), BridgeError> {
        let mut slots = self.lock_slots();
        let entry = slots.entry(slot.to_string()).or_default();
        if entry.active.is_some() {
            return Err(BridgeError::AlreadyRunning {
                slot: slot.to_string(),
            });
        }
        entry.policy = Arc::new(policy);
        Ok(())
    }

    /// Launch `program args…` in `slot`.
    pub fn start<I, S>(
        &self,
        slot: &str,
        program: &str,
        args: I,
    ) -> Result<OperationHandle, BridgeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start_command(slot, CommandSpec::new(program, args))
    }

    /// Launch `spec` in `slot` and return without waiting for it.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::AlreadyRunning`] – the slot owns an operation; nothing
    ///   is spawned.
    /// - [`BridgeError::SpawnFailure`] – the OS refused to create the process;
    ///   the slot stays `Idle`.
    pub fn start_command(
        &self,
        slot: &str,
        spec: CommandSpec,
    ) -> Result<OperationHandle, BridgeError> {
        let command = spec.to_string();
        let (mut child, handle, kill_rx) = {
            let mut slots = self.lock_slots();
            let entry = slots.entry(slot.to_string()).or_default();
            if entry.active.is_some() {
                warn!(slot, "start rejected: slot is already running");
                return Err(BridgeError::AlreadyRunning {
                    slot: slot.to_string(),
                });
            }

            let child = spec.to_command().spawn().map_err(|e| {
                warn!(slot, command = %command, error = %e, "failed to spawn process");
                BridgeError::SpawnFailure {
                    slot: slot.to_string(),
                    details: e.to_string(),
                }
            })?;

            let (kill_tx, kill_rx) = oneshot::channel();
            let handle = OperationHandle {
                slot: slot.to_string(),
                operation_id: Uuid::new_v4(),
                started_at: Utc::now(),
                command: command.clone(),
            };
            entry.active = Some(ActiveOperation {
                id: handle.operation_id,
                started_at: handle.started_at,
                kill_tx: Some(kill_tx),
                stop_requested: false,
                settled: false,
            });
            (child, handle, kill_rx)
        };

        info!(slot, operation_id = %handle.operation_id, command = %command, pid = ?child.id(), "operation started");
        self.notify(slot, handle.operation_id, StatusKind::Started { command });

        let (line_tx, lines) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(out, OutputStream::Stdout, line_tx.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(err, OutputStream::Stderr, line_tx)));
        }

        let monitor = Monitor {
            supervisor: self.clone(),
            slot: slot.to_string(),
            operation_id: handle.operation_id,
        };
        tokio::spawn(monitor.run(child, lines, readers, kill_rx));

        Ok(handle)
    }

    /// Request the running operation in `slot` to stop.
    ///
    /// Depending on the slot's policy this kills the process and/or launches
    /// the stop command.  Returns without waiting for the process to exit;
    /// the slot is released when it does.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotRunning`] when the slot is idle; nothing is spawned.
    pub fn stop(&self, slot: &str) -> Result<(), BridgeError> {
        let (operation_id, policy, kill_tx) = {
            let mut slots = self.lock_slots();
            let Some(entry) = slots.get_mut(slot) else {
                return Err(BridgeError::NotRunning {
                    slot: slot.to_string(),
                });
            };
            let Some(active) = entry.active.as_mut() else {
                return Err(BridgeError::NotRunning {
                    slot: slot.to_string(),
                });
            };
            active.stop_requested = true;
            let kill_tx = if entry.policy.kill_on_stop {
                active.kill_tx.take()
            } else {
                None
            };
            (active.id, Arc::clone(&entry.policy), kill_tx)
        };

        info!(slot, operation_id = %operation_id, "stop requested");
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }
        if let Some(stop) = &policy.stop_command {
            launch_detached(slot, stop, self.shared.options.exit_drain);
        }
        self.notify(slot, operation_id, StatusKind::StopRequested);
        Ok(())
    }

    /// Stop every slot whose operation has not reported an outcome yet.
    /// Returns the slots a stop was issued for.
    ///
    /// Held operations that already succeeded or failed keep running.
    pub fn stop_all(&self) -> Vec<String> {
        let pending: Vec<String> = self
            .lock_slots()
            .iter()
            .filter(|(_, entry)| entry.active.as_ref().is_some_and(|a| !a.settled))
            .map(|(slot, _)| slot.clone())
            .collect();
        pending
            .into_iter()
            .filter(|slot| self.stop(slot).is_ok())
            .collect()
    }

    /// Current state of `slot`.  Unknown slots are reported as `Idle`.
    pub fn status(&self, slot: &str) -> SlotStatus {
        let slots = self.lock_slots();
        match slots.get(slot) {
            Some(entry) => SlotStatus {
                slot: slot.to_string(),
                state: if entry.active.is_some() {
                    OperationState::Running
                } else {
                    OperationState::Idle
                },
                operation_id: entry.active.as_ref().map(|a| a.id),
                started_at: entry.active.as_ref().map(|a| a.started_at),
                last_outcome: entry.last_outcome.clone(),
            },
            None => SlotStatus {
                slot: slot.to_string(),
                state: OperationState::Idle,
                operation_id: None,
                started_at: None,
                last_outcome: None,
            },
        }
    }

    pub fn is_running(&self, slot: &str) -> bool {
        self.lock_slots()
            .get(slot)
            .is_some_and(|entry| entry.active.is_some())
    }

    /// Names of all slots that currently own an operation.
    pub fn running_slots(&self) -> Vec<String> {
        self.lock_slots()
            .iter()
            .filter(|(_, entry)| entry.active.is_some())
            .map(|(slot, _)| slot.clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Monitor callbacks
    // -----------------------------------------------------------------------

    /// Classify one output line of `operation_id`.  Returns `true` once the
    /// operation has reported its outcome.
    ///
    /// Lines from an operation that no longer owns its slot, or that already
    /// reported, are ignored.
    fn on_output_line(
        &self,
        slot: &str,
        operation_id: Uuid,
        stream: OutputStream,
        line: &str,
    ) -> bool {
        debug!(slot, operation_id = %operation_id, %stream, line, "child output");

        let (outcome, policy) = {
            let mut slots = self.lock_slots();
            let Some(entry) = slots.get_mut(slot) else {
                return true;
            };
            let Some(active) = entry.active.as_mut().filter(|a| a.id == operation_id) else {
                return true;
            };
            if active.settled {
                return true;
            }
            let outcome = entry.policy.classifier.classify(stream, line);
            let state = match &outcome {
                LineOutcome::Ignore => return false,
                LineOutcome::Success => OperationState::Succeeded,
                LineOutcome::Failure(reason) => OperationState::Failed(reason.clone()),
            };
            if entry.policy.hold_until_exit {
                active.settled = true;
            } else {
                entry.active = None;
            }
            entry.last_outcome = Some(state);
            (outcome, Arc::clone(&entry.policy))
        };

        match outcome {
            LineOutcome::Success => {
                info!(slot, operation_id = %operation_id, line, "operation succeeded");
                self.notify(
                    slot,
                    operation_id,
                    StatusKind::Succeeded {
                        line: line.to_string(),
                    },
                );
            }
            LineOutcome::Failure(reason) => {
                warn!(slot, operation_id = %operation_id, reason = %reason, line, "operation failed");
                self.fail(slot, operation_id, reason, Some(line.to_string()), &policy);
            }
            LineOutcome::Ignore => {}
        }
        true
    }

    /// Release `operation_id` after its process exited.
    fn on_process_exit(&self, slot: &str, operation_id: Uuid, exit_code: Option<i32>) {
        let (state, policy) = {
            let mut slots = self.lock_slots();
            let Some(entry) = slots.get_mut(slot) else {
                return;
            };
            let Some(active) = entry.active.take_if(|a| a.id == operation_id) else {
                debug!(slot, operation_id = %operation_id, code = ?exit_code, "process exited after release");
                return;
            };
            if active.settled {
                info!(slot, operation_id = %operation_id, code = ?exit_code, "held operation released");
                drop(slots);
                self.notify(slot, operation_id, StatusKind::Released { exit_code });
                return;
            }
            let state = if entry.policy.fail_on_nonzero_exit
                && !active.stop_requested
                && exit_code != Some(0)
            {
                OperationState::Failed(match exit_code {
                    Some(code) => format!("exited with code {code}"),
                    None => "terminated by signal".to_string(),
                })
            } else {
                OperationState::Idle
            };
            entry.last_outcome = Some(state.clone());
            (state, Arc::clone(&entry.policy))
        };

        if let OperationState::Failed(reason) = state {
            warn!(slot, operation_id = %operation_id, reason = %reason, "operation failed on exit");
            self.fail(slot, operation_id, reason, None, &policy);
        }
        info!(slot, operation_id = %operation_id, code = ?exit_code, "operation released");
        self.notify(slot, operation_id, StatusKind::Released { exit_code });
    }

    fn fail(
        &self,
        slot: &str,
        operation_id: Uuid,
        reason: String,
        line: Option<String>,
        policy: &SlotPolicy,
    ) {
        self.notify(slot, operation_id, StatusKind::Failed { reason, line });
        if policy.compensate_on_failure
            && let Some(stop) = &policy.stop_command
        {
            launch_detached(slot, stop, self.shared.options.exit_drain);
            self.notify(slot, operation_id, StatusKind::CompensatingStop);
        }
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn notify(&self, slot: &str, operation_id: Uuid, kind: StatusKind) {
        self.shared
            .sink
            .notify(StatusUpdate::new(slot, operation_id, kind));
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, SlotEntry>> {
        // Critical sections never panic midway, so a poisoned table is still
        // consistent.
        self.shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Monitor task
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the child process of one operation.
struct Monitor {
    supervisor: Supervisor,
    slot: String,
    operation_id: Uuid,
}

/// Kills the child on drop while armed.  Disarmed once the operation has
/// reported, so processes the supervisor has let go outlive the runtime.
struct ChildGuard {
    child: Child,
    armed: bool,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.child.start_kill();
        }
    }
}

impl Monitor {
    async fn run(
        self,
        child: Child,
        mut lines: mpsc::UnboundedReceiver<(OutputStream, String)>,
        readers: Vec<tokio::task::JoinHandle<()>>,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        let mut guard = ChildGuard { child, armed: true };
        let mut kill_armed = true;
        let exit_code = loop {
            tokio::select! {
                biased;
                Some((stream, line)) = lines.recv() => {
                    if self.supervisor.on_output_line(&self.slot, self.operation_id, stream, &line) {
                        guard.armed = false;
                    }
                }
                request = &mut kill_rx, if kill_armed => {
                    kill_armed = false;
                    if request.is_ok()
                        && let Err(e) = guard.child.start_kill()
                    {
                        warn!(slot = %self.slot, error = %e, "failed to kill process");
                    }
                }
                status = guard.child.wait() => {
                    break match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!(slot = %self.slot, error = %e, "failed to wait for process");
                            None
                        }
                    };
                }
            }
        };
        guard.armed = false;

        let drain = async {
            while let Some((stream, line)) = lines.recv().await {
                self.supervisor
                    .on_output_line(&self.slot, self.operation_id, stream, &line);
            }
        };
        if tokio::time::timeout(self.supervisor.shared.options.exit_drain, drain)
            .await
            .is_err()
        {
            debug!(slot = %self.slot, "output still open after exit; abandoning readers");
        }
        for reader in readers {
            reader.abort();
        }

        self.supervisor
            .on_process_exit(&self.slot, self.operation_id, exit_code);
    }
}
