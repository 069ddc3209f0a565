//! Trailnet launch worker.
//!
//! A single `launch` request toggles between launching the drone on
//! Trailnet and handing control back, driving the launch button on the video
//! screen.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use skybridge_supervisor::{OutputClassifier, SlotPolicy, Supervisor};
use skybridge_types::{
    BridgeError, OutputStream, StatusKind, StatusUpdate, WorkerReply, WorkerRequest,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::worker::{HostLink, ScriptSet, Worker, WorkerContext, unknown_request};

pub const ID: &str = "launch_drone";

pub const LAUNCH_SLOT: &str = "launch";
pub const RESUME_SLOT: &str = "launch_stop";

const SCRIPT: &str = "startstoptrailnetlaunch.sh";

pub struct LaunchWorker {
    supervisor: Supervisor,
    link: HostLink,
    scripts: ScriptSet,
    launched: AtomicBool,
}

impl LaunchWorker {
    pub fn new(
        ctx: &WorkerContext,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StatusUpdate>), BridgeError> {
        let (supervisor, updates) = ctx.supervisor();
        let scripts = ctx.scripts.clone();

        // Order matters: the last rule catches every other stderr line.
        supervisor.register_slot(
            LAUNCH_SLOT,
            SlotPolicy::new(
                OutputClassifier::new()
                    .success("launch initiated", Some(OutputStream::Stdout))
                    .failure(
                        "must be launched first",
                        Some(OutputStream::Stderr),
                        "Error: make sure that Trailnet and Mavros must be started first",
                    )
                    .failure(
                        "Could not arm",
                        Some(OutputStream::Stderr),
                        "ERROR: Could not arm FCU launch aborted",
                    )
                    .failure("", Some(OutputStream::Stderr), "ERROR: process has died"),
            )
            .with_stop_command(scripts.command(SCRIPT, &["stop"]))
            .kill_on_stop(false)
            .compensate_on_failure(true)
            .hold_until_exit(true)
            .fail_on_nonzero_exit(ctx.fail_on_nonzero_exit),
        )?;

        supervisor.register_slot(
            RESUME_SLOT,
            SlotPolicy::new(OutputClassifier::new().success("", Some(OutputStream::Stdout)))
                .fail_on_nonzero_exit(ctx.fail_on_nonzero_exit),
        )?;

        Ok((
            Self {
                supervisor,
                link: ctx.link(ID),
                scripts,
                launched: AtomicBool::new(false),
            },
            updates,
        ))
    }

    pub fn is_launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    fn toggle(&self) -> WorkerReply {
        if !self.launched.swap(true, Ordering::SeqCst) {
            info!("launching drone on trailnet");
            return match self
                .supervisor
                .start_command(LAUNCH_SLOT, self.scripts.command(SCRIPT, &["start"]))
            {
                Ok(_) => WorkerReply::ok_with("started"),
                Err(e) => {
                    self.launched.store(false, Ordering::SeqCst);
                    self.reject(e)
                }
            };
        }

        info!("resuming manual control");
        self.launched.store(false, Ordering::SeqCst);
        // While the launch script is alive it is stopped through its own slot,
        // whose stop command is the same script.
        let result = if self.supervisor.is_running(LAUNCH_SLOT) {
            self.supervisor.stop(LAUNCH_SLOT).map(|()| self.send_button_update())
        } else {
            self.supervisor
                .start_command(RESUME_SLOT, self.scripts.command(SCRIPT, &["stop"]))
                .map(|_| ())
        };
        match result {
            Ok(()) => WorkerReply::ok_with("started"),
            Err(e) => self.reject(e),
        }
    }

    fn reject(&self, err: BridgeError) -> WorkerReply {
        match &err {
            BridgeError::AlreadyRunning { .. } => self.link.error("Process already running!"),
            _ => self.link.error(err.to_string()),
        }
        err.into()
    }

    fn send_button_update(&self) {
        let (text, background) = if self.is_launched() {
            ("Resume Control", "#ff39aa00")
        } else {
            ("Launch Drone on Trailnet", "red")
        };
        self.link.screen_update(
            "video",
            None,
            json!({
                "launch_button": { "text": text, "background": background },
            }),
        );
    }
}

impl Worker for LaunchWorker {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Launch Drone"
    }

    fn handle_request(&self, request: &WorkerRequest) -> WorkerReply {
        match request.id.as_str() {
            "launch" => self.toggle(),
            _ => unknown_request(request),
        }
    }

    fn on_status(&self, update: &StatusUpdate) {
        match (update.slot.as_str(), &update.kind) {
            (LAUNCH_SLOT, StatusKind::Succeeded { .. }) => {
                self.link.say("Trailnet autonomous mode initiated");
                self.send_button_update();
            }
            (LAUNCH_SLOT, StatusKind::Failed { reason, .. }) => {
                self.launched.store(false, Ordering::SeqCst);
                self.link.error(reason.clone());
                self.send_button_update();
            }
            (RESUME_SLOT, StatusKind::Succeeded { .. }) => self.send_button_update(),
            (slot, kind) => debug!(slot, ?kind, "no host update for status"),
        }
    }

    fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }
}
