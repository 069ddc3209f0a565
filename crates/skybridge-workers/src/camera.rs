//! Camera worker: still pictures and video recording through the camera
//! scripts.
//!
//! | Request id | Effect |
//! |---|---|
//! | `take_picture` | `takepicture.sh take_picture` when the payload mentions `video`, otherwise `takepicture.sh take_depth_pic` |
//! | `toggle_video` | stop the running recording, or start `startstop_video.sh start_recording` (`videocolor`) / `start_rec_depth` (`depthcolor`) |

use serde_json::json;
use skybridge_supervisor::{OutputClassifier, SlotPolicy, Supervisor};
use skybridge_types::{
    BridgeError, OutputStream, StatusKind, StatusUpdate, WorkerReply, WorkerRequest,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::worker::{HostLink, ScriptSet, Worker, WorkerContext, unknown_request};

pub const ID: &str = "camera";

pub const PICTURE_SLOT: &str = "picture";
pub const RECORDING_SLOT: &str = "recording";

const PICTURE_SCRIPT: &str = "takepicture.sh";
const VIDEO_SCRIPT: &str = "startstop_video.sh";

const SCREEN: &str = "flight";
const PANEL: &str = "camera_panel";

/// Drives the camera scripts from the flight screen's camera panel.
pub struct CameraWorker {
    supervisor: Supervisor,
    link: HostLink,
    scripts: ScriptSet,
}

impl CameraWorker {
    /// Build the worker and register its slot policies.
    ///
    /// The returned receiver carries the worker's status updates and must be
    /// handed to the registry together with the worker.
    pub fn new(
        ctx: &WorkerContext,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StatusUpdate>), BridgeError> {
        let (supervisor, updates) = ctx.supervisor();
        let scripts = ctx.scripts.clone();

        supervisor.register_slot(
            PICTURE_SLOT,
            SlotPolicy::new(
                OutputClassifier::new()
                    .success("taken", Some(OutputStream::Stdout))
                    .failure("ERROR", Some(OutputStream::Stderr), "camera reported an error"),
            )
            .with_stop_command(scripts.command(PICTURE_SCRIPT, &["stop"]))
            .compensate_on_failure(true)
            .fail_on_nonzero_exit(ctx.fail_on_nonzero_exit),
        )?;

        // Any stderr output while recording means the middleware is gone.
        // The recorder owns the slot until it exits, failed or not.
        supervisor.register_slot(
            RECORDING_SLOT,
            SlotPolicy::new(OutputClassifier::new().failure(
                "",
                Some(OutputStream::Stderr),
                "ROS Error: Failed to contact master",
            ))
            .with_stop_command(scripts.command(VIDEO_SCRIPT, &["stop"]))
            .compensate_on_failure(true)
            .hold_until_exit(true)
            .fail_on_nonzero_exit(ctx.fail_on_nonzero_exit),
        )?;

        Ok((
            Self {
                supervisor,
                link: ctx.link(ID),
                scripts,
            },
            updates,
        ))
    }

    fn take_picture(&self, request: &WorkerRequest) -> WorkerReply {
        let mode = if request.mentions("video") {
            "take_picture"
        } else {
            "take_depth_pic"
        };
        info!(mode, "taking picture");
        match self
            .supervisor
            .start_command(PICTURE_SLOT, self.scripts.command(PICTURE_SCRIPT, &[mode]))
        {
            Ok(_) => WorkerReply::ok_with("picture requested"),
            Err(e) => self.reject(e),
        }
    }

    fn toggle_video(&self, request: &WorkerRequest) -> WorkerReply {
        if self.supervisor.is_running(RECORDING_SLOT) {
            return match self.supervisor.stop(RECORDING_SLOT) {
                Ok(()) => {
                    self.link.say("Recording stopped");
                    WorkerReply::ok_with("recording stopped")
                }
                Err(e) => self.reject(e),
            };
        }

        let (mode, announcement) = if request.mentions("videocolor") {
            ("start_recording", "Video recording started")
        } else if request.mentions("depthcolor") {
            ("start_rec_depth", "Depth map recording started")
        } else {
            self.link.error("Error controlling camera");
            return WorkerReply::error("unknown recording mode");
        };

        match self
            .supervisor
            .start_command(RECORDING_SLOT, self.scripts.command(VIDEO_SCRIPT, &[mode]))
        {
            Ok(_) => {
                self.link.say(announcement);
                WorkerReply::ok_with("recording started")
            }
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

    fn send_picture_status(&self, busy: bool) {
        let icon = if busy { "shutter_close2.png" } else { "shutter.png" };
        self.link.screen_update(
            SCREEN,
            Some(PANEL),
            json!({
                "take_picture": { "icon": format!("$(img)/{ID}/{icon}") },
                "spin_image_node": { "enabled": !busy },
            }),
        );
    }

    fn send_recording_status(&self, recording: bool) {
        let icon = if recording { "record_on.png" } else { "record_off.png" };
        self.link.screen_update(
            SCREEN,
            Some(PANEL),
            json!({
                "btn_video": { "icon": format!("$(img)/{ID}/{icon}") },
                "spin_image_node": { "enabled": !recording },
            }),
        );
    }
}

impl Worker for CameraWorker {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Camera"
    }

    fn handle_request(&self, request: &WorkerRequest) -> WorkerReply {
        match request.id.as_str() {
            "take_picture" => self.take_picture(request),
            "toggle_video" => self.toggle_video(request),
            _ => unknown_request(request),
        }
    }

    fn on_status(&self, update: &StatusUpdate) {
        match (update.slot.as_str(), &update.kind) {
            (PICTURE_SLOT, StatusKind::Started { .. }) => self.send_picture_status(true),
            (PICTURE_SLOT, StatusKind::Succeeded { .. }) => {
                self.link.say("picture taken");
                self.send_picture_status(false);
            }
            (PICTURE_SLOT, StatusKind::Failed { reason, line }) => {
                self.link
                    .error(format!("Error occured {}", line.as_deref().unwrap_or(reason)));
                self.send_picture_status(false);
            }
            (PICTURE_SLOT, StatusKind::Released { .. }) => self.send_picture_status(false),

            (RECORDING_SLOT, StatusKind::Started { .. }) => self.send_recording_status(true),
            (RECORDING_SLOT, StatusKind::Failed { reason, .. }) => {
                self.link.error(reason.clone());
                self.send_recording_status(false);
            }
            (RECORDING_SLOT, StatusKind::Released { .. }) => self.send_recording_status(false),

            (slot, kind) => debug!(slot, ?kind, "no host update for status"),
        }
    }

    fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }
}
