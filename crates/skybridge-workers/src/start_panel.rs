//! Start screen worker: launches and stops the onboard ROS nodes and powers
//! the companion computer down.
//!
//! Each node button has a start slot and a stop slot.  A node counts as
//! launched once its start script reports success, and as stopped once its
//! stop script prints anything.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use skybridge_supervisor::{OutputClassifier, SlotPolicy, Supervisor};
use skybridge_types::{
    BridgeError, OutputStream, StatusKind, StatusUpdate, WorkerReply, WorkerRequest,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::worker::{HostLink, ScriptSet, Worker, WorkerContext, unknown_request};

pub const ID: &str = "start_panel";

pub const SHUTDOWN_SLOT: &str = "shutdown";

const SHUTDOWN_SCRIPT: &str = "shutdowntx2.sh";

const LAUNCHED_COLOR: &str = "#ff39aa00";
const STOPPED_COLOR: &str = "black";

/// A ROS node driven by a start/stop script.
struct NodeSpec {
    start_slot: &'static str,
    stop_slot: &'static str,
    script: &'static str,
    success: &'static str,
    announcement: &'static str,
    button: &'static str,
}

static ZED: NodeSpec = NodeSpec {
    start_slot: "zed",
    stop_slot: "zed_stop",
    script: "startstopZEDimagenodes.sh",
    success: "ZED ros launched",
    announcement: "ZED node initiated",
    button: "do_dialog",
};

static RTSP: NodeSpec = NodeSpec {
    start_slot: "rtsp",
    stop_slot: "rtsp_stop",
    script: "startstopROS2RTSPimagenode.sh",
    success: "ROS2RTSP launched",
    announcement: "Video server initiated",
    button: "do_dialog2",
};

/// Mavros is started outside SkyBridge; only its button is tracked.
const MAVROS_BUTTON: &str = "do_dialog3";

struct Node {
    spec: &'static NodeSpec,
    launched: AtomicBool,
}

impl Node {
    fn new(spec: &'static NodeSpec) -> Self {
        Self {
            spec,
            launched: AtomicBool::new(false),
        }
    }
}

pub struct StartPanelWorker {
    supervisor: Supervisor,
    link: HostLink,
    scripts: ScriptSet,
    nodes: [Node; 2],
    mavros: AtomicBool,
}

impl StartPanelWorker {
    pub fn new(
        ctx: &WorkerContext,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StatusUpdate>), BridgeError> {
        let (supervisor, updates) = ctx.supervisor();

        for spec in [&ZED, &RTSP] {
            // The start script runs the node; its slot is busy until it exits.
            supervisor.register_slot(
                spec.start_slot,
                SlotPolicy::new(
                    OutputClassifier::new().success(spec.success, Some(OutputStream::Stdout)),
                )
                .hold_until_exit(true)
                .fail_on_nonzero_exit(ctx.fail_on_nonzero_exit),
            )?;
            supervisor.register_slot(
                spec.stop_slot,
                SlotPolicy::new(OutputClassifier::new().success("", Some(OutputStream::Stdout)))
                    .fail_on_nonzero_exit(ctx.fail_on_nonzero_exit),
            )?;
        }
        supervisor.register_slot(SHUTDOWN_SLOT, SlotPolicy::default())?;

        Ok((
            Self {
                supervisor,
                link: ctx.link(ID),
                scripts: ctx.scripts.clone(),
                nodes: [Node::new(&ZED), Node::new(&RTSP)],
                mavros: AtomicBool::new(false),
            },
            updates,
        ))
    }

    /// Whether the node behind `start_slot` is currently marked launched.
    pub fn is_launched(&self, start_slot: &str) -> bool {
        self.node(start_slot)
            .is_some_and(|n| n.launched.load(Ordering::SeqCst))
    }

    pub fn is_mavros_started(&self) -> bool {
        self.mavros.load(Ordering::SeqCst)
    }

    fn node(&self, slot: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.spec.start_slot == slot || n.spec.stop_slot == slot)
    }

    fn start_node(&self, node: &Node) -> WorkerReply {
        info!(node = node.spec.start_slot, "starting node");
        self.run(node.spec.start_slot, node.spec.script, &["start"])
    }

    fn stop_node(&self, node: &Node) -> WorkerReply {
        info!(node = node.spec.start_slot, "stopping node");
        node.launched.store(false, Ordering::SeqCst);
        self.run(node.spec.stop_slot, node.spec.script, &["stop"])
    }

    fn toggle_mavros(&self, started: bool) -> WorkerReply {
        info!(started, "mavros button toggled");
        self.mavros.store(started, Ordering::SeqCst);
        self.send_button_update(MAVROS_BUTTON, started);
        WorkerReply::ok()
    }

    fn shutdown(&self) -> WorkerReply {
        info!("shutting down companion computer");
        self.run(SHUTDOWN_SLOT, SHUTDOWN_SCRIPT, &[])
    }

    fn run(&self, slot: &str, script: &str, args: &[&str]) -> WorkerReply {
        match self
            .supervisor
            .start_command(slot, self.scripts.command(script, args))
        {
            Ok(_) => WorkerReply::ok_with("started"),
            Err(BridgeError::AlreadyRunning { slot }) => {
                self.link.error("Process already running!");
                BridgeError::AlreadyRunning { slot }.into()
            }
            Err(e) => {
                self.link
                    .error(format!("Error starting child process: {e}"));
                e.into()
            }
        }
    }

    fn send_button_update(&self, button: &str, launched: bool) {
        let background = if launched { LAUNCHED_COLOR } else { STOPPED_COLOR };
        let mut values = serde_json::Map::new();
        values.insert(button.to_string(), json!({ "background": background }));
        self.link
            .screen_update("start", Some("worker_buttons"), values.into());
    }
}

impl Worker for StartPanelWorker {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Start Panel"
    }

    fn handle_request(&self, request: &WorkerRequest) -> WorkerReply {
        let [zed, rtsp] = &self.nodes;
        match request.id.as_str() {
            "zed_ros_start" => self.start_node(zed),
            "zed_ros_stop" => self.stop_node(zed),
            "ros_rtsp_start" => self.start_node(rtsp),
            "ros_rtsp_stop" => self.stop_node(rtsp),
            "ros_mavros_start" => self.toggle_mavros(true),
            "ros_mavros_stop" => self.toggle_mavros(false),
            "shutdown_ok" => self.shutdown(),
            _ => unknown_request(request),
        }
    }

    fn on_status(&self, update: &StatusUpdate) {
        let Some(node) = self.node(&update.slot) else {
            debug!(slot = %update.slot, kind = ?update.kind, "no host update for status");
            return;
        };
        let starting = update.slot == node.spec.start_slot;
        match &update.kind {
            StatusKind::Succeeded { .. } if starting => {
                node.launched.store(true, Ordering::SeqCst);
                self.link.say(node.spec.announcement);
                self.send_button_update(node.spec.button, true);
            }
            StatusKind::Succeeded { .. } => {
                self.send_button_update(node.spec.button, node.launched.load(Ordering::SeqCst));
            }
            StatusKind::Failed { reason, .. } => {
                self.link.error(reason.clone());
            }
            kind => debug!(slot = %update.slot, ?kind, "no host update for status"),
        }
    }

    fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestBench, speech_texts};
    use skybridge_types::HostMessage;
    use std::sync::Arc;

    const ZED_SCRIPT: &str = r#"
case "$1" in
  start) echo "ZED ros launched"; sleep 1 ;;
  stop) echo "stopping zed" ;;
esac
"#;

    const RTSP_SCRIPT: &str = r#"
case "$1" in
  start) echo "ROS2RTSP launched" ;;
  stop) echo "stopping rtsp" ;;
esac
"#;

    const SHUTDOWN: &str = r#"echo poweroff >> "$(dirname "$0")/shutdown.log""#;

    fn bench() -> (TestBench, Arc<StartPanelWorker>) {
        let mut bench = TestBench::new(&[
            (ZED.script, ZED_SCRIPT),
            (RTSP.script, RTSP_SCRIPT),
            (SHUTDOWN_SCRIPT, SHUTDOWN),
        ]);
        let (worker, updates) = StartPanelWorker::new(&bench.ctx).unwrap();
        let worker = Arc::new(worker);
        bench.relay_into(worker.clone(), updates);
        (bench, worker)
    }

    fn button(m: &HostMessage, name: &str) -> Option<String> {
        match m {
            HostMessage::ScreenUpdate {
                screen_id,
                panel_id,
                values,
            } if screen_id == "start" && panel_id.as_deref() == Some("worker_buttons") => values
                .get(name)
                .and_then(|b| b["background"].as_str())
                .map(str::to_string),
            _ => None,
        }
    }

    #[tokio::test]
    async fn zed_start_then_stop_recolours_button() {
        let (mut bench, worker) = bench();

        assert!(worker.handle_request(&WorkerRequest::new(ID, "zed_ros_start")).ok);
        let events = bench
            .events_until(|m| button(m, "do_dialog").is_some())
            .await;
        assert_eq!(speech_texts(&events), vec!["ZED node initiated"]);
        assert_eq!(button(events.last().unwrap(), "do_dialog").as_deref(), Some(LAUNCHED_COLOR));
        assert!(worker.is_launched("zed"));

        assert!(worker.handle_request(&WorkerRequest::new(ID, "zed_ros_stop")).ok);
        assert!(!worker.is_launched("zed"));
        let events = bench
            .events_until(|m| button(m, "do_dialog").is_some())
            .await;
        assert_eq!(button(events.last().unwrap(), "do_dialog").as_deref(), Some(STOPPED_COLOR));
    }

    #[tokio::test]
    async fn rtsp_announces_video_server() {
        let (mut bench, worker) = bench();
        assert!(worker.handle_request(&WorkerRequest::new(ID, "ros_rtsp_start")).ok);
        let events = bench
            .events_until(|m| button(m, "do_dialog2").is_some())
            .await;
        assert_eq!(speech_texts(&events), vec!["Video server initiated"]);
        assert!(worker.is_launched("rtsp"));
        assert!(!worker.is_launched("zed"));
    }

    #[tokio::test]
    async fn mavros_only_toggles_its_button() {
        let (mut bench, worker) = bench();

        assert!(worker.handle_request(&WorkerRequest::new(ID, "ros_mavros_start")).ok);
        assert!(worker.is_mavros_started());
        let event = bench.next_event().await;
        assert_eq!(button(&event, MAVROS_BUTTON).as_deref(), Some(LAUNCHED_COLOR));

        assert!(worker.handle_request(&WorkerRequest::new(ID, "ros_mavros_stop")).ok);
        let event = bench.next_event().await;
        assert_eq!(button(&event, MAVROS_BUTTON).as_deref(), Some(STOPPED_COLOR));
        assert!(worker.supervisor().running_slots().is_empty());
    }

    #[tokio::test]
    async fn shutdown_runs_script_in_its_own_slot() {
        let (bench, worker) = bench();
        assert!(worker.handle_request(&WorkerRequest::new(ID, "shutdown_ok")).ok);
        assert_eq!(bench.wait_for_lines("shutdown.log", 1).await, 1);
    }

    #[tokio::test]
    async fn double_start_is_rejected_while_script_runs() {
        let (mut bench, worker) = bench();
        let slow = bench.path(ZED.script);
        std::fs::write(&slow, "sleep 5").unwrap();

        assert!(worker.handle_request(&WorkerRequest::new(ID, "zed_ros_start")).ok);
        let reply = worker.handle_request(&WorkerRequest::new(ID, "zed_ros_start"));
        assert!(!reply.ok);
        let event = bench.next_event().await;
        assert_eq!(speech_texts(&[event]), vec!["Process already running!"]);
        worker.supervisor().stop_all();
    }

    #[tokio::test]
    async fn running_node_is_not_launched_twice() {
        let (mut bench, worker) = bench();
        std::fs::write(
            bench.path(ZED.script),
            r#"echo $$ >> "$(dirname "$0")/zed.pids"; echo "ZED ros launched"; sleep 5"#,
        )
        .unwrap();

        assert!(worker.handle_request(&WorkerRequest::new(ID, "zed_ros_start")).ok);
        bench
            .events_until(|m| button(m, "do_dialog").is_some())
            .await;
        assert!(worker.is_launched("zed"));

        let reply = worker.handle_request(&WorkerRequest::new(ID, "zed_ros_start"));
        assert!(!reply.ok);
        let event = bench.next_event().await;
        assert_eq!(speech_texts(&[event]), vec!["Process already running!"]);
        assert_eq!(bench.wait_for_lines("zed.pids", 1).await, 1);

        // Shutdown leaves the launched node alone.
        assert!(worker.supervisor().stop_all().is_empty());
        worker.supervisor().stop(ZED.start_slot).unwrap();
    }

    #[tokio::test]
    async fn unknown_id() {
        let (_bench, worker) = bench();
        let reply = worker.handle_request(&WorkerRequest::new(ID, "show_dialog"));
        assert_eq!(reply, WorkerReply::error("No message with id show_dialog"));
    }
}
