//! GCS workers that drive the onboard scripts through a
//! [`Supervisor`][skybridge_supervisor::Supervisor] each.
//!
//! | Worker | Request ids |
//! |---|---|
//! | [`camera`] | `take_picture`, `toggle_video` |
//! | [`launch`] | `launch` |
//! | [`start_panel`] | `zed_ros_start`, `zed_ros_stop`, `ros_rtsp_start`, `ros_rtsp_stop`, `ros_mavros_start`, `ros_mavros_stop`, `shutdown_ok` |

pub mod camera;
pub mod launch;
pub mod registry;
pub mod start_panel;
pub mod worker;

#[cfg(test)]
mod testing;

pub use camera::CameraWorker;
pub use launch::LaunchWorker;
pub use registry::{BUILTIN_WORKERS, WorkerRegistry};
pub use start_panel::StartPanelWorker;
pub use worker::{HostLink, ScriptSet, Worker, WorkerContext};
