//! `skybridge-runtime` – process-level plumbing around the workers.
//!
//! # Modules
//!
//! - [`host_loop`] – [`HostLoop`][host_loop::HostLoop]: reads JSON requests
//!   from the host, dispatches them through the
//!   [`WorkerRegistry`][skybridge_workers::WorkerRegistry] and writes replies
//!   and bus events back as JSON lines.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: initialises
//!   the global `tracing` subscriber on stderr with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to Jaeger, Grafana Tempo, or any OTLP-compatible collector.

pub mod host_loop;
pub mod telemetry;

pub use host_loop::{ExitReason, HostLoop};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
