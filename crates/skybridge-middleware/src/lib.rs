//! `skybridge-middleware` – status push plumbing
//!
//! Routes host-facing messages from workers to whoever talks to the host,
//! without caring about the messages' meaning.
//!
//! # Modules
//!
//! - [`bus`] – Headless publish/subscribe bus built on a Tokio broadcast
//!   channel.

pub mod bus;

pub use bus::{DEFAULT_CAPACITY, EventBus};
