#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::doc_markdown,
    clippy::float_cmp,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

//! Connection lifecycle, priority message queuing, and agent event delivery
//! core for multi-tenant WebSocket chat backends.
//!
//! The surrounding backend hands this crate a validated
//! `(user_id, connection_id)` pair per accepted socket and an async delivery
//! sink; the crate owns everything between acceptance and delivery:
//!
//! - a per-connection lifecycle [state machine](connection) driving
//! - a per-connection [priority queue](queue) that buffers during setup and
//!   passes through once the connection is operational,
//! - a process-wide [queue registry](queue::registry),
//! - per-user [rate limiting](ratelimit) with independent sliding windows,
//! - the [agent event sequencer](events) enforcing the five mandatory
//!   lifecycle events per run,
//! - per-connection [performance tracking](perf) with threshold alerts.
//!
//! [`service::RelayService`] composes all of it behind one facade.

pub mod config;
pub mod connection;
pub mod events;
pub mod perf;
pub mod queue;
pub mod ratelimit;
pub mod service;

pub use config::RelayConfig;
pub use service::{RelayError, RelayService};
