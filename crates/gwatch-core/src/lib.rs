//! gwatch-core: event tracing capsule and scheduler broker.
//!
//! A capsule lives inside a traced process. Instrumentation pushes events
//! into a per-thread [`trace::EventTrace`]; a [`report::ReportLoop`] ships
//! archived events to the scheduler as time-series writes.
//!
//! ```text
//! instrumentation → EventTrace → ReportLoop → ConnectionInstance
//!                                                   ↓  (TCP, chunked)
//!                 Broker ← capsule / gtrace / profiler channels
//!                    ↓
//!             KV / TS / SQL stores → subscriptions → gtrace clients
//! ```
//!
//! # Modules
//!
//! - `event`: event model, domains and ticks
//! - `trace`: bounded event queue with a parent stack, plus `TraceView`
//! - `report`: report loop draining a trace into a sink
//! - `connection`: per-connection outbound chunking and inbound reassembly
//! - `transport`: tokio TCP plumbing driving connections
//! - `store`: KV, time-series and SQLite stores with subscriptions
//! - `broker`: scheduler-side routing for all three channels
//! - `agent`: agent contexts, tasks and contents
//! - `capsule`: the in-process agent tying trace, report loop and transport
//! - `config`: TOML configuration
//! - `logging`: tracing-subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod agent;
pub mod broker;
pub mod capsule;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod logging;
pub mod report;
pub mod store;
pub mod trace;
pub mod transport;

pub use error::{Error, ErrorKind, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
