//! Single-task event-loop runtime for the pubsub fabric bridge.
//!
//! This crate wires `bridge-core`'s data structures and `bridge-wire`'s
//! dispatcher into the owning event-loop task described by the concurrency
//! model: one task, no locks, ticking a 100 µs fabric poll and a 200 ms
//! heartbeat, with an orderly shutdown path bounded by a conductor-pump
//! retry budget.

#![warn(clippy::all)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod dev_tracing;
pub mod runtime;

pub use bridge_core::config::Config;
pub use bridge_core::stamp::Stamp;
pub use bridge_wire::fabric::Fabric;
pub use bridge_wire::local_bus::LocalBus;
pub use runtime::{Bridge, TickOutcome};
