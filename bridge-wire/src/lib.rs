//! Wire protocol, fragment reassembly, and the fabric/local-bus dispatcher
//! for the pubsub fabric bridge.
//!
//! This crate sits between `bridge-core` (the pure, I/O-free data
//! structures) and the `bridge` runtime crate: it defines the `Fabric` and
//! `LocalBus` collaborator traits an embedder implements, the on-wire frame
//! encoding, and the dispatcher that drives `bridge-core`'s data structures
//! from decoded frames.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::unused_async)]
#![allow(clippy::future_not_send)] // Runtime-agnostic design
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_arguments)]

pub mod dispatcher;
pub mod fabric;
pub mod fragment;
pub mod frame;
pub mod local_bus;

pub mod prelude {
    pub use crate::dispatcher::{DispatchOutcome, Dispatcher};
    pub use crate::fabric::{Fabric, InMemoryFabric};
    pub use crate::fragment::FragmentAssembler;
    pub use crate::frame::{decode, encode, Frame, Header, MsgType, RouteBody};
    pub use crate::local_bus::{InMemoryLocalBus, LocalBus, LocalPublish, RouteNotification};
}
