//! Bridge Core
//!
//! Runtime-agnostic kernel for the pubsub fabric bridge: no locks, no I/O,
//! no async — every type here is driven synchronously by the single
//! owning event-loop task in the `bridge` crate (§5 "Concurrency &
//! Resource model").
//!
//! - Route compressor (`idset`)
//! - Exact-match and prefix-match route maps (`subject_route`, `pattern_route`)
//! - Peer session lifecycle (`peer_table`)
//! - Local subscription announcement cache (`local_sub_cache`)
//! - Outbound frame queue (`outbound_queue`)
//! - Setup/teardown cooperative scheduler (`scheduler`)
//! - Peer identity (`stamp`), tunables (`config`), error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]

pub mod config;
pub mod error;
pub mod hash;
pub mod idset;
pub mod local_sub_cache;
pub mod outbound_queue;
pub mod pattern_route;
pub mod peer_table;
pub mod scheduler;
pub mod stamp;
pub mod subject_route;

/// Small prelude to make downstream crates ergonomic. Kept minimal to
/// avoid API lock-in.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{BridgeError, Result};
    pub use crate::hash::fnv1a64;
    pub use crate::idset::{Compressor, IdHandle, ModifyOutcome};
    pub use crate::local_sub_cache::{LocalSubCache, SubAnnouncement};
    pub use crate::outbound_queue::{OfferOutcome, OutboundQueue, WriteResult};
    pub use crate::pattern_route::PatternRouteMap;
    pub use crate::peer_table::{PeerTable, Session, SessionState, UpdateOutcome};
    pub use crate::scheduler::{Poll, Scheduler, Task, TaskState};
    pub use crate::stamp::Stamp;
    pub use crate::subject_route::SubjectRouteMap;
}
