//! Bridge timing and sizing configuration.
//!
//! Centralizes the constants the design calls out by name (§6 "Timings",
//! §5 "Resource model") instead of scattering them as magic numbers across
//! the peer table, outbound queue, and dispatcher.

use std::time::Duration;

/// Poll tick: how often the event loop polls the fabric for inbound data.
pub const POLL_TICK: Duration = Duration::from_micros(100);

/// Heartbeat tick: how often the bridge sends a HELLO probe and checks for
/// idle peers.
pub const HEARTBEAT_TICK: Duration = Duration::from_millis(200);

/// Session timeout, expressed in heartbeat ticks (25 × 200ms = 5s of silence).
pub const SESSION_TIMEOUT_HEARTBEATS: u32 = 25;

/// Maximum number of fragments the inbound dispatcher will process in a
/// single poll before yielding back to the event loop.
pub const MAX_FRAGMENTS_PER_POLL: usize = 8;

/// Maximum number of conductor pumps to attempt during an orderly shutdown
/// close before giving up and force-nulling the handle.
pub const MAX_SHUTDOWN_PUMPS: u32 = 1_000;

/// Maximum number of retries for a single head-of-queue offer before the
/// outbound queue gives up for this tick and preserves the queue head.
pub const MAX_OFFER_RETRIES: u32 = 3;

/// Session array growth increment; slots are never renumbered (§4.D).
pub const SESSION_SLAB_SIZE: usize = 64;

/// `LocalSubCache` gc trigger: compact once free space exceeds this and is
/// more than half of the arena.
pub const LOCAL_SUB_CACHE_GC_MIN_FREE: usize = 1024;

/// Maximum number of prefix-hash entries a single PUBLISH frame may carry
/// (§6 wire frame "prefix_cnt:u8"); bounds the variable-length prefix-hash
/// array the same way the teacher bounds its staging buffer sizes.
pub const MAX_PREFIX_COUNT: usize = 32;

/// Initial capacity for the fragment-reassembly staging buffer, mirroring
/// the teacher's `STAGING_BUF_INITIAL_CAP` sizing convention.
pub const STAGING_BUF_INITIAL_CAP: usize = 256;

/// Bridge-wide tunable configuration.
///
/// Mirrors the teacher's `SocketOptions` builder style: a plain struct with
/// `with_*` builder methods and a documented [`Default`], rather than a
/// pile of free functions or inline constants at each call site.
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the event loop polls the fabric for inbound frames.
    pub poll_tick: Duration,
    /// How often the event loop sends a heartbeat probe.
    pub heartbeat_tick: Duration,
    /// Number of consecutive idle heartbeat ticks before a session is
    /// evicted.
    pub session_timeout_heartbeats: u32,
    /// Fragments processed per poll before yielding.
    pub max_fragments_per_poll: usize,
    /// Conductor-pump retry budget during shutdown.
    pub max_shutdown_pumps: u32,
    /// Offer retries before backpressure is declared for the tick.
    pub max_offer_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_tick: POLL_TICK,
            heartbeat_tick: HEARTBEAT_TICK,
            session_timeout_heartbeats: SESSION_TIMEOUT_HEARTBEATS,
            max_fragments_per_poll: MAX_FRAGMENTS_PER_POLL,
            max_shutdown_pumps: MAX_SHUTDOWN_PUMPS,
            max_offer_retries: MAX_OFFER_RETRIES,
        }
    }
}

impl Config {
    /// Set the fabric poll tick.
    #[must_use]
    pub const fn with_poll_tick(mut self, d: Duration) -> Self {
        self.poll_tick = d;
        self
    }

    /// Set the heartbeat tick.
    #[must_use]
    pub const fn with_heartbeat_tick(mut self, d: Duration) -> Self {
        self.heartbeat_tick = d;
        self
    }

    /// Set the number of idle heartbeats that time a session out.
    #[must_use]
    pub const fn with_session_timeout_heartbeats(mut self, n: u32) -> Self {
        self.session_timeout_heartbeats = n;
        self
    }

    /// The absolute session timeout, derived from heartbeat tick × count.
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        self.heartbeat_tick * self.session_timeout_heartbeats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_timeout_is_five_seconds() {
        let cfg = Config::default();
        assert_eq!(cfg.session_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn builder_overrides_heartbeat() {
        let cfg = Config::default().with_heartbeat_tick(Duration::from_millis(100));
        assert_eq!(cfg.heartbeat_tick, Duration::from_millis(100));
        assert_eq!(
            cfg.session_timeout(),
            Duration::from_millis(100 * u64::from(SESSION_TIMEOUT_HEARTBEATS))
        );
    }
}
