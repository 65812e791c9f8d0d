//! The `LocalBus` collaborator contract (§6 "Local-bus contract", §1
//! "out of scope: the local bus internals").
//!
//! Ground: `monocoque-core/src/monitor.rs`'s `SocketEvent`/flume-channel
//! pair for the producer side (`notify_*`), and `socket_trait.rs`'s
//! `#[async_trait(?Send)]` trait shape for the consumer side (`on_*`).

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// A route-change notification the bridge emits to the local bus when a
/// remote peer's subscription set changes (§4.G "`notify_sub(rcnt, 'A',
/// reply)`" and siblings).
#[derive(Debug, Clone)]
pub struct RouteNotification {
    pub hash: u32,
    pub subject: Bytes,
    /// Aggregate route count after this change (§8 invariant 3: "the
    /// local-bus aggregate-route count equals 1... or 0").
    pub rcnt: u32,
    /// `'A'` (add) or `'D'` (delete), matching the wire code convention
    /// (see [`crate::frame::CODE_ADD`]/[`crate::frame::CODE_DEL`]).
    pub action: u8,
    pub reply: Bytes,
}

impl fmt::Display for RouteNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} subject={:?} rcnt={}",
            self.action as char, self.subject, self.rcnt
        )
    }
}

/// A locally-published message handed to the bridge for forwarding onto
/// the fabric (§6 "`on_msg(pub)`... self-publishes... are suppressed").
#[derive(Debug, Clone)]
pub struct LocalPublish {
    pub subject: Bytes,
    pub payload: Bytes,
    /// The route/fd this publish originated from; self-publishes
    /// (`src_route == our.fd`) are suppressed by the caller before this
    /// ever reaches [`LocalBus::on_msg`].
    pub src_route: u32,
}

/// Consumer side: the bridge implements `on_sub`/`on_unsub`/`on_psub`/
/// `on_punsub` (route changes originating elsewhere) and `on_msg` (a local
/// publish to forward). Producer side: the bridge calls `notify_sub` and
/// its siblings to announce remote-originated routes to the bus.
///
/// An embedder supplies the real bus; this crate ships [`InMemoryLocalBus`]
/// as a test double.
#[async_trait(?Send)]
pub trait LocalBus {
    /// A subscribe route-change originating elsewhere. Implementations
    /// must ignore notifications whose `src_fd` equals the bridge's own fd
    /// (§6 "Notifications whose `src_fd` equals the bridge's own fd are
    /// ignored").
    fn on_sub(&mut self, hash: u32, subject: &[u8], src_fd: u32, rcnt: u32, reply: &[u8]);
    fn on_unsub(&mut self, hash: u32, subject: &[u8], src_fd: u32, rcnt: u32, reply: &[u8]);
    fn on_psub(&mut self, hash: u32, pattern: &[u8], src_fd: u32, rcnt: u32, reply: &[u8]);
    fn on_punsub(&mut self, hash: u32, pattern: &[u8], src_fd: u32, rcnt: u32, reply: &[u8]);

    /// Accept a local publish for forwarding onto the fabric.
    async fn on_msg(&mut self, publish: LocalPublish);

    /// Announce a remote-originated subscribe/unsubscribe/pattern change.
    fn notify_sub(&mut self, n: RouteNotification);
    fn notify_unsub(&mut self, n: RouteNotification);
    fn notify_psub(&mut self, n: RouteNotification);
    fn notify_punsub(&mut self, n: RouteNotification);

    /// Register/drop the one shared aggregate fabric-level route for a
    /// hash (§4.G "on NEW, `add_sub_route` into local bus"; §8 invariant 3
    /// "one shared route per fabric"). Called exactly once per hash
    /// transitioning to/from having any live entry, independent of how
    /// many individual peers are subscribed under it.
    fn add_sub_route(&mut self, hash: u32, subject: &[u8]);
    fn del_sub_route(&mut self, hash: u32, subject: &[u8]);
    fn add_pattern_route(&mut self, hash: u32, pattern: &[u8]);
    fn del_pattern_route(&mut self, hash: u32, pattern: &[u8]);
}

/// In-memory `LocalBus` test double: every `notify_*`/`on_msg` call is
/// appended to a log the test can inspect.
#[derive(Default)]
pub struct InMemoryLocalBus {
    pub notifications: Vec<RouteNotification>,
    pub forwarded: Vec<LocalPublish>,
    pub own_fd: u32,
    /// Hashes with a live aggregate subject route registered.
    pub sub_routes: std::collections::HashSet<u32>,
    /// Hashes with a live aggregate pattern route registered.
    pub pattern_routes: std::collections::HashSet<u32>,
}

impl InMemoryLocalBus {
    #[must_use]
    pub fn new(own_fd: u32) -> Self {
        Self {
            own_fd,
            ..Self::default()
        }
    }
}

#[async_trait(?Send)]
impl LocalBus for InMemoryLocalBus {
    fn on_sub(&mut self, _hash: u32, _subject: &[u8], _src_fd: u32, _rcnt: u32, _reply: &[u8]) {}
    fn on_unsub(&mut self, _hash: u32, _subject: &[u8], _src_fd: u32, _rcnt: u32, _reply: &[u8]) {}
    fn on_psub(&mut self, _hash: u32, _pattern: &[u8], _src_fd: u32, _rcnt: u32, _reply: &[u8]) {}
    fn on_punsub(&mut self, _hash: u32, _pattern: &[u8], _src_fd: u32, _rcnt: u32, _reply: &[u8]) {}

    async fn on_msg(&mut self, publish: LocalPublish) {
        if publish.src_route == self.own_fd {
            return;
        }
        self.forwarded.push(publish);
    }

    fn notify_sub(&mut self, n: RouteNotification) {
        self.notifications.push(n);
    }

    fn notify_unsub(&mut self, n: RouteNotification) {
        self.notifications.push(n);
    }

    fn notify_psub(&mut self, n: RouteNotification) {
        self.notifications.push(n);
    }

    fn notify_punsub(&mut self, n: RouteNotification) {
        self.notifications.push(n);
    }

    fn add_sub_route(&mut self, hash: u32, _subject: &[u8]) {
        self.sub_routes.insert(hash);
    }

    fn del_sub_route(&mut self, hash: u32, _subject: &[u8]) {
        self.sub_routes.remove(&hash);
    }

    fn add_pattern_route(&mut self, hash: u32, _pattern: &[u8]) {
        self.pattern_routes.insert(hash);
    }

    fn del_pattern_route(&mut self, hash: u32, _pattern: &[u8]) {
        self.pattern_routes.remove(&hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CODE_ADD, CODE_DEL};

    #[test]
    fn notify_sub_appends_to_log() {
        let mut bus = InMemoryLocalBus::new(1);
        bus.notify_sub(RouteNotification {
            hash: 1,
            subject: Bytes::from_static(b"a"),
            rcnt: 1,
            action: CODE_ADD,
            reply: Bytes::new(),
        });
        assert_eq!(bus.notifications.len(), 1);
        assert_eq!(bus.notifications[0].action, CODE_ADD);
    }

    #[test]
    fn notify_unsub_uses_delete_code() {
        let mut bus = InMemoryLocalBus::new(1);
        bus.notify_unsub(RouteNotification {
            hash: 1,
            subject: Bytes::from_static(b"a"),
            rcnt: 0,
            action: CODE_DEL,
            reply: Bytes::new(),
        });
        assert_eq!(bus.notifications[0].action, CODE_DEL);
    }

    #[test]
    fn self_publish_is_suppressed() {
        let mut bus = InMemoryLocalBus::new(5);
        let rt = compio::runtime::Runtime::new().unwrap();
        rt.block_on(bus.on_msg(LocalPublish {
            subject: Bytes::from_static(b"a"),
            payload: Bytes::new(),
            src_route: 5,
        }));
        assert!(bus.forwarded.is_empty());
    }
}
