//! Session lifecycle table (§4.D, data model §3).
//!
//! Ground: the design note "Cyclic LRU + hash chains" (§9) plus
//! `original_source/include/aekv/ev_aeron.h`, which keeps a named
//! `uint32_t state` bitset (`SESSION_TIMEOUT = 4`, etc.) rather than a bare
//! integer — reflected here as [`SessionState`]. Structurally this module
//! has no direct teacher analogue (the teacher's sockets don't model a peer
//! session table); it's grounded on the design note's "two arrays of
//! `{prev,next}` indices keyed by `id`" description, adapted to the
//! teacher's slab/free-list idiom seen in `monocoque-core/src/alloc.rs`.

use hashbrown::HashMap;
use std::time::Instant;

use crate::config::SESSION_SLAB_SIZE;
use crate::stamp::Stamp;

/// Session state bits (§3 "state: bitset over {NEW, DATALOSS, TIMEOUT,
/// BYE}"), named the way `original_source/include/aekv/ev_aeron.h` names
/// its `uint32_t state` shift constants instead of leaving the bits bare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionState(u8);

impl SessionState {
    /// Set at creation; cleared on the first HELLO-with-ping proving
    /// bidirectional reachability.
    pub const NEW: Self = Self(0b0001);
    /// Set when an inbound frame's sequence gap is not exactly 1.
    pub const DATALOSS: Self = Self(0b0010);
    /// Set after one idle heartbeat tick; eviction happens on the next.
    pub const TIMEOUT: Self = Self(0b0100);
    /// Set when a BYE frame has been processed (terminal, pre-release).
    pub const BYE: Self = Self(0b1000);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// Opaque in-progress fragment reassembly handle (§3 "frag"), owned by
/// `bridge-wire`'s fragment assembler; the peer table only stores/clears it.
pub type FragHandle = Option<Box<[u8]>>;

/// One tracked remote peer (§3 "Session (peer)").
pub struct Session {
    pub id: u32,
    pub stamp: Stamp,
    pub last_active: Instant,
    pub last_seqno: u64,
    pub delta_seqno: i64,
    pub pub_count: u64,
    pub sub_count: u32,
    pub psub_count: u32,
    pub state: SessionState,
    pub frag: FragHandle,

    // Hash-chain linkage (collisions on `stamp`'s bucket).
    next_id: Option<u32>,
    prev_id: Option<u32>,
    // Global LRU linkage, most-recently-active at the head.
    lru_next: Option<u32>,
    lru_prev: Option<u32>,
}

impl Session {
    fn new(id: u32, stamp: Stamp, now: Instant) -> Self {
        Self {
            id,
            stamp,
            last_active: now,
            last_seqno: 0,
            delta_seqno: 0,
            pub_count: 0,
            sub_count: 0,
            psub_count: 0,
            state: SessionState::NEW,
            frag: None,
            next_id: None,
            prev_id: None,
            lru_next: None,
            lru_prev: None,
        }
    }
}

enum Slot {
    Occupied(Session),
    Free { next_free: Option<u32> },
}

/// Outcome of [`PeerTable::update_session`] — whether this is a brand-new
/// session or an existing one that was touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Created,
    DatalossDetected,
    Updated,
}

/// Session array plus stamp-hash chain and LRU list over the same slots
/// (§9 "Cyclic LRU + hash chains" — two intersecting doubly-linked lists
/// implemented as index pairs, not owning pointers).
pub struct PeerTable {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    stamp_buckets: HashMap<u64, u32>,
    lru_head: Option<u32>,
    lru_tail: Option<u32>,
    /// MRU single-entry cache, consulted before the stamp-hash lookup.
    last_session: Option<(Stamp, u32)>,
    /// Rotating cursor for `next_ping`.
    ping_cursor: Option<u32>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            stamp_buckets: HashMap::new(),
            lru_head: None,
            lru_tail: None,
            last_session: None,
            ping_cursor: None,
        }
    }

    fn bucket_of(stamp: Stamp) -> u64 {
        stamp.raw()
    }

    fn alloc_slot(&mut self) -> u32 {
        if let Some(id) = self.free_head {
            let Slot::Free { next_free } = self.slots[id as usize] else {
                unreachable!("free_head points at an occupied slot")
            };
            self.free_head = next_free;
            return id;
        }
        let base = self.slots.len();
        self.slots.reserve(SESSION_SLAB_SIZE);
        for i in 0..SESSION_SLAB_SIZE {
            let id = (base + i) as u32;
            self.slots.push(Slot::Free {
                next_free: if i + 1 < SESSION_SLAB_SIZE {
                    Some(id + 1)
                } else {
                    None
                },
            });
        }
        self.free_head = Some((base + 1) as u32);
        base as u32
    }

    fn session(&self, id: u32) -> &Session {
        match &self.slots[id as usize] {
            Slot::Occupied(s) => s,
            Slot::Free { .. } => unreachable!("stale session id {id}"),
        }
    }

    fn session_mut(&mut self, id: u32) -> &mut Session {
        match &mut self.slots[id as usize] {
            Slot::Occupied(s) => s,
            Slot::Free { .. } => unreachable!("stale session id {id}"),
        }
    }

    /// Borrow a live session by id.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&Session> {
        match self.slots.get(id as usize)? {
            Slot::Occupied(s) => Some(s),
            Slot::Free { .. } => None,
        }
    }

    #[must_use]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut Session> {
        match self.slots.get_mut(id as usize)? {
            Slot::Occupied(s) => Some(s),
            Slot::Free { .. } => None,
        }
    }

    fn lru_unlink(&mut self, id: u32) {
        let (prev, next) = {
            let s = self.session(id);
            (s.lru_prev, s.lru_next)
        };
        match prev {
            Some(p) => self.session_mut(p).lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.session_mut(n).lru_prev = prev,
            None => self.lru_tail = prev,
        }
        let s = self.session_mut(id);
        s.lru_prev = None;
        s.lru_next = None;
    }

    fn lru_push_head(&mut self, id: u32) {
        let old_head = self.lru_head;
        {
            let s = self.session_mut(id);
            s.lru_prev = None;
            s.lru_next = old_head;
        }
        if let Some(h) = old_head {
            self.session_mut(h).lru_prev = Some(id);
        }
        self.lru_head = Some(id);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(id);
        }
    }

    fn promote_to_lru_head(&mut self, id: u32) {
        if self.lru_head == Some(id) {
            return;
        }
        self.lru_unlink(id);
        self.lru_push_head(id);
    }

    fn hash_chain_insert(&mut self, stamp: Stamp, id: u32) {
        let bucket = Self::bucket_of(stamp);
        let old_head = self.stamp_buckets.insert(bucket, id);
        self.session_mut(id).next_id = old_head;
        if let Some(h) = old_head {
            self.session_mut(h).prev_id = Some(id);
        }
    }

    fn hash_chain_remove(&mut self, id: u32) {
        let (prev, next, stamp) = {
            let s = self.session(id);
            (s.prev_id, s.next_id, s.stamp)
        };
        match prev {
            Some(p) => self.session_mut(p).next_id = next,
            None => {
                let bucket = Self::bucket_of(stamp);
                match next {
                    Some(n) => {
                        self.stamp_buckets.insert(bucket, n);
                    }
                    None => {
                        self.stamp_buckets.remove(&bucket);
                    }
                }
            }
        }
        if let Some(n) = next {
            self.session_mut(n).prev_id = prev;
        }
    }

    fn find_by_stamp(&self, stamp: Stamp) -> Option<u32> {
        let mut cursor = self.stamp_buckets.get(&Self::bucket_of(stamp)).copied();
        while let Some(id) = cursor {
            let s = self.session(id);
            if s.stamp == stamp {
                return Some(id);
            }
            cursor = s.next_id;
        }
        None
    }

    fn new_session(&mut self, stamp: Stamp, now: Instant) -> u32 {
        let id = self.alloc_slot();
        self.slots[id as usize] = Slot::Occupied(Session::new(id, stamp, now));
        self.hash_chain_insert(stamp, id);
        self.lru_push_head(id);
        id
    }

    /// Look up or create the session for `stamp`, recording `seqno` and
    /// detecting dataloss gaps (§4.D `update_session`).
    pub fn update_session(&mut self, stamp: Stamp, seqno: u64, now: Instant) -> (u32, UpdateOutcome) {
        if let Some((cached_stamp, id)) = self.last_session {
            if cached_stamp == stamp {
                return (id, self.touch(id, seqno, now, false));
            }
        }
        if let Some(id) = self.find_by_stamp(stamp) {
            self.last_session = Some((stamp, id));
            return (id, self.touch(id, seqno, now, false));
        }
        let id = self.new_session(stamp, now);
        self.last_session = Some((stamp, id));
        (id, self.touch(id, seqno, now, true))
    }

    fn touch(&mut self, id: u32, seqno: u64, now: Instant, just_created: bool) -> UpdateOutcome {
        let outcome = {
            let s = self.session_mut(id);
            if just_created {
                s.last_seqno = seqno;
                s.delta_seqno = 1;
                UpdateOutcome::Created
            } else {
                let delta = seqno as i64 - s.last_seqno as i64;
                s.delta_seqno = delta;
                s.last_seqno = seqno;
                if delta != 1 {
                    s.state.insert(SessionState::DATALOSS);
                    UpdateOutcome::DatalossDetected
                } else {
                    s.state.remove(SessionState::TIMEOUT);
                    UpdateOutcome::Updated
                }
            }
        };
        self.session_mut(id).last_active = now;
        self.promote_to_lru_head(id);
        outcome
    }

    /// Inspect the LRU tail for idleness (§4.D `check_timeout`). Returns the
    /// id to evict if the tail was already `TIMEOUT`-flagged and is still
    /// idle at `cutoff`; otherwise flags it `TIMEOUT` and returns `None`.
    pub fn check_timeout(&mut self, cutoff: Instant) -> Option<u32> {
        let tail = self.lru_tail?;
        let s = self.session(tail);
        if s.last_active >= cutoff {
            return None;
        }
        if s.state.contains(SessionState::TIMEOUT) {
            return Some(tail);
        }
        self.session_mut(tail).state.insert(SessionState::TIMEOUT);
        None
    }

    /// Release a session: unlink from LRU and hash chain, return slot to
    /// the free list (§4.D `release_session`). Returns the freed session's
    /// fragment handle so the caller can drop any in-progress reassembly.
    pub fn release_session(&mut self, id: u32) -> FragHandle {
        self.hash_chain_remove(id);
        self.lru_unlink(id);
        if self.last_session.map(|(_, cached)| cached) == Some(id) {
            self.last_session = None;
        }
        if self.ping_cursor == Some(id) {
            self.ping_cursor = None;
        }
        let frag = match std::mem::replace(&mut self.slots[id as usize], Slot::Free { next_free: self.free_head }) {
            Slot::Occupied(mut s) => s.frag.take(),
            Slot::Free { .. } => unreachable!("double release of session {id}"),
        };
        self.free_head = Some(id);
        frag
    }

    /// Rotating heartbeat-probe cursor (§4.D `next_ping`): returns the next
    /// live peer's stamp to address, walking the LRU list and wrapping.
    pub fn next_ping(&mut self) -> Option<Stamp> {
        let start = self.ping_cursor.or(self.lru_head)?;
        let next = self.session(start).lru_next.or(self.lru_head);
        self.ping_cursor = next;
        Some(self.session(start).stamp)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied(_)))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn stamp(n: u16) -> Stamp {
        Stamp::addressable(Ipv4Addr::new(10, 0, 0, 1), 1, n)
    }

    #[test]
    fn first_frame_creates_session() {
        let mut t = PeerTable::new();
        let now = Instant::now();
        let (id, outcome) = t.update_session(stamp(1), 1, now);
        assert_eq!(outcome, UpdateOutcome::Created);
        assert!(t.get(id).unwrap().state.contains(SessionState::NEW));
    }

    #[test]
    fn sequential_seqno_clears_timeout() {
        let mut t = PeerTable::new();
        let now = Instant::now();
        let (id, _) = t.update_session(stamp(1), 1, now);
        t.session_mut(id).state.insert(SessionState::TIMEOUT);
        let (_, outcome) = t.update_session(stamp(1), 2, now);
        assert_eq!(outcome, UpdateOutcome::Updated);
        assert!(!t.get(id).unwrap().state.contains(SessionState::TIMEOUT));
    }

    #[test]
    fn gap_in_seqno_sets_dataloss() {
        let mut t = PeerTable::new();
        let now = Instant::now();
        t.update_session(stamp(1), 1, now);
        let (id, outcome) = t.update_session(stamp(1), 5, now);
        assert_eq!(outcome, UpdateOutcome::DatalossDetected);
        assert!(t.get(id).unwrap().state.contains(SessionState::DATALOSS));
    }

    #[test]
    fn check_timeout_requires_two_idle_ticks() {
        let mut t = PeerTable::new();
        let t0 = Instant::now();
        let (id, _) = t.update_session(stamp(1), 1, t0);
        let cutoff = t0 + Duration::from_secs(5);

        assert_eq!(t.check_timeout(cutoff), None);
        assert!(t.get(id).unwrap().state.contains(SessionState::TIMEOUT));

        assert_eq!(t.check_timeout(cutoff), Some(id));
    }

    #[test]
    fn release_session_frees_slot_for_reuse() {
        let mut t = PeerTable::new();
        let now = Instant::now();
        let (id, _) = t.update_session(stamp(1), 1, now);
        t.release_session(id);
        assert!(t.get(id).is_none());
        assert!(t.is_empty());

        let (id2, _) = t.update_session(stamp(2), 1, now);
        assert_eq!(id2, id, "freed slot should be recycled");
    }

    #[test]
    fn update_session_promotes_to_lru_head() {
        let mut t = PeerTable::new();
        let now = Instant::now();
        let (id1, _) = t.update_session(stamp(1), 1, now);
        let (id2, _) = t.update_session(stamp(2), 1, now);
        assert_eq!(t.lru_tail, Some(id1));
        t.update_session(stamp(1), 2, now);
        assert_eq!(t.lru_tail, Some(id2));
    }

    #[test]
    fn next_ping_rotates_through_live_peers() {
        let mut t = PeerTable::new();
        let now = Instant::now();
        let (id1, _) = t.update_session(stamp(1), 1, now);
        let (id2, _) = t.update_session(stamp(2), 1, now);
        let first = t.next_ping().unwrap();
        let second = t.next_ping().unwrap();
        assert_ne!(first, second);
        let ids = [t.get(id1).unwrap().stamp, t.get(id2).unwrap().stamp];
        assert!(ids.contains(&first));
        assert!(ids.contains(&second));
    }

    #[test]
    fn slab_growth_allocates_in_batches() {
        let mut t = PeerTable::new();
        let now = Instant::now();
        for i in 0..(SESSION_SLAB_SIZE as u16 + 1) {
            t.update_session(stamp(i), 1, now);
        }
        assert_eq!(t.slots.len(), SESSION_SLAB_SIZE * 2);
    }
}
