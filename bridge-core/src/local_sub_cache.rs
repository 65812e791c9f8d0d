//! Local subscription announcement cache (§4.E).
//!
//! A linear arena of subscription-announcement records plus a
//! collision-chained hash index, so `publish_my_subs()` (§4.G HELLO
//! handling) can replay every locally-registered subscription without
//! walking the live route maps. Ground: `monocoque-core/src/alloc.rs`'s
//! arena-with-freelist idiom, generalized here to tombstone-based removal
//! plus periodic compaction rather than per-slot reuse, since records are
//! variable-length (subject bytes + optional reply bytes) and can't be
//! slotted into a fixed-size free list the way fixed peer sessions are in
//! [`crate::peer_table`].

use hashbrown::HashMap;

use crate::config::LOCAL_SUB_CACHE_GC_MIN_FREE;

/// One subscription announcement: either a plain subject (exact SUB) or a
/// pattern (PSUB), distinguished by `is_pattern`.
#[derive(Debug, Clone)]
struct Record {
    hash: u64,
    subject: Box<[u8]>,
    reply: Box<[u8]>,
    is_pattern: bool,
    /// Intrusive next-pointer within this hash bucket's chain; `None` ends
    /// the chain. Tombstoned records keep their chain position until gc.
    next: Option<usize>,
    /// Tombstone marker (§3 "sentinel `sublen == 0`").
    live: bool,
}

/// One subscription announcement as seen by callers (a decoded `Record`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAnnouncement {
    pub subject: Box<[u8]>,
    pub reply: Box<[u8]>,
    pub is_pattern: bool,
}

/// Arena + hash index of locally-registered subscription announcements.
#[derive(Default)]
pub struct LocalSubCache {
    arena: Vec<Record>,
    /// subject-hash → index of the chain head in `arena`.
    index: HashMap<u64, usize>,
    /// Count of tombstoned (dead, not yet reclaimed) records.
    subs_free: usize,
}

impl LocalSubCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn gc_should_trigger(&self) -> bool {
        self.subs_free * 2 > self.arena.len() && self.subs_free > LOCAL_SUB_CACHE_GC_MIN_FREE
    }

    /// Insert or update the announcement for `hash`/`subject` (§4.E
    /// `upsert`). If an equal-subject record already exists in the chain it
    /// is tombstoned and replaced in place (same chain position) by a fresh
    /// append, rather than mutated, so the intrusive next-pointer scheme
    /// never needs an in-place resize.
    pub fn upsert(&mut self, hash: u64, subject: &[u8], reply: &[u8], is_pattern: bool) {
        if self.gc_should_trigger() {
            self.gc();
        }

        let mut cursor = self.index.get(&hash).copied();
        let mut prev: Option<usize> = None;
        while let Some(i) = cursor {
            if self.arena[i].live && &*self.arena[i].subject == subject {
                let next = self.arena[i].next;
                self.arena[i].live = false;
                self.subs_free += 1;
                let new_idx = self.append(hash, subject, reply, is_pattern, next);
                match prev {
                    Some(p) => self.arena[p].next = Some(new_idx),
                    None => {
                        self.index.insert(hash, new_idx);
                    }
                }
                return;
            }
            prev = Some(i);
            cursor = self.arena[i].next;
        }
        let new_idx = self.append(hash, subject, reply, is_pattern, self.index.get(&hash).copied());
        self.index.insert(hash, new_idx);
    }

    fn append(
        &mut self,
        hash: u64,
        subject: &[u8],
        reply: &[u8],
        is_pattern: bool,
        next: Option<usize>,
    ) -> usize {
        self.arena.push(Record {
            hash,
            subject: subject.into(),
            reply: reply.into(),
            is_pattern,
            next,
            live: true,
        });
        self.arena.len() - 1
    }

    /// Remove the exact-subject announcement matching `hash`/`subject`
    /// (§4.E `remove`).
    pub fn remove(&mut self, hash: u64, subject: &[u8]) {
        self.remove_matching(hash, |r| !r.is_pattern && &*r.subject == subject);
    }

    /// Remove the pattern announcement whose *reply* bytes equal `pattern`
    /// (§4.E `remove_pattern`: "matches by stored reply-bytes... rather
    /// than the primary subject bytes").
    pub fn remove_pattern(&mut self, hash: u64, pattern: &[u8]) {
        self.remove_matching(hash, |r| r.is_pattern && &*r.reply == pattern);
    }

    fn remove_matching(&mut self, hash: u64, pred: impl Fn(&Record) -> bool) {
        let mut cursor = self.index.get(&hash).copied();
        let mut prev: Option<usize> = None;
        while let Some(i) = cursor {
            let next = self.arena[i].next;
            if self.arena[i].live && pred(&self.arena[i]) {
                self.arena[i].live = false;
                self.subs_free += 1;
                match prev {
                    Some(p) => self.arena[p].next = next,
                    None => match next {
                        Some(n) => {
                            self.index.insert(hash, n);
                        }
                        None => {
                            self.index.remove(&hash);
                        }
                    },
                }
                return;
            }
            prev = Some(i);
            cursor = next;
        }
    }

    /// Rebuild the index and compact the arena, dropping tombstones
    /// (§4.E `gc`). After this call `subs_free == 0`.
    pub fn gc(&mut self) {
        let live: Vec<Record> = self.arena.drain(..).filter(|r| r.live).collect();
        self.arena = live;
        self.index.clear();
        // Rebuild chains: iterate in arena order, pushing each record to the
        // front of its bucket so iteration order matches pre-gc insertion
        // order within a bucket reversed — acceptable since chain order is
        // not an externally observable invariant, only chain reachability.
        for i in 0..self.arena.len() {
            let hash = self.arena[i].hash;
            let old_head = self.index.insert(hash, i);
            self.arena[i].next = old_head;
        }
        self.subs_free = 0;
    }

    /// Every live announcement, for `publish_my_subs()` (§4.G HELLO
    /// handling) to replay into the outbound queue.
    pub fn iter_live(&self) -> impl Iterator<Item = SubAnnouncement> + '_ {
        self.arena.iter().filter(|r| r.live).map(|r| SubAnnouncement {
            subject: r.subject.clone(),
            reply: r.reply.clone(),
            is_pattern: r.is_pattern,
        })
    }

    #[must_use]
    pub fn subs_free(&self) -> usize {
        self.subs_free
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arena.iter().all(|r| !r.live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(subject: &[u8]) -> u64 {
        subject.iter().fold(0xcbf29ce484222325u64, |h, &b| {
            (h ^ u64::from(b)).wrapping_mul(0x100000001b3)
        })
    }

    #[test]
    fn upsert_then_iter_live() {
        let mut c = LocalSubCache::new();
        c.upsert(hash(b"a"), b"a", b"", false);
        let live: Vec<_> = c.iter_live().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(&*live[0].subject, b"a");
    }

    #[test]
    fn upsert_same_subject_replaces_without_duplicating() {
        let mut c = LocalSubCache::new();
        c.upsert(hash(b"a"), b"a", b"r1", false);
        c.upsert(hash(b"a"), b"a", b"r2", false);
        let live: Vec<_> = c.iter_live().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(&*live[0].reply, b"r2");
    }

    #[test]
    fn remove_tombstones_and_drops_from_iteration() {
        let mut c = LocalSubCache::new();
        c.upsert(hash(b"a"), b"a", b"", false);
        c.remove(hash(b"a"), b"a");
        assert_eq!(c.iter_live().count(), 0);
        assert!(c.is_empty());
    }

    #[test]
    fn remove_pattern_matches_by_reply_bytes() {
        let mut c = LocalSubCache::new();
        c.upsert(hash(b"orders."), b"orders.", b"orders.*", true);
        c.remove_pattern(hash(b"orders."), b"orders.*");
        assert_eq!(c.iter_live().count(), 0);
    }

    #[test]
    fn colliding_hashes_keep_both_records_until_individually_removed() {
        let mut c = LocalSubCache::new();
        let h = 1u64;
        c.upsert(h, b"a", b"", false);
        c.upsert(h, b"b", b"", false);
        assert_eq!(c.iter_live().count(), 2);
        c.remove(h, b"a");
        let live: Vec<_> = c.iter_live().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(&*live[0].subject, b"b");
    }

    #[test]
    fn gc_compacts_and_clears_free_counter() {
        let mut c = LocalSubCache::new();
        for i in 0..10u8 {
            c.upsert(hash(&[i]), &[i], b"", false);
        }
        for i in 0..5u8 {
            c.remove(hash(&[i]), &[i]);
        }
        assert_eq!(c.subs_free(), 5);
        c.gc();
        assert_eq!(c.subs_free(), 0);
        assert_eq!(c.iter_live().count(), 5);
    }

    #[test]
    fn gc_trigger_math_matches_contract() {
        // subs_free*2 > subs_size && subs_free > 1024
        let mut c = LocalSubCache::new();
        for i in 0..2000u32 {
            c.upsert(i as u64, &i.to_le_bytes(), b"", false);
        }
        for i in 0..1100u32 {
            c.remove(i as u64, &i.to_le_bytes());
        }
        assert!(c.gc_should_trigger());
    }
}
