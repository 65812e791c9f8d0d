//! Exact-match subject route map (§4.B).
//!
//! Ground: `monocoque-core/src/pubsub/index.rs`'s `SubscriptionIndex`, which
//! buckets subscriptions by a hash of the topic and stores a small peer list
//! per entry. That structure was built around sorted-prefix matching; this
//! module strips it down to pure exact-match hash lookup (wildcard/prefix
//! matching lives in [`crate::pattern_route`] instead) and swaps its peer
//! list for the [`crate::idset`] compressor so high-fanout subjects don't
//! pay a linear `Vec` clone on every subscribe/unsubscribe.

use hashbrown::HashMap;

use crate::idset::{Compressor, IdHandle, ModifyOutcome};

/// One exact-match subject's subscriber set, keyed by a 64-bit subject hash.
struct Entry {
    subject: Box<[u8]>,
    subs: IdHandle,
}

/// Result of [`SubjectRouteMap::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// `peer_id` was already subscribed to this subject; no change made.
    AlreadySubscribed,
    /// A new entry was created for this subject (first subscriber).
    Created,
    /// `peer_id` was added to an existing entry's subscriber set.
    Added,
}

/// Result of [`SubjectRouteMap::rem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemResult {
    /// No entry existed for this subject, or `peer_id` wasn't subscribed.
    NotFound,
    /// `peer_id` was removed; the entry still has other subscribers.
    Removed,
    /// `peer_id` was removed and the entry had no subscribers left, so it
    /// was dropped from the map.
    RemovedEmpty,
}

/// Hash-bucketed exact-match subject → subscriber-id-set map.
///
/// Multiple distinct subjects can collide on the same hash bucket; each
/// bucket holds a small `Vec<Entry>` searched linearly, same as the
/// teacher's `SubscriptionIndex` buckets.
#[derive(Default)]
pub struct SubjectRouteMap {
    buckets: HashMap<u64, Vec<Entry>>,
    compressor: Compressor,
}

impl SubjectRouteMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `peer_id` to `subject` (already hashed by the caller via a
    /// shared hash function, per §4.B — the map itself is hash-agnostic).
    pub fn put(&mut self, hash: u64, subject: &[u8], peer_id: u32) -> PutResult {
        let bucket = self.buckets.entry(hash).or_default();
        if let Some(entry) = bucket.iter_mut().find(|e| &*e.subject == subject) {
            return match self.compressor.insert(&entry.subs, peer_id) {
                ModifyOutcome::AlreadyPresent => PutResult::AlreadySubscribed,
                ModifyOutcome::Updated(h) => {
                    entry.subs = h;
                    PutResult::Added
                }
                ModifyOutcome::NotPresent | ModifyOutcome::Removed => {
                    unreachable!("insert never yields NotPresent/Removed")
                }
            };
        }
        let subs = self.compressor.encode(&[peer_id]);
        bucket.push(Entry {
            subject: subject.into(),
            subs,
        });
        PutResult::Created
    }

    /// Unsubscribe `peer_id` from `subject`.
    pub fn rem(&mut self, hash: u64, subject: &[u8], peer_id: u32) -> RemResult {
        let Some(bucket) = self.buckets.get_mut(&hash) else {
            return RemResult::NotFound;
        };
        let Some(pos) = bucket.iter().position(|e| &*e.subject == subject) else {
            return RemResult::NotFound;
        };
        match self.compressor.remove(&bucket[pos].subs, peer_id) {
            ModifyOutcome::NotPresent => RemResult::NotFound,
            ModifyOutcome::Updated(h) => {
                bucket[pos].subs = h;
                RemResult::Removed
            }
            ModifyOutcome::Removed => {
                bucket.swap_remove(pos);
                if bucket.is_empty() {
                    self.buckets.remove(&hash);
                }
                RemResult::RemovedEmpty
            }
            ModifyOutcome::AlreadyPresent => unreachable!("remove never yields AlreadyPresent"),
        }
    }

    /// First subscriber id-set matching `subject` in `hash`'s bucket, if any.
    #[must_use]
    pub fn find_by_hash(&self, hash: u64, subject: &[u8]) -> Option<Vec<u32>> {
        let bucket = self.buckets.get(&hash)?;
        let entry = bucket.iter().find(|e| &*e.subject == subject)?;
        Some(self.compressor.decompress(&entry.subs))
    }

    /// First subject entry in `hash`'s bucket, regardless of exact subject
    /// match — used by dispatch paths that already know the hash collided
    /// and want to walk every subject sharing it.
    #[must_use]
    pub fn first(&self, hash: u64) -> Option<(&[u8], Vec<u32>)> {
        let bucket = self.buckets.get(&hash)?;
        let entry = bucket.first()?;
        Some((&entry.subject, self.compressor.decompress(&entry.subs)))
    }

    /// Iterate every `(subject, subscribers)` pair sharing `hash`'s bucket.
    pub fn iter_hash(&self, hash: u64) -> impl Iterator<Item = (&[u8], Vec<u32>)> {
        self.buckets
            .get(&hash)
            .into_iter()
            .flatten()
            .map(|e| (&*e.subject, self.compressor.decompress(&e.subs)))
    }

    /// Whether `hash`'s bucket has no live entries left — used after a
    /// `rem` that emptied one entry, to decide whether the *aggregate*
    /// fabric-level route for this hash should be dropped too (§4.G
    /// "if no other entry shares the hash, del_sub_route"; §8 invariant 3).
    #[must_use]
    pub fn bucket_is_empty(&self, hash: u64) -> bool {
        !self.buckets.contains_key(&hash)
    }

    /// Remove `peer_id` from every subject entry across the whole map in
    /// one pass (peer release / dataloss recovery, §4.G "clear all
    /// session-owned routes"), returning the `(hash, subject)` pairs that
    /// became empty and were dropped.
    pub fn remove_peer_everywhere(&mut self, peer_id: u32) -> Vec<(u64, Box<[u8]>)> {
        let mut out = Vec::new();
        self.buckets.retain(|&hash, bucket| {
            bucket.retain_mut(|entry| match self.compressor.remove(&entry.subs, peer_id) {
                ModifyOutcome::Removed => {
                    out.push((hash, entry.subject.clone()));
                    false
                }
                ModifyOutcome::Updated(h) => {
                    entry.subs = h;
                    true
                }
                ModifyOutcome::NotPresent => true,
                ModifyOutcome::AlreadyPresent => unreachable!(),
            });
            !bucket.is_empty()
        });
        out
    }

    /// Total number of distinct subjects tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
