//! Prefix-match pattern route map (§4.C).
//!
//! Ground: same `SubscriptionIndex` hash-bucket structure as
//! [`crate::subject_route`], reused here for pattern (prefix) subscriptions.
//! Matching a published subject against registered prefixes is the
//! dispatcher's job (§4.G): it hashes each candidate prefix of the subject
//! with the same hash function used at PSUB time and probes this map's
//! buckets directly, rather than this module scanning every pattern on
//! every publish.

use hashbrown::HashMap;

use crate::idset::{Compressor, IdHandle, ModifyOutcome};

struct Entry {
    prefix: Box<[u8]>,
    subs: IdHandle,
}

/// Result of [`PatternRouteMap::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    AlreadySubscribed,
    Created,
    Added,
}

/// Result of [`PatternRouteMap::rem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemResult {
    NotFound,
    Removed,
    RemovedEmpty,
}

/// Hash-bucketed prefix → subscriber-id-set map.
#[derive(Default)]
pub struct PatternRouteMap {
    buckets: HashMap<u64, Vec<Entry>>,
    compressor: Compressor,
}

impl PatternRouteMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `peer_id` to the prefix pattern hashing to `hash`.
    pub fn put(&mut self, hash: u64, prefix: &[u8], peer_id: u32) -> PutResult {
        let bucket = self.buckets.entry(hash).or_default();
        if let Some(entry) = bucket.iter_mut().find(|e| &*e.prefix == prefix) {
            return match self.compressor.insert(&entry.subs, peer_id) {
                ModifyOutcome::AlreadyPresent => PutResult::AlreadySubscribed,
                ModifyOutcome::Updated(h) => {
                    entry.subs = h;
                    PutResult::Added
                }
                _ => unreachable!("insert never yields NotPresent/Removed"),
            };
        }
        let subs = self.compressor.encode(&[peer_id]);
        bucket.push(Entry {
            prefix: prefix.into(),
            subs,
        });
        PutResult::Created
    }

    /// Unsubscribe `peer_id` from the prefix pattern hashing to `hash`.
    pub fn rem(&mut self, hash: u64, prefix: &[u8], peer_id: u32) -> RemResult {
        let Some(bucket) = self.buckets.get_mut(&hash) else {
            return RemResult::NotFound;
        };
        let Some(pos) = bucket.iter().position(|e| &*e.prefix == prefix) else {
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

    /// Subscribers of the prefix pattern hashing to `hash`, if registered.
    #[must_use]
    pub fn find_by_hash(&self, hash: u64, prefix: &[u8]) -> Option<Vec<u32>> {
        let bucket = self.buckets.get(&hash)?;
        let entry = bucket.iter().find(|e| &*e.prefix == prefix)?;
        Some(self.compressor.decompress(&entry.subs))
    }

    /// All `(prefix, subscribers)` pairs sharing `hash`'s bucket — used by
    /// the dispatcher to test each candidate prefix length of a subject.
    pub fn iter_hash(&self, hash: u64) -> impl Iterator<Item = (&[u8], Vec<u32>)> {
        self.buckets
            .get(&hash)
            .into_iter()
            .flatten()
            .map(|e| (&*e.prefix, self.compressor.decompress(&e.subs)))
    }

    /// Remove `peer_id` from every pattern entry across the whole map in one
    /// pass (used when a peer session is released, §4.D), returning the
    /// `(hash, prefix)` out-list of entries that became empty and were
    /// dropped so the caller can update any external bookkeeping that
    /// tracks distinct-pattern counts.
    pub fn remove_peer_everywhere(&mut self, peer_id: u32) -> Vec<(u64, Box<[u8]>)> {
        let mut out = Vec::new();
        self.buckets.retain(|&hash, bucket| {
            bucket.retain_mut(|entry| match self.compressor.remove(&entry.subs, peer_id) {
                ModifyOutcome::Removed => {
                    out.push((hash, entry.prefix.clone()));
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

    /// Whether `hash`'s bucket has no live entries left (mirrors
    /// [`crate::subject_route::SubjectRouteMap::bucket_is_empty`]).
    #[must_use]
    pub fn bucket_is_empty(&self, hash: u64) -> bool {
        !self.buckets.contains_key(&hash)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
