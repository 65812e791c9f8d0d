//! Delta/route compressor (§4.A): a compressed representation of a sorted
//! set of small session ids, refcounted when the set outgrows an inline
//! representation.
//!
//! Ground: `monocoque-core/src/pubsub/index.rs` stores a `SmallVec<[PeerKey;
//! 4]>` inline per subscription to dodge heap allocation for the common
//! low-fanout case; this module generalizes that idea into an explicit
//! two-variant handle (§9 design note "Refcounted compressed sets") so a
//! route whose fanout grows large shares one heap-backed arena slot instead
//! of cloning a growing `Vec` on every insert/remove.

use smallvec::SmallVec;

/// Ids up to this count are stored inline in the handle itself; beyond it,
/// the set is promoted to a refcounted arena slot.
pub const INLINE_CAP: usize = 4;

type InlineIds = SmallVec<[u32; INLINE_CAP]>;

/// Opaque handle to a compressed, sorted set of session ids.
///
/// `Empty` is the "zero handle": callers must treat it as a signal to
/// remove the parent map entry (§4.A "Return contract on modify").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IdHandle {
    #[default]
    Empty,
    Inline(InlineIds),
    Shared(u32),
}

impl IdHandle {
    /// Whether this is the zero handle.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

struct Slot {
    ids: Vec<u32>,
    refcount: u32,
}

/// Outcome of a `Compressor::modify` call, matching the return contract in
/// §4.A exactly: unchanged-present, unchanged-absent, became-empty, or
/// replaced by a new handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifyOutcome {
    /// Insert requested but the id was already a member; id-set unchanged.
    AlreadyPresent,
    /// Remove requested but the id was not a member; id-set unchanged.
    NotPresent,
    /// The id-set became empty; the caller must remove the parent map
    /// entry. The old handle has already been deref'd.
    Removed,
    /// The id-set changed and is non-empty; this is the new handle. The
    /// old handle has already been deref'd.
    Updated(IdHandle),
}

/// Arena backing `IdHandle::Shared` slots, with a free list for reuse.
#[derive(Debug, Default)]
pub struct Compressor {
    arena: Vec<Option<Slot>>,
    free: Vec<u32>,
}

impl Compressor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a sorted, deduplicated id list into a handle.
    ///
    /// `existing`, if `Shared`, is *not* reused or derefed here — callers
    /// that are replacing a handle must call [`Compressor::deref`] on the
    /// old handle themselves (this mirrors the source contract: encode and
    /// deref are separate operations, composed by the caller).
    pub fn encode(&mut self, ids: &[u32]) -> IdHandle {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids must be sorted+unique");
        if ids.is_empty() {
            return IdHandle::Empty;
        }
        if ids.len() <= INLINE_CAP {
            return IdHandle::Inline(InlineIds::from_slice(ids));
        }
        let slot = Slot {
            ids: ids.to_vec(),
            refcount: 1,
        };
        let idx = if let Some(idx) = self.free.pop() {
            self.arena[idx as usize] = Some(slot);
            idx
        } else {
            self.arena.push(Some(slot));
            (self.arena.len() - 1) as u32
        };
        IdHandle::Shared(idx)
    }

    /// Decompress a handle into its sorted id list.
    #[must_use]
    pub fn decompress(&self, handle: &IdHandle) -> Vec<u32> {
        match handle {
            IdHandle::Empty => Vec::new(),
            IdHandle::Inline(v) => v.to_vec(),
            IdHandle::Shared(idx) => self.arena[*idx as usize]
                .as_ref()
                .map(|s| s.ids.clone())
                .unwrap_or_default(),
        }
    }

    /// Release a reference to a handle, freeing its arena slot once the
    /// refcount drops to zero. A no-op for `Empty`/`Inline` handles, which
    /// never participate in sharing.
    pub fn deref(&mut self, handle: &IdHandle) {
        if let IdHandle::Shared(idx) = handle {
            let idx = *idx as usize;
            let free_now = if let Some(slot) = self.arena[idx].as_mut() {
                slot.refcount = slot.refcount.saturating_sub(1);
                slot.refcount == 0
            } else {
                false
            };
            if free_now {
                self.arena[idx] = None;
                self.free.push(idx as u32);
            }
        }
    }

    /// Insert `id` into the set encoded by `existing`, returning the
    /// modify-contract outcome. Handles the decompress → modify → re-encode
    /// → deref(old) sequence described in §4.A.
    pub fn insert(&mut self, existing: &IdHandle, id: u32) -> ModifyOutcome {
        let mut ids = self.decompress(existing);
        match ids.binary_search(&id) {
            Ok(_) => ModifyOutcome::AlreadyPresent,
            Err(pos) => {
                ids.insert(pos, id);
                let new_handle = self.encode(&ids);
                self.deref(existing);
                ModifyOutcome::Updated(new_handle)
            }
        }
    }

    /// Remove `id` from the set encoded by `existing`, returning the
    /// modify-contract outcome.
    pub fn remove(&mut self, existing: &IdHandle, id: u32) -> ModifyOutcome {
        let mut ids = self.decompress(existing);
        match ids.binary_search(&id) {
            Err(_) => ModifyOutcome::NotPresent,
            Ok(pos) => {
                ids.remove(pos);
                self.deref(existing);
                if ids.is_empty() {
                    ModifyOutcome::Removed
                } else {
                    ModifyOutcome::Updated(self.encode(&ids))
                }
            }
        }
    }

    /// Number of live shared arena slots (for diagnostics/tests).
    #[must_use]
    pub fn live_shared_slots(&self) -> usize {
        self.arena.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_round_trip() {
        let mut c = Compressor::new();
        let h = c.encode(&[1, 2, 3]);
        assert!(matches!(h, IdHandle::Inline(_)));
        assert_eq!(c.decompress(&h), vec![1, 2, 3]);
    }

    #[test]
    fn promotes_to_shared_past_inline_cap() {
        let mut c = Compressor::new();
        let ids: Vec<u32> = (0..10).collect();
        let h = c.encode(&ids);
        assert!(matches!(h, IdHandle::Shared(_)));
        assert_eq!(c.decompress(&h), ids);
    }

    #[test]
    fn empty_ids_is_empty_handle() {
        let mut c = Compressor::new();
        let h = c.encode(&[]);
        assert_eq!(h, IdHandle::Empty);
    }

    #[test]
    fn insert_then_remove_restores_prior_state() {
        let mut c = Compressor::new();
        let h0 = c.encode(&[1, 3]);
        let h1 = match c.insert(&h0, 2) {
            ModifyOutcome::Updated(h) => h,
            other => panic!("expected Updated, got {other:?}"),
        };
        assert_eq!(c.decompress(&h1), vec![1, 2, 3]);

        let h2 = match c.remove(&h1, 2) {
            ModifyOutcome::Updated(h) => h,
            other => panic!("expected Updated, got {other:?}"),
        };
        assert_eq!(c.decompress(&h2), vec![1, 3]);
    }

    #[test]
    fn remove_to_empty_signals_removed() {
        let mut c = Compressor::new();
        let h0 = c.encode(&[5]);
        let outcome = c.remove(&h0, 5);
        assert_eq!(outcome, ModifyOutcome::Removed);
    }

    #[test]
    fn insert_duplicate_is_already_present() {
        let mut c = Compressor::new();
        let h0 = c.encode(&[1, 2]);
        assert_eq!(c.insert(&h0, 1), ModifyOutcome::AlreadyPresent);
    }

    #[test]
    fn remove_missing_is_not_present() {
        let mut c = Compressor::new();
        let h0 = c.encode(&[1, 2]);
        assert_eq!(c.remove(&h0, 9), ModifyOutcome::NotPresent);
    }

    #[test]
    fn deref_frees_shared_slot_for_reuse() {
        let mut c = Compressor::new();
        let ids: Vec<u32> = (0..10).collect();
        let h = c.encode(&ids);
        assert_eq!(c.live_shared_slots(), 1);
        c.deref(&h);
        assert_eq!(c.live_shared_slots(), 0);

        let h2 = c.encode(&ids);
        assert!(matches!(h2, IdHandle::Shared(0)));
    }

    #[test]
    fn encode_decode_round_trip_for_live_handle() {
        let mut c = Compressor::new();
        let ids: Vec<u32> = vec![2, 4, 6, 8, 10];
        let h = c.encode(&ids);
        let decoded = c.decompress(&h);
        let h2 = c.encode(&decoded);
        assert_eq!(c.decompress(&h2), ids);
    }
}
