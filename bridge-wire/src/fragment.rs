//! Per-session fragment reassembly (§4.F "Fragmentation", §4.G FRAGMENT
//! handling, §3 "frag: in-progress fragment-reassembly handle").
//!
//! Outbound messages whose payload exceeds the fabric's `max_payload_len`
//! are split by the frame builder into one PUBLISH carrying the first
//! chunk followed by one or more FRAGMENT frames carrying the rest; the
//! receiving dispatcher merges them back via this assembler, keyed per
//! session so two peers' in-flight fragments never interleave.
//!
//! Ground: `monocoque-zmtp/src/codec.rs`'s `BytesMut` staging-buffer
//! reassembly idiom, reused here at the message layer instead of the wire
//! layer (the wire layer already has whole frames; this module
//! reassembles the *application* payload those frames carry in pieces).

use bytes::{Bytes, BytesMut};

use bridge_core::config::STAGING_BUF_INITIAL_CAP;

/// An in-progress reassembly for one session (§3 "frag" handle).
pub struct FragmentAssembler {
    staging: BytesMut,
    expected_total: usize,
}

impl FragmentAssembler {
    /// Begin reassembly with the first chunk and the declared total size.
    #[must_use]
    pub fn start(first_chunk: &[u8], expected_total: usize) -> Self {
        let mut staging = BytesMut::with_capacity(expected_total.max(STAGING_BUF_INITIAL_CAP));
        staging.extend_from_slice(first_chunk);
        Self {
            staging,
            expected_total,
        }
    }

    /// Merge one more FRAGMENT chunk in. Returns `Some(payload)` once the
    /// declared total has been reached, `None` if more chunks are still
    /// expected.
    pub fn merge(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.staging.extend_from_slice(chunk);
        if self.staging.len() >= self.expected_total {
            Some(std::mem::take(&mut self.staging).freeze())
        } else {
            None
        }
    }

    /// Bytes accumulated so far, for a failed-merge partial forward (§4.G
    /// "on failure drop and forward current partial").
    #[must_use]
    pub fn partial(&self) -> Bytes {
        Bytes::copy_from_slice(&self.staging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_merge_completes_when_total_reached() {
        let mut a = FragmentAssembler::start(b"hello ", 11);
        assert!(a.merge(b"wo").is_none());
        let done = a.merge(b"rld").unwrap();
        assert_eq!(&*done, b"hello world");
    }

    #[test]
    fn partial_exposes_bytes_accumulated_so_far() {
        let mut a = FragmentAssembler::start(b"abc", 100);
        a.merge(b"def");
        assert_eq!(&*a.partial(), b"abcdef");
    }
}
