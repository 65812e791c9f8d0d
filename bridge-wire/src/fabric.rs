//! The `Fabric` collaborator contract (§6 "external interfaces", §1
//! "out of scope: the fabric transport itself... we model it as a trait").
//!
//! Ground: `monocoque-zmtp/src/socket_trait.rs`'s `#[async_trait(?Send)]
//! Socket` trait, adapted from a send/recv multipart-message shape to the
//! offer/poll/close vocabulary §4.F's `OutboundQueue::write` and §4.G's
//! inbound path are specified against.

use async_trait::async_trait;
use bytes::Bytes;

use bridge_core::outbound_queue::OfferOutcome;

/// External reliable unicast/multicast transport the bridge rides on top
/// of. An embedder supplies the real implementation; this crate only ships
/// [`InMemoryFabric`], a test double.
#[async_trait(?Send)]
pub trait Fabric {
    /// Offer one already-framed message to the transport, non-blocking.
    fn offer(&mut self, frame: &Bytes) -> OfferOutcome;

    /// Pump the transport's local conductor once (§4.F "pump the fabric's
    /// local conductor" on backpressure) without sending anything new.
    fn pump(&mut self);

    /// Poll for one inbound frame, if any is ready. Never blocks.
    fn poll(&mut self) -> Option<Bytes>;

    /// Begin an orderly close. Returns `true` once fully closed; the
    /// caller (the `bridge` runtime) re-invokes this once per conductor
    /// pump until it returns `true` or the shutdown-pump budget is spent
    /// (§5 "Shared resources").
    async fn close(&mut self) -> bool;

    /// Maximum single-frame payload this fabric instance will accept
    /// before the frame builder must fragment (§4.F "Fragmentation").
    fn max_payload_len(&self) -> usize;
}

/// In-memory `Fabric` test double: inbound/outbound frames are plain
/// `VecDeque`s, `offer` always succeeds unless primed otherwise. Grounds
/// the dispatcher and event loop tests without a real transport, per
/// SPEC_FULL's note that this crate ships such a double (ground:
/// `monocoque-zmtp`'s in-memory `InprocStream`/pair-socket test harnesses).
#[derive(Default)]
pub struct InMemoryFabric {
    inbound: std::collections::VecDeque<Bytes>,
    outbound: Vec<Bytes>,
    next_offer: Option<OfferOutcome>,
    closed: bool,
    max_payload_len: usize,
}

impl InMemoryFabric {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_payload_len: 64 * 1024,
            ..Self::default()
        }
    }

    /// Queue a frame to be returned by the next [`Fabric::poll`].
    pub fn inject_inbound(&mut self, frame: Bytes) {
        self.inbound.push_back(frame);
    }

    /// Force the next `offer` call to return `outcome` instead of `Success`.
    pub fn prime_next_offer(&mut self, outcome: OfferOutcome) {
        self.next_offer = Some(outcome);
    }

    /// Every frame successfully offered so far, in submission order.
    #[must_use]
    pub fn sent(&self) -> &[Bytes] {
        &self.outbound
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait(?Send)]
impl Fabric for InMemoryFabric {
    fn offer(&mut self, frame: &Bytes) -> OfferOutcome {
        if let Some(outcome) = self.next_offer.take() {
            if outcome != OfferOutcome::Success {
                return outcome;
            }
        }
        self.outbound.push(frame.clone());
        OfferOutcome::Success
    }

    fn pump(&mut self) {}

    fn poll(&mut self) -> Option<Bytes> {
        self.inbound.pop_front()
    }

    async fn close(&mut self) -> bool {
        self.closed = true;
        true
    }

    fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_succeeds_by_default_and_records_sent_frame() {
        let mut f = InMemoryFabric::new();
        let frame = Bytes::from_static(b"hi");
        assert_eq!(f.offer(&frame), OfferOutcome::Success);
        assert_eq!(f.sent(), &[frame]);
    }

    #[test]
    fn primed_outcome_is_consumed_once() {
        let mut f = InMemoryFabric::new();
        f.prime_next_offer(OfferOutcome::Backpressure);
        let frame = Bytes::from_static(b"hi");
        assert_eq!(f.offer(&frame), OfferOutcome::Backpressure);
        assert_eq!(f.offer(&frame), OfferOutcome::Success);
    }

    #[test]
    fn poll_returns_injected_frames_in_order() {
        let mut f = InMemoryFabric::new();
        f.inject_inbound(Bytes::from_static(b"a"));
        f.inject_inbound(Bytes::from_static(b"b"));
        assert_eq!(f.poll(), Some(Bytes::from_static(b"a")));
        assert_eq!(f.poll(), Some(Bytes::from_static(b"b")));
        assert_eq!(f.poll(), None);
    }
}
