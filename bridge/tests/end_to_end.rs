//! End-to-end scenarios against a mocked fabric (spec "End-to-end
//! scenarios"): peer connect+sub, dataloss, pattern unsubscribe with a
//! shared hash, timeout, backpressure, and self-loop suppression.

use std::time::{Duration, Instant};

use bytes::Bytes;

use bridge::{Bridge, Config, Stamp};
use bridge_core::outbound_queue::OfferOutcome;
use bridge_core::peer_table::SessionState;
use bridge_wire::fabric::InMemoryFabric;
use bridge_wire::frame::{self, Frame, Header, MsgType, RouteBody, CODE_ADD, CODE_DEL};
use bridge_wire::local_bus::InMemoryLocalBus;

fn run<T>(fut: impl std::future::Future<Output = T>) -> T {
    compio::runtime::Runtime::new().unwrap().block_on(fut)
}

fn new_bridge() -> Bridge<InMemoryFabric, InMemoryLocalBus> {
    Bridge::new(Config::default(), Stamp::from(0x99), 1, InMemoryFabric::new(), InMemoryLocalBus::new(1))
}

fn hello(stamp: Stamp, src: u32, seqno: u64, ping: Option<Stamp>) -> Frame {
    Frame::Hello {
        header: Header { msg_type: MsgType::Hello, code: 0, src, stamp, seqno },
        ping,
    }
}

fn route(subject: &[u8], hash: u32) -> RouteBody {
    RouteBody {
        hash,
        subject: Bytes::copy_from_slice(subject),
        reply_or_pattern: Bytes::new(),
        prefix_hashes: Vec::new(),
        msg_enc: 0,
        payload: Bytes::new(),
    }
}

fn inject(bridge: &mut Bridge<InMemoryFabric, InMemoryLocalBus>, frame: &Frame) {
    bridge.fabric_mut().inject_inbound(frame::encode(frame));
}

#[test]
fn scenario_1_peer_connect_and_sub() {
    let mut b = new_bridge();
    let now = Instant::now();

    // Drain our own local subscription announcement first so later sent
    // counts are easy to reason about.
    b.subscribe_local(b"local.subj", b"");
    run(b.poll_tick(b.timer_id(), now)).unwrap();
    let sent_before = b.fabric().sent().len();

    let a = Stamp::from(0x11);
    inject(&mut b, &hello(a, 42, 1, None));
    run(b.poll_tick(b.timer_id(), now)).unwrap();
    assert_eq!(b.peers().len(), 1);

    inject(
        &mut b,
        &Frame::Sub {
            header: Header { msg_type: MsgType::Sub, code: CODE_ADD, src: 42, stamp: a, seqno: 2 },
            route: route(b"x", 7),
        },
    );
    run(b.poll_tick(b.timer_id(), now)).unwrap();

    // Session ids are stable slab indices, not necessarily 0; look the peer
    // up by stamp.
    let session = (0..b.peers().len() as u32)
        .find_map(|i| b.peers().get(i).filter(|s| s.stamp == a))
        .expect("peer A's session must exist");
    assert_eq!(session.sub_count, 1);
    assert!(b.bus().sub_routes.contains(&7));
    assert_eq!(b.bus().notifications.len(), 1);
    assert_eq!(b.bus().notifications[0].action, CODE_ADD);
    assert_eq!(b.bus().notifications[0].subject.as_ref(), b"x");

    // A recognizes us by pinging our own stamp: NEW clears, our one local
    // sub gets replayed.
    inject(&mut b, &hello(a, 42, 3, Some(Stamp::from(0x99))));
    run(b.poll_tick(b.timer_id(), now)).unwrap();
    assert_eq!(b.fabric().sent().len(), sent_before + 1, "local sub cache replayed once");
    let session = (0..b.peers().len() as u32)
        .find_map(|i| b.peers().get(i).filter(|s| s.stamp == a))
        .unwrap();
    assert!(!session.state.contains(SessionState::NEW));
}

#[test]
fn scenario_2_dataloss_clears_routes_and_drops_the_publish() {
    let mut b = new_bridge();
    let now = Instant::now();
    let a = Stamp::from(0x11);

    inject(&mut b, &hello(a, 42, 1, None));
    run(b.poll_tick(b.timer_id(), now)).unwrap();
    inject(
        &mut b,
        &Frame::Sub {
            header: Header { msg_type: MsgType::Sub, code: CODE_ADD, src: 42, stamp: a, seqno: 2 },
            route: route(b"x", 7),
        },
    );
    run(b.poll_tick(b.timer_id(), now)).unwrap();
    assert!(b.bus().sub_routes.contains(&7));

    // Sequence jumps from 2 straight to 4: a gap.
    inject(
        &mut b,
        &Frame::Publish {
            header: Header { msg_type: MsgType::Publish, code: 0, src: 42, stamp: a, seqno: 4 },
            route: route(b"x", 7),
        },
    );
    run(b.poll_tick(b.timer_id(), now)).unwrap();

    assert!(!b.bus().sub_routes.contains(&7), "dataloss must clear A's routes");
    let session = (0..b.peers().len() as u32)
        .find_map(|i| b.peers().get(i).filter(|s| s.stamp == a))
        .expect("A's session survives, just reset");
    assert!(session.state.contains(SessionState::NEW));
    assert_eq!(session.sub_count, 0);
}

#[test]
fn scenario_3_pattern_unsubscribe_with_shared_hash() {
    let mut b = new_bridge();
    let now = Instant::now();
    let pa = Stamp::from(0x21);
    let pb = Stamp::from(0x22);

    inject(&mut b, &hello(pa, 1, 1, None));
    inject(&mut b, &hello(pb, 2, 1, None));
    run(b.poll_tick(b.timer_id(), now)).unwrap();

    // Both subscribe under a hash bucket they happen to share (`hash: 9`,
    // a contrived collision matching `pattern_route.rs`'s own
    // "colliding_prefixes_share_bucket" coverage), but under distinct
    // pattern entries within that bucket.
    inject(
        &mut b,
        &Frame::Psub {
            header: Header { msg_type: MsgType::Psub, code: CODE_ADD, src: 1, stamp: pa, seqno: 2 },
            route: RouteBody {
                hash: 9,
                subject: Bytes::from_static(b"p.*"),
                reply_or_pattern: Bytes::from_static(b"p.*"),
                prefix_hashes: Vec::new(),
                msg_enc: 0,
                payload: Bytes::new(),
            },
        },
    );
    inject(
        &mut b,
        &Frame::Psub {
            header: Header { msg_type: MsgType::Psub, code: CODE_ADD, src: 2, stamp: pb, seqno: 2 },
            route: RouteBody {
                hash: 9,
                subject: Bytes::from_static(b"p.?"),
                reply_or_pattern: Bytes::from_static(b"p.?"),
                prefix_hashes: Vec::new(),
                msg_enc: 0,
                payload: Bytes::new(),
            },
        },
    );
    run(b.poll_tick(b.timer_id(), now)).unwrap();
    assert!(b.bus().pattern_routes.contains(&9));
    let notify_count_before = b.bus().notifications.len();

    // A unsubscribes; the aggregate bucket still has B, so no del_pattern_route.
    inject(
        &mut b,
        &Frame::Punsub {
            header: Header { msg_type: MsgType::Punsub, code: CODE_DEL, src: 1, stamp: pa, seqno: 3 },
            route: RouteBody {
                hash: 9,
                subject: Bytes::from_static(b"p.*"),
                reply_or_pattern: Bytes::from_static(b"p.*"),
                prefix_hashes: Vec::new(),
                msg_enc: 0,
                payload: Bytes::new(),
            },
        },
    );
    run(b.poll_tick(b.timer_id(), now)).unwrap();

    assert!(b.bus().pattern_routes.contains(&9), "B's p.? still holds the bucket open");
    assert_eq!(b.bus().notifications.len(), notify_count_before + 1, "one notify_punsub for p.*");
}

#[test]
fn scenario_4_timeout_evicts_after_two_idle_heartbeats() {
    let mut b = new_bridge();
    let t0 = Instant::now();
    let c = Stamp::from(0x33);

    inject(&mut b, &hello(c, 5, 1, None));
    run(b.poll_tick(b.timer_id(), t0)).unwrap();
    assert_eq!(b.peers().len(), 1);

    let first_tick = t0 + Duration::from_secs(10);
    b.heartbeat_tick(b.timer_id(), first_tick);
    assert_eq!(b.peers().len(), 1, "first idle tick only flags TIMEOUT");

    let second_tick = first_tick + Duration::from_secs(10);
    b.heartbeat_tick(b.timer_id(), second_tick);
    assert_eq!(b.peers().len(), 0, "second idle tick evicts and frees the slot");

    // A fresh frame from the same stamp creates a brand-new session.
    inject(&mut b, &hello(c, 5, 1, None));
    run(b.poll_tick(b.timer_id(), second_tick)).unwrap();
    assert_eq!(b.peers().len(), 1);
}

/// `InMemoryFabric::prime_next_offer` only primes a single call; exercising
/// "three backpressure responses in a row" within one `write()` retry loop
/// needs a fabric that stays backpressured across several consecutive
/// `offer` calls, not just the next one.
struct FlakyFabric {
    inner: InMemoryFabric,
    backpressure_calls_left: u32,
}

#[async_trait::async_trait(?Send)]
impl bridge_wire::fabric::Fabric for FlakyFabric {
    fn offer(&mut self, frame: &Bytes) -> OfferOutcome {
        if self.backpressure_calls_left > 0 {
            self.backpressure_calls_left -= 1;
            return OfferOutcome::Backpressure;
        }
        self.inner.offer(frame)
    }

    fn pump(&mut self) {
        self.inner.pump();
    }

    fn poll(&mut self) -> Option<Bytes> {
        self.inner.poll()
    }

    async fn close(&mut self) -> bool {
        self.inner.close().await
    }

    fn max_payload_len(&self) -> usize {
        self.inner.max_payload_len()
    }
}

#[test]
fn scenario_5_backpressure_retries_head_message_next_tick() {
    let fabric = FlakyFabric { inner: InMemoryFabric::new(), backpressure_calls_left: 3 };
    let mut b = Bridge::new(Config::default(), Stamp::from(0x99), 1, fabric, InMemoryLocalBus::new(1));
    let now = Instant::now();

    b.publish_local(b"x", Bytes::from_static(b"m"));

    run(b.poll_tick(b.timer_id(), now)).unwrap();
    assert_eq!(b.outbound().len(), 1, "message preserved at the head after exhausting retries");

    run(b.poll_tick(b.timer_id(), now)).unwrap();
    assert!(b.outbound().is_empty(), "next tick's offer succeeds and drains it");
}

#[test]
fn scenario_6_self_loop_is_silently_dropped() {
    let mut b = new_bridge();
    let now = Instant::now();

    inject(
        &mut b,
        &Frame::Publish {
            header: Header { msg_type: MsgType::Publish, code: 0, src: 1, stamp: Stamp::from(0x99), seqno: 1 },
            route: route(b"x", 7),
        },
    );
    run(b.poll_tick(b.timer_id(), now)).unwrap();

    assert_eq!(b.peers().len(), 0, "no session is created for our own loopback frame");
    assert!(b.bus().notifications.is_empty());
}
