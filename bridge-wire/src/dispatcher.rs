//! Inbound frame dispatcher (§4.G).
//!
//! Ground: the per-frame algorithm has no single teacher analogue (the
//! teacher dispatches ZMTP handshake/data commands, not a pubsub routing
//! protocol), so this module is grounded piecewise: `monocoque-core/src/
//! router.rs` for the "one function per inbound event, mutate shared state
//! directly, no locks" structure, and `monocoque-core/src/pubsub/hub.rs` for
//! the notify-after-mutate ordering (mutate the index, then tell the bus
//! what changed).
//!
//! Fragmentation decision: the wire format (§6) gives PUBLISH/FRAGMENT
//! frames no "expected total size" field, only the common header's `code`
//! byte (otherwise unused by these two types). This dispatcher treats a
//! nonzero `code` on PUBLISH/FRAGMENT as "more fragments follow" and a zero
//! `code` as "this is the final chunk" — resolving an open question the
//! distilled spec left silent on (recorded in DESIGN.md).

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;

use bridge_core::error::Result;
use bridge_core::local_sub_cache::LocalSubCache;
use bridge_core::outbound_queue::OutboundQueue;
use bridge_core::pattern_route::{self, PatternRouteMap};
use bridge_core::peer_table::{PeerTable, SessionState, UpdateOutcome};
use bridge_core::stamp::Stamp;
use bridge_core::subject_route::{self, SubjectRouteMap};

use crate::fragment::FragmentAssembler;
use crate::frame::{self, Frame, Header, MsgType, RouteBody};
use crate::local_bus::{LocalBus, LocalPublish, RouteNotification};

/// What a single `dispatch` call did, for logging/testing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    SelfLoopDropped,
    Published,
    FragmentStarted,
    FragmentMerged,
    FragmentCompleted,
    FragmentReassemblyFailed,
    Subscribed,
    AlreadySubscribed,
    Unsubscribed,
    UnsubscribeNotFound,
    PatternSubscribed,
    PatternAlreadySubscribed,
    PatternUnsubscribed { removed_count: usize },
    HelloEstablished,
    HelloPinged,
    HelloIgnored,
    Bye,
}

/// An in-progress reassembly: the subject of the originating PUBLISH plus
/// the byte assembler (§3 "frag" handle; `Session::frag` only records
/// *that* one is in progress, this map holds the actual state).
struct Reassembly {
    subject: Bytes,
    assembler: FragmentAssembler,
}

/// Stateful per-connection dispatcher: owns the fragment-reassembly table
/// and knows this bridge's own identity for self-loop suppression (§4.G
/// step 1) and outbound frame `src`/`stamp` stamping.
pub struct Dispatcher {
    own_stamp: Stamp,
    own_src: u32,
    fragments: HashMap<u32, Reassembly>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(own_stamp: Stamp, own_src: u32) -> Self {
        Self {
            own_stamp,
            own_src,
            fragments: HashMap::new(),
        }
    }

    fn is_self_loop(&self, header: &Header) -> bool {
        header.stamp == self.own_stamp && header.src == self.own_src
    }

    /// Drop every route this session owns and reset it to `NEW` (§4.G step
    /// 3 "clear all session-owned routes, then mark NEW"; reused verbatim
    /// by BYE handling, §4.G BYE row).
    fn clear_session_routes(
        &mut self,
        session_id: u32,
        subjects: &mut SubjectRouteMap,
        patterns: &mut PatternRouteMap,
        bus: &mut impl LocalBus,
    ) {
        for (hash, subject) in subjects.remove_peer_everywhere(session_id) {
            let rcnt = u32::from(!subjects.bucket_is_empty(hash));
            if rcnt == 0 {
                bus.del_sub_route(hash as u32, &subject);
            }
            bus.notify_unsub(RouteNotification {
                hash: hash as u32,
                subject: subject.into_vec().into(),
                rcnt,
                action: frame::CODE_DEL,
                reply: Bytes::new(),
            });
        }
        for (hash, prefix) in patterns.remove_peer_everywhere(session_id) {
            let rcnt = u32::from(!patterns.bucket_is_empty(hash));
            if rcnt == 0 {
                bus.del_pattern_route(hash as u32, &prefix);
            }
            bus.notify_punsub(RouteNotification {
                hash: hash as u32,
                subject: prefix.into_vec().into(),
                rcnt,
                action: frame::CODE_DEL,
                reply: Bytes::new(),
            });
        }
        self.fragments.remove(&session_id);
    }

    /// Evict a timed-out session (§4.D "two successive heartbeat ticks with
    /// silence retire a peer"): same route cleanup as BYE, minus the BYE
    /// state bit, since the session is being released outright.
    pub fn evict_timed_out(
        &mut self,
        session_id: u32,
        subjects: &mut SubjectRouteMap,
        patterns: &mut PatternRouteMap,
        peers: &mut PeerTable,
        bus: &mut impl LocalBus,
    ) {
        self.clear_session_routes(session_id, subjects, patterns, bus);
        peers.release_session(session_id);
    }

    /// Replay every locally-registered subscription into the outbound
    /// queue (§4.G HELLO handling, "`publish_my_subs()`").
    fn publish_my_subs(&self, local_subs: &LocalSubCache, outbound: &mut OutboundQueue, seqno: u64) {
        for ann in local_subs.iter_live() {
            let header = Header {
                msg_type: if ann.is_pattern { MsgType::Psub } else { MsgType::Sub },
                code: frame::CODE_ADD,
                src: self.own_src,
                stamp: self.own_stamp,
                seqno,
            };
            let route = RouteBody {
                hash: 0,
                subject: ann.subject.into(),
                reply_or_pattern: ann.reply.into(),
                prefix_hashes: Vec::new(),
                msg_enc: 0,
                payload: Bytes::new(),
            };
            let frame = if ann.is_pattern {
                Frame::Psub { header, route }
            } else {
                Frame::Sub { header, route }
            };
            outbound.push(frame::encode(&frame));
        }
    }

    /// Dispatch one inbound frame (§4.G).
    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch(
        &mut self,
        frame: Frame,
        peers: &mut PeerTable,
        subjects: &mut SubjectRouteMap,
        patterns: &mut PatternRouteMap,
        local_subs: &mut LocalSubCache,
        outbound: &mut OutboundQueue,
        bus: &mut impl LocalBus,
        now: Instant,
    ) -> Result<DispatchOutcome> {
        let header = *frame.header();
        if self.is_self_loop(&header) {
            return Ok(DispatchOutcome::SelfLoopDropped);
        }

        let (session_id, outcome) = peers.update_session(header.stamp, header.seqno, now);

        if outcome == UpdateOutcome::DatalossDetected {
            tracing::warn!(session = session_id, stamp = %header.stamp, "dataloss detected, clearing session routes");
            self.clear_session_routes(session_id, subjects, patterns, bus);
            if let Some(s) = peers.get_mut(session_id) {
                s.state = SessionState::NEW;
            }
        }

        self.dispatch_body(frame, session_id, peers, subjects, patterns, local_subs, outbound, bus)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_body(
        &mut self,
        frame: Frame,
        session_id: u32,
        peers: &mut PeerTable,
        subjects: &mut SubjectRouteMap,
        patterns: &mut PatternRouteMap,
        local_subs: &mut LocalSubCache,
        outbound: &mut OutboundQueue,
        bus: &mut impl LocalBus,
    ) -> Result<DispatchOutcome> {
        match frame {
            Frame::Publish { header, route } => Ok(self.on_publish(session_id, &header, route, peers, bus).await),
            Frame::Fragment { header, payload } => {
                Ok(self.on_fragment(session_id, &header, &payload, peers, bus).await)
            }
            Frame::Sub { header, route } => Ok(self.on_sub(session_id, route, subjects, peers, bus, &header)),
            Frame::Unsub { header, route } => Ok(self.on_unsub(session_id, route, subjects, peers, bus, &header)),
            Frame::Psub { header, route } => Ok(self.on_psub(session_id, route, patterns, peers, bus, &header)),
            Frame::Punsub { header, route } => Ok(self.on_punsub(session_id, route, patterns, peers, bus, &header)),
            Frame::Hello { header, ping } => Ok(self.on_hello(session_id, &header, ping, peers, local_subs, outbound)),
            Frame::Bye { .. } => {
                self.clear_session_routes(session_id, subjects, patterns, bus);
                if let Some(s) = peers.get_mut(session_id) {
                    s.state.insert(SessionState::BYE);
                }
                peers.release_session(session_id);
                Ok(DispatchOutcome::Bye)
            }
        }
    }

    async fn on_publish(
        &mut self,
        session_id: u32,
        header: &Header,
        route: RouteBody,
        peers: &mut PeerTable,
        bus: &mut impl LocalBus,
    ) -> DispatchOutcome {
        let more_fragments = header.code != 0;
        let had_stale_reassembly = self.fragments.remove(&session_id).is_some();
        if had_stale_reassembly {
            tracing::debug!(session = session_id, "PUBLISH interrupted an in-progress reassembly");
        }

        let outcome = if more_fragments {
            self.fragments.insert(
                session_id,
                Reassembly {
                    subject: route.subject,
                    assembler: FragmentAssembler::start(&route.payload, usize::MAX),
                },
            );
            if had_stale_reassembly {
                DispatchOutcome::FragmentReassemblyFailed
            } else {
                DispatchOutcome::FragmentStarted
            }
        } else {
            bus.on_msg(LocalPublish {
                subject: route.subject,
                payload: route.payload,
                src_route: header.src,
            })
            .await;
            if had_stale_reassembly {
                DispatchOutcome::FragmentReassemblyFailed
            } else {
                DispatchOutcome::Published
            }
        };
        if let Some(s) = peers.get_mut(session_id) {
            s.frag = if more_fragments { Some(Box::from(&b""[..])) } else { None };
            s.pub_count += 1;
        }
        outcome
    }

    async fn on_fragment(
        &mut self,
        session_id: u32,
        header: &Header,
        payload: &[u8],
        peers: &mut PeerTable,
        bus: &mut impl LocalBus,
    ) -> DispatchOutcome {
        let more_fragments = header.code != 0;
        let Some(reassembly) = self.fragments.get_mut(&session_id) else {
            return DispatchOutcome::FragmentReassemblyFailed;
        };
        reassembly.assembler.merge(payload);

        if more_fragments {
            return DispatchOutcome::FragmentMerged;
        }

        let Reassembly { subject, assembler } = self.fragments.remove(&session_id).expect("checked above");
        bus.on_msg(LocalPublish {
            subject,
            payload: assembler.partial(),
            src_route: header.src,
        })
        .await;
        if let Some(s) = peers.get_mut(session_id) {
            s.frag = None;
        }
        DispatchOutcome::FragmentCompleted
    }

    fn on_sub(
        &mut self,
        session_id: u32,
        route: RouteBody,
        subjects: &mut SubjectRouteMap,
        peers: &mut PeerTable,
        bus: &mut impl LocalBus,
        _header: &Header,
    ) -> DispatchOutcome {
        let hash = u64::from(route.hash);
        match subjects.put(hash, &route.subject, session_id) {
            subject_route::PutResult::Created => {
                bus.add_sub_route(route.hash, &route.subject);
                if let Some(s) = peers.get_mut(session_id) {
                    s.sub_count += 1;
                }
                bus.notify_sub(RouteNotification {
                    hash: route.hash,
                    subject: route.subject,
                    rcnt: 1,
                    action: frame::CODE_ADD,
                    reply: route.reply_or_pattern,
                });
                DispatchOutcome::Subscribed
            }
            subject_route::PutResult::Added => {
                if let Some(s) = peers.get_mut(session_id) {
                    s.sub_count += 1;
                }
                let rcnt = subjects.find_by_hash(hash, &route.subject).map_or(0, |v| v.len() as u32);
                bus.notify_sub(RouteNotification {
                    hash: route.hash,
                    subject: route.subject,
                    rcnt,
                    action: frame::CODE_ADD,
                    reply: route.reply_or_pattern,
                });
                DispatchOutcome::Subscribed
            }
            subject_route::PutResult::AlreadySubscribed => DispatchOutcome::AlreadySubscribed,
        }
    }

    fn on_unsub(
        &mut self,
        session_id: u32,
        route: RouteBody,
        subjects: &mut SubjectRouteMap,
        peers: &mut PeerTable,
        bus: &mut impl LocalBus,
        _header: &Header,
    ) -> DispatchOutcome {
        let hash = u64::from(route.hash);
        match subjects.rem(hash, &route.subject, session_id) {
            subject_route::RemResult::NotFound => DispatchOutcome::UnsubscribeNotFound,
            subject_route::RemResult::Removed => {
                if let Some(s) = peers.get_mut(session_id) {
                    s.sub_count = s.sub_count.saturating_sub(1);
                }
                let rcnt = subjects.find_by_hash(hash, &route.subject).map_or(0, |v| v.len() as u32);
                bus.notify_unsub(RouteNotification {
                    hash: route.hash,
                    subject: route.subject,
                    rcnt,
                    action: frame::CODE_DEL,
                    reply: route.reply_or_pattern,
                });
                DispatchOutcome::Unsubscribed
            }
            subject_route::RemResult::RemovedEmpty => {
                if subjects.bucket_is_empty(hash) {
                    bus.del_sub_route(route.hash, &route.subject);
                }
                if let Some(s) = peers.get_mut(session_id) {
                    s.sub_count = s.sub_count.saturating_sub(1);
                }
                bus.notify_unsub(RouteNotification {
                    hash: route.hash,
                    subject: route.subject,
                    rcnt: 0,
                    action: frame::CODE_DEL,
                    reply: route.reply_or_pattern,
                });
                DispatchOutcome::Unsubscribed
            }
        }
    }

    fn on_psub(
        &mut self,
        session_id: u32,
        route: RouteBody,
        patterns: &mut PatternRouteMap,
        peers: &mut PeerTable,
        bus: &mut impl LocalBus,
        _header: &Header,
    ) -> DispatchOutcome {
        let hash = u64::from(route.hash);
        match patterns.put(hash, &route.subject, session_id) {
            pattern_route::PutResult::Created => {
                bus.add_pattern_route(route.hash, &route.subject);
                if let Some(s) = peers.get_mut(session_id) {
                    s.psub_count += 1;
                }
                bus.notify_psub(RouteNotification {
                    hash: route.hash,
                    subject: route.subject,
                    rcnt: 1,
                    action: frame::CODE_ADD,
                    reply: route.reply_or_pattern,
                });
                DispatchOutcome::PatternSubscribed
            }
            pattern_route::PutResult::Added => {
                if let Some(s) = peers.get_mut(session_id) {
                    s.psub_count += 1;
                }
                bus.notify_psub(RouteNotification {
                    hash: route.hash,
                    subject: route.subject,
                    rcnt: 1,
                    action: frame::CODE_ADD,
                    reply: route.reply_or_pattern,
                });
                DispatchOutcome::PatternSubscribed
            }
            pattern_route::PutResult::AlreadySubscribed => DispatchOutcome::PatternAlreadySubscribed,
        }
    }

    /// PUNSUB (§4.G "drain temp list removing entries from the table"): the
    /// removal already happened inside `PatternRouteMap::rem`; there is at
    /// most one `(hash, pattern, peer)` triple to remove per call, so the
    /// "temp out-list" collapses to the single result `rem` reports.
    fn on_punsub(
        &mut self,
        session_id: u32,
        route: RouteBody,
        patterns: &mut PatternRouteMap,
        peers: &mut PeerTable,
        bus: &mut impl LocalBus,
        _header: &Header,
    ) -> DispatchOutcome {
        let hash = u64::from(route.hash);
        let mut removed_count = 0usize;
        match patterns.rem(hash, &route.subject, session_id) {
            pattern_route::RemResult::NotFound => {}
            pattern_route::RemResult::Removed => {
                if let Some(s) = peers.get_mut(session_id) {
                    s.psub_count = s.psub_count.saturating_sub(1);
                }
                bus.notify_punsub(RouteNotification {
                    hash: route.hash,
                    subject: route.subject,
                    rcnt: 1,
                    action: frame::CODE_DEL,
                    reply: route.reply_or_pattern,
                });
                removed_count = 1;
            }
            pattern_route::RemResult::RemovedEmpty => {
                if patterns.bucket_is_empty(hash) {
                    bus.del_pattern_route(route.hash, &route.subject);
                }
                if let Some(s) = peers.get_mut(session_id) {
                    s.psub_count = s.psub_count.saturating_sub(1);
                }
                bus.notify_punsub(RouteNotification {
                    hash: route.hash,
                    subject: route.subject,
                    rcnt: 0,
                    action: frame::CODE_DEL,
                    reply: route.reply_or_pattern,
                });
                removed_count = 1;
            }
        }
        DispatchOutcome::PatternUnsubscribed { removed_count }
    }

    fn on_hello(
        &mut self,
        session_id: u32,
        header: &Header,
        ping: Option<Stamp>,
        peers: &mut PeerTable,
        local_subs: &LocalSubCache,
        outbound: &mut OutboundQueue,
    ) -> DispatchOutcome {
        match ping {
            Some(p) if p == self.own_stamp => {
                if let Some(s) = peers.get_mut(session_id) {
                    s.state.remove(SessionState::NEW);
                }
                self.publish_my_subs(local_subs, outbound, header.seqno);
                DispatchOutcome::HelloEstablished
            }
            // Ping addressed to some other peer: not for us, not a plain
            // acknowledgement either (§4.G; `ev_aeron.cpp:978-990` falls
            // through without replying).
            Some(_) => DispatchOutcome::HelloIgnored,
            // No ping payload: plain acknowledgement, reply with a zero
            // ping rather than our own stamp (§4.G; `ev_aeron.cpp:991-996`
            // sets `peer = 0`) so this doesn't double as a heartbeat probe.
            None => {
                let reply = Frame::Hello {
                    header: Header {
                        msg_type: MsgType::Hello,
                        code: 0,
                        src: self.own_src,
                        stamp: self.own_stamp,
                        seqno: header.seqno,
                    },
                    ping: Some(Stamp::NONE),
                };
                outbound.push(frame::encode(&reply));
                DispatchOutcome::HelloPinged
            }
        }
    }
}
