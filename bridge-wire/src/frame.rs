//! Wire frame codec (§6 "Wire frame").
//!
//! Unlike `monocoque-zmtp/src/codec.rs`'s `ZmtpDecoder`, which reassembles a
//! frame out of arbitrarily-split TCP segments, frames here always arrive
//! as one complete buffer handed up by the fabric (a reliable transport
//! that already does wire-level reassembly, §1 "out of scope: the fabric
//! transport itself"). So this module only needs one-shot `Bytes`-based
//! encode/decode, grounded on the same per-field `Buf`/`BufMut` style the
//! teacher's codec uses for its header, without the staging-buffer state
//! machine.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use bridge_core::config::MAX_PREFIX_COUNT;
use bridge_core::error::{BridgeError, Result};
use bridge_core::stamp::Stamp;

/// Common header length: `size:u16, msg_type:u8, code:u8, src:u32,
/// stamp:u64, seqno:u64`.
pub const HEADER_LEN: usize = 2 + 1 + 1 + 4 + 8 + 8;

/// Fixed portion of the route-message trailer: `hash:u32, sublen:u16,
/// replylen:u16, prefix_cnt:u8, msg_enc:u8, msg_size:u32`.
pub const ROUTE_FIXED_LEN: usize = 4 + 2 + 2 + 1 + 1 + 4;

/// Add-route action code, echoed to the local bus as `notify_sub`'s action
/// character (§4.G "`notify_sub(rcnt, 'A', reply)`").
pub const CODE_ADD: u8 = b'A';
/// Remove-route action code (§4.G "UNSUB (code `D`)").
pub const CODE_DEL: u8 = b'D';

/// Wire message type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Publish,
    Fragment,
    Sub,
    Unsub,
    Psub,
    Punsub,
    Hello,
    Bye,
}

impl MsgType {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Publish => 1,
            Self::Fragment => 2,
            Self::Sub => 3,
            Self::Unsub => 4,
            Self::Psub => 5,
            Self::Punsub => 6,
            Self::Hello => 7,
            Self::Bye => 8,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Self::Publish,
            2 => Self::Fragment,
            3 => Self::Sub,
            4 => Self::Unsub,
            5 => Self::Psub,
            6 => Self::Punsub,
            7 => Self::Hello,
            8 => Self::Bye,
            other => return Err(BridgeError::invalid_frame(format!("unknown msg_type {other}"))),
        })
    }

    /// Whether this type carries the route-message trailer (§6).
    #[must_use]
    pub const fn has_route_trailer(self) -> bool {
        matches!(
            self,
            Self::Publish | Self::Sub | Self::Unsub | Self::Psub | Self::Punsub
        )
    }
}

/// Common frame header (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MsgType,
    pub code: u8,
    pub src: u32,
    pub stamp: Stamp,
    pub seqno: u64,
}

/// The variable-length route trailer shared by SUB/UNSUB/PSUB/PUNSUB/PUBLISH.
#[derive(Debug, Clone)]
pub struct RouteBody {
    pub hash: u32,
    /// Subject bytes (exact subject for SUB/UNSUB/PUBLISH, prefix for
    /// PSUB/PUNSUB).
    pub subject: Bytes,
    /// Reply bytes (SUB/UNSUB) or the full pattern string (PSUB/PUNSUB).
    pub reply_or_pattern: Bytes,
    /// Prefix hashes of the subject at each pattern-matchable length, so
    /// the receiving `PatternRouteMap` doesn't need to recompute them
    /// (§4.C, §9 hash-bucket generalization).
    pub prefix_hashes: Vec<u32>,
    pub msg_enc: u8,
    pub payload: Bytes,
}

/// A fully decoded frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Publish { header: Header, route: RouteBody },
    Fragment { header: Header, payload: Bytes },
    Sub { header: Header, route: RouteBody },
    Unsub { header: Header, route: RouteBody },
    Psub { header: Header, route: RouteBody },
    Punsub { header: Header, route: RouteBody },
    Hello { header: Header, ping: Option<Stamp> },
    Bye { header: Header },
}

impl Frame {
    #[must_use]
    pub const fn header(&self) -> &Header {
        match self {
            Self::Publish { header, .. }
            | Self::Fragment { header, .. }
            | Self::Sub { header, .. }
            | Self::Unsub { header, .. }
            | Self::Psub { header, .. }
            | Self::Punsub { header, .. }
            | Self::Hello { header, .. }
            | Self::Bye { header } => header,
        }
    }
}

fn encode_route(buf: &mut BytesMut, header: &Header, r: &RouteBody) {
    let body_len = ROUTE_FIXED_LEN
        + r.subject.len()
        + r.reply_or_pattern.len()
        + r.prefix_hashes.len() * 4
        + r.payload.len();
    let size = (HEADER_LEN + body_len) as u16;
    buf.put_u16(size);
    buf.put_u8(header.msg_type.to_u8());
    buf.put_u8(header.code);
    buf.put_u32(header.src);
    buf.put_u64(header.stamp.raw());
    buf.put_u64(header.seqno);
    buf.put_u32(r.hash);
    buf.put_u16(r.subject.len() as u16);
    buf.put_u16(r.reply_or_pattern.len() as u16);
    buf.put_u8(r.prefix_hashes.len() as u8);
    buf.put_u8(r.msg_enc);
    buf.put_u32(r.payload.len() as u32);
    buf.extend_from_slice(&r.subject);
    buf.extend_from_slice(&r.reply_or_pattern);
    for h in &r.prefix_hashes {
        buf.put_u32(*h);
    }
    buf.extend_from_slice(&r.payload);
}

/// Encode a frame into a fresh, length-prefixed buffer ready for the fabric.
#[must_use]
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::new();
    match frame {
        Frame::Publish { header, route }
        | Frame::Sub { header, route }
        | Frame::Unsub { header, route }
        | Frame::Psub { header, route }
        | Frame::Punsub { header, route } => encode_route(&mut buf, header, route),
        Frame::Fragment { header, payload } => {
            let size = (HEADER_LEN + payload.len()) as u16;
            buf.put_u16(size);
            buf.put_u8(header.msg_type.to_u8());
            buf.put_u8(header.code);
            buf.put_u32(header.src);
            buf.put_u64(header.stamp.raw());
            buf.put_u64(header.seqno);
            buf.extend_from_slice(payload);
        }
        Frame::Hello { header, ping } => {
            let extra = if ping.is_some() { 8 } else { 0 };
            let size = (HEADER_LEN + extra) as u16;
            buf.put_u16(size);
            buf.put_u8(header.msg_type.to_u8());
            buf.put_u8(header.code);
            buf.put_u32(header.src);
            buf.put_u64(header.stamp.raw());
            buf.put_u64(header.seqno);
            if let Some(p) = ping {
                buf.put_u64(p.raw());
            }
        }
        Frame::Bye { header } => {
            buf.put_u16(HEADER_LEN as u16);
            buf.put_u8(header.msg_type.to_u8());
            buf.put_u8(header.code);
            buf.put_u32(header.src);
            buf.put_u64(header.stamp.raw());
            buf.put_u64(header.seqno);
        }
    }
    buf.freeze()
}

fn take(buf: &mut Bytes, n: usize) -> Result<Bytes> {
    if buf.remaining() < n {
        return Err(BridgeError::invalid_frame("buffer shorter than declared field length"));
    }
    Ok(buf.copy_to_bytes(n))
}

fn decode_route(header: Header, mut body: Bytes) -> Result<RouteBody> {
    if body.remaining() < ROUTE_FIXED_LEN {
        return Err(BridgeError::invalid_frame("route trailer shorter than fixed header"));
    }
    let hash = body.get_u32();
    let sublen = body.get_u16() as usize;
    let replylen = body.get_u16() as usize;
    let prefix_cnt = body.get_u8() as usize;
    if prefix_cnt > MAX_PREFIX_COUNT {
        return Err(BridgeError::invalid_frame(format!(
            "prefix_cnt {prefix_cnt} exceeds max {MAX_PREFIX_COUNT}"
        )));
    }
    let msg_enc = body.get_u8();
    let msg_size = body.get_u32() as usize;

    let subject = take(&mut body, sublen)?;
    let reply_or_pattern = take(&mut body, replylen)?;
    let mut prefix_hashes = Vec::with_capacity(prefix_cnt);
    for _ in 0..prefix_cnt {
        if body.remaining() < 4 {
            return Err(BridgeError::invalid_frame("truncated prefix-hash array"));
        }
        prefix_hashes.push(body.get_u32());
    }
    let payload = take(&mut body, msg_size)?;
    let _ = header;
    Ok(RouteBody {
        hash,
        subject,
        reply_or_pattern,
        prefix_hashes,
        msg_enc,
        payload,
    })
}

/// Decode one complete frame from `src`. `src` must hold exactly one frame
/// (the fabric hands up whole frames); trailing bytes beyond the declared
/// `size` are an error, not silently ignored.
pub fn decode(mut src: Bytes) -> Result<Frame> {
    if src.remaining() < HEADER_LEN {
        return Err(BridgeError::invalid_frame("shorter than common header"));
    }
    let size = src.get_u16() as usize;
    let msg_type = MsgType::from_u8(src.get_u8())?;
    let code = src.get_u8();
    let src_id = src.get_u32();
    let stamp = Stamp::from(src.get_u64());
    let seqno = src.get_u64();
    let header = Header {
        msg_type,
        code,
        src: src_id,
        stamp,
        seqno,
    };

    if size < HEADER_LEN || size - HEADER_LEN != src.remaining() {
        return Err(BridgeError::invalid_frame(format!(
            "declared size {size} does not match buffer length {}",
            HEADER_LEN + src.remaining()
        )));
    }

    match msg_type {
        MsgType::Publish => Ok(Frame::Publish {
            route: decode_route(header, src)?,
            header,
        }),
        MsgType::Sub => Ok(Frame::Sub {
            route: decode_route(header, src)?,
            header,
        }),
        MsgType::Unsub => Ok(Frame::Unsub {
            route: decode_route(header, src)?,
            header,
        }),
        MsgType::Psub => Ok(Frame::Psub {
            route: decode_route(header, src)?,
            header,
        }),
        MsgType::Punsub => Ok(Frame::Punsub {
            route: decode_route(header, src)?,
            header,
        }),
        MsgType::Fragment => Ok(Frame::Fragment { header, payload: src }),
        MsgType::Hello => {
            let ping = if src.remaining() >= 8 {
                Some(Stamp::from(src.get_u64()))
            } else {
                None
            };
            Ok(Frame::Hello { header, ping })
        }
        MsgType::Bye => Ok(Frame::Bye { header }),
    }
}
