use bytes::{Buf, BufMut, BytesMut};
use tracing::{trace, warn};

use crate::error::{MalformedReason, WireError};
use crate::packet::{
    FdPayload, FormatChange, Header, Packet, PacketType, RefreshKind, RefreshRequest,
    ReleaseFdPayload,
};

const HEADER_BODY_LEN: usize = 4 + 8 + 8 + 8;
const FD_PAYLOAD_BODY_LEN: usize = 4 + 4 + 8 + 8;
const RELEASE_BODY_LEN: usize = 4;
const REFRESH_BODY_LEN: usize = 8 + 4;

/// A u64 never needs more than ten 7-bit groups.
const MAX_VARINT_LEN: usize = 10;

/// Codec limits.
#[derive(Debug, Clone, Default)]
pub struct WireConfig {
    /// Largest encoded buffer the builder will produce. `None` is unbounded.
    pub max_buffer_len: Option<usize>,
}

/// Append `value` as unsigned LEB128.
pub(crate) fn put_varint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Read an unsigned LEB128 from the front of `src`.
///
/// Returns the value and the number of bytes it occupied.
pub(crate) fn get_varint(src: &[u8]) -> Result<(u64, usize), MalformedReason> {
    let mut value = 0u64;
    for (i, byte) in src.iter().take(MAX_VARINT_LEN).enumerate() {
        let group = u64::from(byte & 0x7f);
        let shift = 7 * i as u32;
        if i == MAX_VARINT_LEN - 1 && group > 1 {
            return Err(MalformedReason::LengthOverflow);
        }
        value |= group << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        Err(MalformedReason::LengthOverflow)
    } else {
        Err(MalformedReason::TruncatedLength)
    }
}

fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn body_len(packet: &Packet) -> usize {
    match packet {
        Packet::Header(_) => HEADER_BODY_LEN,
        Packet::FdPayload(_) => FD_PAYLOAD_BODY_LEN,
        Packet::ReleaseFdPayload(_) => RELEASE_BODY_LEN,
        Packet::FormatChange(p) => varint_len(p.format.len() as u64) + p.format.len(),
        Packet::RefreshRequest(_) => REFRESH_BODY_LEN,
    }
}

/// Append one packet (tag, length, body) to `dst`.
///
/// Placement rules such as "header first" are enforced by
/// [`WireBufferBuilder`](crate::WireBufferBuilder), not here.
pub fn encode_packet(packet: &Packet, dst: &mut BytesMut) {
    let len = body_len(packet);
    dst.reserve(1 + varint_len(len as u64) + len);
    dst.put_u8(packet.packet_type().tag());
    put_varint(dst, len as u64);

    match packet {
        Packet::Header(h) => {
            dst.put_u32_le(h.flags);
            dst.put_u64_le(h.sequence);
            dst.put_i64_le(h.timestamp);
            dst.put_i64_le(h.dts_offset);
        }
        Packet::FdPayload(p) => {
            dst.put_u32_le(p.fd_slot);
            dst.put_u32_le(p.lend_id);
            dst.put_u64_le(p.offset);
            dst.put_u64_le(p.size);
        }
        Packet::ReleaseFdPayload(p) => dst.put_u32_le(p.lend_id),
        Packet::FormatChange(p) => {
            put_varint(dst, p.format.len() as u64);
            dst.put_slice(p.format.as_bytes());
        }
        Packet::RefreshRequest(p) => {
            dst.put_i64_le(p.timestamp);
            dst.put_u32_le(p.kind.code());
        }
    }
}

enum Body {
    Known(Packet),
    Unknown(u8),
    Invalid(&'static str),
}

fn parse_body(tag: u8, mut body: &[u8]) -> Body {
    let Some(ty) = PacketType::from_tag(tag) else {
        return Body::Unknown(tag);
    };

    let need = match ty {
        PacketType::Header => HEADER_BODY_LEN,
        PacketType::FdPayload => FD_PAYLOAD_BODY_LEN,
        PacketType::ReleaseFdPayload => RELEASE_BODY_LEN,
        PacketType::RefreshRequest => REFRESH_BODY_LEN,
        PacketType::FormatChange => 1,
    };
    if body.len() < need {
        return Body::Invalid("body shorter than its fixed layout");
    }

    let packet = match ty {
        PacketType::Header => Packet::Header(Header {
            flags: body.get_u32_le(),
            sequence: body.get_u64_le(),
            timestamp: body.get_i64_le(),
            dts_offset: body.get_i64_le(),
        }),
        PacketType::FdPayload => Packet::FdPayload(FdPayload {
            fd_slot: body.get_u32_le(),
            lend_id: body.get_u32_le(),
            offset: body.get_u64_le(),
            size: body.get_u64_le(),
        }),
        PacketType::ReleaseFdPayload => Packet::ReleaseFdPayload(ReleaseFdPayload {
            lend_id: body.get_u32_le(),
        }),
        PacketType::RefreshRequest => Packet::RefreshRequest(RefreshRequest {
            timestamp: body.get_i64_le(),
            kind: RefreshKind::from_code(body.get_u32_le()),
        }),
        PacketType::FormatChange => {
            let Ok((len, used)) = get_varint(body) else {
                return Body::Invalid("bad format string length");
            };
            let rest = &body[used..];
            if len > rest.len() as u64 {
                return Body::Invalid("format string runs past packet body");
            }
            match std::str::from_utf8(&rest[..len as usize]) {
                Ok(format) => Packet::FormatChange(FormatChange {
                    format: format.to_owned(),
                }),
                Err(_) => return Body::Invalid("format string is not UTF-8"),
            }
        }
    };
    Body::Known(packet)
}

/// Lazy, restartable packet cursor over one buffer.
///
/// Yields `Ok(packet)` for each well-formed packet. Unknown tags and
/// packets with an unusable body are skipped. On a buffer-level problem the
/// cursor yields a single [`WireError::MalformedBuffer`] and then ends;
/// everything yielded before it is still valid content.
#[derive(Debug, Clone)]
pub struct PacketIter<'a> {
    data: &'a [u8],
    pos: usize,
    fd_count: usize,
    done: bool,
}

impl<'a> PacketIter<'a> {
    /// Start at the beginning of `data`, validating slots against `fd_count`.
    pub fn new(data: &'a [u8], fd_count: usize) -> Self {
        Self::resume(data, fd_count, 0)
    }

    /// Continue from a byte offset previously reported by [`offset`](Self::offset).
    pub fn resume(data: &'a [u8], fd_count: usize, offset: usize) -> Self {
        Self {
            data,
            pos: offset.min(data.len()),
            fd_count,
            done: false,
        }
    }

    /// Byte offset of the next packet to decode.
    pub fn offset(&self) -> usize {
        self.pos
    }

    fn fail(&mut self, offset: usize, reason: MalformedReason) -> Option<Result<Packet, WireError>> {
        self.done = true;
        self.pos = offset;
        warn!(offset, %reason, "stopping decode of malformed buffer");
        Some(Err(WireError::MalformedBuffer { offset, reason }))
    }
}

impl Iterator for PacketIter<'_> {
    type Item = Result<Packet, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.pos < self.data.len() {
            let start = self.pos;
            let tag = self.data[start];

            let (declared, prefix) = match get_varint(&self.data[start + 1..]) {
                Ok(v) => v,
                Err(reason) => return self.fail(start, reason),
            };
            let body_start = start + 1 + prefix;
            let available = self.data.len() - body_start;
            if declared > available as u64 {
                return self.fail(
                    start,
                    MalformedReason::TruncatedBody {
                        declared,
                        available,
                    },
                );
            }
            let body_end = body_start + declared as usize;
            let body = &self.data[body_start..body_end];

            match parse_body(tag, body) {
                Body::Known(Packet::Header(_)) if start != 0 => {
                    warn!(offset = start, "skipping header that is not the first packet");
                }
                Body::Known(Packet::FdPayload(p)) if p.fd_slot as usize >= self.fd_count => {
                    return self.fail(
                        start,
                        MalformedReason::FdSlotOutOfRange {
                            slot: p.fd_slot,
                            available: self.fd_count,
                        },
                    );
                }
                Body::Known(packet) => {
                    self.pos = body_end;
                    return Some(Ok(packet));
                }
                Body::Unknown(tag) => trace!(tag, len = declared, "skipping unknown packet"),
                Body::Invalid(why) => warn!(tag, offset = start, why, "skipping malformed packet"),
            }
            self.pos = body_end;
        }
        None
    }
}

/// Result of decoding a whole buffer eagerly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Packets decoded before the end of the buffer or the first buffer error.
    pub packets: Vec<Packet>,
    /// Set when decoding stopped early.
    pub error: Option<WireError>,
}

impl Decoded {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Decode all packets of `data`, keeping whatever precedes a buffer error.
pub fn decode(data: &[u8], fd_count: usize) -> Decoded {
    let mut decoded = Decoded::default();
    for item in PacketIter::new(data, fd_count) {
        match item {
            Ok(packet) => decoded.packets.push(packet),
            Err(err) => decoded.error = Some(err),
        }
    }
    decoded
}
