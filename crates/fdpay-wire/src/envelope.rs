//! Stream delimitation for [`WireBuffer`](crate::WireBuffer)s.
//!
//! Envelope format:
//! ```text
//! ┌──────────────┬───────────┬───────────┬──────────────────────┐
//! │ Magic (2B)   │ Length    │ FD count  │ WireBuffer bytes     │
//! │ 0x46 0x44    │ (4B LE)   │ (2B LE)   │ (Length bytes)       │
//! │ "FD"         │           │           │                      │
//! └──────────────┴───────────┴───────────┴──────────────────────┘
//! ```
//! The descriptors themselves ride as `SCM_RIGHTS` data on the first
//! `sendmsg` of the envelope, never inside the bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fdpay_transport::MAX_FDS_PER_MESSAGE;

use crate::error::FrameError;

/// Envelope header: magic (2) + length (4) + fd count (2) = 8 bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 8;

/// Magic bytes: "FD" (0x46 0x44).
pub const MAGIC: [u8; 2] = [0x46, 0x44];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Limits and timeouts for envelope I/O.
#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    /// Maximum WireBuffer size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Maximum descriptors per message. Default: the kernel's SCM_MAX_FD.
    pub max_fds: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_fds: MAX_FDS_PER_MESSAGE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Write an envelope header for `payload_len` bytes and `fd_count` descriptors.
pub fn encode_envelope(
    payload_len: usize,
    fd_count: usize,
    config: &EnvelopeConfig,
    dst: &mut BytesMut,
) -> Result<(), FrameError> {
    let max_payload = config.max_payload_size.min(u32::MAX as usize);
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    let max_fds = config.max_fds.min(u16::MAX as usize);
    if fd_count > max_fds {
        return Err(FrameError::TooManyDescriptors {
            count: fd_count,
            max: max_fds,
        });
    }
    dst.reserve(ENVELOPE_HEADER_SIZE + payload_len);
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload_len as u32);
    dst.put_u16_le(fd_count as u16);
    Ok(())
}

/// Split one complete envelope off the front of `src`.
///
/// Returns `Ok(None)` until the whole envelope is buffered. On success the
/// WireBuffer bytes and the announced descriptor count are returned.
pub fn decode_envelope(
    src: &mut BytesMut,
    config: &EnvelopeConfig,
) -> Result<Option<(Bytes, usize)>, FrameError> {
    if src.len() < ENVELOPE_HEADER_SIZE {
        return Ok(None);
    }
    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let mut header = &src[2..ENVELOPE_HEADER_SIZE];
    let payload_len = header.get_u32_le() as usize;
    let fd_count = header.get_u16_le() as usize;

    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: config.max_payload_size,
        });
    }
    if fd_count > config.max_fds {
        return Err(FrameError::TooManyDescriptors {
            count: fd_count,
            max: config.max_fds,
        });
    }
    if src.len() < ENVELOPE_HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(ENVELOPE_HEADER_SIZE);
    Ok(Some((src.split_to(payload_len).freeze(), fd_count)))
}
