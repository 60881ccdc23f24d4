//! Control packet codec for zero-copy buffer passing.
//!
//! A [`WireBuffer`] is a run of type-tagged packets plus a side-channel of
//! file descriptors. Each packet is:
//! - a 1-byte type tag
//! - a LEB128 body length
//! - a little-endian, type-specific body
//!
//! [`FdPayload`] packets point into the side-channel by slot index, so the
//! bytes describe *where* shared memory lives while the descriptors travel
//! out of band. On a stream socket every WireBuffer is wrapped in an
//! envelope (see [`envelope`]) that records its length and descriptor count.

pub mod buffer;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod packet;
pub mod reader;
pub mod writer;

pub use buffer::{WireBuffer, WireBufferBuilder};
pub use codec::{decode, encode_packet, Decoded, PacketIter, WireConfig};
pub use envelope::{
    decode_envelope, encode_envelope, EnvelopeConfig, DEFAULT_MAX_PAYLOAD, ENVELOPE_HEADER_SIZE,
};
pub use error::{FrameError, MalformedReason, Result, WireError};
pub use packet::{
    FdPayload, FormatChange, Header, LendId, Packet, PacketType, RefreshKind, RefreshRequest,
    ReleaseFdPayload,
};
pub use reader::MessageReader;
pub use writer::MessageWriter;
