/// Why decoding of a whole buffer had to stop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedReason {
    /// The buffer ends inside a packet's length prefix.
    #[error("truncated length prefix")]
    TruncatedLength,

    /// The length prefix does not fit in 64 bits.
    #[error("length prefix overflows")]
    LengthOverflow,

    /// The declared body length runs past the end of the buffer.
    #[error("body of {declared} bytes exceeds the {available} remaining")]
    TruncatedBody { declared: u64, available: usize },

    /// An fd-payload references a descriptor slot that was not supplied.
    #[error("descriptor slot {slot} out of range ({available} supplied)")]
    FdSlotOutOfRange { slot: u32, available: usize },
}

/// Errors produced by the packet codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Decoding stopped; packets yielded before this point remain valid.
    #[error("malformed buffer at byte {offset}: {reason}")]
    MalformedBuffer {
        offset: usize,
        reason: MalformedReason,
    },

    /// A header was added after other packets.
    #[error("header must be the first packet of a buffer")]
    MisplacedHeader,

    /// The encoded buffer exceeds the configured maximum.
    #[error("encoded buffer too large ({size} bytes, max {max})")]
    BufferTooLarge { size: usize, max: usize },
}

/// Errors that can occur while moving envelopes over a stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The envelope header contains an invalid magic number.
    #[error("invalid envelope magic (expected 0x4644 \"FD\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// More descriptors than one message may carry.
    #[error("too many descriptors ({count}, max {max})")]
    TooManyDescriptors { count: usize, max: usize },

    /// A complete envelope announced more descriptors than arrived with it.
    #[error("envelope announced {expected} descriptors but only {available} arrived")]
    MissingDescriptors { expected: usize, available: usize },

    /// An I/O error occurred while reading or writing.
    #[error("envelope I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete envelope was received.
    #[error("connection closed (incomplete envelope)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, WireError>;
