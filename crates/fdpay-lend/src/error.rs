/// Errors that can occur while lending buffers to clients.
#[derive(Debug, thiserror::Error)]
pub enum LendError {
    /// Descriptor-backed storage could not be allocated for a copy.
    #[error("failed to allocate {size} bytes of descriptor-backed memory: {source}")]
    AllocationFailure {
        size: u64,
        #[source]
        source: std::io::Error,
    },

    /// The buffer's descriptor could not be attached to the outgoing message.
    #[error("descriptor transfer failed: {0}")]
    DescriptorTransfer(#[source] std::io::Error),

    /// The buffer holds no memory to lend.
    #[error("buffer has no memory to lend")]
    EmptyBuffer,

    /// Every lend id is reserved or held by a client.
    #[error("no free lend id")]
    LendIdsExhausted,

    /// Reading a lent or received region failed.
    #[error("region I/O failed: {0}")]
    Region(#[source] std::io::Error),

    /// No upstream connection to deliver control packets to.
    #[error("no upstream control sink")]
    NoUpstream,

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] fdpay_transport::TransportError),

    /// Envelope-level error.
    #[error("frame error: {0}")]
    Frame(#[from] fdpay_wire::FrameError),

    /// Packet codec error.
    #[error("wire error: {0}")]
    Wire(#[from] fdpay_wire::WireError),
}

pub type Result<T> = std::result::Result<T, LendError>;
