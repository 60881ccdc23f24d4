//! Lending descriptor-backed buffers to other processes.
//!
//! A producer turns each [`MediaBuffer`] into a wire buffer whose content
//! stays in shared memory; only a small control message and a descriptor
//! cross the socket. The [`FdRegistry`] records which client holds which
//! lend until the client sends it back with a release packet, and the
//! [`ControlDispatcher`] applies those packets. On the consumer side,
//! [`ControlDispatcher::receive`] wraps an incoming buffer so that dropping
//! it returns every lend upstream exactly once.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use fdpay_lend::{BufferMeta, FdRegistry, MediaBuffer, PayloadProducer};
//!
//! let registry = Arc::new(FdRegistry::new());
//! let producer = PayloadProducer::new(Arc::clone(&registry));
//!
//! let buffer = MediaBuffer::with_memory(Bytes::from_static(b"frame"), BufferMeta::default());
//! let outgoing = producer.payload(buffer)?;
//! producer.buffer_sent("client-1", &outgoing);
//! assert_eq!(registry.refcount("client-1", outgoing.lend_id()), Some(1));
//! # Ok::<(), fdpay_lend::LendError>(())
//! ```

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod producer;
pub mod registry;

pub use connection::{
    connect, ClientConnection, ClientListener, ConnectionSink, ListenerConfig, UPSTREAM_ID,
};
pub use dispatcher::{
    ControlDispatcher, ControlReport, ControlSink, PipelineEvents, ReceivedBuffer, ReceivedRegion,
    Role,
};
pub use error::{LendError, Result};
pub use memory::{BufferMeta, FdAllocator, FdMemory, MediaBuffer, Memory, TmpfileAllocator};
pub use producer::{
    LendTag, OutgoingBuffer, PayloadProducer, ProducerConfig, NO_SEQUENCE, NO_TIMESTAMP,
};
pub use registry::{FdRegistry, Removal};
