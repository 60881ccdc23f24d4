//! Turns media buffers into outgoing wire buffers that lend their memory.

use std::os::fd::AsFd;
use std::sync::{Arc, Weak};

use fdpay_wire::{
    FdPayload, FormatChange, Header, LendId, Packet, WireBuffer, WireBufferBuilder, WireConfig,
};
use tracing::{debug, trace};

use crate::error::{LendError, Result};
use crate::memory::{BufferMeta, FdAllocator, FdMemory, MediaBuffer, TmpfileAllocator};
use crate::registry::FdRegistry;

/// Header timestamp used when a buffer has no presentation time.
pub const NO_TIMESTAMP: i64 = -1;

/// Header sequence used when a buffer has no stream offset.
pub const NO_SEQUENCE: u64 = u64::MAX;

/// Producer behavior.
#[derive(Debug, Clone, Default)]
pub struct ProducerConfig {
    /// Added to every presentation timestamp before it goes on the wire.
    pub base_time: i64,
    /// Copy descriptor-backed memory that its owner may recycle instead of
    /// lending it and holding the original buffer.
    pub copy_reusable: bool,
    /// Encoding limits.
    pub wire: WireConfig,
}

/// What an outgoing buffer keeps alive while its lend is outstanding.
///
/// The tag owns the lend id's reservation and returns it to the registry
/// when the last holder, local or in a client entry, drops it.
pub struct LendTag {
    lend_id: LendId,
    memory: FdMemory,
    original: Option<MediaBuffer>,
    registry: Weak<FdRegistry>,
}

impl LendTag {
    pub fn lend_id(&self) -> LendId {
        self.lend_id
    }

    pub fn memory(&self) -> &FdMemory {
        &self.memory
    }

    /// Whether the source buffer is held until every client releases.
    pub fn retains_original(&self) -> bool {
        self.original.is_some()
    }
}

impl Drop for LendTag {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release_lend_id(self.lend_id);
        }
    }
}

impl std::fmt::Debug for LendTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LendTag")
            .field("lend_id", &self.lend_id)
            .field("memory", &self.memory)
            .field("retains_original", &self.original.is_some())
            .finish()
    }
}

/// A wire buffer ready to be sent, tagged with the lend it introduces.
#[derive(Debug)]
pub struct OutgoingBuffer {
    wire: WireBuffer,
    header: Header,
    meta: BufferMeta,
    copied: bool,
    tag: Arc<LendTag>,
}

impl OutgoingBuffer {
    pub fn wire(&self) -> &WireBuffer {
        &self.wire
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Metadata of the source buffer, unchanged.
    pub fn meta(&self) -> &BufferMeta {
        &self.meta
    }

    pub fn lend_id(&self) -> LendId {
        self.tag.lend_id
    }

    pub fn tag(&self) -> &Arc<LendTag> {
        &self.tag
    }

    /// Whether the content was copied into freshly allocated memory.
    pub fn is_copy(&self) -> bool {
        self.copied
    }
}

/// Produces [`OutgoingBuffer`]s and records their delivery in the registry.
pub struct PayloadProducer<A = TmpfileAllocator> {
    registry: Arc<FdRegistry>,
    allocator: A,
    config: ProducerConfig,
}

impl PayloadProducer<TmpfileAllocator> {
    pub fn new(registry: Arc<FdRegistry>) -> Self {
        Self::with_allocator(registry, TmpfileAllocator::new())
    }
}

impl<A: FdAllocator> PayloadProducer<A> {
    pub fn with_allocator(registry: Arc<FdRegistry>, allocator: A) -> Self {
        Self {
            registry,
            allocator,
            config: ProducerConfig::default(),
        }
    }

    /// Override producer config.
    pub fn with_config(mut self, config: ProducerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<FdRegistry> {
        &self.registry
    }

    /// Build the wire buffer that lends `buffer`'s content.
    ///
    /// A buffer made of exactly one descriptor-backed block is lent as is;
    /// anything else is copied into fresh memory from the allocator. When the
    /// lent block is recycled by its owner, `buffer` itself is held until
    /// every client has released the lend.
    pub fn payload(&self, buffer: MediaBuffer) -> Result<OutgoingBuffer> {
        if buffer.memories().is_empty() {
            return Err(LendError::EmptyBuffer);
        }
        let meta = *buffer.meta();

        let reuse = buffer
            .single_fd_memory()
            .filter(|memory| !(memory.is_reusable() && self.config.copy_reusable))
            .cloned();
        let (memory, original, copied) = match reuse {
            Some(memory) => {
                let original = memory.is_reusable().then_some(buffer);
                (memory, original, false)
            }
            None => (self.copy(&buffer)?, None, true),
        };

        let fd = memory
            .as_fd()
            .try_clone_to_owned()
            .map_err(LendError::DescriptorTransfer)?;
        let lend_id = self
            .registry
            .next_lend_id()
            .ok_or(LendError::LendIdsExhausted)?;
        // From here on the reservation is returned when `tag` drops.
        let tag = Arc::new(LendTag {
            lend_id,
            memory,
            original,
            registry: Arc::downgrade(&self.registry),
        });
        let header = Header {
            flags: 0,
            sequence: meta.offset.unwrap_or(NO_SEQUENCE),
            timestamp: meta
                .pts
                .map_or(NO_TIMESTAMP, |pts| pts.saturating_add(self.config.base_time)),
            dts_offset: 0,
        };

        let mut builder = WireBufferBuilder::with_config(self.config.wire.clone());
        builder.add_header(&header)?;
        let fd_slot = builder.add_fd(fd);
        builder.add_packet(&Packet::FdPayload(FdPayload {
            fd_slot,
            lend_id,
            offset: tag.memory.offset(),
            size: tag.memory.size(),
        }))?;
        let wire = builder.finish()?;

        trace!(
            lend_id,
            size = tag.memory.size(),
            copied,
            retained = tag.original.is_some(),
            "payload built"
        );
        Ok(OutgoingBuffer {
            wire,
            header,
            meta,
            copied,
            tag,
        })
    }

    /// Record that `client` confirmed receipt of `buffer`.
    ///
    /// The registry holds the buffer's memory (and retained source) until
    /// the client releases the lend. Returns the client's count for it.
    pub fn buffer_sent(&self, client: &str, buffer: &OutgoingBuffer) -> u32 {
        let tag = Arc::clone(&buffer.tag);
        self.registry.add(client, buffer.lend_id(), tag, drop)
    }

    /// Build a control message announcing a new content format.
    pub fn format_change(&self, format: &str) -> Result<WireBuffer> {
        let mut builder = WireBufferBuilder::with_config(self.config.wire.clone());
        builder.add_packet(&Packet::FormatChange(FormatChange {
            format: format.to_string(),
        }))?;
        Ok(builder.finish()?)
    }

    fn copy(&self, buffer: &MediaBuffer) -> Result<FdMemory> {
        let size = buffer.size();
        let memory = self
            .allocator
            .allocate(size)
            .map_err(|source| LendError::AllocationFailure { size, source })?;
        buffer.copy_into(&memory).map_err(LendError::Region)?;
        debug!(size, "copied buffer into fresh memory");
        Ok(memory)
    }
}

impl<A> std::fmt::Debug for PayloadProducer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadProducer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
