use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use bytes::{Bytes, BytesMut};

use crate::codec::{decode, encode_packet, Decoded, PacketIter, WireConfig};
use crate::error::{Result, WireError};
use crate::packet::{Header, Packet};

/// One self-contained protocol message: packet bytes plus the descriptors
/// its fd-payload packets refer to by slot.
pub struct WireBuffer {
    data: Bytes,
    fds: Vec<OwnedFd>,
}

impl WireBuffer {
    pub fn new(data: impl Into<Bytes>, fds: Vec<OwnedFd>) -> Self {
        Self {
            data: data.into(),
            fds,
        }
    }

    /// Encode `packets` after an optional header into a new buffer.
    pub fn encode(header: Option<&Header>, packets: &[Packet], fds: Vec<OwnedFd>) -> Result<Self> {
        let mut builder = WireBufferBuilder::new();
        if let Some(header) = header {
            builder.add_header(header)?;
        }
        for fd in fds {
            builder.add_fd(fd);
        }
        for packet in packets {
            builder.add_packet(packet)?;
        }
        builder.finish()
    }

    /// The encoded packet bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The side-channel descriptors, indexed by fd slot.
    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    /// The descriptor in `slot`, if present.
    pub fn fd(&self, slot: u32) -> Option<BorrowedFd<'_>> {
        self.fds.get(slot as usize).map(AsFd::as_fd)
    }

    /// Borrow every side-channel descriptor, in slot order.
    pub fn borrowed_fds(&self) -> Vec<BorrowedFd<'_>> {
        self.fds.iter().map(AsFd::as_fd).collect()
    }

    /// Lazily iterate the packets, validating slots against the side-channel.
    pub fn packets(&self) -> PacketIter<'_> {
        PacketIter::new(&self.data, self.fds.len())
    }

    /// Decode every packet eagerly.
    pub fn decode(&self) -> Decoded {
        decode(&self.data, self.fds.len())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_parts(self) -> (Bytes, Vec<OwnedFd>) {
        (self.data, self.fds)
    }

    /// Duplicate the buffer, including fresh descriptors for the side-channel.
    pub fn try_clone(&self) -> std::io::Result<Self> {
        let fds = self
            .fds
            .iter()
            .map(OwnedFd::try_clone)
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self {
            data: self.data.clone(),
            fds,
        })
    }
}

impl std::fmt::Debug for WireBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireBuffer")
            .field("len", &self.data.len())
            .field("fds", &self.fds.len())
            .finish()
    }
}

/// Incrementally assembles a [`WireBuffer`].
#[derive(Default)]
pub struct WireBufferBuilder {
    buf: BytesMut,
    fds: Vec<OwnedFd>,
    packets: usize,
    config: WireConfig,
}

impl WireBufferBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: WireConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Add the buffer header. Only legal before any other packet.
    pub fn add_header(&mut self, header: &Header) -> Result<()> {
        if self.packets != 0 {
            return Err(WireError::MisplacedHeader);
        }
        encode_packet(&Packet::Header(*header), &mut self.buf);
        self.packets += 1;
        Ok(())
    }

    /// Attach a descriptor to the side-channel and return its slot.
    pub fn add_fd(&mut self, fd: OwnedFd) -> u32 {
        self.fds.push(fd);
        (self.fds.len() - 1) as u32
    }

    /// Append a packet. A header is only accepted as the first packet.
    pub fn add_packet(&mut self, packet: &Packet) -> Result<()> {
        if let Packet::Header(header) = packet {
            return self.add_header(header);
        }
        encode_packet(packet, &mut self.buf);
        self.packets += 1;
        Ok(())
    }

    /// Number of packets added so far.
    pub fn packet_count(&self) -> usize {
        self.packets
    }

    pub fn is_empty(&self) -> bool {
        self.packets == 0
    }

    pub fn finish(self) -> Result<WireBuffer> {
        if let Some(max) = self.config.max_buffer_len {
            if self.buf.len() > max {
                return Err(WireError::BufferTooLarge {
                    size: self.buf.len(),
                    max,
                });
            }
        }
        Ok(WireBuffer {
            data: self.buf.freeze(),
            fds: self.fds,
        })
    }
}
