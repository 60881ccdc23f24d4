use std::collections::VecDeque;
use std::io::ErrorKind;
use std::os::fd::OwnedFd;

use bytes::BytesMut;
use fdpay_transport::{FdRead, FdStream};
use tracing::trace;

use crate::buffer::WireBuffer;
use crate::envelope::{decode_envelope, EnvelopeConfig};
use crate::error::FrameError;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete [`WireBuffer`]s, descriptors included, from a stream.
///
/// Handles partial reads internally. Descriptors are queued in arrival
/// order and handed to envelopes by their announced count.
pub struct MessageReader<T> {
    inner: T,
    buf: BytesMut,
    fds: VecDeque<OwnedFd>,
    config: EnvelopeConfig,
}

impl<T: FdRead> MessageReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, EnvelopeConfig::default())
    }

    pub fn with_config(inner: T, config: EnvelopeConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            fds: VecDeque::new(),
            config,
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_message(&mut self) -> Result<WireBuffer, FrameError> {
        let mut received = Vec::new();
        loop {
            if let Some((data, fd_count)) = decode_envelope(&mut self.buf, &self.config)? {
                if self.fds.len() < fd_count {
                    return Err(FrameError::MissingDescriptors {
                        expected: fd_count,
                        available: self.fds.len(),
                    });
                }
                let fds: Vec<OwnedFd> = self.fds.drain(..fd_count).collect();
                trace!(len = data.len(), fds = fds.len(), "read message");
                return Ok(WireBuffer::new(data, fds));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.recv_with_fds(&mut chunk, &mut received) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };
            self.fds.extend(received.drain(..));

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Descriptors received but not yet claimed by a complete envelope.
    pub fn pending_fds(&self) -> usize {
        self.fds.len()
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn config(&self) -> &EnvelopeConfig {
        &self.config
    }
}

impl MessageReader<FdStream> {
    /// Create a reader for `FdStream` and apply the read timeout from config.
    pub fn with_config_stream(inner: FdStream, config: EnvelopeConfig) -> Result<Self, FrameError> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

pub(crate) fn transport_to_frame_error(err: fdpay_transport::TransportError) -> FrameError {
    match err {
        fdpay_transport::TransportError::Io(io) | fdpay_transport::TransportError::Accept(io) => {
            FrameError::Io(io)
        }
        fdpay_transport::TransportError::Bind { source, .. }
        | fdpay_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
