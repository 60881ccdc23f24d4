use std::io::ErrorKind;
use std::os::fd::BorrowedFd;

use bytes::BytesMut;
use fdpay_transport::{FdStream, FdWrite};
use tracing::trace;

use crate::buffer::WireBuffer;
use crate::envelope::{encode_envelope, EnvelopeConfig};
use crate::error::FrameError;
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes [`WireBuffer`]s, descriptors included, to a stream.
pub struct MessageWriter<T> {
    inner: T,
    buf: BytesMut,
    config: EnvelopeConfig,
}

impl<T: FdWrite> MessageWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, EnvelopeConfig::default())
    }

    pub fn with_config(inner: T, config: EnvelopeConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Send one message (blocking).
    ///
    /// The descriptors are attached to the first chunk the kernel accepts;
    /// any remainder of a short write goes out without them. A write timeout
    /// surfaces as `FrameError::Io` with `WouldBlock` or `TimedOut`; the
    /// stream is then mid-message and should be dropped.
    pub fn write_message(&mut self, message: &WireBuffer) -> Result<(), FrameError> {
        self.buf.clear();
        encode_envelope(message.len(), message.fds().len(), &self.config, &mut self.buf)?;
        self.buf.extend_from_slice(message.data());

        let fds = message.borrowed_fds();
        let mut attach: &[BorrowedFd<'_>] = &fds;
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.send_with_fds(&self.buf[offset..], attach) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    offset += n;
                    attach = &[];
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        trace!(len = message.len(), fds = fds.len(), "wrote message");
        Ok(())
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

impl MessageWriter<FdStream> {
    /// Create a writer for `FdStream` and apply the write timeout from config.
    pub fn with_config_stream(inner: FdStream, config: EnvelopeConfig) -> Result<Self, FrameError> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}
