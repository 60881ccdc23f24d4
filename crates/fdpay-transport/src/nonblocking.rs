//! Non-blocking descriptor passing on the tokio reactor.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use tokio::io::Interest;
use tokio::net::UnixStream;

use crate::ancillary;
use crate::error::Result;
use crate::traits::FdStream;

/// Async counterpart of [`FdStream`].
///
/// Sends and receives go through `sendmsg`/`recvmsg` directly and wait on
/// socket readiness instead of blocking the calling thread.
#[derive(Debug)]
pub struct AsyncFdStream {
    inner: UnixStream,
}

impl AsyncFdStream {
    /// Register a blocking stream with the current tokio runtime.
    pub fn from_std(stream: FdStream) -> Result<Self> {
        let stream = stream.into_unix();
        stream.set_nonblocking(true)?;
        Ok(Self {
            inner: UnixStream::from_std(stream)?,
        })
    }

    /// Create a connected pair on the current runtime.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair()?;
        Ok((Self { inner: left }, Self { inner: right }))
    }

    /// Wait until the socket is writable and send `buf` with `fds` attached.
    pub async fn send_with_fds(&self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        self.inner
            .async_io(Interest::WRITABLE, || {
                ancillary::send_with_fds(self.inner.as_fd(), buf, fds)
            })
            .await
    }

    /// Attempt a send without waiting; fails with `WouldBlock` when the
    /// socket buffer is full.
    pub fn try_send_with_fds(&self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        self.inner.try_io(Interest::WRITABLE, || {
            ancillary::send_with_fds(self.inner.as_fd(), buf, fds)
        })
    }

    /// Wait until data is available and receive it with any descriptors.
    pub async fn recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
        self.inner
            .async_io(Interest::READABLE, || {
                ancillary::recv_with_fds(self.inner.as_fd(), buf, fds)
            })
            .await
    }
}

impl AsFd for AsyncFdStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_descriptor_without_blocking() {
        let (left, right) = AsyncFdStream::pair().unwrap();
        let (spare, _other) = FdStream::pair().unwrap();

        let sent = left.send_with_fds(b"async", &[spare.as_fd()]).await.unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 8];
        let mut fds = Vec::new();
        let n = right.recv_with_fds(&mut buf, &mut fds).await.unwrap();
        assert_eq!(&buf[..n], b"async");
        assert_eq!(fds.len(), 1);
    }

    #[tokio::test]
    async fn wraps_blocking_stream() {
        let (left, right) = FdStream::pair().unwrap();
        let left = AsyncFdStream::from_std(left).unwrap();
        let right = AsyncFdStream::from_std(right).unwrap();

        left.try_send_with_fds(b"hi", &[]).unwrap();
        let mut buf = [0u8; 2];
        let mut fds = Vec::new();
        right.recv_with_fds(&mut buf, &mut fds).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
