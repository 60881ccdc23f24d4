use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;

use crate::ancillary;
use crate::error::Result;

/// A stream that can receive descriptors alongside its bytes.
pub trait FdRead {
    /// Read payload bytes into `buf`, appending any received descriptors to
    /// `fds`. Returns `Ok(0)` at end of stream.
    fn recv_with_fds(&mut self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize>;
}

/// A stream that can send descriptors alongside its bytes.
pub trait FdWrite {
    /// Write payload bytes with `fds` attached to the first byte written.
    /// Returns how many bytes were accepted; a short write means the caller
    /// must send the remainder with no descriptors.
    fn send_with_fds(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize>;
}

/// A connected Unix stream socket able to pass file descriptors.
///
/// Implements plain `Read + Write` for descriptor-free traffic as well as
/// [`FdRead`]/[`FdWrite`] for messages carrying a side-channel.
pub struct FdStream {
    inner: UnixStream,
}

impl FdStream {
    /// Create a connected pair, mostly useful for in-process tests.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair()?;
        Ok((Self::from(left), Self::from(right)))
    }

    /// Set read timeout on the underlying socket.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set write timeout on the underlying socket.
    pub fn set_write_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Switch the socket between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.inner.set_nonblocking(nonblocking).map_err(Into::into)
    }

    /// Try to clone this stream (creates a new file descriptor).
    ///
    /// Used to split one connection into a reading and a writing half.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::from(self.inner.try_clone()?))
    }

    /// Shut down one or both directions of the connection.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.inner.shutdown(how).map_err(Into::into)
    }

    /// Consume the wrapper and return the std socket.
    pub fn into_unix(self) -> UnixStream {
        self.inner
    }

    /// Get the credentials of the connected peer (Linux only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        use std::os::fd::AsRawFd;

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and the descriptor is an open Unix socket owned by this stream.
        let rc = unsafe {
            libc::getsockopt(
                self.inner.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl From<UnixStream> for FdStream {
    fn from(inner: UnixStream) -> Self {
        Self { inner }
    }
}

impl AsFd for FdStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl FdRead for FdStream {
    fn recv_with_fds(&mut self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
        ancillary::recv_with_fds(self.inner.as_fd(), buf, fds)
    }
}

impl FdWrite for FdStream {
    fn send_with_fds(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        ancillary::send_with_fds(self.inner.as_fd(), buf, fds)
    }
}

impl Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl std::fmt::Debug for FdStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdStream").field("type", &"unix").finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn pair_carries_plain_bytes() {
        let (mut left, mut right) = FdStream::pair().unwrap();
        left.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn trait_methods_pass_descriptors() {
        let (mut left, mut right) = FdStream::pair().unwrap();
        let (spare, _other) = FdStream::pair().unwrap();

        left.send_with_fds(b"fd", &[spare.as_fd()]).unwrap();

        let mut buf = [0u8; 2];
        let mut fds = Vec::new();
        let n = right.recv_with_fds(&mut buf, &mut fds).unwrap();
        assert_eq!(n, 2);
        assert_eq!(fds.len(), 1);
    }

    #[test]
    fn cloned_halves_share_connection() {
        let (left, mut right) = FdStream::pair().unwrap();
        let mut writer = left.try_clone().unwrap();
        drop(left);

        writer.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn peer_credentials_report_own_pid() {
        let (left, _right) = FdStream::pair().unwrap();
        let (_, _, pid) = left.peer_credentials().unwrap();
        assert_eq!(pid, std::process::id());
    }
}
