use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::FdStream;

/// Listening Unix domain socket for descriptor-passing clients.
///
/// Binds a filesystem path, hands out [`FdStream`]s on accept and removes
/// the socket file again on drop, provided the path still names the socket
/// this listener created.
pub struct FdListener {
    listener: UnixListener,
    path: PathBuf,
    identity: Option<(u64, u64)>,
}

impl FdListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// `sockaddr_un.sun_path` is 108 bytes on Linux, 104 on the BSDs and macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on `path` with the default mode.
    ///
    /// A stale socket left at `path` is removed first; any other kind of
    /// file there is an error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen on `path`, then chmod the socket file to `mode`.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_err = |source: std::io::Error| TransportError::Bind {
            path: path.clone(),
            source,
        };

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening for descriptor clients");

        Ok(Self {
            listener,
            identity: Some((created.dev(), created.ino())),
            path,
        })
    }

    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<FdStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        let stream = FdStream::from(stream);
        match stream.peer_credentials() {
            Some((uid, _gid, pid)) => debug!(uid, pid, "accepted connection"),
            None => debug!("accepted connection"),
        }
        Ok(stream)
    }

    /// Wait up to `timeout` for a connection.
    ///
    /// Returns `Ok(None)` when nothing arrived in time or a signal cut the
    /// wait short, so callers can check a shutdown flag between attempts.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<FdStream>> {
        let mut pollfd = libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        // SAFETY: `pollfd` is a valid, initialised array of one entry that
        // outlives the call, and the listener keeps the descriptor open.
        let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(TransportError::Accept(err));
        }
        if ready == 0 {
            return Ok(None);
        }
        self.accept().map(Some)
    }

    /// Connect to a listening socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<FdStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to descriptor server");
        Ok(FdStream::from(stream))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "unix-domain-socket+scm-rights"
    }
}

impl Drop for FdListener {
    fn drop(&mut self) {
        let Some((dev, ino)) = self.identity else {
            return;
        };
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        if metadata.file_type().is_socket() && metadata.dev() == dev && metadata.ino() == ino {
            debug!(path = ?self.path, "cleaning up socket file");
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;

    use super::*;
    use crate::traits::{FdRead, FdWrite};

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fdpay-uds-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn accept_and_pass_descriptor() {
        let dir = scratch_dir("accept");
        let sock_path = dir.join("test.sock");
        let listener = FdListener::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let path_clone = sock_path.clone();
        let handle = std::thread::spawn(move || {
            let mut client = FdListener::connect(&path_clone).unwrap();
            let mut file = std::fs::File::create(path_clone.with_extension("data")).unwrap();
            file.write_all(b"frame-bytes").unwrap();
            let file = std::fs::File::open(path_clone.with_extension("data")).unwrap();
            client.send_with_fds(b"F", &[file.as_fd()]).unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 1];
        let mut fds = Vec::new();
        server.recv_with_fds(&mut buf, &mut fds).unwrap();
        handle.join().unwrap();

        assert_eq!(&buf, b"F");
        let mut file = std::fs::File::from(fds.remove(0));
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "frame-bytes");

        drop(listener);
        assert!(!sock_path.exists(), "socket file should be cleaned up on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn accept_timeout_returns_none_without_clients() {
        let dir = scratch_dir("accept-timeout");
        let sock_path = dir.join("idle.sock");
        let listener = FdListener::bind(&sock_path).unwrap();

        let started = std::time::Instant::now();
        let accepted = listener.accept_timeout(Duration::from_millis(20)).unwrap();
        assert!(accepted.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));

        let _client = FdListener::connect(&sock_path).unwrap();
        let accepted = listener.accept_timeout(Duration::from_secs(5)).unwrap();
        assert!(accepted.is_some());

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = FdListener::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn default_permissions_are_owner_only() {
        let dir = scratch_dir("perms");
        let sock_path = dir.join("perm.sock");

        let listener = FdListener::bind(&sock_path).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn refuses_to_replace_regular_file() {
        let dir = scratch_dir("regular");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = FdListener::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rebind_over_stale_socket() {
        let dir = scratch_dir("stale");
        let sock_path = dir.join("stale.sock");
        let first = FdListener::bind(&sock_path).unwrap();
        std::mem::forget(first);

        let second = FdListener::bind(&sock_path).unwrap();
        assert_eq!(second.path(), sock_path.as_path());
        drop(second);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let dir = scratch_dir("missing");
        let result = FdListener::connect(dir.join("nobody.sock"));
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
