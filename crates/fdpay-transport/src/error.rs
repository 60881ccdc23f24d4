use std::path::PathBuf;

/// Errors raised while setting up or using a descriptor-passing socket.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// `accept(2)` failed on a bound listener.
    #[error("failed to accept client: {0}")]
    Accept(std::io::Error),

    /// A socket option or descriptor transfer failed on an open stream.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `sun_path` cannot hold the requested socket path.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

pub type Result<T> = std::result::Result<T, TransportError>;
