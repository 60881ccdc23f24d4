use std::net::Shutdown;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fdpay_transport::{FdListener, FdStream};
use fdpay_wire::{EnvelopeConfig, MessageReader, MessageWriter, WireBuffer};
use tracing::{debug, info};

use crate::dispatcher::ControlSink;
use crate::error::Result;

/// Identity used for the producer side of a consumer connection.
pub const UPSTREAM_ID: &str = "upstream";

/// Listener behavior.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Envelope limits and timeouts for accepted connections.
    pub envelope: EnvelopeConfig,
    /// Permission bits of the socket file.
    pub mode: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            envelope: EnvelopeConfig::default(),
            mode: 0o600,
        }
    }
}

/// Listens for clients and gives each a stable identity.
pub struct ClientListener {
    listener: FdListener,
    config: ListenerConfig,
    next_client_id: AtomicU64,
}

impl ClientListener {
    /// Bind to a Unix domain socket path.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_config(path, ListenerConfig::default())
    }

    pub fn bind_with_config(path: impl AsRef<Path>, config: ListenerConfig) -> Result<Self> {
        let listener = FdListener::bind_with_mode(path, config.mode)?;
        info!(path = %listener.path().display(), "listening for clients");
        Ok(Self {
            listener,
            config,
            next_client_id: AtomicU64::new(1),
        })
    }

    /// Accept next connection and assign an auto-generated client id.
    pub fn accept(&self) -> Result<ClientConnection> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.accept_with_id(&format!("client-{id}"))
    }

    /// Accept next connection and use explicit client id.
    pub fn accept_with_id(&self, client_id: &str) -> Result<ClientConnection> {
        let stream = self.listener.accept()?;
        self.wrap(client_id, stream)
    }

    /// Like [`ClientListener::accept`], but gives up after `timeout`.
    ///
    /// Client ids are only consumed by connections that actually arrive.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<ClientConnection>> {
        let Some(stream) = self.listener.accept_timeout(timeout)? else {
            return Ok(None);
        };
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.wrap(&format!("client-{id}"), stream).map(Some)
    }

    fn wrap(&self, client_id: &str, stream: FdStream) -> Result<ClientConnection> {
        let connection =
            ClientConnection::from_stream(client_id, stream, self.config.envelope.clone())?;
        info!(client = client_id, "client connected");
        Ok(connection)
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.listener.path()
    }
}

/// Connect to a producer listening at `path`.
pub fn connect(path: impl AsRef<Path>, config: EnvelopeConfig) -> Result<ClientConnection> {
    let stream = FdListener::connect(path)?;
    ClientConnection::from_stream(UPSTREAM_ID, stream, config)
}

/// One end of a connection: a message reader plus a shareable sink.
pub struct ClientConnection {
    id: String,
    reader: MessageReader<FdStream>,
    sink: Arc<ConnectionSink>,
}

impl ClientConnection {
    /// Wrap an already connected stream.
    pub fn from_stream(id: &str, stream: FdStream, config: EnvelopeConfig) -> Result<Self> {
        let reader_stream = stream.try_clone()?;
        let reader = MessageReader::with_config_stream(reader_stream, config.clone())?;
        let writer = MessageWriter::with_config_stream(stream, config)?;
        Ok(Self {
            id: id.to_string(),
            reader,
            sink: Arc::new(ConnectionSink {
                peer: id.to_string(),
                writer: Mutex::new(writer),
            }),
        })
    }

    /// Identity of the remote end, stable for the connection's lifetime.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sink(&self) -> &Arc<ConnectionSink> {
        &self.sink
    }

    /// Receive the next message (blocking).
    pub fn recv(&mut self) -> Result<WireBuffer> {
        Ok(self.reader.read_message()?)
    }

    pub fn send(&self, message: &WireBuffer) -> Result<()> {
        self.sink.send(message)
    }

    /// Split into id, reader and sink so the halves can live on different threads.
    pub fn into_split(self) -> (String, MessageReader<FdStream>, Arc<ConnectionSink>) {
        (self.id, self.reader, self.sink)
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Sending half of a connection, safe to share between threads.
pub struct ConnectionSink {
    peer: String,
    writer: Mutex<MessageWriter<FdStream>>,
}

impl ConnectionSink {
    pub fn send(&self, message: &WireBuffer) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_message(message)?;
        debug!(peer = %self.peer, len = message.len(), fds = message.fds().len(), "sent");
        Ok(())
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Shut down one or both directions of the underlying socket.
    ///
    /// `Shutdown::Write` tells the peer no more messages follow while its
    /// control messages can still be read; `Shutdown::Both` also wakes a
    /// reader blocked on the other half.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.get_ref().shutdown(how)?;
        debug!(peer = %self.peer, ?how, "shut down");
        Ok(())
    }
}

impl ControlSink for ConnectionSink {
    fn send_control(&self, message: &WireBuffer) -> Result<()> {
        self.send(message)
    }
}
