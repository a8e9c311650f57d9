use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use uuid::fmt::Simple;
use uuid::Uuid;

use crate::config::ServerConfig;

/// Unique identifier for an accepted connection (log correlation).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnId {
    raw: Simple,
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnId {
    /// Generate a new random id.
    pub fn new() -> ConnId {
        Self {
            raw: Uuid::new_v4().simple(),
        }
    }

    /// Raw UUID (compact format).
    #[inline]
    pub fn raw(&self) -> Simple {
        self.raw
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// One accepted connection, handed to the request handler.
///
/// The connection task is the socket's only owner; dropping both halves
/// (normally, on error, or through cancellation) is what closes it.
pub struct ServerConnection<Io> {
    /// Buffered read half of the socket.
    pub input: BufReader<ReadHalf<Io>>,
    /// Write half of the socket.
    pub output: WriteHalf<Io>,
    /// Remote peer address.
    pub peer_addr: SocketAddr,
    /// Connection id for log correlation.
    pub id: ConnId,
}

impl<Io> ServerConnection<Io>
where
    Io: AsyncRead + AsyncWrite,
{
    pub(crate) fn new(io: Io, peer_addr: SocketAddr) -> Self {
        let (input, output) = tokio::io::split(io);
        Self {
            input: BufReader::new(input),
            output,
            peer_addr,
            id: ConnId::new(),
        }
    }
}

impl<Io> fmt::Debug for ServerConnection<Io> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Listening half of the socket capability.
///
/// `accept` must be cancel-safe: a dropped accept future may not lose a
/// connection. `tokio::net::TcpListener` provides the production impl;
/// tests plug in-memory listeners in here.
pub trait Listener: Send + 'static {
    /// Byte stream of one accepted connection.
    type Io: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;

    /// Local address the listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Deferred bind half of the socket capability.
///
/// Binding runs inside the accept task, so a failure surfaces through the
/// server handle's bound-address future rather than at spawn time.
pub trait Bind: Send + 'static {
    /// Listener produced by a successful bind.
    type Listener: Listener;

    /// Open the listening socket.
    fn bind(self) -> impl Future<Output = io::Result<Self::Listener>> + Send;
}

/// Binds a [`TcpListener`] from host/port settings.
#[derive(Debug, Clone)]
pub struct TcpBinder {
    host: String,
    port: u16,
}

impl TcpBinder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<&ServerConfig> for TcpBinder {
    fn from(cfg: &ServerConfig) -> Self {
        Self::new(cfg.host.clone(), cfg.port)
    }
}

impl Bind for TcpBinder {
    type Listener = TcpListener;

    fn bind(self) -> impl Future<Output = io::Result<TcpListener>> + Send {
        TcpListener::bind((self.host, self.port))
    }
}

/// Per-connection request handler, invoked once per accepted connection
/// inside that connection's supervised task. May suspend freely on the
/// connection's streams; errors are reported to the failure sink and
/// never escalate past the connection task.
pub trait Handler<Io>: Clone + Send + Sync + 'static {
    fn handle(&self, conn: ServerConnection<Io>) -> impl Future<Output = anyhow::Result<()>> + Send;
}

impl<F, Fut, Io> Handler<Io> for F
where
    F: Fn(ServerConnection<Io>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    Io: AsyncRead + AsyncWrite + Send + 'static,
{
    fn handle(&self, conn: ServerConnection<Io>) -> impl Future<Output = anyhow::Result<()>> + Send {
        (self)(conn)
    }
}
