//! Tunnel Sockets
//!
//! A tunnel socket is a single bidirectional byte stream, the only thing a
//! restricted network extension can reach. Connection progress is reported
//! through a state feed rather than by blocking in `open`.
//!
//! # State Feed
//!
//! ```text
//! Connecting ──▶ Connected ──▶ Closed
//!      │             │
//!      └─────────────┴──────▶ Cancelled
//! ```
//!
//! Each transition is published at most once, and `Closed`/`Cancelled` are
//! terminal: later transitions are dropped.

use async_trait::async_trait;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Socket connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Connection attempt in progress
    Connecting,
    /// Stream is ready for I/O
    Connected,
    /// Stream ended (peer closed, error, or local close)
    Closed,
    /// Stream was torn down by its owner before completing
    Cancelled,
}

impl SocketState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SocketState::Closed | SocketState::Cancelled)
    }
}

/// Socket errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SocketError {
    #[error("Socket not connected")]
    NotConnected,

    #[error("Socket closed")]
    Closed,

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Publisher side of a socket's state feed
#[derive(Debug, Clone)]
pub struct StateFeed {
    tx: Arc<watch::Sender<SocketState>>,
}

impl StateFeed {
    /// New feed starting in `Connecting`
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SocketState::Connecting);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a transition.
    ///
    /// Returns `false` when the transition was dropped because it repeats the
    /// current state or the feed is already terminal.
    pub fn transition(&self, next: SocketState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    pub fn current(&self) -> SocketState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SocketState> {
        self.tx.subscribe()
    }
}

impl Default for StateFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// One bidirectional stream through the tunnel
#[async_trait]
pub trait TunnelSocket: Send {
    /// Subscribe to state transitions; the receiver starts at the current state
    fn subscribe(&self) -> watch::Receiver<SocketState>;

    async fn write(&mut self, data: &[u8]) -> Result<(), SocketError>;

    /// Half-close the write side
    async fn write_close(&mut self) -> Result<(), SocketError>;

    /// Read at least `min` bytes and at most [`TunnelSocket::max_read`].
    ///
    /// Fewer than `min` bytes (possibly none) means the peer closed the stream.
    async fn read_at_least(&mut self, min: usize) -> Result<Vec<u8>, SocketError>;

    /// Upper bound on bytes returned by one read
    fn max_read(&self) -> usize;

    /// Close the stream; publishes `Closed`
    async fn close(&mut self);

    /// Abort the stream; publishes `Cancelled`
    async fn cancel(&mut self);
}

/// Opens sockets scoped to one host/port
pub trait TunnelSocketFactory: Send + Sync {
    fn open(&self, host: &str, port: u16, use_tls: bool) -> Box<dyn TunnelSocket>;
}

/// TCP socket configuration
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Bound on the TCP + TLS connect phase
    pub connect_timeout: Duration,
    /// Maximum bytes handed out by one read
    pub max_read: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_read: 8192,
        }
    }
}

trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

type BoxedStream = Box<dyn ByteStream>;

/// Factory for [`TcpTunnelSocket`]s.
///
/// Used directly when the process has an ordinary network stack, and as the
/// reference implementation for tunnel-provided factories.
pub struct TcpSocketFactory {
    config: SocketConfig,
    tls: Arc<ClientConfig>,
}

impl TcpSocketFactory {
    pub fn new(config: SocketConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            config,
            tls: Arc::new(tls),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SocketConfig::default())
    }
}

impl TunnelSocketFactory for TcpSocketFactory {
    fn open(&self, host: &str, port: u16, use_tls: bool) -> Box<dyn TunnelSocket> {
        Box::new(TcpTunnelSocket::open(
            host.to_string(),
            port,
            use_tls.then(|| self.tls.clone()),
            &self.config,
        ))
    }
}

/// TCP (optionally TLS) stream with a state feed.
///
/// `open` returns immediately; the connect runs on a background task and
/// hands the stream over once the feed reports `Connected`.
pub struct TcpTunnelSocket {
    feed: StateFeed,
    stream: Option<BoxedStream>,
    pending: Option<oneshot::Receiver<BoxedStream>>,
    connect_task: Option<JoinHandle<()>>,
    max_read: usize,
}

impl TcpTunnelSocket {
    fn open(host: String, port: u16, tls: Option<Arc<ClientConfig>>, config: &SocketConfig) -> Self {
        let feed = StateFeed::new();
        let (tx, rx) = oneshot::channel();
        let task_feed = feed.clone();
        let connect_timeout = config.connect_timeout;

        let connect_task = tokio::spawn(async move {
            debug!("Connecting to endpoint {}:{}", host, port);
            let result = tokio::time::timeout(connect_timeout, connect(&host, port, tls)).await;
            match result {
                Ok(Ok(stream)) => {
                    // Hand the stream over before announcing it
                    if tx.send(stream).is_ok() {
                        task_feed.transition(SocketState::Connected);
                    }
                }
                Ok(Err(e)) => {
                    warn!("Connect to {}:{} failed: {}", host, port, e);
                    task_feed.transition(SocketState::Closed);
                }
                Err(_) => {
                    warn!("Connect to {}:{} timed out", host, port);
                    task_feed.transition(SocketState::Closed);
                }
            }
        });

        Self {
            feed,
            stream: None,
            pending: Some(rx),
            connect_task: Some(connect_task),
            max_read: config.max_read,
        }
    }

    async fn stream(&mut self) -> Result<&mut BoxedStream, SocketError> {
        if self.feed.current().is_terminal() {
            return Err(SocketError::Closed);
        }
        if self.stream.is_none() {
            let rx = self.pending.take().ok_or(SocketError::NotConnected)?;
            let stream = rx.await.map_err(|_| SocketError::NotConnected)?;
            self.stream = Some(stream);
        }
        self.stream.as_mut().ok_or(SocketError::NotConnected)
    }

    fn teardown(&mut self, state: SocketState) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.pending = None;
        self.stream = None;
        self.feed.transition(state);
    }
}

async fn connect(host: &str, port: u16, tls: Option<Arc<ClientConfig>>) -> Result<BoxedStream, SocketError> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| SocketError::ConnectFailed(e.to_string()))?;
    tcp.set_nodelay(true).ok();

    let Some(tls) = tls else {
        return Ok(Box::new(tcp));
    };

    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| SocketError::Tls("Invalid server name".to_string()))?;
    let stream = TlsConnector::from(tls)
        .connect(server_name, tcp)
        .await
        .map_err(|e| SocketError::Tls(e.to_string()))?;
    Ok(Box::new(stream))
}

#[async_trait]
impl TunnelSocket for TcpTunnelSocket {
    fn subscribe(&self) -> watch::Receiver<SocketState> {
        self.feed.subscribe()
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SocketError> {
        let stream = self.stream().await?;
        stream.write_all(data).await.map_err(|e| SocketError::Io(e.to_string()))?;
        stream.flush().await.map_err(|e| SocketError::Io(e.to_string()))
    }

    async fn write_close(&mut self) -> Result<(), SocketError> {
        let stream = self.stream().await?;
        stream.shutdown().await.map_err(|e| SocketError::Io(e.to_string()))
    }

    async fn read_at_least(&mut self, min: usize) -> Result<Vec<u8>, SocketError> {
        let max = self.max_read;
        // One read never returns more than `max`, so stop there
        let min = min.min(max);
        let stream = self.stream().await?;
        let mut buf = vec![0u8; max];
        let mut filled = 0;

        while filled < min {
            let n = stream
                .read(&mut buf[filled..])
                .await
                .map_err(|e| SocketError::Io(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        buf.truncate(filled);
        if filled < min {
            self.feed.transition(SocketState::Closed);
        }
        Ok(buf)
    }

    fn max_read(&self) -> usize {
        self.max_read
    }

    async fn close(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.shutdown().await.ok();
        }
        self.teardown(SocketState::Closed);
    }

    async fn cancel(&mut self) {
        self.teardown(SocketState::Cancelled);
    }
}

impl Drop for TcpTunnelSocket {
    fn drop(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
    }
}
