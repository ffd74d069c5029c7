//! Tunneled HTTP Client
//!
//! Performs one request/response exchange over a [`TunnelSocket`]:
//!
//! 1. Open a socket scoped to the request's host, port and scheme
//! 2. Wait on the socket's state feed for `Connected`
//! 3. Write the framed request, then half-close the write side
//! 4. Read until the response is complete, end of stream, or the size cap
//! 5. Decode and store any `Set-Cookie` values
//!
//! The whole exchange races the request timeout and the caller's
//! cancellation token; exactly one outcome is ever returned.

use crate::cookies::CookieStore;
use crate::framing::{self, FramingError, TunnelRequest, TunnelResponse};
use crate::socket::{SocketError, SocketState, TunnelSocket, TunnelSocketFactory};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a request could not reach the server
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnreachableCause {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("no data received")]
    NoData,

    #[error("{0}")]
    Transport(String),
}

/// HTTP client errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Server unreachable: {0}")]
    Unreachable(UnreachableCause),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Malformed response: {0}")]
    MalformedResponse(#[from] FramingError),
}

impl HttpError {
    /// Transport-level failure that may succeed on retry
    pub fn is_unreachable(&self) -> bool {
        matches!(self, HttpError::Unreachable(_))
    }
}

impl From<SocketError> for HttpError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::Closed | SocketError::NotConnected => {
                HttpError::Unreachable(UnreachableCause::ConnectionAborted)
            }
            other => HttpError::Unreachable(UnreachableCause::Transport(other.to_string())),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Default request timeout
    pub timeout: Duration,
    /// Maximum accepted response size (head + body)
    pub max_response_size: usize,
    /// User-Agent string, added when the request carries none
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_response_size: 16 * 1024,
            user_agent: None,
        }
    }
}

/// Client statistics
#[derive(Debug, Default)]
pub struct ClientStats {
    pub requests_made: AtomicU64,
    pub requests_failed: AtomicU64,
    pub bytes_received: AtomicU64,
}

/// HTTP/1.1 client over tunnel sockets
pub struct TunneledHttpClient {
    factory: Arc<dyn TunnelSocketFactory>,
    cookies: Arc<CookieStore>,
    config: HttpClientConfig,
    stats: ClientStats,
}

impl TunneledHttpClient {
    pub fn new(
        factory: Arc<dyn TunnelSocketFactory>,
        cookies: Arc<CookieStore>,
        config: HttpClientConfig,
    ) -> Self {
        Self {
            factory,
            cookies,
            config,
            stats: ClientStats::default(),
        }
    }

    pub fn cookies(&self) -> &Arc<CookieStore> {
        &self.cookies
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Send with the configured default timeout
    pub async fn send(
        &self,
        request: TunnelRequest,
        cancel: &CancellationToken,
    ) -> Result<TunnelResponse, HttpError> {
        self.send_with_timeout(request, self.config.timeout, cancel).await
    }

    /// Perform one exchange.
    ///
    /// Resolves with `Unreachable(TimedOut)` exactly when `timeout` elapses if
    /// the exchange has not finished, and with `Cancelled` as soon as `cancel`
    /// fires. The socket is torn down on every path.
    pub async fn send_with_timeout(
        &self,
        mut request: TunnelRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TunnelResponse, HttpError> {
        self.stats.requests_made.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let (host, port, use_tls) = endpoint(&request)?;

        if let Some(cookie) = self.cookies.header_for(&request.url) {
            request.headers.set("Cookie", cookie);
        }
        if let Some(ua) = &self.config.user_agent {
            if !request.headers.contains("User-Agent") {
                request.headers.set("User-Agent", ua.clone());
            }
        }
        if !request.headers.contains("Connection") {
            request.headers.set("Connection", "close");
        }
        let data = framing::encode(&request)?;

        let mut socket = self.factory.open(&host, port, use_tls);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HttpError::Cancelled),
            result = tokio::time::timeout(timeout, self.exchange(socket.as_mut(), &data)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(HttpError::Unreachable(UnreachableCause::TimedOut(timeout))),
                }
            }
        };

        match &outcome {
            Ok(response) => {
                socket.close().await;
                self.cookies
                    .store_from_response(&request.url, response.headers.get_all("Set-Cookie"));
                debug!(
                    "HTTP {} {} -> {} ({} bytes, {:?})",
                    request.method,
                    request.url.path(),
                    response.status,
                    response.body_bytes().len(),
                    start.elapsed()
                );
            }
            Err(e) => {
                socket.cancel().await;
                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                warn!("HTTP {} {} failed: {}", request.method, request.url.path(), e);
            }
        }

        outcome
    }

    async fn exchange(
        &self,
        socket: &mut dyn TunnelSocket,
        data: &[u8],
    ) -> Result<TunnelResponse, HttpError> {
        let mut states = socket.subscribe();
        let state = match states.wait_for(|s| *s != SocketState::Connecting).await {
            Ok(state) => *state,
            Err(_) => SocketState::Closed,
        };
        match state {
            SocketState::Connected => {}
            SocketState::Cancelled => return Err(HttpError::Cancelled),
            SocketState::Closed | SocketState::Connecting => {
                return Err(HttpError::Unreachable(UnreachableCause::ConnectionAborted));
            }
        }

        socket.write(data).await?;
        socket.write_close().await?;

        let max = self.config.max_response_size;
        let mut buf = Vec::with_capacity(socket.max_read().min(max));
        loop {
            let chunk = socket.read_at_least(1).await?;
            if chunk.is_empty() {
                break;
            }
            buf.extend_from_slice(&chunk);
            if buf.len() > max {
                return Err(FramingError::TooLarge(max).into());
            }
            if framing::is_complete(&buf) {
                break;
            }
        }

        if buf.is_empty() {
            return Err(HttpError::Unreachable(UnreachableCause::NoData));
        }

        self.stats.bytes_received.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(framing::decode(&buf)?)
    }

    /// Get client statistics (made, failed, bytes received)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.requests_made.load(Ordering::Relaxed),
            self.stats.requests_failed.load(Ordering::Relaxed),
            self.stats.bytes_received.load(Ordering::Relaxed),
        )
    }
}

fn endpoint(request: &TunnelRequest) -> Result<(String, u16, bool), HttpError> {
    let host = request
        .url
        .host_str()
        .ok_or_else(|| HttpError::InvalidRequest("No host in URL".to_string()))?
        .to_string();

    let use_tls = match request.url.scheme() {
        "https" => true,
        "http" => false,
        other => return Err(HttpError::InvalidRequest(format!("Unsupported scheme {}", other))),
    };

    let port = request
        .url
        .port_or_known_default()
        .ok_or_else(|| HttpError::InvalidRequest("No port for URL".to_string()))?;

    Ok((host, port, use_tls))
}
