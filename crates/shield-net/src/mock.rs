//! In-memory tunnel sockets for tests.
//!
//! A [`MockTunnelFactory`] hands out sockets that never touch the network.
//! Each socket collects what is written to it and, once the write side is
//! half-closed, asks the factory's handler for the response bytes.

use crate::framing::HeaderList;
use crate::socket::{SocketError, SocketState, StateFeed, TunnelSocket, TunnelSocketFactory};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

type Handler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// How sockets from a [`MockTunnelFactory`] behave
#[derive(Clone)]
pub enum MockBehavior {
    /// Connect immediately and answer each request via the handler
    Respond(Handler),
    /// Stay in `Connecting` forever
    NeverConnect,
    /// Report `Closed` before ever connecting
    Disconnect,
}

/// One call to [`TunnelSocketFactory::open`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRecord {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// A request as written to a mock socket
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct Recorder {
    opens: Vec<OpenRecord>,
    requests: Vec<Vec<u8>>,
    feeds: Vec<StateFeed>,
}

/// Socket factory backed by a closure
pub struct MockTunnelFactory {
    behavior: MockBehavior,
    recorder: Arc<Mutex<Recorder>>,
}

impl MockTunnelFactory {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            recorder: Arc::new(Mutex::new(Recorder::default())),
        }
    }

    /// Answer every request with the same bytes
    pub fn responding(response: Vec<u8>) -> Self {
        Self::new(MockBehavior::Respond(Arc::new(move |_| response.clone())))
    }

    /// Answer each request with `handler(request_bytes)`
    pub fn with_handler(handler: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) -> Self {
        Self::new(MockBehavior::Respond(Arc::new(handler)))
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        self.recorder.lock().unwrap().opens.clone()
    }

    /// Raw bytes of every completed request, in order
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.recorder.lock().unwrap().requests.clone()
    }

    /// Parsed form of every completed request
    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests().iter().filter_map(|r| parse_request(r)).collect()
    }

    /// State of the most recently opened socket
    pub fn last_state(&self) -> Option<SocketState> {
        self.recorder.lock().unwrap().feeds.last().map(StateFeed::current)
    }
}

impl TunnelSocketFactory for MockTunnelFactory {
    fn open(&self, host: &str, port: u16, use_tls: bool) -> Box<dyn TunnelSocket> {
        let feed = StateFeed::new();
        let handler = match &self.behavior {
            MockBehavior::Respond(handler) => {
                feed.transition(SocketState::Connected);
                Some(handler.clone())
            }
            MockBehavior::NeverConnect => None,
            MockBehavior::Disconnect => {
                feed.transition(SocketState::Closed);
                None
            }
        };

        let mut recorder = self.recorder.lock().unwrap();
        recorder.opens.push(OpenRecord {
            host: host.to_string(),
            port,
            use_tls,
        });
        recorder.feeds.push(feed.clone());

        Box::new(MockSocket {
            feed,
            handler,
            recorder: self.recorder.clone(),
            written: Vec::new(),
            response: Vec::new(),
            max_read: 8192,
        })
    }
}

struct MockSocket {
    feed: StateFeed,
    handler: Option<Handler>,
    recorder: Arc<Mutex<Recorder>>,
    written: Vec<u8>,
    response: Vec<u8>,
    max_read: usize,
}

impl MockSocket {
    fn check_connected(&self) -> Result<(), SocketError> {
        match self.feed.current() {
            SocketState::Connected => Ok(()),
            SocketState::Connecting => Err(SocketError::NotConnected),
            _ => Err(SocketError::Closed),
        }
    }
}

#[async_trait]
impl TunnelSocket for MockSocket {
    fn subscribe(&self) -> watch::Receiver<SocketState> {
        self.feed.subscribe()
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SocketError> {
        self.check_connected()?;
        self.written.extend_from_slice(data);
        Ok(())
    }

    async fn write_close(&mut self) -> Result<(), SocketError> {
        self.check_connected()?;
        let handler = self.handler.as_ref().ok_or(SocketError::NotConnected)?;
        self.response = handler(&self.written);
        self.recorder.lock().unwrap().requests.push(self.written.clone());
        Ok(())
    }

    async fn read_at_least(&mut self, min: usize) -> Result<Vec<u8>, SocketError> {
        self.check_connected()?;
        let n = self.response.len().min(self.max_read);
        let chunk: Vec<u8> = self.response.drain(..n).collect();
        if chunk.len() < min {
            self.feed.transition(SocketState::Closed);
        }
        Ok(chunk)
    }

    fn max_read(&self) -> usize {
        self.max_read
    }

    async fn close(&mut self) {
        self.feed.transition(SocketState::Closed);
    }

    async fn cancel(&mut self) {
        self.feed.transition(SocketState::Cancelled);
    }
}

/// Build a raw HTTP/1.1 response with a `Content-Length`
pub fn http_response(status: u16, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {} {}\r\n", status, reason(status)).into_bytes();
    for (name, value) in headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

/// Method and target from a raw request
pub fn request_line(raw: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(raw).ok()?;
    let line = text.split("\r\n").next()?;
    let mut parts = line.split(' ');
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    Some((method, target))
}

/// Parse a raw request as written by the client
pub fn parse_request(raw: &[u8]) -> Option<RecordedRequest> {
    let (method, target) = request_line(raw)?;
    let sep = raw.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&raw[..sep]).ok()?;

    let mut headers = HeaderList::new();
    for line in head.split("\r\n").skip(1) {
        let (name, value) = line.split_once(':')?;
        headers.append(name.trim(), value.trim());
    }

    Some(RecordedRequest {
        method,
        target,
        headers,
        body: raw[sep + 4..].to_vec(),
    })
}
