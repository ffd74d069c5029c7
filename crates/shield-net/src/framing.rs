//! HTTP/1.1 Wire Framing
//!
//! Encodes requests to bytes and decodes responses from bytes without any
//! socket knowledge. The tunnel only gives us a raw byte stream, so this is
//! the whole HTTP stack as far as the control plane is concerned.
//!
//! # Conventions
//!
//! - Lines end in `\r\n`; the head and body are separated by `\r\n\r\n`
//! - Header lines are split on the *first* colon only
//! - Repeated list-valued headers (`Set-Cookie`, ...) are kept as a sequence
//!   and read back merged with `", "`
//! - A response without the blank-line separator has no body; one with the
//!   separator and nothing after it has an empty body

use std::fmt;
use url::Url;

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Separator used when reading a repeated list-valued header as one value
pub const MULTI_VALUE_SEPARATOR: &str = ", ";

/// Headers whose repeated occurrences form a list rather than overriding
/// each other.
const LIST_VALUED: &[&str] = &["set-cookie", "vary", "via", "warning", "allow", "cache-control"];

/// Framing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("Truncated status line")]
    TruncatedStatusLine,

    #[error("Malformed status line: {0}")]
    MalformedStatusLine(String),

    #[error("Invalid status code: {0}")]
    InvalidStatusCode(String),

    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Response head is not valid UTF-8")]
    InvalidEncoding,

    #[error("Header {0} contains a line break")]
    HeaderInjection(String),

    #[error("Response exceeds {0} bytes")]
    TooLarge(usize),
}

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order-preserving, multi-valued header list.
///
/// Lookups are case-insensitive. Nothing is ever collapsed on insert, so a
/// response carrying five `Set-Cookie` lines keeps all five.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing entries with the same name
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every entry named `name` with a single value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Remove every entry named `name`
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// All values for `name`, in wire order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Read a header as a single value.
    ///
    /// List-valued headers are joined with [`MULTI_VALUE_SEPARATOR`]; for
    /// anything else the last occurrence wins.
    pub fn get(&self, name: &str) -> Option<String> {
        if is_list_valued(name) {
            let values: Vec<&str> = self.get_all(name).collect();
            if values.is_empty() {
                None
            } else {
                Some(values.join(MULTI_VALUE_SEPARATOR))
            }
        } else {
            self.get_all(name).last().map(str::to_string)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_list_valued(name: &str) -> bool {
    LIST_VALUED.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// A request to be framed over the tunnel
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderList,
    pub body: Option<Vec<u8>>,
}

impl TunnelRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderList::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: Url, body: Vec<u8>) -> Self {
        Self::new(Method::Post, url).with_body(body)
    }

    /// Set a header, replacing previous values
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Request target as it appears on the request line
    pub fn target(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        }
    }
}

/// A decoded response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelResponse {
    /// Protocol version from the status line (e.g. `HTTP/1.1`)
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderList,
    /// `None` when the response carried no head/body separator at all
    pub body: Option<Vec<u8>>,
}

impl TunnelResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name)
    }

    /// Body bytes, empty when there is no body
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_deref().unwrap_or(&[])
    }
}

/// Encode a request to HTTP/1.1 bytes.
///
/// `Host` comes from the URL; caller-supplied `Host` and `Content-Length`
/// entries are ignored since both are derived here. Caller headers go out in
/// insertion order.
pub fn encode(request: &TunnelRequest) -> Result<Vec<u8>, FramingError> {
    let mut out = Vec::with_capacity(256 + request.body.as_ref().map_or(0, Vec::len));

    out.extend_from_slice(
        format!("{} {} HTTP/1.1\r\n", request.method, request.target()).as_bytes(),
    );

    if let Some(host) = request.url.host_str() {
        match request.url.port() {
            Some(port) => out.extend_from_slice(format!("Host: {}:{}\r\n", host, port).as_bytes()),
            None => out.extend_from_slice(format!("Host: {}\r\n", host).as_bytes()),
        }
    }

    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if has_line_break(name) || has_line_break(value) {
            return Err(FramingError::HeaderInjection(name.to_string()));
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }

    match &request.body {
        Some(body) => {
            out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
            out.extend_from_slice(body);
        }
        None => out.extend_from_slice(CRLF),
    }

    Ok(out)
}

fn has_line_break(s: &str) -> bool {
    s.contains('\r') || s.contains('\n')
}

/// Decode a complete response buffer
pub fn decode(data: &[u8]) -> Result<TunnelResponse, FramingError> {
    let status_end = find(data, CRLF, 0).ok_or(FramingError::TruncatedStatusLine)?;
    let status_line =
        std::str::from_utf8(&data[..status_end]).map_err(|_| FramingError::InvalidEncoding)?;
    let (version, status, reason) = parse_status_line(status_line)?;

    // The separator may start right at the status line's own CRLF when there
    // are no headers at all.
    let (head, body) = match find(data, HEAD_END, status_end) {
        Some(sep) => {
            let head = if sep > status_end { &data[status_end + 2..sep] } else { &[][..] };
            (head, Some(data[sep + HEAD_END.len()..].to_vec()))
        }
        None => (&data[status_end + 2..], None),
    };

    let head = std::str::from_utf8(head).map_err(|_| FramingError::InvalidEncoding)?;
    let mut headers = HeaderList::new();
    for line in head.split("\r\n").filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FramingError::MalformedHeader(line.to_string()))?;
        let name = name.trim();
        if name.is_empty() || name.contains(' ') {
            return Err(FramingError::MalformedHeader(line.to_string()));
        }
        headers.append(name, value.trim());
    }

    Ok(TunnelResponse {
        version,
        status,
        reason,
        headers,
        body,
    })
}

fn parse_status_line(line: &str) -> Result<(String, u16, String), FramingError> {
    let (version, rest) = line
        .split_once(' ')
        .ok_or_else(|| FramingError::MalformedStatusLine(line.to_string()))?;
    if !version.starts_with("HTTP/") {
        return Err(FramingError::MalformedStatusLine(line.to_string()));
    }

    let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FramingError::InvalidStatusCode(code.to_string()));
    }
    let status: u16 = code
        .parse()
        .map_err(|_| FramingError::InvalidStatusCode(code.to_string()))?;
    if status < 100 {
        return Err(FramingError::InvalidStatusCode(code.to_string()));
    }

    Ok((version.to_string(), status, reason.trim().to_string()))
}

/// Whether a partially read buffer already holds the whole response.
///
/// Only answers `true` when the head is complete and a `Content-Length` says
/// the body is too. Without a length the caller has to read to end of stream.
pub fn is_complete(data: &[u8]) -> bool {
    let Some(sep) = find(data, HEAD_END, 0) else {
        return false;
    };
    let Ok(head) = std::str::from_utf8(&data[..sep]) else {
        return false;
    };
    let length = head.split("\r\n").skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    });
    match length {
        Some(len) => data.len() - (sep + HEAD_END.len()) >= len,
        None => false,
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
