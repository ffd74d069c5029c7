//! Shield Network Layer
//!
//! HTTP over a tunnel socket, for processes whose only network access is the
//! VPN tunnel itself.
//!
//! Architecture:
//! 1. [`framing`] turns requests into bytes and bytes into responses
//! 2. [`socket`] provides byte streams with an observable state feed
//! 3. [`client`] runs one exchange per socket under a timeout and a
//!    cancellation token
//! 4. [`cookies`] carries session cookies across exchanges

pub mod client;
pub mod cookies;
pub mod framing;
pub mod socket;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::{HttpClientConfig, HttpError, TunneledHttpClient, UnreachableCause};
pub use cookies::{Cookie, CookieStore};
pub use framing::{FramingError, HeaderList, Method, TunnelRequest, TunnelResponse};
pub use socket::{
    SocketConfig, SocketError, SocketState, StateFeed, TcpSocketFactory, TcpTunnelSocket,
    TunnelSocket, TunnelSocketFactory,
};
