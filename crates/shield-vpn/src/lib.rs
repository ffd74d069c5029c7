//! Shield VPN - Session Establishment & Certificate Renewal
//!
//! Takes a server id and brings up a certified VPN session: picks the best
//! reachable protocol, hands it to the data plane, then obtains a client
//! certificate through the tunnel and keeps it fresh.
//!
//! # Architecture
//!
//! ```text
//! SessionManager
//!   |-- ServerDirectory ............ server + candidate lookup
//!   |-- ProtocolAvailabilityResolver  concurrent probes, priority choice
//!   |-- DataPlane .................. tunnel up/down, certificate install
//!   `-- CertificateRefreshManager
//!         `-- CredentialRefresher .. 401 -> re-auth -> retry once
//!               `-- ApiClient ...... JSON over shield-net sockets
//! ```
//!
//! Control-plane HTTP goes through [`shield_net::TunneledHttpClient`], so
//! API calls made after the tunnel is up travel inside it.

mod api;
mod certificate;
mod config;
mod credentials;
mod dataplane;
mod directory;
pub(crate) mod epoch;
mod keys;
mod probe;
mod protocol;
mod refresh_manager;
mod refresher;
mod resolver;
mod session;
mod watchdog;

pub use api::{
    ApiClient, ApiError, CertificateRequest, CertificateResponse, ClientConfig, SessionRefreshResponse,
    TokenResponse,
};
pub use certificate::{Certificate, CertificateFeatures};
pub use config::{ApiConfig, ConfigError, EndpointPaths, SessionConfig, SessionSettings, SmartProtocolConfig};
pub use credentials::{
    CredentialStore, CredentialVault, Credentials, FileCredentialStore, MemoryCredentialStore, StoreError,
};
pub use dataplane::{DataPlane, DataPlaneError, DataPlaneEvent, DirectDataPlane};
pub use directory::{ServerDirectory, StaticDirectory};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use probe::{NetworkProber, Prober};
pub use protocol::{
    AvailabilityResult, PortOverride, PortTable, ProtocolCandidate, ProtocolChoice, ProtocolError, ProtocolFlags,
    ServerDescriptor, ServerStatus, Transport, VpnProtocol, default_port_table,
};
pub use refresh_manager::{CertificateRefreshManager, RefreshIntervals};
pub use refresher::{CertificateSettings, CredentialRefresher, RefreshError};
pub use resolver::{CandidateResult, ProtocolAvailabilityResolver, choose};
pub use session::{Collaborators, ConnectionAttempt, FailureReason, SessionManager, SessionState};
pub use watchdog::ProgressWatchdog;
