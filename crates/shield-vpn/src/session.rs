//! Session State Machine
//!
//! Drives one connection attempt at a time from server selection to a
//! connected, certified tunnel, and keeps it that way until cancelled.
//!
//! # States
//!
//! ```text
//! Idle -> Resolving -> Establishing -> Authenticating -> Connected
//!            |              |                |              |
//!            +--------------+----------------+--------------+--> Failed(reason)
//!
//! any state --cancel--> Disconnecting -> Idle
//! ```
//!
//! A new `connect` supersedes the running attempt: the old attempt is
//! cancelled and torn down before the new one publishes anything. A
//! progress watchdog covers `Establishing` and `Authenticating`.
//!
//! Once the tunnel is up, data plane events fail the attempt in any state.
//! While connected, every renewed certificate is handed to the data plane,
//! and the session fails rather than keep a certificate past its expiry.

use crate::api::ApiClient;
use crate::certificate::{Certificate, CertificateFeatures};
use crate::config::SessionConfig;
use crate::credentials::{CredentialStore, CredentialVault};
use crate::dataplane::{DataPlane, DataPlaneEvent};
use crate::directory::ServerDirectory;
use crate::keys::KeyPair;
use crate::probe::Prober;
use crate::protocol::ProtocolChoice;
use crate::refresh_manager::{CertificateRefreshManager, RefreshIntervals};
use crate::refresher::{CertificateSettings, CredentialRefresher, RefreshError};
use crate::resolver::ProtocolAvailabilityResolver;
use crate::watchdog::ProgressWatchdog;
use shield_net::CookieStore;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why an attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No stored credentials; the user has to log in
    NoCredentials,
    /// Credentials rejected even after re-authentication
    Unauthenticated,
    /// API or tunnel unreachable
    Unreachable,
    MalformedResponse,
    /// No candidate protocol answered
    NoProtocolAvailable,
    /// The watchdog saw no progress
    StuckConnection,
    /// Server under maintenance
    ServerUnavailable,
    UnknownServer,
    /// Tunnel setup or certificate installation failed
    DataPlane(String),
    /// The API asked us to slow down
    RateLimited,
    /// The API refused the request with this status
    ApiRejected(u16),
    /// No renewed certificate arrived before the current one expired
    CertificateExpired,
    Internal(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoCredentials => write!(f, "no credentials"),
            FailureReason::Unauthenticated => write!(f, "unauthenticated"),
            FailureReason::Unreachable => write!(f, "unreachable"),
            FailureReason::MalformedResponse => write!(f, "malformed response"),
            FailureReason::NoProtocolAvailable => write!(f, "no protocol available"),
            FailureReason::StuckConnection => write!(f, "stuck connection"),
            FailureReason::ServerUnavailable => write!(f, "server unavailable"),
            FailureReason::UnknownServer => write!(f, "unknown server"),
            FailureReason::DataPlane(msg) => write!(f, "data plane: {}", msg),
            FailureReason::RateLimited => write!(f, "rate limited"),
            FailureReason::ApiRejected(status) => write!(f, "rejected with status {}", status),
            FailureReason::CertificateExpired => write!(f, "certificate expired"),
            FailureReason::Internal(msg) => write!(f, "internal: {}", msg),
        }
    }
}

impl From<RefreshError> for FailureReason {
    fn from(e: RefreshError) -> Self {
        match e {
            RefreshError::NoCredentials => FailureReason::NoCredentials,
            RefreshError::Unauthenticated | RefreshError::AuthRefreshFailed(_) => FailureReason::Unauthenticated,
            RefreshError::Unreachable(_) => FailureReason::Unreachable,
            RefreshError::MalformedResponse(_) => FailureReason::MalformedResponse,
            RefreshError::TooManyRequests { .. } => FailureReason::RateLimited,
            RefreshError::UnexpectedStatus { status, .. } => FailureReason::ApiRejected(status),
            other => FailureReason::Internal(other.to_string()),
        }
    }
}

/// Session state as published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Resolving,
    Establishing,
    Authenticating,
    Connected,
    Failed(FailureReason),
    Disconnecting,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }

    /// No attempt is making progress in this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Resolving => write!(f, "resolving"),
            SessionState::Establishing => write!(f, "establishing"),
            SessionState::Authenticating => write!(f, "authenticating"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Failed(reason) => write!(f, "failed ({})", reason),
            SessionState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Bookkeeping for the current attempt
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub server_id: String,
    pub choice: Option<ProtocolChoice>,
    pub started_at: Instant,
    /// Certificate requests retried after transport failures
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// Everything the session drives but does not own
pub struct Collaborators {
    pub directory: Arc<dyn ServerDirectory>,
    pub prober: Arc<dyn Prober>,
    pub data_plane: Arc<dyn DataPlane>,
    pub credentials: Arc<dyn CredentialStore>,
}

struct ActiveAttempt {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: SessionConfig,
    directory: Arc<dyn ServerDirectory>,
    resolver: ProtocolAvailabilityResolver,
    data_plane: Arc<dyn DataPlane>,
    vault: Arc<CredentialVault>,
    cookies: Arc<CookieStore>,
    keys: KeyPair,
    features: RwLock<CertificateFeatures>,
    state: watch::Sender<SessionState>,
    transitions: broadcast::Sender<SessionState>,
    certificates: RwLock<Option<Arc<CertificateRefreshManager>>>,
    attempt: RwLock<Option<ConnectionAttempt>>,
}

/// VPN session controller
pub struct SessionManager {
    inner: Arc<Inner>,
    active: Mutex<Option<ActiveAttempt>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, collaborators: Collaborators, keys: KeyPair) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (transitions, _) = broadcast::channel(64);
        let resolver = ProtocolAvailabilityResolver::new(collaborators.prober, config.smart_protocol.probe_timeout());

        let inner = Inner {
            directory: collaborators.directory,
            resolver,
            data_plane: collaborators.data_plane,
            vault: Arc::new(CredentialVault::new(collaborators.credentials)),
            cookies: Arc::new(CookieStore::new()),
            keys,
            features: RwLock::new(CertificateFeatures::default()),
            state,
            transitions,
            certificates: RwLock::new(None),
            attempt: RwLock::new(None),
            config,
        };

        Self {
            inner: Arc::new(inner),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Latest state; intermediate states may be skipped by slow readers
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Every transition, in order
    pub fn transitions(&self) -> broadcast::Receiver<SessionState> {
        self.inner.transitions.subscribe()
    }

    /// Features requested with the next certificate
    pub fn set_features(&self, features: CertificateFeatures) {
        *write(&self.inner.features) = features;
    }

    pub fn features(&self) -> CertificateFeatures {
        read(&self.inner.features).clone()
    }

    /// The certificate in use, if one is valid
    pub fn current_certificate(&self) -> Option<Certificate> {
        read(&self.inner.certificates).as_ref().and_then(|m| m.current())
    }

    pub fn attempt(&self) -> Option<ConnectionAttempt> {
        read(&self.inner.attempt).clone()
    }

    /// Start connecting to `server_id`, superseding any running attempt
    pub async fn connect(&self, server_id: &str) -> watch::Receiver<SessionState> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!("Superseding previous connection attempt");
            self.inner.teardown(previous).await;
        }

        info!("Connecting to {}", server_id);
        *write(&self.inner.attempt) = Some(ConnectionAttempt {
            server_id: server_id.to_string(),
            choice: None,
            started_at: Instant::now(),
            retry_count: 0,
            last_error: None,
        });

        let receiver = self.inner.state.subscribe();
        let cancel = CancellationToken::new();
        self.inner.publish(&cancel, SessionState::Resolving);

        let task = tokio::spawn(self.inner.clone().run(server_id.to_string(), cancel.clone()));
        *active = Some(ActiveAttempt { cancel, task });
        receiver
    }

    /// Stop whatever is running and return to `Idle`. Safe to call repeatedly.
    pub async fn cancel(&self) {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(attempt) => {
                self.inner.announce(SessionState::Disconnecting);
                self.inner.teardown(attempt).await;
                self.inner.announce(SessionState::Idle);
                info!("Session cancelled");
            }
            None => {
                if self.state() != SessionState::Idle {
                    self.inner.announce(SessionState::Idle);
                }
            }
        }
    }
}

impl Inner {
    /// Publish unless the attempt was cancelled meanwhile
    fn publish(&self, cancel: &CancellationToken, state: SessionState) {
        let published = self.state.send_if_modified(|current| {
            if cancel.is_cancelled() || *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        if published {
            debug!("Session state: {}", state);
            let _ = self.transitions.send(state);
        }
    }

    /// Publish on behalf of the controller
    fn announce(&self, state: SessionState) {
        if self.state.send_replace(state.clone()) != state {
            debug!("Session state: {}", state);
            let _ = self.transitions.send(state);
        }
    }

    async fn teardown(&self, attempt: ActiveAttempt) {
        attempt.cancel.cancel();
        if let Err(e) = attempt.task.await {
            if e.is_panic() {
                error!("Connection attempt panicked: {}", e);
            }
        }
        self.data_plane.stop().await;
        *write(&self.certificates) = None;
    }

    fn note_error(&self, error: &str) {
        if let Some(attempt) = write(&self.attempt).as_mut() {
            attempt.last_error = Some(error.to_string());
        }
    }

    async fn run(self: Arc<Self>, server_id: String, cancel: CancellationToken) {
        let reason = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            reason = self.drive(&server_id, &cancel) => reason,
        };

        warn!("Connection to {} failed: {}", server_id, reason);
        self.note_error(&reason.to_string());
        self.data_plane.stop().await;
        *write(&self.certificates) = None;
        self.publish(&cancel, SessionState::Failed(reason));
    }

    /// Run the attempt; only returns when it fails
    async fn drive(&self, server_id: &str, cancel: &CancellationToken) -> FailureReason {
        // Resolving
        let Some(server) = self.directory.server(server_id).await else {
            return FailureReason::UnknownServer;
        };
        if server.is_under_maintenance() {
            return FailureReason::ServerUnavailable;
        }

        let candidates = self.directory.candidates(&server).await;
        let choice = match self
            .resolver
            .resolve_best(&server, &candidates, &self.config.smart_protocol.priority)
            .await
        {
            Some(choice) => choice,
            None => return FailureReason::NoProtocolAvailable,
        };
        if let Some(attempt) = write(&self.attempt).as_mut() {
            attempt.choice = Some(choice.clone());
        }

        // Establishing
        self.publish(cancel, SessionState::Establishing);
        let watchdog = ProgressWatchdog::new(self.config.session.watchdog_deadline());

        let factory = tokio::select! {
            _ = watchdog.expired() => return FailureReason::StuckConnection,
            established = self.data_plane.establish(&server, &choice, &self.keys) => match established {
                Ok(factory) => factory,
                Err(e) => return FailureReason::DataPlane(e.to_string()),
            },
        };
        watchdog.record("tunnel up");
        let mut events = self.data_plane.subscribe();

        // Authenticating
        self.publish(cancel, SessionState::Authenticating);
        let api = Arc::new(ApiClient::new(factory, self.cookies.clone(), self.config.api.clone()));
        let refresher = CredentialRefresher::new(
            api,
            self.vault.clone(),
            CertificateSettings {
                device_name: self.config.session.device_name.clone(),
                duration: self.config.session.certificate_duration.clone(),
            },
        );
        let manager = Arc::new(CertificateRefreshManager::new(
            refresher,
            self.keys.clone(),
            RefreshIntervals {
                check_interval: self.config.session.refresh_check_interval(),
                refresh_earlier_by: self.config.session.refresh_earlier_by(),
                ..RefreshIntervals::default()
            },
        ));
        let features = read(&self.features).clone();

        let certificate = tokio::select! {
            _ = watchdog.expired() => return FailureReason::StuckConnection,
            reason = tunnel_failure(&mut events) => return reason,
            result = self.authenticate(&manager, &features, &watchdog, cancel) => match result {
                Ok(certificate) => certificate,
                Err(reason) => return reason,
            },
        };

        if let Err(e) = self.data_plane.install_certificate(&certificate).await {
            return FailureReason::DataPlane(e.to_string());
        }
        *write(&self.certificates) = Some(manager.clone());

        // Connected
        let mut renewed = manager.subscribe();
        let refresh_cancel = cancel.child_token();
        let _stop_refresh = refresh_cancel.clone().drop_guard();
        let mut refresh_task = manager.spawn_periodic(features, refresh_cancel);
        let mut expires_at = expiry_deadline(&certificate);

        self.publish(cancel, SessionState::Connected);
        info!(
            "Connected to {} via {} on {}:{}",
            server.id, choice.protocol, choice.ip, choice.port
        );

        loop {
            tokio::select! {
                reason = tunnel_failure(&mut events) => return reason,
                changed = renewed.changed() => {
                    if changed.is_err() {
                        return FailureReason::Internal("certificate feed closed".to_string());
                    }
                    let Some(certificate) = renewed.borrow_and_update().clone() else {
                        continue;
                    };
                    if let Err(e) = self.data_plane.install_certificate(&certificate).await {
                        return FailureReason::DataPlane(e.to_string());
                    }
                    expires_at = expiry_deadline(&certificate);
                    info!(
                        "Installed renewed certificate, valid for {:?}",
                        certificate.remaining(SystemTime::now())
                    );
                }
                _ = tokio::time::sleep_until(expires_at) => {
                    warn!("Certificate expired before a renewal arrived");
                    return FailureReason::CertificateExpired;
                }
                stopped = &mut refresh_task => {
                    return match stopped {
                        Ok(Err(e)) => e.into(),
                        Ok(Ok(())) => FailureReason::Internal("certificate refresh stopped".to_string()),
                        Err(e) => FailureReason::Internal(e.to_string()),
                    };
                }
            }
        }
    }

    /// Request the session certificate, retrying transport failures with
    /// backoff up to the configured attempt count
    async fn authenticate(
        &self,
        manager: &CertificateRefreshManager,
        features: &CertificateFeatures,
        watchdog: &ProgressWatchdog,
        cancel: &CancellationToken,
    ) -> Result<Certificate, FailureReason> {
        let max_attempts = self.config.session.max_auth_attempts.max(1);
        let mut attempt = 1;

        loop {
            match manager.refresh(features, cancel).await {
                Ok(certificate) => {
                    watchdog.record("certificate issued");
                    return Ok(certificate);
                }
                Err(e) if e.is_unreachable() && attempt < max_attempts => {
                    let delay = self.config.session.backoff(attempt);
                    warn!(
                        "Certificate request failed ({}), retry {}/{} in {:?}",
                        e,
                        attempt,
                        max_attempts - 1,
                        delay
                    );
                    self.note_error(&e.to_string());
                    if let Some(current) = write(&self.attempt).as_mut() {
                        current.retry_count = attempt;
                    }
                    watchdog.record("retrying certificate request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.note_error(&e.to_string());
                    return Err(e.into());
                }
            }
        }
    }
}

/// Resolves once the data plane reports the tunnel unusable
async fn tunnel_failure(events: &mut broadcast::Receiver<DataPlaneEvent>) -> FailureReason {
    loop {
        match events.recv().await {
            Ok(DataPlaneEvent::TunnelDown(why)) => {
                warn!("Tunnel down: {}", why);
                return FailureReason::Unreachable;
            }
            Ok(DataPlaneEvent::Maintenance) => {
                warn!("Server entered maintenance");
                return FailureReason::ServerUnavailable;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} data plane events", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Data plane event feed closed");
                return std::future::pending().await;
            }
        }
    }
}

/// When `certificate` stops being usable, on the runtime clock
fn expiry_deadline(certificate: &Certificate) -> tokio::time::Instant {
    tokio::time::Instant::now() + certificate.remaining(SystemTime::now())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credentials, MemoryCredentialStore};
    use crate::dataplane::{DataPlaneError, DirectDataPlane};
    use crate::directory::StaticDirectory;
    use crate::protocol::{ServerDescriptor, ServerStatus, VpnProtocol, default_port_table};
    use async_trait::async_trait;
    use shield_net::mock::{MockBehavior, MockTunnelFactory, http_response};
    use shield_net::{TunnelSocket, TunnelSocketFactory};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    /// Answers for the listed protocols, immediately
    struct FixedProber(Vec<VpnProtocol>);

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, _server: &ServerDescriptor, protocol: VpnProtocol, _ip: IpAddr, _port: u16) -> bool {
            self.0.contains(&protocol)
        }
    }

    /// Never finishes bringing the tunnel up
    struct StuckDataPlane {
        events: broadcast::Sender<DataPlaneEvent>,
    }

    #[async_trait]
    impl DataPlane for StuckDataPlane {
        async fn establish(
            &self,
            _server: &ServerDescriptor,
            _choice: &ProtocolChoice,
            _keys: &KeyPair,
        ) -> Result<Arc<dyn TunnelSocketFactory>, DataPlaneError> {
            std::future::pending().await
        }

        async fn install_certificate(&self, _certificate: &Certificate) -> Result<(), DataPlaneError> {
            Ok(())
        }

        async fn stop(&self) {}

        fn subscribe(&self) -> broadcast::Receiver<DataPlaneEvent> {
            self.events.subscribe()
        }
    }

    /// Drops the first `failures` connections, then answers
    struct FlakyFactory {
        failing: MockTunnelFactory,
        working: MockTunnelFactory,
        failures: AtomicUsize,
    }

    impl TunnelSocketFactory for FlakyFactory {
        fn open(&self, host: &str, port: u16, use_tls: bool) -> Box<dyn TunnelSocket> {
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                self.failing.open(host, port, use_tls)
            } else {
                self.working.open(host, port, use_tls)
            }
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            session_id: "uid".to_string(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expiration: UNIX_EPOCH + Duration::from_secs(4_000_000_000),
            scopes: vec!["vpn".to_string()],
        }
    }

    fn cert_response() -> Vec<u8> {
        let later = crate::epoch::to_secs(SystemTime::now()) + 24 * 3600;
        let body = format!(
            r#"{{"Certificate":"PEM","ExpirationTime":{},"RefreshTime":{}}}"#,
            later, later
        );
        http_response(200, &[], body.as_bytes())
    }

    fn servers() -> Vec<ServerDescriptor> {
        let mut down = ServerDescriptor::new("NL#2", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        down.status = ServerStatus::Maintenance;
        vec![ServerDescriptor::new("NL#1", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))), down]
    }

    fn session(
        data_plane: Arc<dyn DataPlane>,
        prober: FixedProber,
        store: MemoryCredentialStore,
    ) -> SessionManager {
        let config = SessionConfig::default();
        let directory = StaticDirectory::new(servers(), default_port_table(), Default::default());
        SessionManager::new(
            config,
            Collaborators {
                directory: Arc::new(directory),
                prober: Arc::new(prober),
                data_plane,
                credentials: Arc::new(store),
            },
            KeyPair::generate(),
        )
    }

    fn direct(factory: impl TunnelSocketFactory + 'static) -> Arc<DirectDataPlane> {
        Arc::new(DirectDataPlane::new(Arc::new(factory)))
    }

    async fn settled(rx: &mut watch::Receiver<SessionState>) -> SessionState {
        rx.wait_for(|s| s.is_terminal() || s.is_connected())
            .await
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn test_connects_and_publishes_every_step() {
        let data_plane = direct(MockTunnelFactory::responding(cert_response()));
        let session = session(
            data_plane.clone(),
            FixedProber(vec![VpnProtocol::WireGuardTcp]),
            MemoryCredentialStore::with_credentials(credentials()),
        );
        let mut transitions = session.transitions();

        let mut rx = session.connect("NL#1").await;
        assert_eq!(settled(&mut rx).await, SessionState::Connected);

        let mut seen = Vec::new();
        while let Ok(state) = transitions.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                SessionState::Resolving,
                SessionState::Establishing,
                SessionState::Authenticating,
                SessionState::Connected,
            ]
        );

        let attempt = session.attempt().unwrap();
        assert_eq!(attempt.choice.unwrap().protocol, VpnProtocol::WireGuardTcp);
        assert!(session.current_certificate().is_some());
        assert!(data_plane.installed_certificate().await.is_some());
    }

    #[tokio::test]
    async fn test_maintenance_fails_before_probing() {
        let session = session(
            direct(MockTunnelFactory::responding(cert_response())),
            FixedProber(VpnProtocol::all().to_vec()),
            MemoryCredentialStore::with_credentials(credentials()),
        );

        let mut rx = session.connect("NL#2").await;
        assert_eq!(
            settled(&mut rx).await,
            SessionState::Failed(FailureReason::ServerUnavailable)
        );
        assert!(session.attempt().unwrap().choice.is_none());

        let mut rx = session.connect("XX#9").await;
        assert_eq!(settled(&mut rx).await, SessionState::Failed(FailureReason::UnknownServer));
    }

    #[tokio::test]
    async fn test_no_protocol_available() {
        let session = session(
            direct(MockTunnelFactory::responding(cert_response())),
            FixedProber(vec![]),
            MemoryCredentialStore::with_credentials(credentials()),
        );

        let mut rx = session.connect("NL#1").await;
        assert_eq!(
            settled(&mut rx).await,
            SessionState::Failed(FailureReason::NoProtocolAvailable)
        );
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_without_retry() {
        let factory = Arc::new(MockTunnelFactory::responding(cert_response()));
        let session = session(
            Arc::new(DirectDataPlane::new(factory.clone())),
            FixedProber(vec![VpnProtocol::WireGuardUdp]),
            MemoryCredentialStore::new(),
        );

        let mut rx = session.connect("NL#1").await;
        assert_eq!(settled(&mut rx).await, SessionState::Failed(FailureReason::NoCredentials));
        assert!(factory.opens().is_empty());
        assert!(session.current_certificate().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_are_retried() {
        let flaky = FlakyFactory {
            failing: MockTunnelFactory::new(MockBehavior::Disconnect),
            working: MockTunnelFactory::responding(cert_response()),
            failures: AtomicUsize::new(2),
        };
        let session = session(
            direct(flaky),
            FixedProber(vec![VpnProtocol::WireGuardUdp]),
            MemoryCredentialStore::with_credentials(credentials()),
        );

        let mut rx = session.connect("NL#1").await;
        assert_eq!(settled(&mut rx).await, SessionState::Connected);
        assert_eq!(session.attempt().unwrap().retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let factory = Arc::new(MockTunnelFactory::new(MockBehavior::Disconnect));
        let session = session(
            Arc::new(DirectDataPlane::new(factory.clone())),
            FixedProber(vec![VpnProtocol::WireGuardUdp]),
            MemoryCredentialStore::with_credentials(credentials()),
        );

        let mut rx = session.connect("NL#1").await;
        assert_eq!(settled(&mut rx).await, SessionState::Failed(FailureReason::Unreachable));
        assert_eq!(factory.opens().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fails_stuck_establish() {
        let (events, _) = broadcast::channel(4);
        let session = session(
            Arc::new(StuckDataPlane { events }),
            FixedProber(vec![VpnProtocol::WireGuardUdp]),
            MemoryCredentialStore::with_credentials(credentials()),
        );

        let start = tokio::time::Instant::now();
        let mut rx = session.connect("NL#1").await;

        assert_eq!(settled(&mut rx).await, SessionState::Failed(FailureReason::StuckConnection));
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_tunnel_events_fail_connected_session() {
        let data_plane = direct(MockTunnelFactory::responding(cert_response()));
        let session = session(
            data_plane.clone(),
            FixedProber(vec![VpnProtocol::WireGuardUdp]),
            MemoryCredentialStore::with_credentials(credentials()),
        );

        let mut rx = session.connect("NL#1").await;
        assert_eq!(settled(&mut rx).await, SessionState::Connected);

        data_plane.notify(DataPlaneEvent::Maintenance);
        rx.wait_for(|s| s.is_failed()).await.unwrap();
        assert_eq!(session.state(), SessionState::Failed(FailureReason::ServerUnavailable));
        assert!(!data_plane.is_up());
        assert!(session.current_certificate().is_none());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let data_plane = direct(MockTunnelFactory::responding(cert_response()));
        let session = session(
            data_plane.clone(),
            FixedProber(vec![VpnProtocol::WireGuardUdp]),
            MemoryCredentialStore::with_credentials(credentials()),
        );

        session.cancel().await;
        assert_eq!(session.state(), SessionState::Idle);

        let mut rx = session.connect("NL#1").await;
        assert_eq!(settled(&mut rx).await, SessionState::Connected);

        let mut transitions = session.transitions();
        session.cancel().await;
        session.cancel().await;

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(transitions.try_recv().unwrap(), SessionState::Disconnecting);
        assert_eq!(transitions.try_recv().unwrap(), SessionState::Idle);
        assert!(transitions.try_recv().is_err());
        assert!(!data_plane.is_up());
        assert!(session.current_certificate().is_none());
    }

    /// Issues `PEM-0`, `PEM-1`, ... each already due for refresh
    fn renewing_factory() -> MockTunnelFactory {
        let issued = AtomicUsize::new(0);
        MockTunnelFactory::with_handler(move |_| {
            let n = issued.fetch_add(1, Ordering::SeqCst);
            let now = crate::epoch::to_secs(SystemTime::now());
            let body = format!(
                r#"{{"Certificate":"PEM-{}","ExpirationTime":{},"RefreshTime":{}}}"#,
                n,
                now + 24 * 3600,
                now
            );
            http_response(200, &[], body.as_bytes())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_certificate_reaches_data_plane() {
        let data_plane = direct(renewing_factory());
        let session = session(
            data_plane.clone(),
            FixedProber(vec![VpnProtocol::WireGuardUdp]),
            MemoryCredentialStore::with_credentials(credentials()),
        );

        let mut rx = session.connect("NL#1").await;
        assert_eq!(settled(&mut rx).await, SessionState::Connected);
        assert_eq!(data_plane.installed_certificate().await.unwrap().payload, "PEM-0");

        // One refresh check interval later
        tokio::time::sleep(Duration::from_secs(150)).await;

        let current = session.current_certificate().unwrap();
        assert_eq!(current.payload, "PEM-1");
        assert_eq!(data_plane.installed_certificate().await, Some(current));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_certificate_fails_connected_session() {
        // Valid for 100 s, and every later request is refused
        let issued = AtomicUsize::new(0);
        let factory = MockTunnelFactory::with_handler(move |_| {
            if issued.fetch_add(1, Ordering::SeqCst) > 0 {
                return http_response(503, &[], b"");
            }
            let now = crate::epoch::to_secs(SystemTime::now());
            let body = format!(
                r#"{{"Certificate":"PEM","ExpirationTime":{},"RefreshTime":{}}}"#,
                now + 100,
                now + 50
            );
            http_response(200, &[], body.as_bytes())
        });
        let data_plane = direct(factory);
        let session = session(
            data_plane.clone(),
            FixedProber(vec![VpnProtocol::WireGuardUdp]),
            MemoryCredentialStore::with_credentials(credentials()),
        );

        let mut rx = session.connect("NL#1").await;
        assert_eq!(settled(&mut rx).await, SessionState::Connected);

        let failed = rx.wait_for(|s| s.is_failed()).await.unwrap().clone();
        assert_eq!(failed, SessionState::Failed(FailureReason::CertificateExpired));
        assert!(data_plane.installed_certificate().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reauth_failure_fails_session() {
        // First certificate is due at once; afterwards the session is revoked
        let issued = AtomicUsize::new(0);
        let factory = MockTunnelFactory::with_handler(move |raw| {
            let target = shield_net::mock::request_line(raw).map(|(_, t)| t).unwrap_or_default();
            if target != "/vpn/v1/certificate" || issued.fetch_add(1, Ordering::SeqCst) > 0 {
                return http_response(401, &[], b"");
            }
            let now = crate::epoch::to_secs(SystemTime::now());
            let body = format!(
                r#"{{"Certificate":"PEM","ExpirationTime":{},"RefreshTime":{}}}"#,
                now + 24 * 3600,
                now
            );
            http_response(200, &[], body.as_bytes())
        });
        let session = session(
            direct(factory),
            FixedProber(vec![VpnProtocol::WireGuardUdp]),
            MemoryCredentialStore::with_credentials(credentials()),
        );

        let mut rx = session.connect("NL#1").await;
        assert_eq!(settled(&mut rx).await, SessionState::Connected);

        let failed = rx.wait_for(|s| s.is_failed()).await.unwrap().clone();
        assert_eq!(failed, SessionState::Failed(FailureReason::Unauthenticated));
    }

    #[tokio::test]
    async fn test_tunnel_events_seen_while_authenticating() {
        // Certificate requests never get a connected socket
        let data_plane = direct(MockTunnelFactory::new(MockBehavior::NeverConnect));
        let session = session(
            data_plane.clone(),
            FixedProber(vec![VpnProtocol::WireGuardUdp]),
            MemoryCredentialStore::with_credentials(credentials()),
        );

        let mut rx = session.connect("NL#1").await;
        rx.wait_for(|s| *s == SessionState::Authenticating).await.unwrap();

        data_plane.notify(DataPlaneEvent::Maintenance);
        assert_eq!(
            settled(&mut rx).await,
            SessionState::Failed(FailureReason::ServerUnavailable)
        );
        assert_eq!(session.attempt().unwrap().retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_supersedes_running_attempt() {
        let (events, _) = broadcast::channel(4);
        let stuck: Arc<dyn DataPlane> = Arc::new(StuckDataPlane { events });
        let session = session(
            stuck,
            FixedProber(vec![VpnProtocol::WireGuardUdp]),
            MemoryCredentialStore::with_credentials(credentials()),
        );

        let mut first = session.connect("NL#1").await;
        first.wait_for(|s| *s == SessionState::Establishing).await.unwrap();

        let mut second = session.connect("NL#2").await;
        assert_eq!(
            settled(&mut second).await,
            SessionState::Failed(FailureReason::ServerUnavailable)
        );
        assert_eq!(session.attempt().unwrap().server_id, "NL#2");
    }
}
