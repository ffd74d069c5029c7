//! Data Plane Seam
//!
//! The data plane brings up the actual cipher tunnel for a chosen protocol
//! and port, and hands back a socket factory whose sockets travel through
//! it. The session layer only drives it; it never looks inside.

use crate::certificate::Certificate;
use crate::keys::KeyPair;
use crate::protocol::{ProtocolChoice, ServerDescriptor};
use async_trait::async_trait;
use shield_net::{SocketConfig, TcpSocketFactory, TunnelSocketFactory};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, broadcast};
use tracing::{info, warn};

/// Events the data plane reports after the tunnel is up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPlaneEvent {
    /// The tunnel dropped
    TunnelDown(String),
    /// The server announced maintenance
    Maintenance,
}

/// Data plane errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataPlaneError {
    #[error("Tunnel setup failed: {0}")]
    EstablishFailed(String),

    #[error("Certificate rejected: {0}")]
    CertificateRejected(String),

    #[error("Tunnel not established")]
    NotEstablished,
}

/// OS / cipher tunnel integration
#[async_trait]
pub trait DataPlane: Send + Sync {
    /// Bring the tunnel up; sockets from the returned factory go through it
    async fn establish(
        &self,
        server: &ServerDescriptor,
        choice: &ProtocolChoice,
        keys: &KeyPair,
    ) -> Result<Arc<dyn TunnelSocketFactory>, DataPlaneError>;

    /// Start the cipher session with `certificate`
    async fn install_certificate(&self, certificate: &Certificate) -> Result<(), DataPlaneError>;

    /// Tear the tunnel down; a no-op when it is not up
    async fn stop(&self);

    fn subscribe(&self) -> broadcast::Receiver<DataPlaneEvent>;
}

/// Data plane that routes nothing and uses the host network for API calls.
///
/// Useful for diagnostics and for exercising the session flow without a
/// tunnel driver.
pub struct DirectDataPlane {
    factory: Arc<dyn TunnelSocketFactory>,
    events: broadcast::Sender<DataPlaneEvent>,
    installed: RwLock<Option<Certificate>>,
    up: AtomicBool,
}

impl DirectDataPlane {
    pub fn new(factory: Arc<dyn TunnelSocketFactory>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            factory,
            events,
            installed: RwLock::new(None),
            up: AtomicBool::new(false),
        }
    }

    /// Plain TCP/TLS sockets over the host network
    pub fn with_tcp(config: SocketConfig) -> Self {
        Self::new(Arc::new(TcpSocketFactory::new(config)))
    }

    /// Inject an event, as a tunnel driver would
    pub fn notify(&self, event: DataPlaneEvent) {
        if self.events.send(event).is_err() {
            warn!("Data plane event dropped, nobody is listening");
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    pub async fn installed_certificate(&self) -> Option<Certificate> {
        self.installed.read().await.clone()
    }
}

#[async_trait]
impl DataPlane for DirectDataPlane {
    async fn establish(
        &self,
        server: &ServerDescriptor,
        choice: &ProtocolChoice,
        keys: &KeyPair,
    ) -> Result<Arc<dyn TunnelSocketFactory>, DataPlaneError> {
        info!(
            "Direct data plane: {} via {} {}:{} (client key {})",
            server.id, choice.protocol, choice.ip, choice.port, keys.public
        );
        self.up.store(true, Ordering::SeqCst);
        Ok(self.factory.clone())
    }

    async fn install_certificate(&self, certificate: &Certificate) -> Result<(), DataPlaneError> {
        if !self.is_up() {
            return Err(DataPlaneError::NotEstablished);
        }
        *self.installed.write().await = Some(certificate.clone());
        Ok(())
    }

    async fn stop(&self) {
        if self.up.swap(false, Ordering::SeqCst) {
            info!("Direct data plane stopped");
        }
        *self.installed.write().await = None;
    }

    fn subscribe(&self) -> broadcast::Receiver<DataPlaneEvent> {
        self.events.subscribe()
    }
}
