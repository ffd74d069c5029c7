//! Certificate Refresh Scheduling
//!
//! Keeps the current certificate up to date while a session is connected.
//!
//! A refresh is due when there is no certificate, the requested features
//! changed, or the certificate's refresh time minus `refresh_earlier_by` has
//! passed. Only one refresh runs at a time; a caller that cannot get the slot
//! within `wait_timeout` fails with [`RefreshError::Busy`].

use crate::certificate::{Certificate, CertificateFeatures};
use crate::keys::KeyPair;
use crate::refresher::{CredentialRefresher, RefreshError};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Refresh timing
#[derive(Debug, Clone)]
pub struct RefreshIntervals {
    /// How often the periodic task checks
    pub check_interval: Duration,
    /// Refresh this long before the certificate's refresh time
    pub refresh_earlier_by: Duration,
    /// How long to wait for an in-flight refresh before giving up
    pub wait_timeout: Duration,
}

impl Default for RefreshIntervals {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(2 * 60),
            refresh_earlier_by: Duration::from_secs(3 * 60),
            wait_timeout: Duration::from_secs(2 * 60),
        }
    }
}

/// Owner of the session's current certificate
pub struct CertificateRefreshManager {
    refresher: CredentialRefresher,
    keys: KeyPair,
    intervals: RefreshIntervals,
    in_flight: Mutex<()>,
    current: watch::Sender<Option<Certificate>>,
}

impl CertificateRefreshManager {
    pub fn new(refresher: CredentialRefresher, keys: KeyPair, intervals: RefreshIntervals) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            refresher,
            keys,
            intervals,
            in_flight: Mutex::new(()),
            current,
        }
    }

    /// Current certificate, `None` once it has expired
    pub fn current(&self) -> Option<Certificate> {
        self.current
            .borrow()
            .as_ref()
            .filter(|c| c.is_valid())
            .cloned()
    }

    /// Follow certificate replacements
    pub fn subscribe(&self) -> watch::Receiver<Option<Certificate>> {
        self.current.subscribe()
    }

    /// Whether a refresh is due for `features` at `now`
    pub fn needs_refresh(&self, features: &CertificateFeatures, now: SystemTime) -> bool {
        let current = self.current.borrow();
        let Some(cert) = current.as_ref() else {
            debug!("No certificate yet, refresh due");
            return true;
        };
        if cert.granted_features != *features {
            debug!("Certificate features changed, refresh due");
            return true;
        }
        cert.refresh_due_at(now, self.intervals.refresh_earlier_by)
    }

    /// Refresh unconditionally
    pub async fn refresh(
        &self,
        features: &CertificateFeatures,
        cancel: &CancellationToken,
    ) -> Result<Certificate, RefreshError> {
        self.run(features, true, cancel).await
    }

    /// Refresh only if due; returns the certificate in effect
    pub async fn check_refresh(
        &self,
        features: &CertificateFeatures,
        cancel: &CancellationToken,
    ) -> Result<Certificate, RefreshError> {
        self.run(features, false, cancel).await
    }

    async fn run(
        &self,
        features: &CertificateFeatures,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Certificate, RefreshError> {
        let _slot = tokio::time::timeout(self.intervals.wait_timeout, self.in_flight.lock())
            .await
            .map_err(|_| RefreshError::Busy)?;

        // Re-check under the slot; a refresh that just finished may suffice
        if !force && !self.needs_refresh(features, SystemTime::now()) {
            if let Some(cert) = self.current() {
                debug!("Certificate still fresh, no refresh");
                return Ok(cert);
            }
        }

        let cert = self
            .refresher
            .refresh_certificate(&self.keys.public, features, cancel)
            .await?;
        self.current.send_replace(Some(cert.clone()));
        Ok(cert)
    }

    /// Check periodically until `cancel` fires.
    ///
    /// Transient errors are logged and the next tick tries again. Errors
    /// that need a new login end the task with that error; cancellation ends
    /// it with `Ok`.
    pub fn spawn_periodic(
        self: Arc<Self>,
        features: CertificateFeatures,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), RefreshError>> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.intervals.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match self.check_refresh(&features, &cancel).await {
                    Ok(cert) => debug!(
                        "Certificate check done, {:?} until expiry",
                        cert.remaining(SystemTime::now())
                    ),
                    Err(RefreshError::Cancelled) => break,
                    Err(e) if e.needs_login() => {
                        error!("Background certificate refresh needs a new login: {}", e);
                        return Err(e);
                    }
                    Err(e) => warn!("Background certificate refresh failed, retrying later: {}", e),
                }
            }
            info!("Certificate refresh task stopped");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::config::ApiConfig;
    use crate::credentials::{CredentialVault, Credentials, MemoryCredentialStore};
    use crate::refresher::CertificateSettings;
    use shield_net::CookieStore;
    use shield_net::mock::{MockTunnelFactory, http_response};
    use std::time::UNIX_EPOCH;

    fn manager(factory: Arc<MockTunnelFactory>, intervals: RefreshIntervals) -> CertificateRefreshManager {
        let credentials = Credentials {
            session_id: "uid".to_string(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expiration: UNIX_EPOCH + Duration::from_secs(4_000_000_000),
            scopes: vec![],
        };
        manager_with_store(factory, intervals, MemoryCredentialStore::with_credentials(credentials))
    }

    fn manager_with_store(
        factory: Arc<MockTunnelFactory>,
        intervals: RefreshIntervals,
        store: MemoryCredentialStore,
    ) -> CertificateRefreshManager {
        let api = ApiClient::new(factory, Arc::new(CookieStore::new()), ApiConfig::default());
        let refresher = CredentialRefresher::new(
            Arc::new(api),
            Arc::new(CredentialVault::new(Arc::new(store))),
            CertificateSettings {
                device_name: "test".to_string(),
                duration: "1440 min".to_string(),
            },
        );
        CertificateRefreshManager::new(refresher, KeyPair::generate(), intervals)
    }

    fn cert_response(refresh: u64, expiry: u64) -> Vec<u8> {
        let body = format!(
            r#"{{"Certificate":"PEM","ExpirationTime":{},"RefreshTime":{}}}"#,
            expiry, refresh
        );
        http_response(200, &[], body.as_bytes())
    }

    fn far_future() -> u64 {
        crate::epoch::to_secs(SystemTime::now()) + 24 * 3600
    }

    #[tokio::test]
    async fn test_check_skips_when_fresh() {
        let factory = Arc::new(MockTunnelFactory::responding(cert_response(far_future(), far_future())));
        let manager = manager(factory.clone(), RefreshIntervals::default());
        let features = CertificateFeatures::default();
        let cancel = CancellationToken::new();

        assert!(manager.current().is_none());
        manager.check_refresh(&features, &cancel).await.unwrap();
        manager.check_refresh(&features, &cancel).await.unwrap();
        assert_eq!(factory.opens().len(), 1);
        assert!(manager.current().is_some());

        // Different features force a new certificate
        let other = CertificateFeatures {
            net_shield_level: 2,
            ..CertificateFeatures::default()
        };
        assert!(manager.needs_refresh(&other, SystemTime::now()));
        manager.check_refresh(&other, &cancel).await.unwrap();
        assert_eq!(factory.opens().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_certificate_is_not_current() {
        let factory = Arc::new(MockTunnelFactory::responding(cert_response(1, 2)));
        let manager = manager(factory, RefreshIntervals::default());

        manager
            .refresh(&CertificateFeatures::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(manager.current().is_none());
        assert!(manager.needs_refresh(&CertificateFeatures::default(), SystemTime::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_when_slot_held() {
        let factory = Arc::new(MockTunnelFactory::responding(cert_response(far_future(), far_future())));
        let manager = manager(
            factory,
            RefreshIntervals {
                wait_timeout: Duration::from_secs(5),
                ..RefreshIntervals::default()
            },
        );

        let _held = manager.in_flight.lock().await;
        let result = manager
            .refresh(&CertificateFeatures::default(), &CancellationToken::new())
            .await;

        assert_eq!(result, Err(RefreshError::Busy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_refreshes_when_due() {
        // Refresh time already passed, so every check refreshes
        let factory = Arc::new(MockTunnelFactory::responding(cert_response(1, far_future())));
        let manager = Arc::new(manager(
            factory.clone(),
            RefreshIntervals {
                check_interval: Duration::from_secs(60),
                ..RefreshIntervals::default()
            },
        ));
        let cancel = CancellationToken::new();

        let mut replaced = manager.subscribe();
        let task = manager.clone().spawn_periodic(CertificateFeatures::default(), cancel.clone());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(factory.opens().len(), 2);
        assert!(replaced.has_changed().unwrap());
        assert!(replaced.borrow_and_update().is_some());

        cancel.cancel();
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_ends_when_login_needed() {
        let factory = Arc::new(MockTunnelFactory::responding(cert_response(1, far_future())));
        let manager = Arc::new(manager_with_store(
            factory.clone(),
            RefreshIntervals {
                check_interval: Duration::from_secs(60),
                ..RefreshIntervals::default()
            },
            MemoryCredentialStore::new(),
        ));

        let task = manager.spawn_periodic(CertificateFeatures::default(), CancellationToken::new());

        assert_eq!(task.await.unwrap(), Err(RefreshError::NoCredentials));
        assert!(factory.opens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_survives_transient_errors() {
        let factory = Arc::new(MockTunnelFactory::responding(http_response(503, &[], b"")));
        let manager = Arc::new(manager(
            factory.clone(),
            RefreshIntervals {
                check_interval: Duration::from_secs(60),
                ..RefreshIntervals::default()
            },
        ));
        let cancel = CancellationToken::new();

        let task = manager.spawn_periodic(CertificateFeatures::default(), cancel.clone());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(factory.opens().len(), 2);
        assert!(!task.is_finished());

        cancel.cancel();
        assert_eq!(task.await.unwrap(), Ok(()));
    }
}
