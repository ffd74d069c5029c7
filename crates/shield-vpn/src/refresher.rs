//! Credential Refresher
//!
//! Obtains a certificate for the client key, renewing API credentials on the
//! way when the access token is rejected.
//!
//! # Sequence
//!
//! 1. Load credentials; none at all is [`RefreshError::NoCredentials`] and
//!    no request is made
//! 2. Request the certificate
//! 3. On 401, re-authenticate: session refresh, then token refresh, then
//!    store the renewed credentials
//! 4. Request the certificate once more; a second 401 is
//!    [`RefreshError::Unauthenticated`]
//!
//! Steps 3 and 4 run at most once per call. There is no loop.

use crate::api::{ApiClient, ApiError, CertificateRequest};
use crate::certificate::{Certificate, CertificateFeatures};
use crate::credentials::{CredentialVault, Credentials, StoreError};
use crate::keys::PublicKey;
use shield_net::{HttpError, UnreachableCause};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Certificate refresh errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("No stored credentials")]
    NoCredentials,

    #[error("Credentials rejected after re-authentication")]
    Unauthenticated,

    #[error("Re-authentication failed: {0}")]
    AuthRefreshFailed(Box<ApiError>),

    #[error("API unreachable: {0}")]
    Unreachable(UnreachableCause),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Unexpected status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("Too many certificate requests (retry after {retry_after:?})")]
    TooManyRequests { retry_after: Option<Duration> },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Another refresh is still running")]
    Busy,

    #[error("Refresh cancelled")]
    Cancelled,

    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),
}

impl RefreshError {
    /// Transport failure worth another attempt
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RefreshError::Unreachable(_))
    }

    /// Only a fresh login can fix this
    pub fn needs_login(&self) -> bool {
        matches!(
            self,
            RefreshError::NoCredentials | RefreshError::Unauthenticated | RefreshError::AuthRefreshFailed(_)
        )
    }
}

impl From<ApiError> for RefreshError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Http(HttpError::Unreachable(cause)) => RefreshError::Unreachable(cause),
            ApiError::Http(HttpError::Cancelled) => RefreshError::Cancelled,
            ApiError::Http(HttpError::MalformedResponse(e)) => RefreshError::MalformedResponse(e.to_string()),
            ApiError::Http(HttpError::InvalidRequest(msg)) => RefreshError::InvalidRequest(msg),
            ApiError::Decode(msg) => RefreshError::MalformedResponse(msg),
            ApiError::Unauthorized => RefreshError::Unauthenticated,
            ApiError::TooManyRequests { retry_after } => RefreshError::TooManyRequests { retry_after },
            ApiError::Status { status, message, .. } => RefreshError::UnexpectedStatus { status, message },
            ApiError::Config(e) => RefreshError::InvalidRequest(e.to_string()),
        }
    }
}

/// Certificate request parameters that do not change per call
#[derive(Debug, Clone)]
pub struct CertificateSettings {
    pub device_name: String,
    /// API duration syntax, e.g. `1440 min`
    pub duration: String,
}

/// Fetches certificates, renewing credentials on a single 401
pub struct CredentialRefresher {
    api: Arc<ApiClient>,
    vault: Arc<CredentialVault>,
    settings: CertificateSettings,
}

impl CredentialRefresher {
    pub fn new(api: Arc<ApiClient>, vault: Arc<CredentialVault>, settings: CertificateSettings) -> Self {
        Self { api, vault, settings }
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    /// Obtain a fresh certificate for `public_key`
    pub async fn refresh_certificate(
        &self,
        public_key: &PublicKey,
        features: &CertificateFeatures,
        cancel: &CancellationToken,
    ) -> Result<Certificate, RefreshError> {
        let credentials = self.vault.load().await?.ok_or(RefreshError::NoCredentials)?;
        let request = CertificateRequest::new(
            public_key,
            features,
            &self.settings.device_name,
            &self.settings.duration,
        );

        debug!("Requesting certificate for key {}", public_key.fingerprint());
        let first = self.api.certificate(&credentials, &request, cancel).await;
        let response = match first {
            Err(ApiError::Unauthorized) => {
                info!("Access token rejected, re-authenticating session {}", credentials.session_id);
                let renewed = self.reauthenticate(&credentials, cancel).await?;
                match self.api.certificate(&renewed, &request, cancel).await {
                    Err(ApiError::Unauthorized) => {
                        warn!("Certificate request rejected again after re-authentication");
                        return Err(RefreshError::Unauthenticated);
                    }
                    other => other?,
                }
            }
            other => other?,
        };

        let certificate = response.into_certificate(public_key, features);
        info!(
            "Obtained certificate valid for {:?}",
            certificate.remaining(SystemTime::now())
        );
        Ok(certificate)
    }

    /// Renew credentials after `stale` was rejected.
    ///
    /// If another caller already replaced `stale` while we waited for the
    /// lock, its credentials are used instead of renewing again.
    async fn reauthenticate(
        &self,
        stale: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<Credentials, RefreshError> {
        let _guard = self.vault.lock_reauth().await;

        if let Some(current) = self.vault.load().await? {
            if current.access_token != stale.access_token {
                debug!("Credentials were renewed concurrently, reusing them");
                return Ok(current);
            }
        }

        let session = self
            .api
            .refresh_session(stale, cancel)
            .await
            .map_err(auth_failed)?;
        let token = self
            .api
            .refresh_token(&session.uid, &session.refresh_token, cancel)
            .await
            .map_err(auth_failed)?;

        let renewed = token.into_credentials(session.uid, SystemTime::now());
        Ok(self.vault.replace_rejected(stale, renewed).await?)
    }
}

fn auth_failed(e: ApiError) -> RefreshError {
    match e {
        ApiError::Http(HttpError::Cancelled) => RefreshError::Cancelled,
        other => {
            warn!("Re-authentication failed: {}", other);
            RefreshError::AuthRefreshFailed(Box::new(other))
        }
    }
}
