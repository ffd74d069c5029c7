//! Control-plane API
//!
//! JSON requests to the VPN API, carried by a [`TunneledHttpClient`]. Every
//! request gets the standard header set; authenticated requests also carry
//! the access token and session id.
//!
//! | Call | Method | Path (default) |
//! |------|--------|----------------|
//! | certificate | POST | `vpn/v1/certificate` |
//! | session refresh | POST | `auth/v4/sessions/refresh` |
//! | token refresh | POST | `auth/v4/refresh` |
//! | client config | GET | `vpn/v2/clientconfig` |

use crate::certificate::{Certificate, CertificateFeatures};
use crate::config::{ApiConfig, ConfigError};
use crate::credentials::Credentials;
use crate::keys::PublicKey;
use crate::protocol::{PortTable, ProtocolFlags, ServerDescriptor, VpnProtocol, ProtocolCandidate, default_port_table};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shield_net::{
    CookieStore, HttpClientConfig, HttpError, Method, TunnelRequest, TunnelResponse,
    TunnelSocketFactory, TunneledHttpClient,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const HEADER_APP_VERSION: &str = "x-app-version";
const HEADER_API_VERSION: &str = "x-api-version";
const HEADER_SESSION_UID: &str = "x-session-uid";

/// API call errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("Access token rejected")]
    Unauthorized,

    #[error("Too many requests (retry after {retry_after:?})")]
    TooManyRequests { retry_after: Option<Duration> },

    #[error("Unexpected status {status}: {message}")]
    Status { status: u16, code: Option<i64>, message: String },

    #[error("Undecodable body: {0}")]
    Decode(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Error body the API returns alongside non-2xx statuses
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    code: Option<i64>,
    error: Option<String>,
}

/// `POST vpn/v1/certificate` body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertificateRequest {
    pub client_public_key: String,
    pub client_public_key_mode: String,
    pub device_name: String,
    pub mode: String,
    pub duration: String,
    pub features: CertificateFeatures,
}

impl CertificateRequest {
    pub fn new(public_key: &PublicKey, features: &CertificateFeatures, device_name: &str, duration: &str) -> Self {
        Self {
            client_public_key: public_key.to_pem(),
            client_public_key_mode: "EC".to_string(),
            device_name: device_name.to_string(),
            mode: "session".to_string(),
            duration: duration.to_string(),
            features: features.clone(),
        }
    }
}

/// `POST vpn/v1/certificate` response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertificateResponse {
    #[serde(default)]
    pub client_key_fingerprint: String,
    pub certificate: String,
    #[serde(with = "crate::epoch")]
    pub expiration_time: SystemTime,
    #[serde(with = "crate::epoch")]
    pub refresh_time: SystemTime,
}

impl CertificateResponse {
    /// Domain certificate; falls back to our own fingerprint when the API
    /// does not echo one
    pub fn into_certificate(self, public_key: &PublicKey, features: &CertificateFeatures) -> Certificate {
        let fingerprint = if self.client_key_fingerprint.is_empty() {
            public_key.fingerprint()
        } else {
            self.client_key_fingerprint
        };
        Certificate {
            public_key_fingerprint: fingerprint,
            payload: self.certificate,
            valid_until: self.expiration_time,
            refresh_time: self.refresh_time,
            granted_features: features.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RefreshBody<'a> {
    #[serde(rename = "UID")]
    uid: &'a str,
    refresh_token: &'a str,
    grant_type: &'static str,
    response_type: &'static str,
}

/// `POST auth/v4/sessions/refresh` response: a new session/refresh pair
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionRefreshResponse {
    #[serde(rename = "UID")]
    pub uid: String,
    pub refresh_token: String,
}

/// `POST auth/v4/refresh` response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds from now
    pub expires_in: u64,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenResponse {
    pub fn into_credentials(self, session_id: String, now: SystemTime) -> Credentials {
        Credentials {
            session_id,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expiration: now + Duration::from_secs(self.expires_in),
            scopes: self.scopes,
        }
    }
}

/// Client configuration pushed by the API
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientConfig {
    /// Ports per protocol; protocols left out keep their built-in defaults
    #[serde(default)]
    pub default_ports: PortTable,
    #[serde(default)]
    pub smart_protocol: ProtocolFlags,
    /// Minutes between server list refreshes
    #[serde(default)]
    pub server_refresh_interval: Option<u64>,
}

impl ClientConfig {
    /// Built-in defaults overlaid with the pushed ports
    pub fn port_table(&self) -> PortTable {
        let mut table = default_port_table();
        for (protocol, ports) in &self.default_ports {
            table.insert(*protocol, ports.clone());
        }
        table
    }

    pub fn candidates(&self, server: &ServerDescriptor, order: &[VpnProtocol]) -> Vec<ProtocolCandidate> {
        server.candidates(order, &self.port_table(), &self.smart_protocol)
    }
}

#[derive(Debug, Deserialize)]
struct ClientConfigEnvelope {
    #[serde(rename = "ClientConfig")]
    client_config: ClientConfig,
}

/// JSON API client bound to one socket factory
pub struct ApiClient {
    http: TunneledHttpClient,
    config: ApiConfig,
}

impl ApiClient {
    pub fn new(factory: Arc<dyn TunnelSocketFactory>, cookies: Arc<CookieStore>, config: ApiConfig) -> Self {
        let http = TunneledHttpClient::new(
            factory,
            cookies,
            HttpClientConfig {
                timeout: config.request_timeout(),
                max_response_size: config.max_response_size,
                user_agent: Some(config.user_agent.clone()),
            },
        );
        Self { http, config }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str, auth: Option<&Credentials>) -> Result<TunnelRequest, ApiError> {
        let url = self.config.url_for(path)?;
        let mut request = TunnelRequest::new(method, url)
            .header(HEADER_APP_VERSION, self.config.app_version.clone())
            .header(HEADER_API_VERSION, self.config.api_version.clone())
            .header("Accept", "application/json");
        if let Some(credentials) = auth {
            request = request
                .header("Authorization", format!("Bearer {}", credentials.access_token))
                .header(HEADER_SESSION_UID, credentials.session_id.clone());
        }
        Ok(request)
    }

    fn with_json<T: Serialize>(request: TunnelRequest, body: &T) -> Result<TunnelRequest, ApiError> {
        let body = serde_json::to_vec(body).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(request.header("Content-Type", "application/json").with_body(body))
    }

    async fn call<T: DeserializeOwned>(&self, request: TunnelRequest, cancel: &CancellationToken) -> Result<T, ApiError> {
        let path = request.url.path().to_string();
        let response = self.http.send(request, cancel).await?;
        check_status(&path, &response)?;
        serde_json::from_slice(response.body_bytes()).map_err(|e| {
            warn!("Undecodable {} response from {}: {}", response.status, path, e);
            ApiError::Decode(e.to_string())
        })
    }

    /// Request a certificate for `request.client_public_key`
    pub async fn certificate(
        &self,
        credentials: &Credentials,
        request: &CertificateRequest,
        cancel: &CancellationToken,
    ) -> Result<CertificateResponse, ApiError> {
        let http = self.request(Method::Post, &self.config.endpoints.certificate, Some(credentials))?;
        let http = Self::with_json(http, request)?;
        self.call(http, cancel).await
    }

    /// Exchange the refresh token for a new session/refresh pair
    pub async fn refresh_session(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<SessionRefreshResponse, ApiError> {
        let http = self.request(Method::Post, &self.config.endpoints.session_refresh, None)?
            .header(HEADER_SESSION_UID, credentials.session_id.clone());
        let body = RefreshBody {
            uid: &credentials.session_id,
            refresh_token: &credentials.refresh_token,
            grant_type: "refresh_token",
            response_type: "token",
        };
        let http = Self::with_json(http, &body)?;
        self.call(http, cancel).await
    }

    /// Exchange a refresh token for a fresh access token
    pub async fn refresh_token(
        &self,
        session_id: &str,
        refresh_token: &str,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse, ApiError> {
        let http = self.request(Method::Post, &self.config.endpoints.token_refresh, None)?
            .header(HEADER_SESSION_UID, session_id.to_string());
        let body = RefreshBody {
            uid: session_id,
            refresh_token,
            grant_type: "refresh_token",
            response_type: "token",
        };
        let http = Self::with_json(http, &body)?;
        self.call(http, cancel).await
    }

    /// Fetch the client configuration; authenticated when credentials are given
    pub async fn client_config(
        &self,
        credentials: Option<&Credentials>,
        cancel: &CancellationToken,
    ) -> Result<ClientConfig, ApiError> {
        let http = self.request(Method::Get, &self.config.endpoints.client_config, credentials)?;
        let envelope: ClientConfigEnvelope = self.call(http, cancel).await?;
        Ok(envelope.client_config)
    }
}

fn check_status(path: &str, response: &TunnelResponse) -> Result<(), ApiError> {
    match response.status {
        200..=299 => Ok(()),
        401 => {
            debug!("{} rejected the access token", path);
            Err(ApiError::Unauthorized)
        }
        429 => {
            let retry_after = response
                .header("Retry-After")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            warn!("{} rate limited (retry after {:?})", path, retry_after);
            Err(ApiError::TooManyRequests { retry_after })
        }
        status => {
            let body: Option<ErrorBody> = serde_json::from_slice(response.body_bytes()).ok();
            let (code, message) = match body {
                Some(b) => (b.code, b.error.unwrap_or_else(|| response.reason.clone())),
                None => (None, response.reason.clone()),
            };
            warn!("{} failed with {} ({:?}): {}", path, status, code, message);
            Err(ApiError::Status { status, code, message })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shield_net::mock::{MockTunnelFactory, http_response};
    use std::time::UNIX_EPOCH;

    fn client(factory: Arc<MockTunnelFactory>) -> ApiClient {
        ApiClient::new(factory, Arc::new(CookieStore::new()), ApiConfig::default())
    }

    fn credentials() -> Credentials {
        Credentials {
            session_id: "uid-1".to_string(),
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            expiration: UNIX_EPOCH + Duration::from_secs(2_000_000_000),
            scopes: vec![],
        }
    }

    #[tokio::test]
    async fn test_client_config_example() {
        let body = r#"{"ClientConfig":{"DefaultPorts":{"WireGuardUDP":[51820,443],"OpenVPNTCP":[8443]},"SmartProtocol":{"OpenVPN":true,"IKEv2":false,"WireGuard":true,"WireGuardTCP":true,"WireGuardTLS":true},"ServerRefreshInterval":10}}"#;
        let raw = format!("HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{}", body);
        let factory = Arc::new(MockTunnelFactory::responding(raw.into_bytes()));
        let api = client(factory.clone());

        let config = api.client_config(None, &CancellationToken::new()).await.unwrap();

        assert_eq!(config.default_ports[&VpnProtocol::WireGuardUdp], vec![51820, 443]);
        assert_eq!(config.default_ports[&VpnProtocol::OpenVpnTcp], vec![8443]);
        assert!(!config.smart_protocol.ikev2);
        assert!(config.smart_protocol.openvpn);
        assert_eq!(config.server_refresh_interval, Some(10));

        let table = config.port_table();
        assert_eq!(table[&VpnProtocol::Ikev2], vec![500]);

        let request = &factory.recorded()[0];
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/vpn/v2/clientconfig");
        assert_eq!(request.headers.get("x-api-version").unwrap(), "3");
        assert!(!request.headers.contains("Authorization"));
    }

    #[tokio::test]
    async fn test_certificate_request_shape() {
        let response = br#"{"Code":1000,"ClientKeyFingerprint":"fp","Certificate":"-----BEGIN CERTIFICATE-----","ExpirationTime":1700086400,"RefreshTime":1700043200}"#;
        let factory = Arc::new(MockTunnelFactory::responding(http_response(200, &[], response)));
        let api = client(factory.clone());

        let key = PublicKey::from_bytes([9u8; 32]);
        let features = CertificateFeatures::default();
        let request = CertificateRequest::new(&key, &features, "laptop", "1440 min");
        let cert = api
            .certificate(&credentials(), &request, &CancellationToken::new())
            .await
            .unwrap()
            .into_certificate(&key, &features);

        assert_eq!(cert.public_key_fingerprint, "fp");
        assert_eq!(crate::epoch::to_secs(cert.valid_until), 1_700_086_400);
        assert_eq!(crate::epoch::to_secs(cert.refresh_time), 1_700_043_200);

        let sent = &factory.recorded()[0];
        assert_eq!(sent.method, "POST");
        assert_eq!(sent.target, "/vpn/v1/certificate");
        assert_eq!(sent.headers.get("Authorization").unwrap(), "Bearer access-1");
        assert_eq!(sent.headers.get("x-session-uid").unwrap(), "uid-1");
        assert_eq!(sent.headers.get("Content-Type").unwrap(), "application/json");

        let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
        assert_eq!(body["Mode"], "session");
        assert_eq!(body["DeviceName"], "laptop");
        assert_eq!(body["Duration"], "1440 min");
        assert!(body["ClientPublicKey"].as_str().unwrap().starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(body["Features"]["SplitTCP"], true);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let unauthorized = Arc::new(MockTunnelFactory::responding(http_response(401, &[], b"")));
        let result = client(unauthorized).client_config(None, &CancellationToken::new()).await;
        assert_eq!(result, Err(ApiError::Unauthorized));

        let limited = Arc::new(MockTunnelFactory::responding(http_response(429, &[("Retry-After", "30")], b"")));
        let result = client(limited).client_config(None, &CancellationToken::new()).await;
        assert_eq!(
            result,
            Err(ApiError::TooManyRequests { retry_after: Some(Duration::from_secs(30)) })
        );

        let failed = Arc::new(MockTunnelFactory::responding(http_response(
            422,
            &[],
            br#"{"Code":2001,"Error":"Invalid key"}"#,
        )));
        let result = client(failed).client_config(None, &CancellationToken::new()).await;
        assert_eq!(
            result,
            Err(ApiError::Status { status: 422, code: Some(2001), message: "Invalid key".to_string() })
        );
    }

    #[tokio::test]
    async fn test_undecodable_body() {
        let factory = Arc::new(MockTunnelFactory::responding(http_response(200, &[], b"<html>")));
        let result = client(factory).client_config(None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(ApiError::Decode(_))));
    }
}
