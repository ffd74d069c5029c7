//! Session Configuration
//!
//! Everything the session layer needs to know before connecting: where the
//! API lives, how smart protocol probes, how patient the state machine is,
//! and the static server list.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Durations are written in seconds.
//!
//! ```toml
//! [api]
//! base_url = "https://api.shieldvpn.example"
//!
//! [smart_protocol]
//! probe_timeout_secs = 3
//! priority = ["WireGuardUDP", "WireGuardTCP", "OpenVPNUDP"]
//!
//! [[servers]]
//! id = "CH#1"
//! entry_ip = "185.159.157.1"
//! domain = "ch-01.shieldvpn.example"
//! ```

use crate::protocol::{PortTable, ProtocolFlags, ServerDescriptor, VpnProtocol, default_port_table};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// API endpoint paths, relative to `base_url`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPaths {
    pub certificate: String,
    pub session_refresh: String,
    pub token_refresh: String,
    pub client_config: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            certificate: "vpn/v1/certificate".to_string(),
            session_refresh: "auth/v4/sessions/refresh".to_string(),
            token_refresh: "auth/v4/refresh".to_string(),
            client_config: "vpn/v2/clientconfig".to_string(),
        }
    }
}

/// Control-plane API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Cap on a single response (head + body)
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,
    #[serde(default)]
    pub endpoints: EndpointPaths,
}

fn default_base_url() -> String {
    "https://api.shieldvpn.example".to_string()
}

fn default_app_version() -> String {
    format!("linux-shield@{}", env!("CARGO_PKG_VERSION"))
}

fn default_user_agent() -> String {
    format!("ShieldVPN/{} (Linux)", env!("CARGO_PKG_VERSION"))
}

fn default_api_version() -> String {
    "3".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_response_size() -> usize {
    16 * 1024
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            app_version: default_app_version(),
            user_agent: default_user_agent(),
            api_version: default_api_version(),
            request_timeout_secs: default_request_timeout(),
            max_response_size: default_max_response_size(),
            endpoints: EndpointPaths::default(),
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Absolute URL for an endpoint path
    pub fn url_for(&self, path: &str) -> Result<Url, ConfigError> {
        let joined = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|_| ConfigError::InvalidUrl(joined))
    }
}

/// Smart protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartProtocolConfig {
    /// Per-candidate probe deadline
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Preference order; the first available protocol in this list wins
    #[serde(default = "default_priority")]
    pub priority: Vec<VpnProtocol>,
    #[serde(default)]
    pub enabled: ProtocolFlags,
    #[serde(default = "default_port_table")]
    pub default_ports: PortTable,
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_priority() -> Vec<VpnProtocol> {
    VpnProtocol::all().to_vec()
}

impl Default for SmartProtocolConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
            priority: default_priority(),
            enabled: ProtocolFlags::default(),
            default_ports: default_port_table(),
        }
    }
}

impl SmartProtocolConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Connection attempt tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Max time without progress in Establishing/Authenticating
    #[serde(default = "default_watchdog_deadline")]
    pub watchdog_deadline_secs: u64,
    /// Certificate attempts per connection when the API is unreachable
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub retry_backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap")]
    pub retry_backoff_cap_secs: u64,
    /// Requested certificate lifetime, in the API's duration syntax
    #[serde(default = "default_certificate_duration")]
    pub certificate_duration: String,
    #[serde(default = "default_refresh_check_interval")]
    pub refresh_check_interval_secs: u64,
    /// Refresh this long before the certificate's refresh time
    #[serde(default = "default_refresh_earlier_by")]
    pub refresh_earlier_by_secs: u64,
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

fn default_watchdog_deadline() -> u64 {
    30
}

fn default_max_auth_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    1
}

fn default_backoff_cap() -> u64 {
    8
}

fn default_certificate_duration() -> String {
    "1440 min".to_string()
}

fn default_refresh_check_interval() -> u64 {
    2 * 60
}

fn default_refresh_earlier_by() -> u64 {
    3 * 60
}

fn default_device_name() -> String {
    "shield-linux".to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            watchdog_deadline_secs: default_watchdog_deadline(),
            max_auth_attempts: default_max_auth_attempts(),
            retry_backoff_base_secs: default_backoff_base(),
            retry_backoff_cap_secs: default_backoff_cap(),
            certificate_duration: default_certificate_duration(),
            refresh_check_interval_secs: default_refresh_check_interval(),
            refresh_earlier_by_secs: default_refresh_earlier_by(),
            device_name: default_device_name(),
        }
    }
}

impl SessionSettings {
    pub fn watchdog_deadline(&self) -> Duration {
        Duration::from_secs(self.watchdog_deadline_secs)
    }

    pub fn refresh_check_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_check_interval_secs)
    }

    pub fn refresh_earlier_by(&self) -> Duration {
        Duration::from_secs(self.refresh_earlier_by_secs)
    }

    /// Backoff before retry number `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let secs = self
            .retry_backoff_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.retry_backoff_cap_secs);
        Duration::from_secs(secs)
    }
}

/// Complete session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub smart_protocol: SmartProtocolConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    /// Where the binary keeps credentials
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
}

impl SessionConfig {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_toml_file(path),
        }
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = Url::parse(&self.api.base_url)
            .map_err(|_| ConfigError::InvalidUrl(self.api.base_url.clone()))?;
        if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
            return Err(ConfigError::InvalidUrl(self.api.base_url.clone()));
        }

        if self.api.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("api.request_timeout_secs"));
        }
        if self.api.max_response_size < 1024 {
            return Err(ConfigError::ResponseLimitTooLow);
        }
        if self.smart_protocol.probe_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("smart_protocol.probe_timeout_secs"));
        }
        if self.session.watchdog_deadline_secs == 0 {
            return Err(ConfigError::ZeroDuration("session.watchdog_deadline_secs"));
        }
        if self.session.refresh_check_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration("session.refresh_check_interval_secs"));
        }
        if self.session.max_auth_attempts == 0 {
            return Err(ConfigError::NoAuthAttempts);
        }

        let mut seen = HashSet::new();
        for protocol in &self.smart_protocol.priority {
            if !seen.insert(*protocol) {
                return Err(ConfigError::DuplicatePriority(*protocol));
            }
        }

        let mut ids = HashSet::new();
        for server in &self.servers {
            if server.id.is_empty() {
                return Err(ConfigError::InvalidServer("empty id".to_string()));
            }
            if !ids.insert(server.id.as_str()) {
                return Err(ConfigError::InvalidServer(format!("duplicate id {}", server.id)));
            }
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("Response size limit too low (minimum 1KB)")]
    ResponseLimitTooLow,

    #[error("At least one certificate attempt is required")]
    NoAuthAttempts,

    #[error("Protocol {0} listed twice in priority")]
    DuplicatePriority(VpnProtocol),

    #[error("Invalid server entry: {0}")]
    InvalidServer(String),
}
