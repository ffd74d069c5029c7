//! Client Certificates
//!
//! Short-lived certificates bind the client key pair to a VPN session and
//! the features it was granted. A certificate is immutable once issued; a
//! refresh produces a new one.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Features a certificate is issued for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertificateFeatures {
    /// 0 = off, 1 = malware, 2 = malware + ads
    pub net_shield_level: u8,
    #[serde(rename = "RandomNAT")]
    pub random_nat: bool,
    pub port_forwarding: bool,
    #[serde(rename = "SplitTCP")]
    pub split_tcp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_mode: Option<bool>,
}

impl Default for CertificateFeatures {
    fn default() -> Self {
        Self {
            net_shield_level: 0,
            random_nat: true,
            port_forwarding: false,
            split_tcp: true,
            safe_mode: None,
        }
    }
}

/// An issued client certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub public_key_fingerprint: String,
    /// PEM certificate chain
    pub payload: String,
    /// Never used past this instant
    pub valid_until: SystemTime,
    /// Server-suggested time to request a new one
    pub refresh_time: SystemTime,
    pub granted_features: CertificateFeatures,
}

impl Certificate {
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        now < self.valid_until
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }

    /// Whether a refresh is due at `now`, starting `earlier_by` ahead of the
    /// refresh time
    pub fn refresh_due_at(&self, now: SystemTime, earlier_by: Duration) -> bool {
        let due = self
            .refresh_time
            .checked_sub(earlier_by)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        now >= due || !self.is_valid_at(now)
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.valid_until.duration_since(now).unwrap_or(Duration::ZERO)
    }
}
