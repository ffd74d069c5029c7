//! VPN Protocols and Candidates
//!
//! The wire protocols a server can be reached with, the server descriptors
//! the directory hands out, and the per-attempt candidate list the resolver
//! probes.
//!
//! # Protocols
//!
//! | API name | Transport | Default ports |
//! |----------|-----------|---------------|
//! | WireGuardUDP | UDP | 51820, 443, 88, 1224 |
//! | WireGuardTCP | TCP | 443 |
//! | WireGuardTLS | TLS | 443 |
//! | OpenVPNUDP | UDP | 80, 51820, 4569, 1194, 5060 |
//! | OpenVPNTCP | TCP | 443, 7770, 8443 |
//! | IKEv2 | UDP | 500 |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// VPN wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VpnProtocol {
    #[serde(rename = "WireGuardUDP")]
    WireGuardUdp,
    #[serde(rename = "WireGuardTCP")]
    WireGuardTcp,
    #[serde(rename = "WireGuardTLS")]
    WireGuardTls,
    #[serde(rename = "OpenVPNUDP")]
    OpenVpnUdp,
    #[serde(rename = "OpenVPNTCP")]
    OpenVpnTcp,
    #[serde(rename = "IKEv2")]
    Ikev2,
}

/// Transport a protocol rides on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

impl VpnProtocol {
    pub fn all() -> &'static [VpnProtocol] {
        &[
            VpnProtocol::WireGuardUdp,
            VpnProtocol::WireGuardTcp,
            VpnProtocol::WireGuardTls,
            VpnProtocol::OpenVpnUdp,
            VpnProtocol::OpenVpnTcp,
            VpnProtocol::Ikev2,
        ]
    }

    /// Name used by the API and in configuration files
    pub fn api_name(&self) -> &'static str {
        match self {
            VpnProtocol::WireGuardUdp => "WireGuardUDP",
            VpnProtocol::WireGuardTcp => "WireGuardTCP",
            VpnProtocol::WireGuardTls => "WireGuardTLS",
            VpnProtocol::OpenVpnUdp => "OpenVPNUDP",
            VpnProtocol::OpenVpnTcp => "OpenVPNTCP",
            VpnProtocol::Ikev2 => "IKEv2",
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            VpnProtocol::WireGuardUdp | VpnProtocol::OpenVpnUdp | VpnProtocol::Ikev2 => Transport::Udp,
            VpnProtocol::WireGuardTcp | VpnProtocol::OpenVpnTcp => Transport::Tcp,
            VpnProtocol::WireGuardTls => Transport::Tls,
        }
    }

    pub fn is_wireguard(&self) -> bool {
        matches!(
            self,
            VpnProtocol::WireGuardUdp | VpnProtocol::WireGuardTcp | VpnProtocol::WireGuardTls
        )
    }

    pub fn is_openvpn(&self) -> bool {
        matches!(self, VpnProtocol::OpenVpnUdp | VpnProtocol::OpenVpnTcp)
    }

    pub fn default_ports(&self) -> Vec<u16> {
        match self {
            VpnProtocol::WireGuardUdp => vec![51820, 443, 88, 1224],
            VpnProtocol::WireGuardTcp => vec![443],
            VpnProtocol::WireGuardTls => vec![443],
            VpnProtocol::OpenVpnUdp => vec![80, 51820, 4569, 1194, 5060],
            VpnProtocol::OpenVpnTcp => vec![443, 7770, 8443],
            VpnProtocol::Ikev2 => vec![500],
        }
    }
}

impl fmt::Display for VpnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

impl FromStr for VpnProtocol {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VpnProtocol::all()
            .iter()
            .copied()
            .find(|p| p.api_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ProtocolError::UnknownProtocol(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),
}

/// Default port table
pub type PortTable = BTreeMap<VpnProtocol, Vec<u16>>;

pub fn default_port_table() -> PortTable {
    VpnProtocol::all()
        .iter()
        .map(|p| (*p, p.default_ports()))
        .collect()
}

/// Which protocol families smart protocol may pick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolFlags {
    #[serde(alias = "OpenVPN")]
    pub openvpn: bool,
    #[serde(alias = "WireGuard")]
    pub wireguard: bool,
    #[serde(alias = "WireGuardTCP")]
    pub wireguard_tcp: bool,
    #[serde(alias = "WireGuardTLS")]
    pub wireguard_tls: bool,
    #[serde(alias = "IKEv2")]
    pub ikev2: bool,
}

impl Default for ProtocolFlags {
    fn default() -> Self {
        Self {
            openvpn: true,
            wireguard: true,
            wireguard_tcp: true,
            wireguard_tls: true,
            ikev2: true,
        }
    }
}

impl ProtocolFlags {
    pub fn allows(&self, protocol: VpnProtocol) -> bool {
        match protocol {
            VpnProtocol::WireGuardUdp => self.wireguard,
            VpnProtocol::WireGuardTcp => self.wireguard && self.wireguard_tcp,
            VpnProtocol::WireGuardTls => self.wireguard && self.wireguard_tls,
            VpnProtocol::OpenVpnUdp | VpnProtocol::OpenVpnTcp => self.openvpn,
            VpnProtocol::Ikev2 => self.ikev2,
        }
    }
}

/// Server status as reported by the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Online,
    Maintenance,
}

/// Per-server replacement of the entry address and ports for one protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOverride {
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// A server as known to the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub entry_ip: IpAddr,
    /// TLS server name / hostname of the server
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub status: ServerStatus,
    /// Base64 X25519 public key of the server
    #[serde(default)]
    pub x25519_public_key: Option<String>,
    /// Protocols this server speaks; empty means all
    #[serde(default)]
    pub protocols: Vec<VpnProtocol>,
    #[serde(default)]
    pub overrides: BTreeMap<VpnProtocol, PortOverride>,
}

impl ServerDescriptor {
    pub fn new(id: impl Into<String>, entry_ip: IpAddr) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            entry_ip,
            domain: String::new(),
            status: ServerStatus::Online,
            x25519_public_key: None,
            protocols: Vec::new(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn supports(&self, protocol: VpnProtocol) -> bool {
        self.protocols.is_empty() || self.protocols.contains(&protocol)
    }

    pub fn is_under_maintenance(&self) -> bool {
        self.status == ServerStatus::Maintenance
    }

    /// Build the ordered candidate list for one connection attempt.
    ///
    /// Order follows `order`; protocols the server does not speak or `flags`
    /// disable are left out. Ports come from `ports`, and a server override
    /// is attached when present.
    pub fn candidates(
        &self,
        order: &[VpnProtocol],
        ports: &PortTable,
        flags: &ProtocolFlags,
    ) -> Vec<ProtocolCandidate> {
        order
            .iter()
            .copied()
            .filter(|p| self.supports(*p) && flags.allows(*p))
            .map(|p| ProtocolCandidate {
                protocol: p,
                ports: ports.get(&p).cloned().unwrap_or_default(),
                server_override: self.overrides.get(&p).cloned(),
            })
            .collect()
    }
}

/// One protocol and the ports it may be reached on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolCandidate {
    pub protocol: VpnProtocol,
    pub ports: Vec<u16>,
    pub server_override: Option<PortOverride>,
}

impl ProtocolCandidate {
    pub fn new(protocol: VpnProtocol, ports: Vec<u16>) -> Self {
        Self {
            protocol,
            ports,
            server_override: None,
        }
    }

    pub fn with_override(mut self, server_override: PortOverride) -> Self {
        self.server_override = Some(server_override);
        self
    }

    /// Ports to probe: the override's when it lists any
    pub fn effective_ports(&self) -> &[u16] {
        match &self.server_override {
            Some(o) if !o.ports.is_empty() => &o.ports,
            _ => &self.ports,
        }
    }

    /// Address to probe
    pub fn effective_ip(&self, server: &ServerDescriptor) -> IpAddr {
        self.server_override
            .as_ref()
            .and_then(|o| o.ip)
            .unwrap_or(server.entry_ip)
    }
}

/// Outcome of probing one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityResult {
    /// Responding ports, in configured order; never empty
    Available(Vec<u16>),
    Unavailable,
}

impl AvailabilityResult {
    pub fn is_available(&self) -> bool {
        matches!(self, AvailabilityResult::Available(_))
    }

    pub fn ports(&self) -> &[u16] {
        match self {
            AvailabilityResult::Available(ports) => ports,
            AvailabilityResult::Unavailable => &[],
        }
    }
}

/// The protocol and port an attempt settled on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolChoice {
    pub protocol: VpnProtocol,
    pub ip: IpAddr,
    pub port: u16,
    /// Every port that answered, first one is `port`
    pub ports: Vec<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_api_names() {
        let json = serde_json::to_string(&VpnProtocol::WireGuardTls).unwrap();
        assert_eq!(json, "\"WireGuardTLS\"");

        let parsed: VpnProtocol = serde_json::from_str("\"OpenVPNUDP\"").unwrap();
        assert_eq!(parsed, VpnProtocol::OpenVpnUdp);

        assert_eq!("ikev2".parse::<VpnProtocol>().unwrap(), VpnProtocol::Ikev2);
        assert!("pptp".parse::<VpnProtocol>().is_err());
    }

    #[test]
    fn test_candidates_respect_support_and_flags() {
        let mut server = ServerDescriptor::new("CH#1", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        server.protocols = vec![VpnProtocol::WireGuardUdp, VpnProtocol::WireGuardTcp, VpnProtocol::OpenVpnUdp];
        server.overrides.insert(
            VpnProtocol::WireGuardUdp,
            PortOverride {
                ip: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))),
                ports: vec![9999],
            },
        );

        let flags = ProtocolFlags {
            openvpn: false,
            ..ProtocolFlags::default()
        };
        let candidates = server.candidates(VpnProtocol::all(), &default_port_table(), &flags);

        let protocols: Vec<_> = candidates.iter().map(|c| c.protocol).collect();
        assert_eq!(protocols, vec![VpnProtocol::WireGuardUdp, VpnProtocol::WireGuardTcp]);

        assert_eq!(candidates[0].effective_ports(), &[9999]);
        assert_eq!(candidates[0].effective_ip(&server), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(candidates[1].effective_ports(), &[443]);
        assert_eq!(candidates[1].effective_ip(&server), server.entry_ip);
    }

    #[test]
    fn test_wireguard_flag_gates_variants() {
        let flags = ProtocolFlags {
            wireguard: false,
            ..ProtocolFlags::default()
        };
        assert!(!flags.allows(VpnProtocol::WireGuardTls));
        assert!(flags.allows(VpnProtocol::Ikev2));
    }
}
