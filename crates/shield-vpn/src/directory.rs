//! Server Directory
//!
//! Supplies server descriptors and their protocol candidate lists by id.

use crate::api::ClientConfig;
use crate::config::SessionConfig;
use crate::protocol::{PortTable, ProtocolCandidate, ProtocolFlags, ServerDescriptor, VpnProtocol};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::info;

/// Source of servers and candidates
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    async fn server(&self, id: &str) -> Option<ServerDescriptor>;

    /// Candidates for one attempt, in declaration order
    async fn candidates(&self, server: &ServerDescriptor) -> Vec<ProtocolCandidate>;
}

struct Policy {
    ports: PortTable,
    flags: ProtocolFlags,
}

/// Directory backed by the configured server list
pub struct StaticDirectory {
    servers: HashMap<String, ServerDescriptor>,
    policy: RwLock<Policy>,
}

impl StaticDirectory {
    pub fn new(servers: Vec<ServerDescriptor>, ports: PortTable, flags: ProtocolFlags) -> Self {
        Self {
            servers: servers.into_iter().map(|s| (s.id.clone(), s)).collect(),
            policy: RwLock::new(Policy { ports, flags }),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.servers.clone(),
            config.smart_protocol.default_ports.clone(),
            config.smart_protocol.enabled,
        )
    }

    /// Adopt ports and protocol flags pushed by the API
    pub fn apply_client_config(&self, config: &ClientConfig) {
        let mut policy = match self.policy.write() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        policy.ports = config.port_table();
        policy.flags = config.smart_protocol;
        info!("Applied client config ({} protocols with ports)", policy.ports.len());
    }
}

#[async_trait]
impl ServerDirectory for StaticDirectory {
    async fn server(&self, id: &str) -> Option<ServerDescriptor> {
        self.servers.get(id).cloned()
    }

    async fn candidates(&self, server: &ServerDescriptor) -> Vec<ProtocolCandidate> {
        let policy = match self.policy.read() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        server.candidates(VpnProtocol::all(), &policy.ports, &policy.flags)
    }
}
