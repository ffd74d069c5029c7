//! Protocol Availability Resolver
//!
//! Probes every candidate concurrently and reports a result for each one, in
//! declaration order. Choosing a winner is a separate, pure step driven by a
//! static priority list, so probe completion order never affects the choice.
//!
//! Within a candidate every port is probed concurrently under the same
//! deadline; the candidate is available if any port answered in time.

use crate::probe::Prober;
use crate::protocol::{AvailabilityResult, ProtocolCandidate, ProtocolChoice, ServerDescriptor, VpnProtocol};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Result for one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateResult {
    pub candidate: ProtocolCandidate,
    /// Address that was probed
    pub ip: IpAddr,
    pub result: AvailabilityResult,
}

/// Concurrent smart-protocol resolver
pub struct ProtocolAvailabilityResolver {
    prober: Arc<dyn Prober>,
    timeout: Duration,
}

impl ProtocolAvailabilityResolver {
    pub fn new(prober: Arc<dyn Prober>, timeout: Duration) -> Self {
        Self { prober, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe all candidates; one result per candidate, in input order
    pub async fn resolve(&self, server: &ServerDescriptor, candidates: &[ProtocolCandidate]) -> Vec<CandidateResult> {
        let mut results: Vec<Option<AvailabilityResult>> = vec![None; candidates.len()];
        let mut tasks = JoinSet::new();

        for (index, candidate) in candidates.iter().enumerate() {
            let ports = candidate.effective_ports().to_vec();
            if ports.is_empty() {
                debug!("{} has no ports configured, skipping probe", candidate.protocol);
                results[index] = Some(AvailabilityResult::Unavailable);
                continue;
            }

            let prober = self.prober.clone();
            let server = server.clone();
            let protocol = candidate.protocol;
            let ip = candidate.effective_ip(&server);
            let timeout = self.timeout;

            tasks.spawn(async move {
                let result = probe_ports(prober, server, protocol, ip, ports, timeout).await;
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }

        candidates
            .iter()
            .zip(results)
            .map(|(candidate, result)| {
                let result = result.unwrap_or(AvailabilityResult::Unavailable);
                debug!("{} -> {:?}", candidate.protocol, result);
                CandidateResult {
                    candidate: candidate.clone(),
                    ip: candidate.effective_ip(server),
                    result,
                }
            })
            .collect()
    }

    /// Probe and pick the best available candidate by `priority`
    pub async fn resolve_best(
        &self,
        server: &ServerDescriptor,
        candidates: &[ProtocolCandidate],
        priority: &[VpnProtocol],
    ) -> Option<ProtocolChoice> {
        let results = self.resolve(server, candidates).await;
        let choice = choose(&results, priority);
        match &choice {
            Some(c) => info!("Smart protocol chose {} on {}:{}", c.protocol, c.ip, c.port),
            None => warn!("No protocol available for server {}", server.id),
        }
        choice
    }
}

/// Pick the available candidate whose protocol ranks first in `priority`.
///
/// Protocols missing from `priority` rank after all listed ones; ties go to
/// declaration order.
pub fn choose(results: &[CandidateResult], priority: &[VpnProtocol]) -> Option<ProtocolChoice> {
    let rank = |protocol: VpnProtocol| {
        priority
            .iter()
            .position(|p| *p == protocol)
            .unwrap_or(priority.len())
    };

    results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.result.is_available())
        .min_by_key(|(index, r)| (rank(r.candidate.protocol), *index))
        .and_then(|(_, r)| {
            let ports = r.result.ports().to_vec();
            let port = *ports.first()?;
            Some(ProtocolChoice {
                protocol: r.candidate.protocol,
                ip: r.ip,
                port,
                ports,
            })
        })
}

async fn probe_ports(
    prober: Arc<dyn Prober>,
    server: ServerDescriptor,
    protocol: VpnProtocol,
    ip: IpAddr,
    ports: Vec<u16>,
    timeout: Duration,
) -> AvailabilityResult {
    let server = Arc::new(server);
    let mut tasks = JoinSet::new();

    for (index, port) in ports.iter().copied().enumerate() {
        let prober = prober.clone();
        let server = server.clone();
        tasks.spawn(async move {
            let ok = tokio::time::timeout(timeout, prober.probe(&server, protocol, ip, port))
                .await
                .unwrap_or(false);
            (index, ok)
        });
    }

    let mut responded = vec![false; ports.len()];
    while let Some(joined) = tasks.join_next().await {
        if let Ok((index, true)) = joined {
            responded[index] = true;
        }
    }

    let available: Vec<u16> = ports
        .iter()
        .zip(responded)
        .filter_map(|(port, ok)| ok.then_some(*port))
        .collect();

    if available.is_empty() {
        AvailabilityResult::Unavailable
    } else {
        AvailabilityResult::Available(available)
    }
}
