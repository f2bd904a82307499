//! Peer selection by reflection probe

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use sharemesh_net::{is_external_ip, Reflector};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info};

/// Why a candidate was not accepted
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },
    #[error("{host} did not answer within {wait:?}")]
    Timeout { host: String, wait: Duration },
    #[error("{host} reflected non-public address {ip}")]
    NotExternal { host: String, ip: IpAddr },
}

/// Picks one reachable peer out of a candidate list
pub struct PeerSelector<R> {
    reflector: R,
    local_host: String,
    production: bool,
    probe_timeout: Duration,
}

impl<R: Reflector> PeerSelector<R> {
    pub fn new(reflector: R, local_host: impl Into<String>, production: bool, probe_timeout: Duration) -> Self {
        Self {
            reflector,
            local_host: local_host.into(),
            production,
            probe_timeout,
        }
    }

    /// Probe a random candidate; if it fails, probe all the others at once
    /// and take the first that answers acceptably.
    pub async fn select(&self, candidates: &[String]) -> Option<String> {
        let candidates: Vec<&String> = candidates
            .iter()
            .filter(|host| **host != self.local_host)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let pick = rand::thread_rng().gen_range(0..candidates.len());
        let first = candidates[pick];
        match self.probe(first).await {
            Ok(()) => return Some(first.clone()),
            Err(e) => debug!("Probe failed: {}", e),
        }

        let mut pending: FuturesUnordered<_> = candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != pick)
            .map(|(_, host)| async move { self.probe(host).await.map(|()| (*host).clone()) })
            .collect();

        while let Some(result) = pending.next().await {
            match result {
                Ok(host) => return Some(host),
                Err(e) => debug!("Probe failed: {}", e),
            }
        }

        info!("No reachable peer among {} candidate(s)", candidates.len());
        None
    }

    async fn probe(&self, host: &str) -> Result<(), ProbeError> {
        let ip = timeout(self.probe_timeout, self.reflector.reflect(host))
            .await
            .map_err(|_| ProbeError::Timeout {
                host: host.to_string(),
                wait: self.probe_timeout,
            })?
            .map_err(|e| ProbeError::Unreachable {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        if self.production && !is_external_ip(ip) {
            return Err(ProbeError::NotExternal {
                host: host.to_string(),
                ip,
            });
        }
        debug!("{} reflected {}", host, ip);
        Ok(())
    }
}
