//! Replica-set primary discovery.
//!
//! Discovery walks the known server list in order, asking each candidate
//! over a short-lived probe connection whether it is the writable primary,
//! and merges the replica hosts each candidate reports into the list.
//! Probes never borrow pooled connections, so discovery cannot deadlock
//! against pool acquisition.

use std::time::Duration;

use async_trait::async_trait;
use bson::doc;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::connection::RawConnection;
use crate::core::EndPoint;
use crate::error::DriverError;

/// What a candidate reported about itself.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    /// The candidate claims to be the writable primary.
    pub is_primary: bool,
    /// Replica-set members the candidate knows about.
    pub hosts: Vec<EndPoint>,
}

/// Asks a single endpoint whether it is the writable primary.
///
/// Production code uses [`WireProbe`]; tests swap in scripted probes.
#[async_trait]
pub trait PrimaryProbe: Send + Sync {
    async fn probe(&self, endpoint: &EndPoint) -> Result<ProbeReport, DriverError>;
}

/// Probe that opens a disposable wire connection and runs `ismaster`.
pub struct WireProbe {
    connect_timeout: Duration,
}

impl WireProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[derive(Debug, Deserialize)]
struct IsMasterResponse {
    #[serde(default)]
    ismaster: bool,
    #[serde(default)]
    hosts: Vec<String>,
}

#[async_trait]
impl PrimaryProbe for WireProbe {
    async fn probe(&self, endpoint: &EndPoint) -> Result<ProbeReport, DriverError> {
        let connection = RawConnection::open(endpoint.clone(), self.connect_timeout).await?;

        let response: Result<IsMasterResponse, DriverError> =
            connection.send_command("admin", &doc! { "ismaster": 1i32 }).await;
        connection.shutdown().await;
        let response = response?;

        let mut hosts = Vec::with_capacity(response.hosts.len());
        for host in &response.hosts {
            match EndPoint::parse(host) {
                Ok(endpoint) => hosts.push(endpoint),
                Err(e) => warn!("Ignoring unparseable replica host '{}': {}", host, e),
            }
        }

        Ok(ProbeReport {
            is_primary: response.ismaster,
            hosts,
        })
    }
}

/// Probe `servers` in order and return the primary endpoint.
///
/// The list grows in place with newly reported hosts (deduplicated by
/// endpoint), so members learned mid-walk get probed too. Per-candidate
/// failures are expected in a partially reachable topology and only logged.
///
/// When no candidate confirmed itself primary: a final list of at most one
/// entry is accepted as primary anyway (a standalone server has no replica
/// status to report), while a multi-server list fails with
/// [`DriverError::NoPrimaryFound`].
pub async fn discover_primary(
    probe: &dyn PrimaryProbe,
    servers: &mut Vec<EndPoint>,
) -> Result<EndPoint, DriverError> {
    let mut index = 0;
    while index < servers.len() {
        let candidate = servers[index].clone();
        index += 1;

        let report = match probe.probe(&candidate).await {
            Ok(report) => report,
            Err(e) => {
                debug!("Primary probe of {} failed: {}", candidate, e);
                continue;
            }
        };

        for host in report.hosts {
            if !servers.contains(&host) {
                servers.push(host);
            }
        }

        if report.is_primary {
            debug!("Discovered primary at {}", candidate);
            return Ok(candidate);
        }
    }

    if servers.len() <= 1 {
        if let Some(single) = servers.first() {
            debug!(
                "Accepting single known server {} as primary without confirmation",
                single
            );
            return Ok(single.clone());
        }
    }

    Err(DriverError::NoPrimaryFound)
}
