//! Pod and service CIDR negotiation
//!
//! Precedence is explicit configuration, then discovery, then the prompt.
//! A discovered value is marked auto-detected so it stays off the
//! connectivity resource; the data plane discovers it again on its own.

use std::fmt;

use ipnet::Ipv4Net;
use tracing::{info, warn};

use super::validate::parse_network;
use crate::prompt::{CidrKind, Prompter};
use crate::Result;

/// Where a negotiated CIDR came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CidrSource {
    /// Set in the join configuration
    Explicit,
    /// Found by network discovery
    Discovered,
    /// Answered through the prompt
    Prompted,
}

/// A negotiated CIDR
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedCidr {
    /// The network
    pub cidr: Ipv4Net,
    /// How it was obtained
    pub source: CidrSource,
}

impl ResolvedCidr {
    /// Whether discovery supplied the value
    pub fn is_auto_detected(&self) -> bool {
        self.source == CidrSource::Discovered
    }

    /// The value to record on the connectivity resource, empty if the data
    /// plane should discover it itself
    pub fn recorded(&self) -> String {
        if self.is_auto_detected() {
            String::new()
        } else {
            self.cidr.to_string()
        }
    }
}

impl fmt::Display for ResolvedCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cidr)
    }
}

fn field_for(kind: CidrKind) -> &'static str {
    match kind {
        CidrKind::Pod => "spec.joinConfig.clusterCIDR",
        CidrKind::Service => "spec.joinConfig.serviceCIDR",
    }
}

/// Resolve one CIDR of the joining cluster
pub async fn resolve_cidr(
    cluster_id: &str,
    kind: CidrKind,
    explicit: Option<&str>,
    discovered: &[String],
    prompter: &dyn Prompter,
) -> Result<ResolvedCidr> {
    let field = field_for(kind);
    let first_discovered = discovered.iter().find_map(|c| c.trim().parse::<Ipv4Net>().ok());

    if let Some(value) = explicit {
        let cidr = parse_network(cluster_id, field, value)?;
        if let Some(found) = first_discovered.filter(|d| *d != cidr) {
            warn!(
                cluster_id = %cluster_id,
                kind = %kind,
                configured = %cidr,
                discovered = %found,
                "Configured CIDR does not match the discovered one, using the configured value"
            );
        }
        return Ok(ResolvedCidr {
            cidr,
            source: CidrSource::Explicit,
        });
    }

    if let Some(cidr) = first_discovered {
        info!(cluster_id = %cluster_id, kind = %kind, cidr = %cidr, "Using discovered CIDR");
        return Ok(ResolvedCidr {
            cidr,
            source: CidrSource::Discovered,
        });
    }

    let answer = prompter.ask_for_cidr(kind).await?;
    let cidr = parse_network(cluster_id, field, &answer)?;
    info!(cluster_id = %cluster_id, kind = %kind, cidr = %cidr, "Using prompted CIDR");
    Ok(ResolvedCidr {
        cidr,
        source: CidrSource::Prompted,
    })
}
