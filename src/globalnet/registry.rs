//! Address registry value type and its record encoding

use std::collections::BTreeMap;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::cidr;
use crate::store::RecordData;
use crate::{Error, Result};

/// Record key: whether global addressing is active ("true"/"false")
pub const KEY_ENABLED: &str = "globalnetEnabled";
/// Record key: supernet all cluster blocks are carved from
pub const KEY_CIDR_RANGE: &str = "globalnetCidrRange";
/// Record key: default block size in addresses
pub const KEY_CLUSTER_SIZE: &str = "globalnetClusterSize";
/// Record key: JSON list of per-cluster allocations
pub const KEY_CLUSTER_INFO: &str = "clusterinfo";

#[derive(Debug, Serialize, Deserialize)]
struct ClusterInfo {
    cluster_id: String,
    global_cidr: Vec<String>,
}

/// Fabric-wide global address assignments
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressRegistry {
    /// Whether global addressing is active fabric-wide
    pub enabled: bool,
    /// Range all cluster blocks are carved from
    pub supernet: Ipv4Net,
    /// Default number of addresses per cluster block
    pub default_block_size: u64,
    /// Allocated blocks per cluster, first entry is the primary block
    pub cluster_blocks: BTreeMap<String, Vec<Ipv4Net>>,
}

impl AddressRegistry {
    /// Create an empty registry
    pub fn new(enabled: bool, supernet: Ipv4Net, default_block_size: u64) -> Self {
        Self {
            enabled,
            supernet,
            default_block_size,
            cluster_blocks: BTreeMap::new(),
        }
    }

    /// Decode from a record
    pub fn from_record(data: &RecordData) -> Result<Self> {
        let enabled = match data.get(KEY_ENABLED).map(String::as_str) {
            Some("true") => true,
            Some("false") | None => false,
            Some(other) => {
                return Err(Error::serialization(format!(
                    "{} must be true or false, got {:?}",
                    KEY_ENABLED, other
                )))
            }
        };

        let range = data
            .get(KEY_CIDR_RANGE)
            .ok_or_else(|| Error::serialization(format!("registry is missing {}", KEY_CIDR_RANGE)))?;
        let supernet = cidr::parse_cidr(range)?;

        let default_block_size = match data.get(KEY_CLUSTER_SIZE) {
            Some(s) => s.trim().parse::<u64>().map_err(|e| {
                Error::serialization(format!("{} {:?}: {}", KEY_CLUSTER_SIZE, s, e))
            })?,
            None => 0,
        };

        let mut cluster_blocks = BTreeMap::new();
        if let Some(raw) = data.get(KEY_CLUSTER_INFO).filter(|s| !s.trim().is_empty()) {
            let infos: Vec<ClusterInfo> = serde_json::from_str(raw)
                .map_err(|e| Error::serialization(format!("{}: {}", KEY_CLUSTER_INFO, e)))?;
            for info in infos {
                let blocks = info
                    .global_cidr
                    .iter()
                    .map(|c| cidr::parse_cidr(c))
                    .collect::<Result<Vec<_>>>()?;
                cluster_blocks.insert(info.cluster_id, blocks);
            }
        }

        Ok(Self {
            enabled,
            supernet,
            default_block_size,
            cluster_blocks,
        })
    }

    /// Encode into a record, cluster entries sorted by cluster ID
    pub fn to_record(&self) -> Result<RecordData> {
        let infos: Vec<ClusterInfo> = self
            .cluster_blocks
            .iter()
            .map(|(id, blocks)| ClusterInfo {
                cluster_id: id.clone(),
                global_cidr: blocks.iter().map(ToString::to_string).collect(),
            })
            .collect();
        let info = serde_json::to_string(&infos)
            .map_err(|e| Error::serialization(format!("{}: {}", KEY_CLUSTER_INFO, e)))?;

        let mut data = RecordData::new();
        data.insert(KEY_ENABLED.to_string(), self.enabled.to_string());
        data.insert(KEY_CIDR_RANGE.to_string(), self.supernet.to_string());
        data.insert(
            KEY_CLUSTER_SIZE.to_string(),
            self.default_block_size.to_string(),
        );
        data.insert(KEY_CLUSTER_INFO.to_string(), info);
        Ok(data)
    }

    /// Primary block of a cluster
    pub fn primary_block(&self, cluster_id: &str) -> Option<Ipv4Net> {
        self.cluster_blocks
            .get(cluster_id)
            .and_then(|blocks| blocks.first().copied())
    }

    /// Make `block` the cluster's only allocation
    pub fn assign(&mut self, cluster_id: &str, block: Ipv4Net) {
        self.cluster_blocks
            .insert(cluster_id.to_string(), vec![block]);
    }

    /// All allocated blocks with their owners, in ascending address order
    pub fn allocated(&self) -> Vec<(&str, Ipv4Net)> {
        let mut all: Vec<(&str, Ipv4Net)> = self
            .cluster_blocks
            .iter()
            .flat_map(|(id, blocks)| blocks.iter().map(move |b| (id.as_str(), *b)))
            .collect();
        all.sort_by_key(|(_, b)| cidr::range(b));
        all
    }

    /// Check the registry invariants: blocks lie inside the supernet and no
    /// two clusters' blocks overlap
    pub fn validate(&self) -> Result<()> {
        let all = self.allocated();
        for (owner, block) in &all {
            if !cidr::contains(&self.supernet, block) {
                return Err(Error::invalid_range(
                    block.to_string(),
                    format!(
                        "block of cluster {} is outside supernet {}",
                        owner, self.supernet
                    ),
                ));
            }
        }
        for (i, (a_owner, a)) in all.iter().enumerate() {
            for (b_owner, b) in &all[i + 1..] {
                if a_owner != b_owner && cidr::overlaps(a, b) {
                    return Err(Error::overlap(b.to_string(), a.to_string(), *a_owner));
                }
            }
        }
        Ok(())
    }
}
