//! Network discovery
//!
//! Best-effort detection of a cluster's pod and service CIDRs. Absence of data
//! is not an error; the join falls back to explicit configuration or a prompt.
//!
//! The Kubernetes implementation reads the flags of the static control-plane
//! pods in `kube-system` (kubeadm-style clusters), then falls back to the
//! per-node pod CIDRs for the pod range.
//!
//! The API server version is read as well, so a join can report clusters
//! older than the data plane supports.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::{Error, Result};

/// Oldest Kubernetes release the data plane runs on
pub const MIN_KUBERNETES_VERSION: (u64, u64, u64) = (1, 17, 0);

const CLUSTER_CIDR_FLAG: &str = "--cluster-cidr=";
const SERVICE_CIDR_FLAG: &str = "--service-cluster-ip-range=";

/// Pod and service CIDRs of a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterNetwork {
    /// Pod CIDRs, first one is used
    pub pod_cidrs: Vec<String>,
    /// Service CIDRs, first one is used
    pub service_cidrs: Vec<String>,
}

impl ClusterNetwork {
    /// Whether nothing was discovered
    pub fn is_empty(&self) -> bool {
        self.pod_cidrs.is_empty() && self.service_cidrs.is_empty()
    }
}

/// Discovers the local cluster's network configuration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkDiscovery: Send + Sync {
    /// Discover CIDRs, `None` if nothing could be determined
    async fn discover(&self) -> Result<Option<ClusterNetwork>>;

    /// Git version of the API server, e.g. `v1.24.3`
    async fn server_version(&self) -> Result<String>;
}

/// Discovery through control-plane pod flags and node pod CIDRs
#[derive(Clone)]
pub struct KubeNetworkDiscovery {
    client: Client,
}

impl KubeNetworkDiscovery {
    /// Create a discovery over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn control_plane_args(&self, component: &str) -> Result<Vec<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), "kube-system");
        let lp = ListParams::default().labels(&format!("component={}", component));
        let list = pods.list(&lp).await?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|p| p.spec)
            .flat_map(|s| s.containers)
            .flat_map(|c| {
                let command = c.command.unwrap_or_default();
                command.into_iter().chain(c.args.unwrap_or_default())
            })
            .collect())
    }

    async fn node_pod_cidrs(&self) -> Result<Vec<String>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        let mut cidrs: Vec<String> = list
            .items
            .into_iter()
            .filter_map(|n| n.spec)
            .filter_map(|s| s.pod_cidr)
            .collect();
        cidrs.sort();
        cidrs.dedup();
        Ok(cidrs)
    }
}

#[async_trait]
impl NetworkDiscovery for KubeNetworkDiscovery {
    async fn discover(&self) -> Result<Option<ClusterNetwork>> {
        let mut args = self.control_plane_args("kube-controller-manager").await?;
        args.extend(self.control_plane_args("kube-apiserver").await?);

        let mut network = ClusterNetwork {
            pod_cidrs: flag_values(&args, CLUSTER_CIDR_FLAG),
            service_cidrs: flag_values(&args, SERVICE_CIDR_FLAG),
        };
        if network.pod_cidrs.is_empty() {
            network.pod_cidrs = self.node_pod_cidrs().await?;
        }

        debug!(
            pod_cidrs = ?network.pod_cidrs,
            service_cidrs = ?network.service_cidrs,
            "Discovered cluster network"
        );
        Ok((!network.is_empty()).then_some(network))
    }

    async fn server_version(&self) -> Result<String> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }
}

/// Requirements the cluster at `git_version` fails to meet
///
/// Build metadata and pre-release suffixes (`v1.24.3-gke.100`,
/// `v1.21.1+k3s1`) are ignored.
pub fn failed_requirements(git_version: &str) -> Result<Vec<String>> {
    let core = git_version
        .trim()
        .trim_start_matches('v')
        .split(['-', '+'])
        .next()
        .unwrap_or_default();

    let mut parts = core.split('.').map(str::parse::<u64>);
    let version = match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor)), patch) => {
            (major, minor, patch.and_then(|p| p.ok()).unwrap_or(0))
        }
        _ => {
            return Err(Error::dependency(
                "discovery",
                format!("unparseable server version {:?}", git_version),
            ))
        }
    };

    let mut failed = Vec::new();
    if version < MIN_KUBERNETES_VERSION {
        let (major, minor, patch) = MIN_KUBERNETES_VERSION;
        failed.push(format!(
            "Kubernetes {}.{}.{} or newer is required, the cluster runs {}",
            major, minor, patch, git_version
        ));
    }
    Ok(failed)
}

/// Values of `flag` (given with its trailing `=`), split on commas, deduplicated
pub fn flag_values(args: &[String], flag: &str) -> Vec<String> {
    let mut values: Vec<String> = Vec::new();
    for arg in args {
        if let Some(v) = arg.trim().strip_prefix(flag) {
            for cidr in v.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                if !values.iter().any(|existing| existing == cidr) {
                    values.push(cidr.to_string());
                }
            }
        }
    }
    values
}
