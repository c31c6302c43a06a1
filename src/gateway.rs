//! Gateway node selection
//!
//! Connectivity needs at least one node labelled as gateway. If none carries
//! the label yet, a worker node is chosen through the prompt collaborator and
//! labelled, retrying only on write conflicts.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::prompt::Prompter;
use crate::retry::{retry_with_backoff, Clock, RetryConfig};
use crate::{Error, Result};

/// Node label marking gateway nodes
pub const GATEWAY_LABEL: &str = "submariner.io/gateway";

const CONTROL_PLANE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// Result of labelling a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelOutcome {
    /// Label is in place
    Applied,
    /// The node changed concurrently, try again
    Conflict,
}

/// What [`ensure_gateway_node`] did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewaySelection {
    /// A node was already labelled
    AlreadyLabeled(String),
    /// This node was labelled now
    Labeled(String),
    /// No node was available or chosen
    NoCandidate,
}

/// Gateway label operations on the local cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayNodes: Send + Sync {
    /// Names of nodes carrying the gateway label
    async fn labeled_gateways(&self) -> Result<Vec<String>>;

    /// Names of nodes eligible as gateways (workers)
    async fn worker_nodes(&self) -> Result<Vec<String>>;

    /// Put the gateway label on `node`
    async fn label_gateway(&self, node: &str) -> Result<LabelOutcome>;
}

/// Make sure some node carries the gateway label
pub async fn ensure_gateway_node(
    nodes: &dyn GatewayNodes,
    prompter: &dyn Prompter,
    retry: &RetryConfig,
    clock: &dyn Clock,
) -> Result<GatewaySelection> {
    if let Some(existing) = nodes.labeled_gateways().await?.into_iter().next() {
        info!(node = %existing, "Gateway node already labelled");
        return Ok(GatewaySelection::AlreadyLabeled(existing));
    }

    let candidates = nodes.worker_nodes().await?;
    let Some(node) = prompter.ask_for_gateway_node(&candidates).await? else {
        warn!("No gateway node selected, connectivity will not come up until one is labelled");
        return Ok(GatewaySelection::NoCandidate);
    };
    if !candidates.contains(&node) {
        return Err(Error::invalid_input(format!(
            "gateway node {} is not a worker node of this cluster",
            node
        )));
    }

    let name = node.as_str();
    retry_with_backoff(
        retry,
        clock,
        "label gateway node",
        |e| matches!(e, Error::Conflict { .. }),
        || async move {
            match nodes.label_gateway(name).await? {
                LabelOutcome::Applied => Ok(()),
                LabelOutcome::Conflict => Err(Error::conflict(format!("node/{}", name), 1)),
            }
        },
    )
    .await?;

    info!(node = %node, "Labelled gateway node");
    Ok(GatewaySelection::Labeled(node))
}

/// Gateway label operations through the Kubernetes API
#[derive(Clone)]
pub struct KubeGatewayNodes {
    client: Client,
    field_manager: String,
}

impl KubeGatewayNodes {
    /// Create over the given client
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

fn is_control_plane(node: &Node) -> bool {
    let labels = node.labels();
    CONTROL_PLANE_LABELS.iter().any(|l| labels.contains_key(*l))
}

#[async_trait]
impl GatewayNodes for KubeGatewayNodes {
    async fn labeled_gateways(&self) -> Result<Vec<String>> {
        let lp = ListParams::default().labels(&format!("{}=true", GATEWAY_LABEL));
        Ok(self
            .api()
            .list(&lp)
            .await?
            .items
            .iter()
            .map(|n| n.name_any())
            .collect())
    }

    async fn worker_nodes(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .api()
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .filter(|n| !is_control_plane(n))
            .map(|n| n.name_any())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn label_gateway(&self, node: &str) -> Result<LabelOutcome> {
        let patch = serde_json::json!({
            "metadata": { "labels": { GATEWAY_LABEL: "true" } }
        });
        let params = PatchParams::apply(&self.field_manager);
        match self.api().patch(node, &params, &Patch::Merge(&patch)).await {
            Ok(_) => Ok(LabelOutcome::Applied),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(LabelOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }
}
