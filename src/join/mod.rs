//! Cluster join orchestration
//!
//! A join runs as a fixed sequence of states:
//!
//! ```text
//! Validating -> Discovering -> Negotiating -> Allocating -> CredentialIssuing
//!     -> Materializing -> Done
//! ```
//!
//! `Allocating` is skipped when globalnet is off for the cluster. Any fatal
//! error moves the run to `Failed` and aborts it; nothing is rolled back.
//! Every step is idempotent, so running the same request again completes
//! partial work and otherwise changes nothing.

pub mod negotiate;
pub mod resources;
pub mod validate;

use std::fmt;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{BrokerConnector, BrokerProvisioner};
use crate::bundle::HandshakeBundle;
use crate::crd::{JoinConfig, ServiceDiscovery, Submariner};
use crate::discovery::{failed_requirements, ClusterNetwork, NetworkDiscovery};
use crate::gateway::{ensure_gateway_node, GatewayNodes, GatewaySelection};
use crate::globalnet::AddressRegistryClient;
use crate::materializer::{replace, ApplyOutcome, DesiredObject, ResourceMaterializer};
use crate::prompt::{CidrKind, Prompter};
use crate::retry::{Clock, RetryConfig};
use crate::store::RecordKey;
use crate::{Result, GLOBALNET_RECORD_NAME};

use negotiate::{resolve_cidr, ResolvedCidr};
use resources::{service_discovery_spec, submariner_spec, ResourceInputs};

/// Name of the connectivity resource
pub const SUBMARINER_NAME: &str = "submariner";

/// Name of the service-discovery-only resource
pub const SERVICE_DISCOVERY_NAME: &str = "service-discovery";

/// Desired state of one cluster joining the fabric
#[derive(Clone, Debug, PartialEq)]
pub struct JoinRequest {
    /// Fabric-wide unique cluster ID
    pub cluster_id: String,
    /// Explicit service CIDR
    pub service_cidr: Option<String>,
    /// Explicit pod CIDR
    pub pod_cidr: Option<String>,
    /// Explicit global CIDR
    pub global_cidr: Option<String>,
    /// Whether this cluster uses global addressing
    pub globalnet_enabled: bool,
    /// Requested global addresses, 0 for the registry default
    pub requested_block_size: u64,
    /// Data-plane settings carried through to the resources
    pub settings: JoinConfig,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl JoinRequest {
    /// Derive a request from the Fabric join configuration
    pub fn from_config(config: &JoinConfig) -> Self {
        Self {
            cluster_id: config.cluster_id.trim().to_string(),
            service_cidr: non_empty(&config.service_cidr),
            pod_cidr: non_empty(&config.cluster_cidr),
            global_cidr: non_empty(&config.globalnet_cidr),
            globalnet_enabled: config.globalnet_enabled,
            requested_block_size: config.globalnet_cluster_size,
            settings: config.clone(),
        }
    }
}

/// States of a join run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinState {
    /// Checking the request
    Validating,
    /// Looking up the cluster's network
    Discovering,
    /// Settling pod and service CIDRs
    Negotiating,
    /// Reserving the global CIDR on the broker
    Allocating,
    /// Minting the cluster's broker credential
    CredentialIssuing,
    /// Writing the data-plane resources
    Materializing,
    /// Finished
    Done,
    /// Aborted on a fatal error
    Failed,
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validating => "Validating",
            Self::Discovering => "Discovering",
            Self::Negotiating => "Negotiating",
            Self::Allocating => "Allocating",
            Self::CredentialIssuing => "CredentialIssuing",
            Self::Materializing => "Materializing",
            Self::Done => "Done",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// A resource written during `Materializing`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterializedObject {
    /// `Kind namespace/name`
    pub object: String,
    /// What happened to it
    pub outcome: ApplyOutcome,
}

/// Result of a completed join
#[derive(Clone, Debug, PartialEq)]
pub struct JoinOutcome {
    /// Negotiated service CIDR
    pub service_cidr: ResolvedCidr,
    /// Negotiated pod CIDR
    pub pod_cidr: ResolvedCidr,
    /// Allocated global CIDR, `None` without globalnet
    pub global_cidr: Option<Ipv4Net>,
    /// Broker service account of this cluster
    pub service_account: String,
    /// Gateway labelling result, `None` when not attempted
    pub gateway: Option<GatewaySelection>,
    /// Resources written to the local cluster
    pub materialized: Vec<MaterializedObject>,
    /// States visited, in order
    pub transitions: Vec<JoinState>,
}

/// Bounded waits used by a join
#[derive(Clone, Debug, PartialEq)]
pub struct JoinRetries {
    /// Registry compare-and-swap
    pub registry: RetryConfig,
    /// Credential token wait
    pub credential: RetryConfig,
    /// Delete-and-recreate of the connectivity resource
    pub replace: RetryConfig,
    /// Gateway node labelling
    pub node_label: RetryConfig,
}

impl Default for JoinRetries {
    fn default() -> Self {
        Self {
            registry: RetryConfig::registry_update(),
            credential: RetryConfig::credential_wait(),
            replace: RetryConfig::resource_replace(),
            node_label: RetryConfig::node_label(),
        }
    }
}

impl JoinRetries {
    /// Same attempt counts without any delay
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            registry: RetryConfig::immediate(max_attempts),
            credential: RetryConfig::immediate(max_attempts),
            replace: RetryConfig::immediate(max_attempts),
            node_label: RetryConfig::immediate(max_attempts),
        }
    }
}

/// Collaborators of the orchestrator on the joining cluster
#[derive(Clone)]
pub struct JoinCollaborators {
    /// Network discovery
    pub discovery: Arc<dyn NetworkDiscovery>,
    /// Prompt for values nothing else resolved
    pub prompter: Arc<dyn Prompter>,
    /// Gateway node labelling
    pub gateways: Arc<dyn GatewayNodes>,
    /// Materializer for the local cluster
    pub materializer: Arc<dyn ResourceMaterializer>,
    /// Opens sessions on the broker
    pub connector: Arc<dyn BrokerConnector>,
    /// Clock for all waits
    pub clock: Arc<dyn Clock>,
}

/// Records state transitions of one run
struct Transitions {
    visited: Vec<JoinState>,
}

impl Transitions {
    fn start() -> Self {
        info!(state = %JoinState::Validating, "Join started");
        Self {
            visited: vec![JoinState::Validating],
        }
    }

    fn current(&self) -> JoinState {
        self.visited.last().copied().unwrap_or(JoinState::Validating)
    }

    fn enter(&mut self, next: JoinState) {
        info!(from = %self.current(), to = %next, "Join state transition");
        self.visited.push(next);
    }
}

/// Drives a cluster through the join sequence
pub struct JoinOrchestrator {
    collaborators: JoinCollaborators,
    operator_namespace: String,
    retries: JoinRetries,
}

impl JoinOrchestrator {
    /// Create an orchestrator writing data-plane resources to `operator_namespace`
    pub fn new(collaborators: JoinCollaborators, operator_namespace: impl Into<String>) -> Self {
        Self {
            collaborators,
            operator_namespace: operator_namespace.into(),
            retries: JoinRetries::default(),
        }
    }

    /// Override the bounded waits
    pub fn with_retries(mut self, retries: JoinRetries) -> Self {
        self.retries = retries;
        self
    }

    /// Run the join to completion or to the first fatal error
    #[instrument(skip(self, request, bundle), fields(cluster_id = %request.cluster_id))]
    pub async fn run(&self, request: &JoinRequest, bundle: &HandshakeBundle) -> Result<JoinOutcome> {
        let mut transitions = Transitions::start();
        match self.execute(request, bundle, &mut transitions).await {
            Ok(mut outcome) => {
                transitions.enter(JoinState::Done);
                outcome.transitions = transitions.visited;
                info!(
                    service_cidr = %outcome.service_cidr,
                    pod_cidr = %outcome.pod_cidr,
                    global_cidr = ?outcome.global_cidr,
                    "Cluster joined"
                );
                Ok(outcome)
            }
            Err(e) => {
                let at = transitions.current();
                transitions.enter(JoinState::Failed);
                error!(state = %at, error = %e, "Join failed");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        request: &JoinRequest,
        bundle: &HandshakeBundle,
        transitions: &mut Transitions,
    ) -> Result<JoinOutcome> {
        let c = &self.collaborators;
        let cluster_id = request.cluster_id.as_str();

        validate::validate_request(request)?;
        self.check_requirements().await?;

        transitions.enter(JoinState::Discovering);
        let network = self.discover().await;

        transitions.enter(JoinState::Negotiating);
        let service_cidr = resolve_cidr(
            cluster_id,
            CidrKind::Service,
            request.service_cidr.as_deref(),
            &network.service_cidrs,
            c.prompter.as_ref(),
        )
        .await?;
        let pod_cidr = resolve_cidr(
            cluster_id,
            CidrKind::Pod,
            request.pod_cidr.as_deref(),
            &network.pod_cidrs,
            c.prompter.as_ref(),
        )
        .await?;

        let session = c.connector.connect(bundle).await?;

        let global_cidr = if request.globalnet_enabled {
            transitions.enter(JoinState::Allocating);
            let registry = AddressRegistryClient::new(
                session.store.clone(),
                RecordKey::new(&session.namespace, GLOBALNET_RECORD_NAME),
                self.retries.registry.clone(),
                c.clock.clone(),
            );
            registry
                .update_allocation(
                    cluster_id,
                    request.requested_block_size,
                    request.global_cidr.as_deref(),
                )
                .await?
        } else {
            debug!("Globalnet disabled for this cluster");
            None
        };

        transitions.enter(JoinState::CredentialIssuing);
        let credential = BrokerProvisioner::new(
            session.materializer.clone(),
            session.secrets.clone(),
            session.namespace.clone(),
            c.clock.clone(),
        )
        .with_credential_wait(self.retries.credential.clone())
        .issue_cluster_credential(cluster_id)
        .await?;

        transitions.enter(JoinState::Materializing);
        let inputs = ResourceInputs {
            request,
            bundle,
            credential: &credential,
            operator_namespace: &self.operator_namespace,
        };
        let mut gateway = None;
        let mut materialized = Vec::new();

        if bundle.is_connectivity_enabled() {
            if request.settings.label_gateway {
                gateway = Some(
                    ensure_gateway_node(
                        c.gateways.as_ref(),
                        c.prompter.as_ref(),
                        &self.retries.node_label,
                        c.clock.as_ref(),
                    )
                    .await?,
                );
            }

            let mut submariner = Submariner::new(
                SUBMARINER_NAME,
                submariner_spec(&inputs, &service_cidr, &pod_cidr, global_cidr)?,
            );
            submariner.metadata.namespace = Some(self.operator_namespace.clone());
            let desired = DesiredObject::from_resource(&submariner)?;
            let outcome = replace(
                c.materializer.as_ref(),
                &desired,
                &self.retries.replace,
                c.clock.as_ref(),
            )
            .await?;
            info!(object = %desired, outcome = ?outcome, "Connectivity configured");
            materialized.push(MaterializedObject {
                object: desired.to_string(),
                outcome,
            });
        } else if bundle.is_service_discovery_enabled() {
            let mut discovery =
                ServiceDiscovery::new(SERVICE_DISCOVERY_NAME, service_discovery_spec(&inputs)?);
            discovery.metadata.namespace = Some(self.operator_namespace.clone());
            let desired = DesiredObject::from_resource(&discovery)?;
            let outcome = c.materializer.create_or_update(&desired).await?;
            info!(object = %desired, outcome = ?outcome, "Service discovery configured");
            materialized.push(MaterializedObject {
                object: desired.to_string(),
                outcome,
            });
        } else {
            warn!("Broker enables neither connectivity nor service discovery, nothing to deploy");
        }

        Ok(JoinOutcome {
            service_cidr,
            pod_cidr,
            global_cidr,
            service_account: credential.service_account,
            gateway,
            materialized,
            transitions: Vec::new(),
        })
    }

    /// Discovery is best effort; failures only lose the discovered values
    /// Report requirements the cluster fails to meet; only an unreadable
    /// version stops the join
    async fn check_requirements(&self) -> Result<()> {
        let version = self.collaborators.discovery.server_version().await?;
        for requirement in failed_requirements(&version)? {
            warn!(version = %version, "{}", requirement);
        }
        Ok(())
    }

    async fn discover(&self) -> ClusterNetwork {
        match self.collaborators.discovery.discover().await {
            Ok(Some(network)) => network,
            Ok(None) => {
                info!("No network details discovered");
                ClusterNetwork::default()
            }
            Err(e) => {
                warn!(error = %e, "Network discovery failed, continuing without it");
                ClusterNetwork::default()
            }
        }
    }
}
