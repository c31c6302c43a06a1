//! Fabric controller implementation
//!
//! Each pass deploys the broker (when this cluster hosts it) and then joins
//! the cluster to the broker. Both steps are idempotent, so a pass simply
//! replays them and writes the outcome into `Fabric.status`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::broker::{deploy_broker, BrokerProvisioner, KubeBrokerConnector, KubeTokenSecrets};
use crate::bundle::{self, HandshakeBundle};
use crate::crd::{Condition, ConditionStatus, Fabric, FabricPhase, FabricStatus};
use crate::discovery::KubeNetworkDiscovery;
use crate::gateway::KubeGatewayNodes;
use crate::join::{JoinCollaborators, JoinOrchestrator, JoinOutcome, JoinRequest};
use crate::materializer::KubeMaterializer;
use crate::prompt::UnattendedPrompter;
use crate::retry::TokioClock;
use crate::store::{ConfigMapStore, RecordKey, RecordStore};
use crate::{
    Error, BROKER_INFO_RECORD_NAME, DEFAULT_BROKER_NAMESPACE, DEFAULT_OPERATOR_NAMESPACE,
    FIELD_MANAGER,
};

/// Condition type reporting the broker deployment
pub const CONDITION_BROKER_READY: &str = "BrokerReady";

/// Condition type reporting the join
pub const CONDITION_JOINED: &str = "Joined";

/// Requeue interval for a healthy Fabric, replaying the idempotent steps
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Writes `Fabric.status`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FabricStatusWriter: Send + Sync {
    /// Patch the status of a Fabric
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FabricStatus,
    ) -> Result<(), Error>;
}

/// Status writer using the Kubernetes API
pub struct KubeFabricStatusWriter {
    client: Client,
}

impl KubeFabricStatusWriter {
    /// Create a writer wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FabricStatusWriter for KubeFabricStatusWriter {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FabricStatus,
    ) -> Result<(), Error> {
        let api: Api<Fabric> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }
}

/// Which roles this operator instance plays
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Roles {
    /// Deploy the broker from `spec.brokerConfig`
    pub deploy_broker: bool,
    /// Join the broker from `spec.joinConfig`
    pub join_broker: bool,
}

/// Controller context shared by all reconciliations
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .roles(Roles { deploy_broker: true, join_broker: true })
///     .broker_url(config.cluster_url.to_string())
///     .build();
/// ```
pub struct Context {
    /// Status writer (trait object for testability)
    pub status: Arc<dyn FabricStatusWriter>,
    /// Records on this cluster, where a locally deployed broker publishes
    pub records: Arc<dyn RecordStore>,
    /// Broker provisioning on this cluster
    pub provisioner: Arc<BrokerProvisioner>,
    /// Join orchestrator
    pub joiner: Arc<JoinOrchestrator>,
    /// URL joining clusters use to reach this cluster's API server
    pub broker_url: String,
    /// Roles enabled for this instance
    pub roles: Roles,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Namespace of the broker
    pub fn broker_namespace(&self) -> &str {
        self.provisioner.namespace()
    }

    /// Create a context for testing with custom collaborators
    #[cfg(test)]
    pub fn for_testing(
        status: Arc<dyn FabricStatusWriter>,
        records: Arc<dyn RecordStore>,
        provisioner: BrokerProvisioner,
        joiner: JoinOrchestrator,
        roles: Roles,
    ) -> Self {
        Self {
            status,
            records,
            provisioner: Arc::new(provisioner),
            joiner: Arc::new(joiner),
            broker_url: "https://broker.example:6443".to_string(),
            roles,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    broker_namespace: String,
    operator_namespace: String,
    broker_url: String,
    roles: Roles,
    status: Option<Arc<dyn FabricStatusWriter>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            broker_namespace: DEFAULT_BROKER_NAMESPACE.to_string(),
            operator_namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            broker_url: String::new(),
            roles: Roles::default(),
            status: None,
        }
    }

    /// Set the broker namespace
    pub fn broker_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.broker_namespace = namespace.into();
        self
    }

    /// Set the namespace the data-plane resources are written to
    pub fn operator_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.operator_namespace = namespace.into();
        self
    }

    /// Set the URL published in the handshake bundle
    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    /// Set the enabled roles
    pub fn roles(mut self, roles: Roles) -> Self {
        self.roles = roles;
        self
    }

    /// Override the status writer
    pub fn status_writer(mut self, status: Arc<dyn FabricStatusWriter>) -> Self {
        self.status = Some(status);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        let clock = Arc::new(TokioClock);
        let materializer = Arc::new(KubeMaterializer::new(client.clone(), FIELD_MANAGER));

        let provisioner = BrokerProvisioner::new(
            materializer.clone(),
            Arc::new(KubeTokenSecrets::new(client.clone())),
            self.broker_namespace,
            clock.clone(),
        );
        let joiner = JoinOrchestrator::new(
            JoinCollaborators {
                discovery: Arc::new(KubeNetworkDiscovery::new(client.clone())),
                prompter: Arc::new(UnattendedPrompter),
                gateways: Arc::new(KubeGatewayNodes::new(client.clone(), FIELD_MANAGER)),
                materializer,
                connector: Arc::new(KubeBrokerConnector::new(FIELD_MANAGER)),
                clock,
            },
            self.operator_namespace,
        );

        Context {
            status: self
                .status
                .unwrap_or_else(|| Arc::new(KubeFabricStatusWriter::new(client.clone()))),
            records: Arc::new(ConfigMapStore::new(client)),
            provisioner: Arc::new(provisioner),
            joiner: Arc::new(joiner),
            broker_url: self.broker_url,
            roles: self.roles,
        }
    }
}

/// What a successful pass did
#[derive(Debug, Default)]
struct PassSummary {
    deployed: Option<HandshakeBundle>,
    joined: Option<JoinOutcome>,
}

/// Reconcile a Fabric resource
///
/// Non-retryable failures (bad input, overlapping or invalid ranges, a
/// malformed bundle) are recorded in the status and wait for a spec change.
/// Anything else is returned to the runtime and retried.
#[instrument(skip(fabric, ctx), fields(fabric = %fabric.name_any()))]
pub async fn reconcile(fabric: Arc<Fabric>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = fabric.name_any();
    let namespace = fabric.namespace().unwrap_or_default();
    info!("reconciling fabric");

    match run_pass(&fabric, &ctx).await {
        Ok(summary) => {
            let status = running_status(&fabric, &summary);
            ctx.status.patch_status(&namespace, &name, &status).await?;
            info!(message = ?status.message, "fabric reconciled");
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        Err(e) => {
            let status = failed_status(&fabric, &e);
            if let Err(patch_err) = ctx.status.patch_status(&namespace, &name, &status).await {
                warn!(error = %patch_err, "failed to record failure in status");
            }
            if e.is_retryable() {
                Err(e)
            } else {
                warn!(error = %e, "fabric needs a spec change before it can progress");
                Ok(Action::await_change())
            }
        }
    }
}

async fn run_pass(fabric: &Fabric, ctx: &Context) -> Result<PassSummary, Error> {
    let mut summary = PassSummary::default();

    match (&fabric.spec.broker_config, ctx.roles.deploy_broker) {
        (Some(config), true) => {
            info!("deploying broker");
            let published = deploy_broker(
                &ctx.provisioner,
                ctx.records.clone(),
                config,
                &ctx.broker_url,
            )
            .await?;
            summary.deployed = Some(published);
        }
        (Some(_), false) => debug!("broker role disabled, ignoring brokerConfig"),
        (None, _) => {}
    }

    match (&fabric.spec.join_config, ctx.roles.join_broker) {
        (Some(config), true) => {
            let bundle = match &summary.deployed {
                Some(published) => published.clone(),
                None => {
                    let key = RecordKey::new(ctx.broker_namespace(), BROKER_INFO_RECORD_NAME);
                    bundle::fetch(ctx.records.as_ref(), &key).await?
                }
            };
            info!(cluster_id = %config.cluster_id, "joining cluster to broker");
            let request = JoinRequest::from_config(config);
            summary.joined = Some(ctx.joiner.run(&request, &bundle).await?);
        }
        (Some(_), false) => debug!("join role disabled, ignoring joinConfig"),
        (None, _) => {}
    }

    Ok(summary)
}

fn running_status(fabric: &Fabric, summary: &PassSummary) -> FabricStatus {
    let mut status = FabricStatus::with_phase(FabricPhase::Running);
    let mut parts = Vec::new();

    if summary.deployed.is_some() {
        parts.push("broker deployed".to_string());
        status = status.condition(Condition::new(
            CONDITION_BROKER_READY,
            ConditionStatus::True,
            "Deployed",
            "Broker resources and handshake bundle are in place",
        ));
    }
    if let Some(outcome) = &summary.joined {
        parts.push(format!("joined as {}", outcome.service_account));
        status = status.condition(Condition::new(
            CONDITION_JOINED,
            ConditionStatus::True,
            "Joined",
            format!(
                "Materialized {}",
                outcome
                    .materialized
                    .iter()
                    .map(|m| m.object.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ));
        status.global_cidr = outcome.global_cidr.map(|c| c.to_string());
        status.service_cidr = Some(outcome.service_cidr.to_string());
        status.cluster_cidr = Some(outcome.pod_cidr.to_string());
    }
    if parts.is_empty() {
        parts.push("nothing to do for the enabled roles".to_string());
    }

    status.observed_generation = fabric.metadata.generation;
    status.message(parts.join(", "))
}

fn failed_status(fabric: &Fabric, error: &Error) -> FabricStatus {
    let condition_type = if fabric.spec.join_config.is_some() {
        CONDITION_JOINED
    } else {
        CONDITION_BROKER_READY
    };
    let mut status = FabricStatus::with_phase(FabricPhase::Failed)
        .message(error.to_string())
        .condition(Condition::new(
            condition_type,
            ConditionStatus::False,
            failure_reason(error),
            error.to_string(),
        ));
    status.observed_generation = fabric.metadata.generation;
    status
}

fn failure_reason(error: &Error) -> &'static str {
    match error {
        Error::Kube { .. } => "KubernetesError",
        Error::InvalidInput { .. } => "InvalidInput",
        Error::InvalidRange { .. } => "InvalidRange",
        Error::Overlap { .. } => "Overlap",
        Error::Exhausted { .. } => "Exhausted",
        Error::Conflict { .. } => "Conflict",
        Error::Unavailable { .. } => "Unavailable",
        Error::MalformedBundle { .. } => "MalformedBundle",
        Error::DependencyFailure { .. } => "DependencyFailure",
        Error::Serialization { .. } => "Serialization",
    }
}

/// Error policy for the controller
///
/// Returned errors are all retryable; they are requeued after a short delay.
pub fn error_policy(fabric: Arc<Fabric>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        fabric = %fabric.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
