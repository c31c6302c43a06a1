//! Broker and member clusters sharing one in-memory record store
//!
//! Drives the public API the way the controller does: deploy a broker,
//! publish its bundle, then join several clusters against it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use parking_lot::Mutex;
use serde_json::Value;

use fabric::broker::{
    deploy_broker, BrokerConnector, BrokerProvisioner, BrokerSession, TokenSecrets,
};
use fabric::bundle::{self, HandshakeBundle};
use fabric::crd::{BrokerConfig, JoinConfig};
use fabric::discovery::{ClusterNetwork, NetworkDiscovery};
use fabric::gateway::{GatewayNodes, LabelOutcome};
use fabric::globalnet::{AddressRegistry, AddressRegistryClient};
use fabric::join::{JoinCollaborators, JoinOrchestrator, JoinRequest, JoinRetries, JoinState};
use fabric::materializer::{is_current, ApplyOutcome, DesiredObject, ResourceMaterializer};
use fabric::prompt::UnattendedPrompter;
use fabric::retry::{ManualClock, RetryConfig};
use fabric::store::{CreateOutcome, MemoryStore, RecordKey, RecordStore};
use fabric::{Error, Result, BROKER_INFO_RECORD_NAME, GLOBALNET_RECORD_NAME};

const BROKER_NS: &str = "submariner-k8s-broker";

fn net(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

/// Objects of one cluster, keyed by `Kind namespace/name`
#[derive(Default)]
struct FakeCluster {
    specs: Mutex<BTreeMap<String, Value>>,
}

#[async_trait]
impl ResourceMaterializer for FakeCluster {
    async fn create_or_update(&self, desired: &DesiredObject) -> Result<ApplyOutcome> {
        let want = desired.body.clone();
        let mut specs = self.specs.lock();
        let outcome = match specs.get(&desired.to_string()) {
            Some(have) if is_current(&want, have) => ApplyOutcome::Unchanged,
            Some(_) => ApplyOutcome::Updated,
            None => ApplyOutcome::Created,
        };
        specs.insert(desired.to_string(), want);
        Ok(outcome)
    }

    async fn create(&self, desired: &DesiredObject) -> Result<CreateOutcome> {
        let mut specs = self.specs.lock();
        if specs.contains_key(&desired.to_string()) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        specs.insert(desired.to_string(), desired.body.clone());
        Ok(CreateOutcome::Created)
    }

    async fn delete(&self, desired: &DesiredObject) -> Result<()> {
        self.specs.lock().remove(&desired.to_string());
        Ok(())
    }

    async fn get_spec(&self, desired: &DesiredObject) -> Result<Option<Value>> {
        Ok(self
            .specs
            .lock()
            .get(&desired.to_string())
            .and_then(|body| body.get("spec").cloned()))
    }
}

/// Every service account has a token as soon as it is asked for
struct InstantTokens;

#[async_trait]
impl TokenSecrets for InstantTokens {
    async fn token_secret(&self, namespace: &str, service_account: &str) -> Result<Option<Secret>> {
        Ok(Some(Secret {
            data: Some(BTreeMap::from([
                (
                    "token".to_string(),
                    ByteString(format!("{}-token", service_account).into_bytes()),
                ),
                ("ca.crt".to_string(), ByteString(b"PEM".to_vec())),
                (
                    "namespace".to_string(),
                    ByteString(namespace.as_bytes().to_vec()),
                ),
            ])),
            ..Default::default()
        }))
    }
}

struct LocalBroker {
    session: BrokerSession,
}

#[async_trait]
impl BrokerConnector for LocalBroker {
    async fn connect(&self, _bundle: &HandshakeBundle) -> Result<BrokerSession> {
        Ok(self.session.clone())
    }
}

struct StaticNetwork;

#[async_trait]
impl NetworkDiscovery for StaticNetwork {
    async fn discover(&self) -> Result<Option<ClusterNetwork>> {
        Ok(Some(ClusterNetwork {
            pod_cidrs: vec!["10.244.0.0/16".into()],
            service_cidrs: vec!["10.96.0.0/12".into()],
        }))
    }

    async fn server_version(&self) -> Result<String> {
        Ok("v1.24.3".into())
    }
}

/// A single worker that gets labelled on first request
#[derive(Default)]
struct OneWorker {
    labeled: Mutex<Option<String>>,
}

#[async_trait]
impl GatewayNodes for OneWorker {
    async fn labeled_gateways(&self) -> Result<Vec<String>> {
        Ok(self.labeled.lock().iter().cloned().collect())
    }

    async fn worker_nodes(&self) -> Result<Vec<String>> {
        Ok(vec!["worker-1".into()])
    }

    async fn label_gateway(&self, node: &str) -> Result<LabelOutcome> {
        *self.labeled.lock() = Some(node.to_string());
        Ok(LabelOutcome::Applied)
    }
}

struct Overlay {
    store: MemoryStore,
    broker: Arc<FakeCluster>,
    bundle: HandshakeBundle,
}

impl Overlay {
    async fn deploy() -> Self {
        let store = MemoryStore::new();
        let broker = Arc::new(FakeCluster::default());
        let provisioner = BrokerProvisioner::new(
            broker.clone(),
            Arc::new(InstantTokens),
            BROKER_NS,
            Arc::new(ManualClock::new()),
        );
        let config = BrokerConfig {
            globalnet_enable: true,
            ..Default::default()
        };
        deploy_broker(
            &provisioner,
            Arc::new(store.clone()),
            &config,
            "https://broker.example:6443",
        )
        .await
        .unwrap();

        let bundle = bundle::fetch(&store, &RecordKey::new(BROKER_NS, BROKER_INFO_RECORD_NAME))
            .await
            .unwrap();
        Self {
            store,
            broker,
            bundle,
        }
    }

    /// Orchestrator for one member cluster
    fn member(&self, local: Arc<FakeCluster>) -> JoinOrchestrator {
        let session = BrokerSession {
            store: Arc::new(self.store.clone()),
            materializer: self.broker.clone(),
            secrets: Arc::new(InstantTokens),
            namespace: BROKER_NS.to_string(),
        };
        JoinOrchestrator::new(
            JoinCollaborators {
                discovery: Arc::new(StaticNetwork),
                prompter: Arc::new(UnattendedPrompter),
                gateways: Arc::new(OneWorker::default()),
                materializer: local,
                connector: Arc::new(LocalBroker { session }),
                clock: Arc::new(ManualClock::new()),
            },
            "submariner-operator",
        )
        .with_retries(JoinRetries::immediate(5))
    }

    fn registry(&self) -> AddressRegistryClient {
        AddressRegistryClient::new(
            Arc::new(self.store.clone()),
            RecordKey::new(BROKER_NS, GLOBALNET_RECORD_NAME),
            RetryConfig::immediate(5),
            Arc::new(ManualClock::new()),
        )
    }
}

fn request(cluster_id: &str) -> JoinRequest {
    JoinRequest::from_config(&JoinConfig::for_cluster(cluster_id))
}

/// Story: Three clusters join a /8 supernet with /16 blocks. The first two
/// get consecutive blocks, a replay of the first changes nothing, and the
/// third cannot claim the second one's block.
#[tokio::test]
async fn story_clusters_share_the_supernet() {
    let overlay = Overlay::deploy().await;
    let cluster_a = Arc::new(FakeCluster::default());

    let a = overlay
        .member(cluster_a.clone())
        .run(&request("cluster-a"), &overlay.bundle)
        .await
        .unwrap();
    assert_eq!(a.global_cidr, Some(net("242.0.0.0/16")));
    assert_eq!(a.transitions.last(), Some(&JoinState::Done));

    let b = overlay
        .member(Arc::new(FakeCluster::default()))
        .run(&request("cluster-b"), &overlay.bundle)
        .await
        .unwrap();
    assert_eq!(b.global_cidr, Some(net("242.1.0.0/16")));

    let writes = overlay.store.write_count();
    let replay = overlay
        .member(cluster_a)
        .run(&request("cluster-a"), &overlay.bundle)
        .await
        .unwrap();
    assert_eq!(replay.global_cidr, Some(net("242.0.0.0/16")));
    assert_eq!(replay.materialized[0].outcome, ApplyOutcome::Unchanged);
    assert_eq!(overlay.store.write_count(), writes);

    let mut c = request("cluster-c");
    c.global_cidr = Some("242.1.0.0/16".into());
    let err = overlay
        .member(Arc::new(FakeCluster::default()))
        .run(&c, &overlay.bundle)
        .await
        .unwrap_err();
    match err {
        Error::Overlap { owner, .. } => assert_eq!(owner, "cluster-b"),
        other => panic!("expected overlap, got {:?}", other),
    }

    let registry = overlay.registry().load().await.unwrap();
    registry.validate().unwrap();
    assert_eq!(registry.primary_block("cluster-c"), None);
}

/// Story: A joining cluster's registry write races with another cluster.
/// The loser re-reads and lands on the next free block.
#[tokio::test]
async fn story_racing_allocation_lands_on_next_block() {
    let overlay = Overlay::deploy().await;

    overlay.store.interleave_before_next_put(|data| {
        let mut registry = AddressRegistry::from_record(data).unwrap();
        registry.assign("cluster-b", "242.0.0.0/16".parse().unwrap());
        *data = registry.to_record().unwrap();
    });

    let a = overlay
        .member(Arc::new(FakeCluster::default()))
        .run(&request("cluster-a"), &overlay.bundle)
        .await
        .unwrap();
    assert_eq!(a.global_cidr, Some(net("242.1.0.0/16")));
    assert_eq!(overlay.store.conflict_count(), 1);

    let registry = overlay.registry().load().await.unwrap();
    assert_eq!(registry.primary_block("cluster-b"), Some(net("242.0.0.0/16")));
    assert_eq!(registry.primary_block("cluster-a"), Some(net("242.1.0.0/16")));
}

/// Story: Allocation order follows arrival, but the scan always picks the
/// lowest free block, so a gap left by an explicit request is filled first.
#[tokio::test]
async fn story_scan_fills_lowest_gap() {
    let overlay = Overlay::deploy().await;
    let registry = overlay.registry();

    assert_eq!(
        registry
            .update_allocation("cluster-x", 0, Some("242.1.0.0/16"))
            .await
            .unwrap(),
        Some(net("242.1.0.0/16"))
    );
    assert_eq!(
        registry.update_allocation("cluster-a", 0, None).await.unwrap(),
        Some(net("242.0.0.0/16"))
    );
    assert_eq!(
        registry.update_allocation("cluster-b", 0, None).await.unwrap(),
        Some(net("242.2.0.0/16"))
    );
}

/// Story: Redeploying the broker keeps the published PSK and every
/// allocation made in between.
#[tokio::test]
async fn story_broker_redeploy_keeps_state() {
    let overlay = Overlay::deploy().await;
    overlay
        .member(Arc::new(FakeCluster::default()))
        .run(&request("cluster-a"), &overlay.bundle)
        .await
        .unwrap();

    let provisioner = BrokerProvisioner::new(
        overlay.broker.clone(),
        Arc::new(InstantTokens),
        BROKER_NS,
        Arc::new(ManualClock::new()),
    );
    let config = BrokerConfig {
        globalnet_enable: true,
        ..Default::default()
    };
    let republished = deploy_broker(
        &provisioner,
        Arc::new(overlay.store.clone()) as Arc<dyn RecordStore>,
        &config,
        "https://broker.example:6443",
    )
    .await
    .unwrap();

    assert_eq!(republished.psk(), overlay.bundle.psk());
    let registry = overlay.registry().load().await.unwrap();
    assert_eq!(registry.primary_block("cluster-a"), Some(net("242.0.0.0/16")));
}
