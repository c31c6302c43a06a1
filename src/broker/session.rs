//! Connections to the broker cluster from a joining cluster
//!
//! A join reads the globalnet registry and issues its credential on the broker,
//! not on the local cluster. The bundle carries everything needed to build a
//! client for it.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use super::{KubeTokenSecrets, TokenSecrets};
use crate::bundle::HandshakeBundle;
use crate::materializer::{KubeMaterializer, ResourceMaterializer};
use crate::store::{ConfigMapStore, RecordStore};
use crate::{Error, Result, DEFAULT_BROKER_NAMESPACE};

const CONTEXT_NAME: &str = "broker";

/// Handles on the broker cluster
#[derive(Clone)]
pub struct BrokerSession {
    /// Shared records (globalnet registry, broker-info)
    pub store: Arc<dyn RecordStore>,
    /// Materializer writing to the broker cluster
    pub materializer: Arc<dyn ResourceMaterializer>,
    /// Token lookup on the broker cluster
    pub secrets: Arc<dyn TokenSecrets>,
    /// Broker namespace
    pub namespace: String,
}

/// Opens sessions on the broker described by a bundle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect with the bundle's credentials
    async fn connect(&self, bundle: &HandshakeBundle) -> Result<BrokerSession>;
}

/// Connects through the broker's Kubernetes API
#[derive(Clone, Debug)]
pub struct KubeBrokerConnector {
    field_manager: String,
}

impl KubeBrokerConnector {
    /// Create a connector whose sessions write as `field_manager`
    pub fn new(field_manager: impl Into<String>) -> Self {
        Self {
            field_manager: field_manager.into(),
        }
    }
}

/// Kubeconfig document reaching the broker with the bundle's token
fn broker_kubeconfig(bundle: &HandshakeBundle, namespace: &str) -> Result<Kubeconfig> {
    let token = bundle
        .token()
        .ok_or_else(|| Error::malformed_bundle("bundle has no client token"))?;
    let server = if bundle.broker_url.contains("://") {
        bundle.broker_url.clone()
    } else {
        format!("https://{}", bundle.broker_url)
    };

    let mut cluster = serde_json::json!({ "server": server });
    if let Some(ca) = bundle.ca_certificate() {
        cluster["certificate-authority-data"] = STANDARD.encode(ca).into();
    }

    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": CONTEXT_NAME, "cluster": cluster }],
        "users": [{ "name": CONTEXT_NAME, "user": { "token": token } }],
        "contexts": [{
            "name": CONTEXT_NAME,
            "context": { "cluster": CONTEXT_NAME, "user": CONTEXT_NAME, "namespace": namespace }
        }],
        "current-context": CONTEXT_NAME,
    });
    serde_json::from_value(doc).map_err(|e| Error::serialization(format!("broker kubeconfig: {}", e)))
}

#[async_trait]
impl BrokerConnector for KubeBrokerConnector {
    async fn connect(&self, bundle: &HandshakeBundle) -> Result<BrokerSession> {
        let namespace = bundle
            .namespace()
            .unwrap_or_else(|| DEFAULT_BROKER_NAMESPACE.to_string());
        let kubeconfig = broker_kubeconfig(bundle, &namespace)?;

        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::dependency("broker", format!("invalid broker config: {}", e)))?;
        let client = Client::try_from(config)?;
        debug!(broker = %bundle.broker_url, namespace = %namespace, "Connected to broker");

        Ok(BrokerSession {
            store: Arc::new(ConfigMapStore::new(client.clone())),
            materializer: Arc::new(KubeMaterializer::new(client.clone(), &self.field_manager)),
            secrets: Arc::new(KubeTokenSecrets::new(client)),
            namespace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn bundle(url: &str) -> HandshakeBundle {
        HandshakeBundle {
            broker_url: url.into(),
            client_token: Some(Secret {
                data: Some(BTreeMap::from([
                    ("token".to_string(), ByteString(b"tok".to_vec())),
                    ("ca.crt".to_string(), ByteString(b"PEM".to_vec())),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_kubeconfig_points_at_broker() {
        let kc = broker_kubeconfig(&bundle("https://10.0.0.1:6443"), "broker-ns").unwrap();
        assert_eq!(kc.current_context.as_deref(), Some(CONTEXT_NAME));

        let cluster = kc.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://10.0.0.1:6443"));
        assert_eq!(
            cluster.certificate_authority_data.as_deref(),
            Some(STANDARD.encode("PEM").as_str())
        );
        let ctx = kc.contexts[0].context.as_ref().unwrap();
        assert_eq!(ctx.namespace.as_deref(), Some("broker-ns"));
    }

    #[test]
    fn test_kubeconfig_adds_missing_scheme() {
        let kc = broker_kubeconfig(&bundle("10.0.0.1:6443"), "ns").unwrap();
        let cluster = kc.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://10.0.0.1:6443"));
    }

    #[test]
    fn test_kubeconfig_requires_token() {
        let err = broker_kubeconfig(&HandshakeBundle::default(), "ns").unwrap_err();
        assert!(matches!(err, Error::MalformedBundle { .. }));
    }
}
