//! Broker provisioning and credential issuance
//!
//! The broker cluster hosts a namespace that every member cluster talks to.
//! Access is granted through service accounts:
//! - `submariner-k8s-broker-admin` manages the broker and backs the handshake
//!   bundle
//! - `cluster-<clusterID>` is minted per joining cluster and bound to the
//!   shared `submariner-k8s-broker-cluster` role
//!
//! Service account tokens are populated asynchronously by the platform, so
//! every credential is waited for with [`RetryConfig::credential_wait`].

pub mod deploy;
mod secrets;
mod session;

pub use deploy::{deploy_broker, resolve_components};
pub use secrets::{KubeTokenSecrets, TokenSecrets};
pub use session::{BrokerConnector, BrokerSession, KubeBrokerConnector};

#[cfg(test)]
pub use secrets::MockTokenSecrets;
#[cfg(test)]
pub use session::MockBrokerConnector;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use tracing::{info, instrument};

use crate::materializer::{DesiredObject, ResourceMaterializer};
use crate::retry::{poll_with_backoff, Clock, RetryConfig};
use crate::{Error, Result};

/// Service account managing the broker
pub const ADMIN_SERVICE_ACCOUNT: &str = "submariner-k8s-broker-admin";

/// Role held by the broker admin
pub const ADMIN_ROLE: &str = "submariner-k8s-broker-admin";

/// Role shared by all member clusters
pub const CLUSTER_ROLE: &str = "submariner-k8s-broker-cluster";

/// Member service account kept for clusters that predate per-cluster accounts
pub const DEFAULT_CLUSTER_SERVICE_ACCOUNT: &str = "submariner-k8s-broker-client";

/// Secret type carrying a service account token
pub const TOKEN_SECRET_TYPE: &str = "kubernetes.io/service-account-token";

/// Annotation linking a token secret to its service account
pub const SERVICE_ACCOUNT_ANNOTATION: &str = "kubernetes.io/service-account.name";

const TOKEN_KEY: &str = "token";
const CA_KEY: &str = "ca.crt";
const NAMESPACE_KEY: &str = "namespace";

/// Service account name for a member cluster
pub fn cluster_service_account(cluster_id: &str) -> String {
    format!("cluster-{}", cluster_id)
}

/// Broker access of one member cluster.
///
/// Produced by credential issuance and handed to the resource builders; it is
/// never cached between joins.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterCredential {
    /// Service account the token belongs to
    pub service_account: String,
    /// Broker namespace the token is scoped to
    pub namespace: String,
    /// Bearer token
    pub token: String,
    /// PEM CA bundle of the broker API server
    pub ca_certificate: Option<String>,
}

impl fmt::Debug for ClusterCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCredential")
            .field("service_account", &self.service_account)
            .field("namespace", &self.namespace)
            .field("token", &"<redacted>")
            .field("ca_certificate", &self.ca_certificate.is_some())
            .finish()
    }
}

fn secret_string(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()?
        .get(key)
        .and_then(|ByteString(bytes)| String::from_utf8(bytes.clone()).ok())
        .filter(|s| !s.is_empty())
}

impl ClusterCredential {
    /// Read a populated token secret, `None` while the token is still missing
    pub fn from_secret(
        service_account: &str,
        default_namespace: &str,
        secret: &Secret,
    ) -> Option<Self> {
        let token = secret_string(secret, TOKEN_KEY)?;
        Some(Self {
            service_account: service_account.to_string(),
            namespace: secret_string(secret, NAMESPACE_KEY)
                .unwrap_or_else(|| default_namespace.to_string()),
            token,
            ca_certificate: secret_string(secret, CA_KEY),
        })
    }
}

/// Provisions access on the broker cluster
#[derive(Clone)]
pub struct BrokerProvisioner {
    materializer: Arc<dyn ResourceMaterializer>,
    secrets: Arc<dyn TokenSecrets>,
    namespace: String,
    credential_wait: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl BrokerProvisioner {
    /// Create a provisioner for the broker in `namespace`
    pub fn new(
        materializer: Arc<dyn ResourceMaterializer>,
        secrets: Arc<dyn TokenSecrets>,
        namespace: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            materializer,
            secrets,
            namespace: namespace.into(),
            credential_wait: RetryConfig::credential_wait(),
            clock,
        }
    }

    /// Override how long credentials are waited for
    pub fn with_credential_wait(mut self, retry: RetryConfig) -> Self {
        self.credential_wait = retry;
        self
    }

    /// Broker namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Materializer writing to the broker cluster
    pub fn materializer(&self) -> &dyn ResourceMaterializer {
        self.materializer.as_ref()
    }

    /// Clock used for credential waits
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Ensure the broker namespace and its RBAC, returning the admin token secret.
    ///
    /// Creates the admin service account and role, the shared member role,
    /// and the default member account, then waits for the admin token.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn ensure_admin_access(&self) -> Result<Secret> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.apply(&namespace).await?;

        self.apply(&self.role(ADMIN_ROLE, admin_rules())).await?;
        self.ensure_bound_account(ADMIN_SERVICE_ACCOUNT, ADMIN_ROLE)
            .await?;

        self.apply(&self.role(CLUSTER_ROLE, cluster_rules())).await?;
        self.ensure_bound_account(DEFAULT_CLUSTER_SERVICE_ACCOUNT, CLUSTER_ROLE)
            .await?;

        let secret = self.wait_for_token_secret(ADMIN_SERVICE_ACCOUNT).await?;
        info!("Broker admin access ready");
        Ok(secret)
    }

    /// Mint (or confirm) the service account of a member cluster and wait for
    /// its token.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn issue_cluster_credential(&self, cluster_id: &str) -> Result<ClusterCredential> {
        let account = cluster_service_account(cluster_id);
        self.ensure_bound_account(&account, CLUSTER_ROLE).await?;

        let secret = self.wait_for_token_secret(&account).await?;
        let credential = ClusterCredential::from_secret(&account, &self.namespace, &secret)
            .ok_or_else(|| {
                Error::unavailable(
                    format!("service account {}/{}", self.namespace, account),
                    "token secret has no token",
                )
            })?;

        info!(cluster_id = %cluster_id, service_account = %account, "Issued cluster credential");
        Ok(credential)
    }

    async fn apply<K>(&self, obj: &K) -> Result<()>
    where
        K: kube::Resource<DynamicType = ()> + serde::Serialize,
    {
        let desired = DesiredObject::from_resource(obj)?;
        self.materializer.create_or_update(&desired).await?;
        Ok(())
    }

    /// Service account, its token secret, and a binding to `role`
    async fn ensure_bound_account(&self, account: &str, role: &str) -> Result<()> {
        let sa = ServiceAccount {
            metadata: self.meta(account),
            ..Default::default()
        };
        self.apply(&sa).await?;
        self.apply(&self.token_secret(account)).await?;
        self.apply(&self.role_binding(account, role)).await
    }

    async fn wait_for_token_secret(&self, account: &str) -> Result<Secret> {
        let what = format!("token of service account {}/{}", self.namespace, account);
        let secrets = self.secrets.as_ref();
        let namespace = self.namespace.as_str();

        poll_with_backoff(&self.credential_wait, self.clock.as_ref(), &what, || async move {
            let secret = secrets.token_secret(namespace, account).await?;
            Ok(secret.filter(|s| secret_string(s, TOKEN_KEY).is_some()))
        })
        .await
    }

    fn meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            ..Default::default()
        }
    }

    fn token_secret(&self, account: &str) -> Secret {
        let mut metadata = self.meta(&format!("{}-token", account));
        metadata.annotations = Some(BTreeMap::from([(
            SERVICE_ACCOUNT_ANNOTATION.to_string(),
            account.to_string(),
        )]));
        Secret {
            metadata,
            type_: Some(TOKEN_SECRET_TYPE.to_string()),
            ..Default::default()
        }
    }

    fn role(&self, name: &str, rules: Vec<PolicyRule>) -> Role {
        Role {
            metadata: self.meta(name),
            rules: Some(rules),
        }
    }

    fn role_binding(&self, account: &str, role: &str) -> RoleBinding {
        RoleBinding {
            metadata: self.meta(&format!("{}-{}", account, role)),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: role.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: account.to_string(),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            }]),
        }
    }
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(owned(groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}

fn admin_rules() -> Vec<PolicyRule> {
    vec![
        rule(&["submariner.io", "multicluster.x-k8s.io"], &["*"], &["*"]),
        rule(
            &[""],
            &["serviceaccounts", "secrets", "configmaps"],
            &["create", "get", "list", "watch", "update", "patch", "delete"],
        ),
        rule(
            &["rbac.authorization.k8s.io"],
            &["rolebindings"],
            &["create", "get", "list", "delete"],
        ),
    ]
}

fn cluster_rules() -> Vec<PolicyRule> {
    let rw = &["create", "get", "list", "watch", "patch", "update", "delete"];
    vec![
        rule(&["submariner.io"], &["clusters", "endpoints"], rw),
        rule(&["multicluster.x-k8s.io"], &["*"], rw),
        rule(&["discovery.k8s.io"], &["endpointslices"], rw),
        rule(&[""], &["configmaps"], &["get", "list", "watch"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materializer::{ApplyOutcome, MockResourceMaterializer};
    use crate::retry::ManualClock;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn populated_token(ns: &str, token: &str) -> Secret {
        Secret {
            data: Some(BTreeMap::from([
                (TOKEN_KEY.to_string(), ByteString(token.as_bytes().to_vec())),
                (CA_KEY.to_string(), ByteString(b"-----BEGIN CERTIFICATE".to_vec())),
                (NAMESPACE_KEY.to_string(), ByteString(ns.as_bytes().to_vec())),
            ])),
            ..Default::default()
        }
    }

    fn recording_materializer() -> (MockResourceMaterializer, Arc<Mutex<Vec<String>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let log = applied.clone();
        let mut mock = MockResourceMaterializer::new();
        mock.expect_create_or_update().returning(move |obj| {
            log.lock().push(obj.to_string());
            Ok(ApplyOutcome::Created)
        });
        (mock, applied)
    }

    /// Story: A new member cluster gets its own service account bound to the
    /// shared role. The token shows up on the third look.
    #[tokio::test]
    async fn story_cluster_credential_is_issued_once_token_appears() {
        let (materializer, applied) = recording_materializer();

        let looks = Arc::new(AtomicU32::new(0));
        let l = looks.clone();
        let mut secrets = MockTokenSecrets::new();
        secrets.expect_token_secret().returning(move |ns, sa| {
            assert_eq!(ns, "submariner-k8s-broker");
            assert_eq!(sa, "cluster-east");
            match l.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(None),
                1 => Ok(Some(Secret::default())),
                _ => Ok(Some(populated_token("submariner-k8s-broker", "abc"))),
            }
        });

        let clock = Arc::new(ManualClock::new());
        let provisioner = BrokerProvisioner::new(
            Arc::new(materializer),
            Arc::new(secrets),
            "submariner-k8s-broker",
            clock.clone(),
        );

        let credential = provisioner.issue_cluster_credential("east").await.unwrap();
        assert_eq!(credential.service_account, "cluster-east");
        assert_eq!(credential.namespace, "submariner-k8s-broker");
        assert_eq!(credential.token, "abc");
        assert!(credential.ca_certificate.is_some());

        assert_eq!(
            *applied.lock(),
            vec![
                "ServiceAccount submariner-k8s-broker/cluster-east",
                "Secret submariner-k8s-broker/cluster-east-token",
                "RoleBinding submariner-k8s-broker/cluster-east-submariner-k8s-broker-cluster",
            ]
        );
        // Credential waits start at five seconds
        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 2);
        assert!(sleeps[0] >= std::time::Duration::from_secs(5));
    }

    /// Story: The platform never populates the token; the join is told the
    /// credential is unavailable instead of hanging.
    #[tokio::test]
    async fn story_missing_token_is_unavailable_after_bound() {
        let (materializer, _) = recording_materializer();
        let mut secrets = MockTokenSecrets::new();
        secrets
            .expect_token_secret()
            .times(4)
            .returning(|_, _| Ok(None));

        let provisioner = BrokerProvisioner::new(
            Arc::new(materializer),
            Arc::new(secrets),
            "submariner-k8s-broker",
            Arc::new(ManualClock::new()),
        )
        .with_credential_wait(RetryConfig::immediate(4));

        let err = provisioner
            .issue_cluster_credential("east")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
        assert!(err.to_string().contains("cluster-east"));
    }

    #[tokio::test]
    async fn test_admin_access_creates_rbac_in_order() {
        let (materializer, applied) = recording_materializer();
        let mut secrets = MockTokenSecrets::new();
        secrets
            .expect_token_secret()
            .returning(|ns, _| Ok(Some(populated_token(ns, "admin"))));

        let provisioner = BrokerProvisioner::new(
            Arc::new(materializer),
            Arc::new(secrets),
            "submariner-k8s-broker",
            Arc::new(ManualClock::new()),
        );
        let secret = provisioner.ensure_admin_access().await.unwrap();
        assert_eq!(secret_string(&secret, TOKEN_KEY).as_deref(), Some("admin"));

        let applied = applied.lock();
        assert_eq!(applied[0], "Namespace submariner-k8s-broker");
        assert_eq!(applied[1], "Role submariner-k8s-broker/submariner-k8s-broker-admin");
        assert!(applied.contains(
            &"ServiceAccount submariner-k8s-broker/submariner-k8s-broker-client".to_string()
        ));
        assert!(applied.contains(&"Role submariner-k8s-broker/submariner-k8s-broker-cluster".to_string()));
        assert_eq!(applied.len(), 9);
    }

    #[test]
    fn test_credential_requires_token() {
        assert!(ClusterCredential::from_secret("cluster-a", "ns", &Secret::default()).is_none());

        let mut secret = populated_token("ns", "t");
        secret.data.as_mut().unwrap().remove(NAMESPACE_KEY);
        let credential = ClusterCredential::from_secret("cluster-a", "fallback", &secret).unwrap();
        assert_eq!(credential.namespace, "fallback");
        assert!(!format!("{:?}", credential).contains("\"t\""));
    }

    #[test]
    fn test_token_secret_is_annotated() {
        let provisioner = BrokerProvisioner::new(
            Arc::new(MockResourceMaterializer::new()),
            Arc::new(MockTokenSecrets::new()),
            "broker",
            Arc::new(ManualClock::new()),
        );
        let secret = provisioner.token_secret("cluster-a");
        assert_eq!(secret.type_.as_deref(), Some(TOKEN_SECRET_TYPE));
        assert_eq!(
            secret.metadata.annotations.unwrap()[SERVICE_ACCOUNT_ANNOTATION],
            "cluster-a"
        );
    }
}
