//! Service account token lookup

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::{Api, ListParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use super::{SERVICE_ACCOUNT_ANNOTATION, TOKEN_SECRET_TYPE};
use crate::Result;

/// Finds the token secret of a service account
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenSecrets: Send + Sync {
    /// Token secret of `service_account`, `None` if there is none yet
    async fn token_secret(&self, namespace: &str, service_account: &str)
        -> Result<Option<Secret>>;
}

/// Token lookup through the Kubernetes API
#[derive(Clone)]
pub struct KubeTokenSecrets {
    client: Client,
}

impl KubeTokenSecrets {
    /// Create a lookup over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn is_token_of(secret: &Secret, service_account: &str) -> bool {
    secret.type_.as_deref() == Some(TOKEN_SECRET_TYPE)
        && secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(SERVICE_ACCOUNT_ANNOTATION))
            .is_some_and(|name| name == service_account)
}

#[async_trait]
impl TokenSecrets for KubeTokenSecrets {
    async fn token_secret(
        &self,
        namespace: &str,
        service_account: &str,
    ) -> Result<Option<Secret>> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let Some(sa) = accounts.get_opt(service_account).await? else {
            debug!(service_account = %service_account, "Service account not found yet");
            return Ok(None);
        };

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        // Legacy clusters still link the generated token from the account
        for reference in sa.secrets.unwrap_or_default() {
            let Some(name) = reference.name else { continue };
            if let Some(secret) = secrets.get_opt(&name).await? {
                if is_token_of(&secret, service_account) {
                    return Ok(Some(secret));
                }
            }
        }

        let lp = ListParams::default().fields(&format!("type={}", TOKEN_SECRET_TYPE));
        Ok(secrets
            .list(&lp)
            .await?
            .items
            .into_iter()
            .find(|s| is_token_of(s, service_account)))
    }
}
