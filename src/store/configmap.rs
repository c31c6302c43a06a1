//! ConfigMap-backed record store
//!
//! The ConfigMap's `resourceVersion` is the version token. A replace carrying a
//! stale `resourceVersion` is rejected by the API server with 409, which maps
//! to [`PutOutcome::Conflict`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::debug;

use super::{CreateOutcome, PutOutcome, RecordData, RecordKey, RecordStore, VersionedRecord};
use crate::{Error, Result};

/// Record store over ConfigMaps in a (usually remote broker) cluster
#[derive(Clone)]
pub struct ConfigMapStore {
    client: Client,
}

impl ConfigMapStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &RecordKey) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

fn to_configmap(key: &RecordKey, data: RecordData, version: Option<&str>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            resource_version: version.map(str::to_string),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

#[async_trait]
impl RecordStore for ConfigMapStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<VersionedRecord>> {
        let Some(cm) = self.api(key).get_opt(&key.name).await? else {
            return Ok(None);
        };

        let version = cm.metadata.resource_version.ok_or_else(|| {
            Error::serialization(format!("configmap {} has no resourceVersion", key))
        })?;
        Ok(Some(VersionedRecord {
            data: cm.data.unwrap_or_default(),
            version,
        }))
    }

    async fn put_if_version(
        &self,
        key: &RecordKey,
        data: RecordData,
        version: &str,
    ) -> Result<PutOutcome> {
        let cm = to_configmap(key, data, Some(version));
        match self
            .api(key)
            .replace(&key.name, &PostParams::default(), &cm)
            .await
        {
            Ok(_) => Ok(PutOutcome::Written),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(record = %key, version = %version, "Conditional write rejected");
                Ok(PutOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, key: &RecordKey, data: RecordData) -> Result<CreateOutcome> {
        let cm = to_configmap(key, data, None);
        match self.api(key).create(&PostParams::default(), &cm).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }
}
