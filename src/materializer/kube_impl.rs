//! Materializer backed by the Kubernetes API

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::Value;
use tracing::debug;

use super::{is_current, ApplyOutcome, DesiredObject, ResourceMaterializer};
use crate::store::CreateOutcome;
use crate::{Error, Result};

/// Materializes objects with server-side apply
#[derive(Clone)]
pub struct KubeMaterializer {
    client: Client,
    field_manager: String,
}

impl KubeMaterializer {
    /// Create a materializer writing as `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, desired: &DesiredObject) -> Api<DynamicObject> {
        match &desired.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &desired.resource),
            None => Api::all_with(self.client.clone(), &desired.resource),
        }
    }
}

fn to_dynamic(desired: &DesiredObject) -> Result<DynamicObject> {
    serde_json::from_value(desired.body.clone())
        .map_err(|e| Error::serialization(format!("{}: {}", desired, e)))
}

/// Everything but metadata and status, which the server owns
fn content(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    value
}

#[async_trait]
impl ResourceMaterializer for KubeMaterializer {
    async fn create_or_update(&self, desired: &DesiredObject) -> Result<ApplyOutcome> {
        let api = self.api(desired);

        let existed = match api.get_opt(&desired.name).await? {
            Some(existing) => {
                let actual = serde_json::to_value(&existing)
                    .map_err(|e| Error::serialization(format!("{}: {}", desired, e)))?;
                if is_current(&content(&desired.body), &content(&actual)) {
                    debug!(object = %desired, "Already up to date");
                    return Ok(ApplyOutcome::Unchanged);
                }
                true
            }
            None => false,
        };

        let params = PatchParams::apply(&self.field_manager).force();
        api.patch(&desired.name, &params, &Patch::Apply(&desired.body))
            .await
            .map_err(|e| Error::dependency("materializer", format!("apply {}: {}", desired, e)))?;

        Ok(if existed {
            ApplyOutcome::Updated
        } else {
            ApplyOutcome::Created
        })
    }

    async fn create(&self, desired: &DesiredObject) -> Result<CreateOutcome> {
        let obj = to_dynamic(desired)?;
        match self.api(desired).create(&PostParams::default(), &obj).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(Error::dependency(
                "materializer",
                format!("create {}: {}", desired, e),
            )),
        }
    }

    async fn delete(&self, desired: &DesiredObject) -> Result<()> {
        match self
            .api(desired)
            .delete(&desired.name, &DeleteParams::foreground())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::dependency(
                "materializer",
                format!("delete {}: {}", desired, e),
            )),
        }
    }

    async fn get_spec(&self, desired: &DesiredObject) -> Result<Option<Value>> {
        Ok(self
            .api(desired)
            .get_opt(&desired.name)
            .await?
            .map(|obj| obj.data.get("spec").cloned().unwrap_or(Value::Null)))
    }
}
