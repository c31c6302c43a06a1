//! Declarative resource materializer
//!
//! One capability for every object the operator needs to exist: namespaces,
//! service accounts, RBAC, and the data-plane resources. Objects are passed
//! as [`DesiredObject`]s so the same interface covers built-in and custom
//! kinds.
//!
//! Two policies are offered on top of it:
//! - [`ResourceMaterializer::create_or_update`] converges an object in place
//! - [`replace`] deletes and recreates a conflicting object so a new spec takes
//!   effect in full instead of being merged into the old one

mod kube_impl;

pub use kube_impl::KubeMaterializer;

use std::fmt;

use async_trait::async_trait;
use kube::core::ApiResource;
use kube::Resource;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::retry::{poll_with_backoff, Clock, RetryConfig};
use crate::store::CreateOutcome;
use crate::{Error, Result};

/// Result of converging an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The object did not exist
    Created,
    /// The object existed with a different desired state
    Updated,
    /// The object already had the desired state
    Unchanged,
}

/// An object the operator wants to exist
#[derive(Clone, Debug)]
pub struct DesiredObject {
    /// API group/version/kind/plural of the object
    pub resource: ApiResource,
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
    /// Full object body including `apiVersion`, `kind` and `metadata`
    pub body: Value,
}

impl DesiredObject {
    /// Capture a typed resource
    pub fn from_resource<K>(obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let resource = ApiResource::erase::<K>(&());
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::invalid_input(format!("{} without a name", resource.kind)))?;

        let mut body = serde_json::to_value(obj)
            .map_err(|e| Error::serialization(format!("{} {}: {}", resource.kind, name, e)))?;
        if let Some(map) = body.as_object_mut() {
            map.insert("apiVersion".into(), Value::String(resource.api_version.clone()));
            map.insert("kind".into(), Value::String(resource.kind.clone()));
        }

        Ok(Self {
            namespace: obj.meta().namespace.clone(),
            name,
            resource,
            body,
        })
    }

    /// The object's `spec`, if it has one
    pub fn spec(&self) -> Option<&Value> {
        self.body.get("spec")
    }
}

impl fmt::Display for DesiredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.resource.kind, ns, self.name),
            None => write!(f, "{} {}", self.resource.kind, self.name),
        }
    }
}

/// Ensures objects exist in a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceMaterializer: Send + Sync {
    /// Create the object or bring an existing one to the desired state
    async fn create_or_update(&self, desired: &DesiredObject) -> Result<ApplyOutcome>;

    /// Create the object, reporting whether it already existed
    async fn create(&self, desired: &DesiredObject) -> Result<CreateOutcome>;

    /// Delete the object and its dependents; a missing object is not an error
    async fn delete(&self, desired: &DesiredObject) -> Result<()>;

    /// Current `spec` of the object, `None` if it does not exist
    async fn get_spec(&self, desired: &DesiredObject) -> Result<Option<Value>>;
}

/// Whether every field set in `desired` has the same value in `actual`.
///
/// Fields only present in `actual` (server defaults, status) are ignored;
/// a `null` in `desired` matches a missing field.
pub fn is_subset(desired: &Value, actual: &Value) -> bool {
    match (desired, actual) {
        (Value::Object(d), Value::Object(a)) => d.iter().all(|(k, dv)| match a.get(k) {
            Some(av) => is_subset(dv, av),
            None => dv.is_null(),
        }),
        (Value::Array(d), Value::Array(a)) => {
            d.len() == a.len() && d.iter().zip(a).all(|(dv, av)| is_subset(dv, av))
        }
        _ => desired == actual,
    }
}

/// Whether `actual` already holds the desired state.
///
/// The `spec` has to match exactly, so a field dropped from the desired spec
/// is not left behind on the object. Other top-level fields only have to be a
/// subset, which leaves room for server-populated content.
pub fn is_current(desired: &Value, actual: &Value) -> bool {
    match (desired, actual) {
        (Value::Object(d), Value::Object(a)) => d.iter().all(|(k, dv)| match a.get(k) {
            Some(av) if k.as_str() == "spec" => dv == av,
            Some(av) => is_subset(dv, av),
            None => dv.is_null(),
        }),
        _ => desired == actual,
    }
}

/// Make `desired` exist with exactly its spec.
///
/// An object whose spec is identical is left alone. Otherwise creation is
/// attempted and a conflicting object is deleted and recreated, retrying while
/// the old object is still terminating.
pub async fn replace(
    materializer: &dyn ResourceMaterializer,
    desired: &DesiredObject,
    retry: &RetryConfig,
    clock: &dyn Clock,
) -> Result<ApplyOutcome> {
    let existing = materializer.get_spec(desired).await?;
    if let (Some(want), Some(have)) = (desired.spec(), existing.as_ref()) {
        if want == have {
            debug!(object = %desired, "Spec already in place");
            return Ok(ApplyOutcome::Unchanged);
        }
    }

    let what = desired.to_string();
    poll_with_backoff(retry, clock, &what, || async move {
        match materializer.create(desired).await? {
            CreateOutcome::Created => Ok(Some(())),
            CreateOutcome::AlreadyExists => {
                info!(object = %desired, "Deleting conflicting object before recreating it");
                materializer.delete(desired).await?;
                Ok(None)
            }
        }
    })
    .await?;

    Ok(if existing.is_some() {
        ApplyOutcome::Updated
    } else {
        ApplyOutcome::Created
    })
}
