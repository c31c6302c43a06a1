//! Fabric Custom Resource Definition
//!
//! A Fabric describes this cluster's role in the overlay: a broker
//! (`brokerConfig`), a member joining a broker (`joinConfig`), or both.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{BrokerConfig, Condition, FabricPhase, JoinConfig};

/// Specification for a Fabric
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.tkestack.io",
    version = "v1alpha1",
    kind = "Fabric",
    plural = "fabrics",
    shortname = "fb",
    status = "FabricStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.joinConfig.clusterID"}"#,
    printcolumn = r#"{"name":"GlobalCIDR","type":"string","jsonPath":".status.globalCIDR"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FabricSpec {
    /// Broker configuration, present when this cluster hosts the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_config: Option<BrokerConfig>,

    /// Join configuration, present when this cluster joins a broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_config: Option<JoinConfig>,
}

/// Status for a Fabric
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FabricStatus {
    /// Current phase
    #[serde(default)]
    pub phase: FabricPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the fabric state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Global CIDR allocated to this cluster
    #[serde(rename = "globalCIDR", default, skip_serializing_if = "Option::is_none")]
    pub global_cidr: Option<String>,

    /// Effective service CIDR
    #[serde(rename = "serviceCIDR", default, skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,

    /// Effective pod CIDR
    #[serde(rename = "clusterCIDR", default, skip_serializing_if = "Option::is_none")]
    pub cluster_cidr: Option<String>,

    /// Generation last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl FabricStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: FabricPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        // Remove existing condition of the same type
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }
}
