//! Data-plane custom resources
//!
//! The operator hands off to the data plane by writing these objects; it
//! never reads their status. Only the fields the join fills in are modelled.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Custom CoreDNS configmap reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoreDnsCustomConfig {
    /// ConfigMap name
    pub config_map_name: String,
    /// ConfigMap namespace, empty for the data-plane default
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Gateway health check settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// Enable health checks
    pub enabled: bool,
    /// Seconds between packets
    pub interval_seconds: u64,
    /// Lost packets before the connection is down
    pub max_packet_loss_count: u64,
}

/// Connectivity configuration of a member cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "submariner.io",
    version = "v1alpha1",
    kind = "Submariner",
    plural = "submariners",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SubmarinerSpec {
    /// Broker type, always `k8s`
    pub broker: String,
    /// Broker API server host:port
    pub broker_k8s_api_server: String,
    /// Per-cluster bearer token on the broker
    pub broker_k8s_api_server_token: String,
    /// Base64 CA bundle of the broker API server
    #[serde(rename = "brokerK8sCA")]
    pub broker_k8s_ca: String,
    /// Broker namespace
    pub broker_k8s_remote_namespace: String,
    /// Cable driver
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cable_driver: String,
    /// IPsec debug logging
    #[serde(rename = "ceIPSecDebug")]
    pub ce_ipsec_debug: bool,
    /// Force UDP encapsulation
    #[serde(rename = "ceIPSecForceUDPEncaps")]
    pub ce_ipsec_force_udp_encaps: bool,
    /// IKE port
    #[serde(rename = "ceIPSecIKEPort")]
    pub ce_ipsec_ike_port: u16,
    /// NAT-T port
    #[serde(rename = "ceIPSecNATTPort")]
    pub ce_ipsec_natt_port: u16,
    /// Prefer this cluster as server
    #[serde(rename = "ceIPSecPreferredServer")]
    pub ce_ipsec_preferred_server: bool,
    /// Base64 IPsec pre-shared key
    #[serde(rename = "ceIPSecPSK")]
    pub ce_ipsec_psk: String,
    /// Pod CIDR, empty when the data plane detects it
    #[serde(rename = "clusterCIDR", default, skip_serializing_if = "String::is_empty")]
    pub cluster_cidr: String,
    /// Cluster ID
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Service CIDR, empty when the data plane detects it
    #[serde(rename = "serviceCIDR", default, skip_serializing_if = "String::is_empty")]
    pub service_cidr: String,
    /// Allocated global CIDR
    #[serde(rename = "globalCIDR", default, skip_serializing_if = "String::is_empty")]
    pub global_cidr: String,
    /// Verbose pod logging
    pub debug: bool,
    /// Namespace the data plane runs in
    pub namespace: String,
    /// NAT traversal
    pub nat_enabled: bool,
    /// LoadBalancer in front of gateways
    pub load_balancer_enabled: bool,
    /// Image repository
    pub repository: String,
    /// Image version
    pub version: String,
    /// Deploy service discovery as well
    pub service_discovery_enabled: bool,
    /// Custom service discovery domains
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_domains: Vec<String>,
    /// Per-component image overrides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub image_overrides: BTreeMap<String, String>,
    /// Custom CoreDNS configmap
    #[serde(rename = "coreDNSCustomConfig", default, skip_serializing_if = "Option::is_none")]
    pub core_dns_custom_config: Option<CoreDnsCustomConfig>,
    /// Gateway health checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_health_check: Option<HealthCheckSpec>,
}

/// Service discovery configuration of a member cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "submariner.io",
    version = "v1alpha1",
    kind = "ServiceDiscovery",
    plural = "servicediscoveries",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDiscoverySpec {
    /// Broker API server host:port
    pub broker_k8s_api_server: String,
    /// Per-cluster bearer token on the broker
    pub broker_k8s_api_server_token: String,
    /// Base64 CA bundle of the broker API server
    #[serde(rename = "brokerK8sCA")]
    pub broker_k8s_ca: String,
    /// Broker namespace
    pub broker_k8s_remote_namespace: String,
    /// Cluster ID
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Verbose pod logging
    pub debug: bool,
    /// Namespace the data plane runs in
    pub namespace: String,
    /// Image repository
    pub repository: String,
    /// Image version
    pub version: String,
    /// Whether global addressing is in use
    pub globalnet_enabled: bool,
    /// Custom service discovery domains
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_domains: Vec<String>,
    /// Per-component image overrides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub image_overrides: BTreeMap<String, String>,
    /// Custom CoreDNS configmap
    #[serde(rename = "coreDNSCustomConfig", default, skip_serializing_if = "Option::is_none")]
    pub core_dns_custom_config: Option<CoreDnsCustomConfig>,
}

/// Broker installation on the broker cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "submariner.io",
    version = "v1alpha1",
    kind = "Broker",
    plural = "brokers",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSpec {
    /// Installed components
    pub components: Vec<String>,
    /// Default service discovery domains
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_custom_domains: Vec<String>,
    /// Default global addresses per cluster
    pub default_globalnet_cluster_size: u64,
    /// Global supernet
    #[serde(rename = "globalnetCIDRRange")]
    pub globalnet_cidr_range: String,
    /// Whether globalnet is enabled
    pub globalnet_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submariner_wire_names() {
        let spec = SubmarinerSpec {
            broker: "k8s".into(),
            ce_ipsec_psk: "cHNr".into(),
            cluster_id: "cluster-a".into(),
            global_cidr: "242.0.0.0/16".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ceIPSecPSK"], "cHNr");
        assert_eq!(json["clusterID"], "cluster-a");
        assert_eq!(json["globalCIDR"], "242.0.0.0/16");
        assert!(json.get("serviceCIDR").is_none());
        assert!(json.get("brokerK8sCA").is_some());
        assert!(json.get("brokerK8sApiServerToken").is_some());
    }
}
