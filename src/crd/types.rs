//! Shared types for Fabric CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default globalnet supernet
pub const DEFAULT_GLOBALNET_CIDR_RANGE: &str = "242.0.0.0/8";
/// Default number of global addresses per cluster
pub const DEFAULT_GLOBALNET_CLUSTER_SIZE: u64 = 65536;
/// Default IPsec NAT-T port
pub const DEFAULT_NATT_PORT: u16 = 4500;
/// Default IPsec IKE port
pub const DEFAULT_IKE_PORT: u16 = 500;
/// Default image repository for data-plane components
pub const DEFAULT_REPOSITORY: &str = "quay.io/submariner";
/// Default data-plane image version
pub const DEFAULT_IMAGE_VERSION: &str = "0.11.0";

/// Components that can be overridden through `imageOverrideArr`
pub const VALID_IMAGE_NAMES: &[&str] = &[
    "submariner-operator",
    "submariner-gateway",
    "submariner-routeagent",
    "submariner-globalnet",
    "submariner-networkplugin-syncer",
    "lighthouse-agent",
    "lighthouse-coredns",
];

fn default_true() -> bool {
    true
}

fn default_cidr_range() -> String {
    DEFAULT_GLOBALNET_CIDR_RANGE.to_string()
}

fn default_components() -> Vec<String> {
    Component::SELECTABLE.iter().map(|c| c.to_string()).collect()
}

fn default_cluster_size() -> u64 {
    DEFAULT_GLOBALNET_CLUSTER_SIZE
}

fn default_natt_port() -> u16 {
    DEFAULT_NATT_PORT
}

fn default_ike_port() -> u16 {
    DEFAULT_IKE_PORT
}

fn default_health_check_interval() -> u64 {
    1
}

fn default_max_packet_loss() -> u64 {
    5
}

/// Fabric component
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    /// Multi-cluster service discovery (Lighthouse)
    ServiceDiscovery,
    /// Gateways, tunnels and routing between clusters
    Connectivity,
    /// Global (virtual) addressing for overlapping cluster CIDRs
    Globalnet,
}

impl Component {
    /// Components an operator may list explicitly
    pub const SELECTABLE: [Component; 2] = [Component::ServiceDiscovery, Component::Connectivity];
}

impl std::str::FromStr for Component {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service-discovery" => Ok(Self::ServiceDiscovery),
            "connectivity" => Ok(Self::Connectivity),
            "globalnet" => Ok(Self::Globalnet),
            _ => Err(crate::Error::invalid_input(format!(
                "invalid component: {s}, expected one of: service-discovery, connectivity"
            ))),
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServiceDiscovery => write!(f, "service-discovery"),
            Self::Connectivity => write!(f, "connectivity"),
            Self::Globalnet => write!(f, "globalnet"),
        }
    }
}

/// Broker cluster configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Enable global addressing for clusters with overlapping CIDRs
    #[serde(default)]
    pub globalnet_enable: bool,

    /// Supernet per-cluster global CIDRs are carved from
    #[serde(rename = "globalnetCIDRRange", default = "default_cidr_range")]
    pub globalnet_cidr_range: String,

    /// Default number of global addresses per cluster (rounded up to a power of two)
    #[serde(default = "default_cluster_size")]
    pub default_globalnet_cluster_size: u64,

    /// Enable multi-cluster service discovery
    #[serde(default = "default_true")]
    pub service_discovery_enabled: bool,

    /// Components to install, at least one
    #[serde(default = "default_components")]
    pub component_arr: Vec<String>,

    /// Domains used for multi-cluster service discovery
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_custom_domains: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            globalnet_enable: false,
            globalnet_cidr_range: default_cidr_range(),
            default_globalnet_cluster_size: default_cluster_size(),
            service_discovery_enabled: true,
            component_arr: default_components(),
            default_custom_domains: Vec::new(),
        }
    }
}

/// Join configuration of a managed cluster
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinConfig {
    /// Cluster identifier, a DNS-1123 name unique across the fabric
    #[serde(rename = "clusterID")]
    pub cluster_id: String,

    /// Service CIDR, discovered when unset
    #[serde(rename = "serviceCIDR", default, skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,

    /// Pod CIDR, discovered when unset
    #[serde(rename = "clusterCIDR", default, skip_serializing_if = "Option::is_none")]
    pub cluster_cidr: Option<String>,

    /// Explicit global CIDR for this cluster
    #[serde(rename = "globalnetCIDR", default, skip_serializing_if = "Option::is_none")]
    pub globalnet_cidr: Option<String>,

    /// Image repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    /// Image version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_version: Option<String>,

    /// IPsec NAT-T port
    #[serde(default = "default_natt_port")]
    pub natt_port: u16,

    /// IPsec IKE port
    #[serde(default = "default_ike_port")]
    pub ike_port: u16,

    /// Prefer this cluster as server for data-plane connections
    #[serde(default)]
    pub preferred_server: bool,

    /// Force UDP encapsulation for IPsec
    #[serde(rename = "forceUDPEncaps", default)]
    pub force_udp_encaps: bool,

    /// Enable NAT traversal for IPsec
    #[serde(default = "default_true")]
    pub nat_traversal: bool,

    /// Enable globalnet for this cluster
    #[serde(default = "default_true")]
    pub globalnet_enabled: bool,

    /// Verbose IPsec logging
    #[serde(default)]
    pub ipsec_debug: bool,

    /// Verbose logging in the deployed pods
    #[serde(default)]
    pub submariner_debug: bool,

    /// Label a gateway node when none is labelled yet
    #[serde(default = "default_true")]
    pub label_gateway: bool,

    /// Put a LoadBalancer in front of the gateways
    #[serde(default)]
    pub load_balancer_enabled: bool,

    /// Cable driver implementation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cable_driver: Option<String>,

    /// Number of global addresses for this cluster, 0 for the broker default
    #[serde(default)]
    pub globalnet_cluster_size: u64,

    /// Domains used for multi-cluster service discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domains: Option<Vec<String>>,

    /// Image overrides as `component=image`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_override_arr: Vec<String>,

    /// Enable gateway health checks
    #[serde(default = "default_true")]
    pub health_check_enable: bool,

    /// Seconds between health check packets
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// Lost packets before a connection is marked down
    #[serde(default = "default_max_packet_loss")]
    pub health_check_max_packet_loss_count: u64,

    /// Custom CoreDNS configmap as `[namespace/]name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coredns_custom_config_map: Option<String>,
}

impl JoinConfig {
    /// Join config for `cluster_id` with every other field at its default
    pub fn for_cluster(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            service_cidr: None,
            cluster_cidr: None,
            globalnet_cidr: None,
            repository: None,
            image_version: None,
            natt_port: DEFAULT_NATT_PORT,
            ike_port: DEFAULT_IKE_PORT,
            preferred_server: false,
            force_udp_encaps: false,
            nat_traversal: true,
            globalnet_enabled: true,
            ipsec_debug: false,
            submariner_debug: false,
            label_gateway: true,
            load_balancer_enabled: false,
            cable_driver: None,
            globalnet_cluster_size: 0,
            custom_domains: None,
            image_override_arr: Vec::new(),
            health_check_enable: true,
            health_check_interval: default_health_check_interval(),
            health_check_max_packet_loss_count: default_max_packet_loss(),
            coredns_custom_config_map: None,
        }
    }
}

/// Fabric lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum FabricPhase {
    /// Not reconciled yet
    #[default]
    Pending,
    /// Broker deployed and/or cluster joined
    Running,
    /// Last reconciliation failed
    Failed,
}

impl std::fmt::Display for FabricPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., BrokerReady, Joined)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod component {
        use super::*;

        #[test]
        fn test_from_str_and_display_agree() {
            for c in [
                Component::ServiceDiscovery,
                Component::Connectivity,
                Component::Globalnet,
            ] {
                assert_eq!(c.to_string().parse::<Component>().unwrap(), c);
            }
        }

        #[test]
        fn test_unknown_component_is_invalid_input() {
            assert!(matches!(
                "tunnels".parse::<Component>(),
                Err(crate::Error::InvalidInput { .. })
            ));
        }

        #[test]
        fn test_serde_is_kebab_case() {
            assert_eq!(
                serde_json::to_string(&Component::ServiceDiscovery).unwrap(),
                "\"service-discovery\""
            );
        }
    }

    mod join_config {
        use super::*;

        #[test]
        fn test_minimal_json_gets_operator_defaults() {
            let cfg: JoinConfig = serde_json::from_str(r#"{"clusterID":"cluster-a"}"#).unwrap();
            assert_eq!(cfg, JoinConfig::for_cluster("cluster-a"));
            assert!(cfg.nat_traversal);
            assert!(cfg.label_gateway);
            assert_eq!(cfg.natt_port, 4500);
        }

        #[test]
        fn test_field_names_match_wire_format() {
            let mut cfg = JoinConfig::for_cluster("cluster-a");
            cfg.service_cidr = Some("10.96.0.0/12".into());
            cfg.globalnet_cidr = Some("242.0.0.0/16".into());
            cfg.force_udp_encaps = true;

            let json = serde_json::to_value(&cfg).unwrap();
            assert_eq!(json["clusterID"], "cluster-a");
            assert_eq!(json["serviceCIDR"], "10.96.0.0/12");
            assert_eq!(json["globalnetCIDR"], "242.0.0.0/16");
            assert_eq!(json["forceUDPEncaps"], true);
            assert_eq!(json["healthCheckMaxPacketLossCount"], 5);
        }
    }

    mod broker_config {
        use super::*;

        #[test]
        fn test_empty_json_gets_defaults() {
            let cfg: BrokerConfig = serde_json::from_str("{}").unwrap();
            assert_eq!(cfg, BrokerConfig::default());
            assert_eq!(cfg.globalnet_cidr_range, "242.0.0.0/8");
            assert!(cfg.service_discovery_enabled);
            assert_eq!(cfg.component_arr, vec!["service-discovery", "connectivity"]);
        }

        #[test]
        fn test_explicit_empty_components_are_kept() {
            let cfg: BrokerConfig = serde_json::from_str(r#"{"componentArr": []}"#).unwrap();
            assert!(cfg.component_arr.is_empty());
        }
    }

    #[test]
    fn test_condition_serializes_type_field() {
        let c = Condition::new("Joined", ConditionStatus::True, "JoinSucceeded", "ok");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "Joined");
        assert_eq!(json["status"], "True");
    }
}
