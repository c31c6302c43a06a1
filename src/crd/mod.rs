//! Custom Resource Definitions
//!
//! `Fabric` is the operator-facing resource. `Submariner`, `ServiceDiscovery`
//! and `Broker` belong to the data plane and are only written.

mod fabric;
mod submariner;
mod types;

pub use fabric::{Fabric, FabricSpec, FabricStatus};
pub use submariner::{
    Broker, BrokerSpec, CoreDnsCustomConfig, HealthCheckSpec, ServiceDiscovery,
    ServiceDiscoverySpec, Submariner, SubmarinerSpec,
};
pub use types::{
    BrokerConfig, Component, Condition, ConditionStatus, FabricPhase, JoinConfig,
    DEFAULT_GLOBALNET_CIDR_RANGE, DEFAULT_GLOBALNET_CLUSTER_SIZE, DEFAULT_IKE_PORT,
    DEFAULT_IMAGE_VERSION, DEFAULT_NATT_PORT, DEFAULT_REPOSITORY, VALID_IMAGE_NAMES,
};
