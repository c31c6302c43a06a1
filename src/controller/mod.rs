//! Controller implementations for fabric CRDs
//!
//! Controllers follow the Kubernetes controller pattern: every pass drives the
//! cluster towards the desired state and records the result in the status.

mod fabric;

pub use fabric::{
    error_policy, reconcile, Context, ContextBuilder, FabricStatusWriter, KubeFabricStatusWriter,
    Roles, CONDITION_BROKER_READY, CONDITION_JOINED,
};
