//! Fabric - control plane for joining Kubernetes clusters to an overlay fabric
//!
//! A broker cluster hands out non-overlapping global address blocks and
//! bootstrap credentials. Joining clusters negotiate their network parameters
//! against a registry stored on the broker and materialize the data-plane
//! resources locally.
//!
//! # Architecture
//!
//! - The broker publishes a handshake bundle (URL, credential, IPsec PSK,
//!   enabled components) as a shared record
//! - The globalnet registry is one shared record, updated only through a
//!   compare-and-swap retry loop
//! - A join is a fixed state machine where every step is idempotent, so a
//!   reconciliation pass can be replayed from any partial state
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Fabric, Submariner, Broker, ...)
//! - [`controller`] - Kubernetes controller reconciliation logic
//! - [`globalnet`] - Global CIDR allocation and the address registry
//! - [`bundle`] - Handshake bundle codec and publication
//! - [`broker`] - Broker deployment and per-cluster credentials
//! - [`join`] - Join orchestration
//! - [`store`] - Shared record store abstraction
//! - [`materializer`] - Declarative resource writes
//! - [`retry`] - Bounded backoff with a pluggable clock
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod broker;
pub mod bundle;
pub mod controller;
pub mod crd;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod globalnet;
pub mod join;
pub mod materializer;
pub mod prompt;
pub mod retry;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Namespace the broker lives in
pub const DEFAULT_BROKER_NAMESPACE: &str = "submariner-k8s-broker";

/// Namespace the data-plane resources are written to
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "submariner-operator";

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "fabric-operator";

/// Name of the globalnet registry record in the broker namespace
pub const GLOBALNET_RECORD_NAME: &str = "submariner-globalnet-info";

/// Name of the record holding the published handshake bundle
pub const BROKER_INFO_RECORD_NAME: &str = "broker-info";
