//! Error types for the fabric operator
//!
//! Errors carry enough context to be reported verbatim on the `Fabric` status.
//! Operator input problems fail fast, allocator errors name the offending
//! range, and transient errors (`Conflict`, `Unavailable`) are retried locally
//! before they ever reach a caller.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for fabric operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Operator-supplied configuration is malformed or contradictory
    #[error("invalid input for {cluster}: {message}")]
    InvalidInput {
        /// Cluster the input belongs to
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.joinConfig.clusterID")
        field: Option<String>,
    },

    /// A CIDR is malformed or lies outside the fabric supernet
    #[error("invalid range {cidr}: {message}")]
    InvalidRange {
        /// The rejected CIDR as supplied
        cidr: String,
        /// Description of what's wrong with it
        message: String,
    },

    /// A requested CIDR collides with a block owned by another cluster
    #[error("{cidr} overlaps {existing} allocated to cluster {owner}")]
    Overlap {
        /// The requested CIDR
        cidr: String,
        /// The already-allocated block it collides with
        existing: String,
        /// Cluster owning the existing block
        owner: String,
    },

    /// No free block of the required size is left in the supernet
    #[error("no free block of {block_size} addresses left in {supernet}")]
    Exhausted {
        /// The supernet that was scanned
        supernet: String,
        /// Required block size in addresses
        block_size: u64,
    },

    /// A conditional write kept losing against concurrent writers
    #[error("record {key} changed concurrently, gave up after {attempts} attempts")]
    Conflict {
        /// Key of the contended record
        key: String,
        /// Number of write attempts made
        attempts: u32,
    },

    /// A dependency is not (yet) available
    #[error("{resource} unavailable: {message}")]
    Unavailable {
        /// What was being waited for
        resource: String,
        /// Why it is considered unavailable
        message: String,
    },

    /// The broker handshake bundle could not be decoded
    #[error("malformed broker bundle: {message}")]
    MalformedBundle {
        /// Decode or parse failure
        message: String,
    },

    /// A collaborator (materializer, discovery, prompt) failed
    #[error("{collaborator} failed: {message}")]
    DependencyFailure {
        /// Collaborator name
        collaborator: String,
        /// Underlying failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create an invalid-input error without cluster context
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create an invalid-input error for a cluster and field path
    pub fn invalid_input_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::InvalidInput {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invalid-range error
    pub fn invalid_range(cidr: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidRange {
            cidr: cidr.into(),
            message: msg.into(),
        }
    }

    /// Create an overlap error
    pub fn overlap(
        cidr: impl Into<String>,
        existing: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self::Overlap {
            cidr: cidr.into(),
            existing: existing.into(),
            owner: owner.into(),
        }
    }

    /// Create an exhausted error
    pub fn exhausted(supernet: impl Into<String>, block_size: u64) -> Self {
        Self::Exhausted {
            supernet: supernet.into(),
            block_size,
        }
    }

    /// Create a conflict error
    pub fn conflict(key: impl Into<String>, attempts: u32) -> Self {
        Self::Conflict {
            key: key.into(),
            attempts,
        }
    }

    /// Create an unavailable error
    pub fn unavailable(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Unavailable {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a malformed-bundle error
    pub fn malformed_bundle(msg: impl Into<String>) -> Self {
        Self::MalformedBundle {
            message: msg.into(),
        }
    }

    /// Create a dependency-failure error
    pub fn dependency(collaborator: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DependencyFailure {
            collaborator: collaborator.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Check if a later reconciliation pass could succeed without a spec change
    ///
    /// Input, range, overlap and decode errors need the operator (or the broker
    /// administrator) to fix something first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::InvalidInput { .. } => false,
            Error::InvalidRange { .. } => false,
            Error::Overlap { .. } => false,
            Error::Exhausted { .. } => true,
            Error::Conflict { .. } => true,
            Error::Unavailable { .. } => true,
            Error::MalformedBundle { .. } => false,
            Error::DependencyFailure { .. } => true,
            Error::Serialization { .. } => false,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::InvalidInput { cluster, .. } => Some(cluster),
            Error::Overlap { owner, .. } => Some(owner),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: How join failures are reported
    // ==========================================================================

    /// Story: An operator typo in the cluster ID is reported with the field
    /// that needs fixing and is never retried.
    #[test]
    fn story_invalid_input_names_the_field() {
        let err = Error::invalid_input_for_field(
            "Cluster_A",
            "spec.joinConfig.clusterID",
            "cluster IDs must be valid DNS-1123 names",
        );
        assert!(err.to_string().contains("Cluster_A"));
        assert!(err.to_string().contains("DNS-1123"));
        assert!(!err.is_retryable());
        assert_eq!(err.cluster(), Some("Cluster_A"));

        match err {
            Error::InvalidInput { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.joinConfig.clusterID"))
            }
            _ => panic!("Expected InvalidInput variant"),
        }
    }

    /// Story: A colliding explicit global CIDR tells the operator who owns the
    /// block they asked for.
    #[test]
    fn story_overlap_names_the_owner() {
        let err = Error::overlap("242.1.0.0/16", "242.1.0.0/16", "cluster-b");
        assert_eq!(
            err.to_string(),
            "242.1.0.0/16 overlaps 242.1.0.0/16 allocated to cluster cluster-b"
        );
        assert_eq!(err.cluster(), Some("cluster-b"));
        assert!(!err.is_retryable());
    }

    /// Story: Transient broker conditions are left to the next reconcile pass.
    #[test]
    fn story_transient_errors_are_retryable() {
        assert!(Error::conflict("ns/globalnet", 10).is_retryable());
        assert!(Error::unavailable("broker-info", "not provisioned").is_retryable());
        assert!(Error::exhausted("242.0.0.0/8", 65536).is_retryable());
        assert!(Error::dependency("materializer", "timeout").is_retryable());
    }

    /// Story: Corrupted or malformed data needs a human.
    #[test]
    fn story_corruption_is_not_retryable() {
        assert!(!Error::malformed_bundle("invalid base64").is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());
        assert!(!Error::invalid_range("242.0.0.1/16", "host bits set").is_retryable());
    }

    #[test]
    fn test_constructors_accept_str_and_string() {
        let err = Error::invalid_input("static message");
        assert!(err.to_string().contains(UNKNOWN_CONTEXT));

        let err = Error::unavailable(format!("secret {}", "cluster-a-token"), "not populated");
        assert!(err.to_string().contains("cluster-a-token"));
    }
}
