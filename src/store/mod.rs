//! Shared record store
//!
//! A record is a flat string map addressed by namespace and name, carrying an
//! opaque version token. Writes are conditional on that token so concurrent
//! writers from different clusters can never silently overwrite each other.
//! On the broker this is a ConfigMap ([`ConfigMapStore`]); tests use
//! [`MemoryStore`].

mod configmap;
mod memory;

pub use configmap::ConfigMapStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Contents of a record
pub type RecordData = BTreeMap<String, String>;

/// Address of a record in the store
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    /// Namespace the record lives in
    pub namespace: String,
    /// Record name
    pub name: String,
}

impl RecordKey {
    /// Create a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A record together with the version token it was read at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedRecord {
    /// Record contents
    pub data: RecordData,
    /// Opaque version token for conditional writes
    pub version: String,
}

/// Result of a conditional write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The record was unchanged since it was read and has been replaced
    Written,
    /// Someone else wrote the record first
    Conflict,
}

/// Result of a create
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The record did not exist and was created
    Created,
    /// A record with this key already exists; nothing was written
    AlreadyExists,
}

/// Single-record atomic storage with optimistic concurrency
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read a record, `None` if it does not exist
    async fn get(&self, key: &RecordKey) -> Result<Option<VersionedRecord>>;

    /// Replace a record only if it is still at `version`
    async fn put_if_version(
        &self,
        key: &RecordKey,
        data: RecordData,
        version: &str,
    ) -> Result<PutOutcome>;

    /// Create a record that must not exist yet
    async fn create(&self, key: &RecordKey, data: RecordData) -> Result<CreateOutcome>;
}
