//! Global address registry
//!
//! Every cluster that enables globalnet gets a distinct block out of one
//! fabric-wide supernet. The assignments live in a single shared record on
//! the broker; [`AddressRegistryClient::update_allocation`] is the only code
//! path that writes it, as a compare-and-swap loop:
//!
//! 1. read the record and its version
//! 2. return early if the cluster already holds the block it would get
//! 3. run the pure [`allocator::allocate`] against the snapshot
//! 4. write back conditioned on the version from step 1
//! 5. on conflict, back off and start over from a fresh read

pub mod allocator;
pub mod cidr;
pub mod registry;

pub use registry::AddressRegistry;

use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{debug, error, info, instrument, warn};

use crate::retry::{Backoff, Clock, RetryConfig};
use crate::store::{CreateOutcome, PutOutcome, RecordKey, RecordStore};
use crate::{Error, Result};

/// Reads and updates the globalnet registry record
#[derive(Clone)]
pub struct AddressRegistryClient {
    store: Arc<dyn RecordStore>,
    key: RecordKey,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl AddressRegistryClient {
    /// Create a client for the record at `key`
    pub fn new(
        store: Arc<dyn RecordStore>,
        key: RecordKey,
        retry: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            key,
            retry,
            clock,
        }
    }

    /// Current registry contents
    pub async fn load(&self) -> Result<AddressRegistry> {
        let record = self.store.get(&self.key).await?.ok_or_else(|| {
            Error::unavailable(
                self.key.to_string(),
                "globalnet registry not found, is the broker deployed?",
            )
        })?;
        AddressRegistry::from_record(&record.data)
    }

    /// Allocate (or confirm) the global CIDR of `cluster_id`.
    ///
    /// Returns `None` when globalnet is disabled fabric-wide. Identical
    /// repeated calls return the same block without writing.
    #[instrument(skip(self), fields(record = %self.key))]
    pub async fn update_allocation(
        &self,
        cluster_id: &str,
        block_size: u64,
        explicit: Option<&str>,
    ) -> Result<Option<Ipv4Net>> {
        let mut backoff = Backoff::new(&self.retry);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let record = self.store.get(&self.key).await?.ok_or_else(|| {
                Error::unavailable(
                    self.key.to_string(),
                    "globalnet registry not found, is the broker deployed?",
                )
            })?;
            let mut registry = AddressRegistry::from_record(&record.data)?;

            if !registry.enabled {
                if let Some(cidr) = explicit {
                    return Err(Error::invalid_input_for_field(
                        cluster_id,
                        "spec.joinConfig.globalnetCIDR",
                        format!(
                            "global CIDR {} requested but globalnet is disabled on the broker",
                            cidr
                        ),
                    ));
                }
                info!(cluster_id = %cluster_id, "Globalnet disabled on broker, nothing to allocate");
                return Ok(None);
            }

            let block = allocator::allocate(&registry, cluster_id, block_size, explicit)?;
            if registry.primary_block(cluster_id) == Some(block) {
                debug!(cluster_id = %cluster_id, global_cidr = %block, "Allocation unchanged");
                return Ok(Some(block));
            }

            registry.assign(cluster_id, block);
            let data = registry.to_record()?;
            match self
                .store
                .put_if_version(&self.key, data, &record.version)
                .await?
            {
                PutOutcome::Written => {
                    info!(
                        cluster_id = %cluster_id,
                        global_cidr = %block,
                        attempt = attempt,
                        "Allocated global CIDR"
                    );
                    return Ok(Some(block));
                }
                PutOutcome::Conflict => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            cluster_id = %cluster_id,
                            attempt = attempt,
                            delay_ms = delay.as_millis(),
                            "Registry changed concurrently, retrying"
                        );
                        self.clock.sleep(delay).await;
                    }
                    None => {
                        error!(
                            cluster_id = %cluster_id,
                            attempt = attempt,
                            "Registry update kept conflicting"
                        );
                        return Err(Error::conflict(self.key.to_string(), attempt));
                    }
                },
            }
        }
    }

    /// Create the registry if it does not exist yet, otherwise validate it.
    ///
    /// An existing registry keeps its settings; only its invariants are
    /// checked.
    #[instrument(skip(self), fields(record = %self.key))]
    pub async fn ensure_registry(
        &self,
        enabled: bool,
        supernet: &str,
        default_block_size: u64,
    ) -> Result<AddressRegistry> {
        let supernet = cidr::parse_cidr(supernet)?;
        let default_block_size = if enabled {
            cidr::valid_cluster_size(&supernet, default_block_size)?
        } else {
            default_block_size
        };

        let fresh = AddressRegistry::new(enabled, supernet, default_block_size);
        match self.store.create(&self.key, fresh.to_record()?).await? {
            CreateOutcome::Created => {
                info!(enabled = enabled, supernet = %supernet, "Created globalnet registry");
                Ok(fresh)
            }
            CreateOutcome::AlreadyExists => {
                let existing = self.load().await?;
                existing.validate()?;
                debug!(
                    clusters = existing.cluster_blocks.len(),
                    "Globalnet registry already exists"
                );
                Ok(existing)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ManualClock;
    use crate::store::{MemoryStore, MockRecordStore, VersionedRecord};

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn key() -> RecordKey {
        RecordKey::new("submariner-k8s-broker", "submariner-globalnet-info")
    }

    fn client(store: Arc<dyn RecordStore>, clock: Arc<ManualClock>) -> AddressRegistryClient {
        AddressRegistryClient::new(store, key(), RetryConfig::immediate(5), clock)
    }

    async fn seeded() -> (MemoryStore, AddressRegistryClient) {
        let store = MemoryStore::new();
        let c = client(Arc::new(store.clone()), Arc::new(ManualClock::new()));
        c.ensure_registry(true, "242.0.0.0/8", 65536).await.unwrap();
        (store, c)
    }

    /// Story: Replaying a join does not rewrite the registry.
    #[tokio::test]
    async fn story_repeated_allocation_is_idempotent() {
        let (store, c) = seeded().await;

        let first = c.update_allocation("cluster-a", 0, None).await.unwrap();
        let writes = store.write_count();
        let second = c.update_allocation("cluster-a", 0, None).await.unwrap();

        assert_eq!(first, Some(net("242.0.0.0/16")));
        assert_eq!(first, second);
        assert_eq!(store.write_count(), writes);
    }

    /// Story: Another cluster grabs the base block between our read and our
    /// write. We retry against the new state and land on the next block.
    #[tokio::test]
    async fn story_conflict_retries_against_fresh_snapshot() {
        let (store, c) = seeded().await;

        store.interleave_before_next_put(|data| {
            let mut r = AddressRegistry::from_record(data).unwrap();
            r.assign("cluster-b", "242.0.0.0/16".parse().unwrap());
            *data = r.to_record().unwrap();
        });

        let got = c.update_allocation("cluster-a", 0, None).await.unwrap();
        assert_eq!(got, Some(net("242.1.0.0/16")));
        assert_eq!(store.conflict_count(), 1);

        let r = c.load().await.unwrap();
        assert_eq!(r.primary_block("cluster-b"), Some(net("242.0.0.0/16")));
        assert_eq!(r.primary_block("cluster-a"), Some(net("242.1.0.0/16")));
        r.validate().unwrap();
    }

    #[tokio::test]
    async fn test_persistent_conflict_surfaces_after_bound() {
        let mut mock = MockRecordStore::new();
        let data = AddressRegistry::new(true, net("242.0.0.0/8"), 65536)
            .to_record()
            .unwrap();
        mock.expect_get().times(5).returning(move |_| {
            Ok(Some(VersionedRecord {
                data: data.clone(),
                version: "1".into(),
            }))
        });
        mock.expect_put_if_version()
            .times(5)
            .returning(|_, _, _| Ok(PutOutcome::Conflict));

        let clock = Arc::new(ManualClock::new());
        let c = client(Arc::new(mock), clock.clone());
        let err = c.update_allocation("cluster-a", 0, None).await.unwrap_err();

        assert!(matches!(err, Error::Conflict { attempts: 5, .. }));
        assert_eq!(clock.sleeps().len(), 4);
    }

    #[tokio::test]
    async fn test_missing_registry_is_unavailable() {
        let store = MemoryStore::new();
        let c = client(Arc::new(store), Arc::new(ManualClock::new()));
        assert!(matches!(
            c.update_allocation("cluster-a", 0, None).await,
            Err(Error::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_disabled_registry_skips_allocation() {
        let store = MemoryStore::new();
        let c = client(Arc::new(store.clone()), Arc::new(ManualClock::new()));
        c.ensure_registry(false, "242.0.0.0/8", 0).await.unwrap();
        let writes = store.write_count();

        assert_eq!(c.update_allocation("cluster-a", 0, None).await.unwrap(), None);
        assert_eq!(store.write_count(), writes);
        assert!(matches!(
            c.update_allocation("cluster-a", 0, Some("242.0.0.0/16")).await,
            Err(Error::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_allocator_errors_are_not_retried() {
        let (store, c) = seeded().await;
        c.update_allocation("cluster-b", 0, None).await.unwrap();
        let err = c
            .update_allocation("cluster-c", 0, Some("242.0.0.0/16"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Overlap { .. }));
        assert_eq!(store.conflict_count(), 0);
    }

    #[tokio::test]
    async fn test_ensure_registry_keeps_existing_allocations() {
        let (_store, c) = seeded().await;
        c.update_allocation("cluster-a", 0, None).await.unwrap();

        // Second provisioning with different settings does not reset anything
        let r = c.ensure_registry(true, "10.0.0.0/8", 256).await.unwrap();
        assert_eq!(r.supernet, net("242.0.0.0/8"));
        assert_eq!(r.primary_block("cluster-a"), Some(net("242.0.0.0/16")));
    }

    #[tokio::test]
    async fn test_ensure_registry_rejects_oversized_blocks() {
        let store = MemoryStore::new();
        let c = client(Arc::new(store), Arc::new(ManualClock::new()));
        assert!(matches!(
            c.ensure_registry(true, "242.0.0.0/8", 1 << 24).await,
            Err(Error::InvalidRange { .. })
        ));
    }
}
