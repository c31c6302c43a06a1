//! In-memory record store
//!
//! Behaves like the ConfigMap store: every successful write bumps a
//! monotonically increasing version. A hook can be armed to mutate a record
//! right before the next conditional write, which makes that write lose the
//! race exactly as it would against a concurrent writer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CreateOutcome, PutOutcome, RecordData, RecordKey, RecordStore, VersionedRecord};
use crate::Result;

type Interleave = Box<dyn FnOnce(&mut RecordData) + Send>;

#[derive(Default)]
struct Inner {
    records: HashMap<RecordKey, (RecordData, u64)>,
    next_version: u64,
    writes: u64,
    conflicts: u64,
    interleave: Option<Interleave>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// Record store held in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a record unconditionally
    pub fn seed(&self, key: &RecordKey, data: RecordData) {
        let mut inner = self.inner.lock();
        let version = inner.bump();
        inner.records.insert(key.clone(), (data, version));
    }

    /// Current contents of a record
    pub fn snapshot(&self, key: &RecordKey) -> Option<RecordData> {
        self.inner.lock().records.get(key).map(|(d, _)| d.clone())
    }

    /// Number of successful writes (creates and conditional puts)
    pub fn write_count(&self) -> u64 {
        self.inner.lock().writes
    }

    /// Number of conditional writes rejected for a stale version
    pub fn conflict_count(&self) -> u64 {
        self.inner.lock().conflicts
    }

    /// Let a simulated concurrent writer change the record before the next
    /// conditional write is evaluated.
    pub fn interleave_before_next_put<F>(&self, f: F)
    where
        F: FnOnce(&mut RecordData) + Send + 'static,
    {
        self.inner.lock().interleave = Some(Box::new(f));
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<VersionedRecord>> {
        Ok(self
            .inner
            .lock()
            .records
            .get(key)
            .map(|(data, version)| VersionedRecord {
                data: data.clone(),
                version: version.to_string(),
            }))
    }

    async fn put_if_version(
        &self,
        key: &RecordKey,
        data: RecordData,
        version: &str,
    ) -> Result<PutOutcome> {
        let mut inner = self.inner.lock();

        if let Some(interleave) = inner.interleave.take() {
            let bumped = inner.bump();
            if let Some((current, v)) = inner.records.get_mut(key) {
                interleave(current);
                *v = bumped;
            }
        }

        let current = inner.records.get(key).map(|(_, v)| v.to_string());
        if current.as_deref() != Some(version) {
            inner.conflicts += 1;
            return Ok(PutOutcome::Conflict);
        }

        let new_version = inner.bump();
        inner.records.insert(key.clone(), (data, new_version));
        inner.writes += 1;
        Ok(PutOutcome::Written)
    }

    async fn create(&self, key: &RecordKey, data: RecordData) -> Result<CreateOutcome> {
        let mut inner = self.inner.lock();
        if inner.records.contains_key(key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let version = inner.bump();
        inner.records.insert(key.clone(), (data, version));
        inner.writes += 1;
        Ok(CreateOutcome::Created)
    }
}
