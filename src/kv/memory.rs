//! MemoryStore: an in-process KeyValueStore with real etag semantics.
//!
//! Every successful write stamps a fresh etag drawn from a store-wide counter,
//! so a deleted and re-created key never reuses an etag a reader might still
//! hold. Clones share the same underlying map, which lets tests hand one
//! store to many simulated workers.
//!
//! For tests the store can also inject faults (`fail_next`), add latency to
//! widen race windows (`with_latency`), and be mutated behind the
//! coordinator's back (`put_unconditional`), the way administrative tooling
//! would.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{Etag, KeyValueStore, StoreError, Versioned};

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    version: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    next_version: u64,
    faults: VecDeque<StoreError>,
    operations: u64,
}

impl Inner {
    fn stamp(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Count the operation and pop an injected fault, if any.
    fn begin(&mut self) -> Result<(), StoreError> {
        self.operations += 1;
        match self.faults.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `latency` before every operation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next operation (of any kind) with `err`. Faults queue up in order.
    pub async fn fail_next(&self, err: StoreError) {
        self.inner.lock().await.faults.push_back(err);
    }

    /// Overwrite a key regardless of its etag and return the new etag.
    pub async fn put_unconditional(&self, key: &str, value: Bytes) -> Etag {
        let mut inner = self.inner.lock().await;
        let version = inner.stamp();
        inner
            .entries
            .insert(key.to_string(), Entry { value, version });
        Etag::new(version.to_string())
    }

    /// Number of operations attempted against this store so far, faults included.
    pub async fn operation_count(&self) -> u64 {
        self.inner.lock().await.operations
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        inner.begin()?;
        Ok(inner.entries.get(key).map(|e| Versioned {
            value: e.value.clone(),
            etag: Etag::new(e.version.to_string()),
        }))
    }

    async fn put_conditional(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<&Etag>,
    ) -> Result<bool, StoreError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        inner.begin()?;
        let current = inner.entries.get(key).map(|e| e.version.to_string());
        let matches = match (expected, current) {
            (None, None) => true,
            (Some(expected), Some(current)) => expected.as_str() == current,
            _ => false,
        };
        if !matches {
            return Ok(false);
        }
        let version = inner.stamp();
        inner
            .entries
            .insert(key.to_string(), Entry { value, version });
        Ok(true)
    }

    async fn delete_if_exists(&self, key: &str) -> Result<bool, StoreError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        inner.begin()?;
        Ok(inner.entries.remove(key).is_some())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        inner.begin()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
