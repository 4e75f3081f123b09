//! Key/value store abstraction consumed by the scheduling coordinator.
//!
//! The only consistency the coordinator relies on is per-key optimistic
//! concurrency: a write conditioned on an [`Etag`] lands only if the stored
//! value still carries that etag. Backends:
//!
//! - `memory`: in-process store used by tests and single-node setups
//! - `object`: any `object_store` backend with conditional puts (S3, GCS, Azure)

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

pub mod memory;
pub mod object;

pub use memory::MemoryStore;
pub use object::ObjectKvStore;

/// Optimistic-concurrency token of a stored value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Etag(String);

impl Etag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored value together with the etag it was read at.
#[derive(Debug, Clone)]
pub struct Versioned {
    pub value: Bytes,
    pub etag: Etag,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Timeouts, 5xx responses, dropped connections. Worth retrying.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// Malformed records, auth failures, unsupported operations. Never retried.
    #[error("permanent store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value and its etag. Returns None if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Write `value` only if the stored etag equals `expected`.
    ///
    /// `expected = None` means create only if absent. Returns false when the
    /// condition does not hold; contention is not an error.
    async fn put_conditional(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<&Etag>,
    ) -> Result<bool, StoreError>;

    /// Delete a key. Returns whether it existed. Missing keys are not an error.
    async fn delete_if_exists(&self, key: &str) -> Result<bool, StoreError>;

    /// List all keys starting with `prefix`, in ascending order.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
