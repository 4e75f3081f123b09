use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::kv::{Etag, KeyValueStore, StoreError, Versioned};

/// Backoff policy for transient store failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt. Zero disables retrying.
    #[serde(default = "RetryPolicy::default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "RetryPolicy::default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default)]
    pub max_interval_ms: Option<u64>,
    #[serde(default = "RetryPolicy::default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default)]
    pub randomize_interval: bool,
}

impl RetryPolicy {
    pub fn default_retry_count() -> u32 {
        3
    }
    pub fn default_initial_interval_ms() -> u64 {
        100
    }
    pub fn default_backoff_factor() -> f64 {
        2.0
    }

    pub fn none() -> Self {
        Self {
            retry_count: 0,
            ..Self::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: Self::default_retry_count(),
            initial_interval_ms: Self::default_initial_interval_ms(),
            max_interval_ms: Some(5_000),
            backoff_factor: Self::default_backoff_factor(),
            randomize_interval: false,
        }
    }
}

/// Delay before retry number `failures_so_far` (0 for the first retry), or None
/// once the policy is exhausted.
///
/// `delay_n = initial * factor^n`, optionally scaled by a random factor in
/// [1, 2), then capped at `max_interval_ms`.
pub fn next_retry_delay_ms(failures_so_far: u32, policy: &RetryPolicy) -> Option<u64> {
    if failures_so_far >= policy.retry_count {
        return None;
    }
    let mut delay =
        (policy.initial_interval_ms as f64 * policy.backoff_factor.powi(failures_so_far as i32))
            .round();
    if policy.randomize_interval {
        delay *= rand::rng().random_range(1.0..2.0);
    }
    let mut delay = if delay.is_finite() && delay > 0.0 {
        delay.round() as u64
    } else {
        0
    };
    if let Some(max) = policy.max_interval_ms {
        delay = delay.min(max);
    }
    Some(delay)
}

/// Wraps a store and retries transient failures with backoff.
///
/// Permanent failures and contention (`put_conditional` returning false) are
/// passed through untouched. A conditional write whose response was lost may
/// have landed; its retry then observes an etag mismatch and reports false,
/// which callers already treat as having lost the race.
pub struct RetryingStore {
    inner: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn with_retries<T, F, Fut>(&self, op: &'static str, key: &str, f: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let mut failures: u32 = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(err) if err.is_transient() => match next_retry_delay_ms(failures, &self.policy) {
                    Some(delay_ms) => {
                        debug!(op, key, attempt = failures + 1, delay_ms, error = %err, "store: retrying transient failure");
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        failures += 1;
                    }
                    None => {
                        warn!(op, key, attempts = failures + 1, error = %err, "store: retries exhausted");
                        return Err(err);
                    }
                },
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for RetryingStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.with_retries("get", key, || self.inner.get(key)).await
    }

    async fn put_conditional(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<&Etag>,
    ) -> Result<bool, StoreError> {
        self.with_retries("put_conditional", key, || {
            self.inner.put_conditional(key, value.clone(), expected)
        })
        .await
    }

    async fn delete_if_exists(&self, key: &str) -> Result<bool, StoreError> {
        self.with_retries("delete_if_exists", key, || self.inner.delete_if_exists(key))
            .await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.with_retries("list_by_prefix", prefix, || self.inner.list_by_prefix(prefix))
            .await
    }
}
