//! Lease-based execution rights for periodic jobs.
//!
//! ## Protocol
//!
//! Every cloud-scoped job owns one record in the key/value store. A worker
//! wins the right to execute by rewriting that record, conditioned on the
//! etag it just read, with `last_executed = now` and a lease naming itself.
//! Losing the conditional write means another worker mutated the record in
//! between; the attempt is simply skipped and the next tick tries again.
//!
//! - **No retry on contention**: at most one failed round trip per tick.
//! - **Expiry reclaim**: a lease whose `timeout` has passed is treated as
//!   absent. Overwriting someone else's expired lease is logged as a warning
//!   since it means that worker died or overran its execution budget.
//! - **Safe release**: release clears the lease only if this worker still
//!   owns it, and only through a conditional write. Anything else is a no-op.
//!
//! ## Known Limitations
//!
//! - **Clock skew**: expiry and due-ness are judged against the caller's
//!   clock. A lease must outlast the job's execution by more than the worst
//!   skew between workers, which is what the safety margin is for.
//!
//! Worker-scoped jobs bypass all of this: due-ness is tracked in process and
//! the persisted record is only an advisory copy.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecError, decode_schedule_state, encode_schedule_state};
use crate::keys::schedule_key;
use crate::kv::{Etag, KeyValueStore, StoreError};
use crate::metrics::Metrics;
use crate::schedule::{LeaseState, ScheduleState};
use crate::settings::{JobConfig, JobConfigError};
use crate::shutdown::Releasable;

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed schedule record at {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: CodecError,
    },
    #[error(transparent)]
    InvalidJob(#[from] JobConfigError),
}

impl CoordinationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinationError::Store(e) if e.is_transient())
    }
}

/// Why a tick did not acquire the right to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The trigger interval has not elapsed since the last granted execution.
    NotDue { next_due_ms: i64 },
    /// Another worker holds a lease that has not expired.
    Leased { owner: String, timeout_ms: i64 },
    /// The record changed between our read and our conditional write.
    Contended,
}

/// The right to execute a job once, as granted by `try_acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub job: String,
    pub worker_id: String,
    pub acquired_ms: i64,
    /// The lease written to the store. None for worker-scoped jobs.
    pub lease: Option<LeaseState>,
    /// Owner of the expired lease this grant overwrote, if any.
    pub took_over_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(Grant),
    Skipped(SkipReason),
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Our lease was cleared.
    Released,
    /// No lease of ours was present: never acquired, already released,
    /// reclaimed by another worker after expiry, or cleared externally.
    NotHeld,
    /// The record changed concurrently; left as is.
    Conflict,
}

impl ReleaseOutcome {
    fn as_label(self) -> &'static str {
        match self {
            ReleaseOutcome::Released => "released",
            ReleaseOutcome::NotHeld => "not_held",
            ReleaseOutcome::Conflict => "conflict",
        }
    }
}

/// Worker-wide settings shared by every coordinator of a process.
#[derive(Clone)]
pub struct CoordinatorOptions {
    pub worker_id: String,
    pub key_prefix: String,
    /// Used for jobs that do not set their own margin.
    pub default_lease_safety_margin_ms: i64,
    pub metrics: Option<Metrics>,
}

impl CoordinatorOptions {
    pub fn new(worker_id: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            key_prefix: key_prefix.into(),
            default_lease_safety_margin_ms: crate::settings::SchedulerConfig::default()
                .lease_safety_margin_ms,
            metrics: None,
        }
    }

    pub fn with_default_lease_safety_margin_ms(mut self, margin_ms: i64) -> Self {
        self.default_lease_safety_margin_ms = margin_ms;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Decides whether this worker may execute one job now, enacts the decision
/// against the store, and later gives the right back.
pub struct ScheduleCoordinator {
    store: Arc<dyn KeyValueStore>,
    job: JobConfig,
    worker_id: String,
    key: String,
    lease_duration_ms: i64,
    metrics: Option<Metrics>,
    /// Last granted execution of a worker-scoped job, in this process only.
    local_last_executed: Mutex<Option<i64>>,
    /// The lease this coordinator last wrote and has not yet released.
    held: Mutex<Option<LeaseState>>,
}

impl ScheduleCoordinator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        job: JobConfig,
        options: CoordinatorOptions,
    ) -> Result<Self, CoordinationError> {
        job.validate()?;
        let key = schedule_key(&options.key_prefix, &job.name);
        let lease_duration_ms = job.lease_duration_ms(options.default_lease_safety_margin_ms);
        Ok(Self {
            store,
            worker_id: options.worker_id,
            key,
            lease_duration_ms,
            metrics: options.metrics,
            job,
            local_last_executed: Mutex::new(None),
            held: Mutex::new(None),
        })
    }

    pub fn job(&self) -> &JobConfig {
        &self.job
    }

    pub fn job_name(&self) -> &str {
        &self.job.name
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lease_duration_ms(&self) -> i64 {
        self.lease_duration_ms
    }

    /// Whether this coordinator wrote a lease it has not released yet.
    /// The store may disagree if the lease expired and was reclaimed.
    pub async fn holds_lease(&self) -> bool {
        self.held.lock().await.is_some()
    }

    /// Current persisted record, if any.
    pub async fn load_state(&self) -> Result<Option<ScheduleState>, CoordinationError> {
        Ok(self.read_state().await?.map(|(state, _)| state))
    }

    async fn read_state(&self) -> Result<Option<(ScheduleState, Etag)>, CoordinationError> {
        let Some(versioned) = self.store.get(&self.key).await? else {
            return Ok(None);
        };
        let state =
            decode_schedule_state(&versioned.value).map_err(|source| CoordinationError::Codec {
                key: self.key.clone(),
                source,
            })?;
        Ok(Some((state, versioned.etag)))
    }

    fn encode(&self, state: &ScheduleState) -> Result<Bytes, CoordinationError> {
        encode_schedule_state(state)
            .map(Bytes::from)
            .map_err(|source| CoordinationError::Codec {
                key: self.key.clone(),
                source,
            })
    }

    /// Try to win the right to execute the job at `now_ms`.
    ///
    /// Contention yields `Skipped(Contended)` without retrying. Store failures
    /// propagate with nothing acquired.
    pub async fn try_acquire(&self, now_ms: i64) -> Result<AcquireOutcome, CoordinationError> {
        let result = if self.job.per_worker {
            self.try_acquire_per_worker(now_ms).await
        } else {
            self.try_acquire_leased(now_ms).await
        };

        let label = match &result {
            Ok(AcquireOutcome::Acquired(_)) => "acquired",
            Ok(AcquireOutcome::Skipped(SkipReason::NotDue { .. })) => "not_due",
            Ok(AcquireOutcome::Skipped(SkipReason::Leased { .. })) => "leased",
            Ok(AcquireOutcome::Skipped(SkipReason::Contended)) => "contended",
            Err(e) => {
                if e.is_transient() {
                    warn!(job = %self.job.name, worker_id = %self.worker_id, error = %e, "schedule: acquire failed");
                } else {
                    error!(job = %self.job.name, worker_id = %self.worker_id, error = %e, "schedule: acquire failed permanently");
                }
                "error"
            }
        };
        if let Some(m) = &self.metrics {
            m.record_acquire(&self.job.name, label);
        }
        result
    }

    async fn try_acquire_leased(&self, now_ms: i64) -> Result<AcquireOutcome, CoordinationError> {
        let (state, etag) = match self.read_state().await? {
            Some((state, etag)) => (state, Some(etag)),
            None => (
                ScheduleState::new(self.job.trigger_interval_ms, false),
                None,
            ),
        };

        if !state.is_due(now_ms) {
            let next_due_ms = state
                .last_executed_ms
                .map(|last| last.saturating_add(state.trigger_interval_ms))
                .unwrap_or(now_ms);
            debug!(job = %self.job.name, next_due_ms, "schedule: not due");
            return Ok(AcquireOutcome::Skipped(SkipReason::NotDue { next_due_ms }));
        }

        if let Some(lease) = state.active_lease(now_ms) {
            debug!(job = %self.job.name, owner = %lease.owner, timeout_ms = lease.timeout_ms, "schedule: leased by another worker");
            return Ok(AcquireOutcome::Skipped(SkipReason::Leased {
                owner: lease.owner.clone(),
                timeout_ms: lease.timeout_ms,
            }));
        }

        // Any lease still present here has expired.
        let expired = state.lease.clone();
        let lease = LeaseState::grant(&self.worker_id, now_ms, self.lease_duration_ms);
        let next = ScheduleState {
            trigger_interval_ms: state.trigger_interval_ms,
            last_executed_ms: Some(now_ms),
            lease: Some(lease.clone()),
            per_worker: false,
        };

        let written = self
            .store
            .put_conditional(&self.key, self.encode(&next)?, etag.as_ref())
            .await?;
        if !written {
            debug!(job = %self.job.name, worker_id = %self.worker_id, "schedule: conditional write lost the race");
            return Ok(AcquireOutcome::Skipped(SkipReason::Contended));
        }

        let took_over_from = match expired {
            Some(prev) if !prev.is_owned_by(&self.worker_id) => {
                warn!(
                    job = %self.job.name,
                    worker_id = %self.worker_id,
                    previous_owner = %prev.owner,
                    expired_at_ms = prev.timeout_ms,
                    "schedule: took over expired lease"
                );
                if let Some(m) = &self.metrics {
                    m.record_takeover(&self.job.name);
                }
                Some(prev.owner)
            }
            Some(prev) => {
                debug!(job = %self.job.name, expired_at_ms = prev.timeout_ms, "schedule: replaced own expired lease");
                None
            }
            None => None,
        };

        *self.held.lock().await = Some(lease.clone());
        info!(job = %self.job.name, worker_id = %self.worker_id, timeout_ms = lease.timeout_ms, "schedule: acquired");
        Ok(AcquireOutcome::Acquired(Grant {
            job: self.job.name.clone(),
            worker_id: self.worker_id.clone(),
            acquired_ms: now_ms,
            lease: Some(lease),
            took_over_from,
        }))
    }

    async fn try_acquire_per_worker(&self, now_ms: i64) -> Result<AcquireOutcome, CoordinationError> {
        // The persisted record only supplies the (possibly admin-edited) interval.
        let persisted = match self.read_state().await {
            Ok(persisted) => persisted,
            Err(e) => {
                debug!(job = %self.job.name, error = %e, "schedule: advisory record unreadable, using configured interval");
                None
            }
        };
        let trigger_interval_ms = persisted
            .as_ref()
            .map(|(state, _)| state.trigger_interval_ms)
            .unwrap_or(self.job.trigger_interval_ms);

        let mut local = self.local_last_executed.lock().await;
        let local_state = ScheduleState {
            trigger_interval_ms,
            last_executed_ms: *local,
            lease: None,
            per_worker: true,
        };
        if !local_state.is_due(now_ms) {
            let next_due_ms = local
                .map(|last| last.saturating_add(trigger_interval_ms))
                .unwrap_or(now_ms);
            return Ok(AcquireOutcome::Skipped(SkipReason::NotDue { next_due_ms }));
        }
        *local = Some(now_ms);
        drop(local);

        self.publish_advisory(local_state.granted(now_ms, None), persisted.map(|(_, etag)| etag))
            .await;

        debug!(job = %self.job.name, worker_id = %self.worker_id, "schedule: acquired (per worker)");
        Ok(AcquireOutcome::Acquired(Grant {
            job: self.job.name.clone(),
            worker_id: self.worker_id.clone(),
            acquired_ms: now_ms,
            lease: None,
            took_over_from: None,
        }))
    }

    /// Best-effort visibility write for worker-scoped jobs. Never consulted for exclusion.
    async fn publish_advisory(&self, state: ScheduleState, etag: Option<Etag>) {
        let bytes = match self.encode(&state) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(job = %self.job.name, error = %e, "schedule: advisory encode failed");
                return;
            }
        };
        match self.store.put_conditional(&self.key, bytes, etag.as_ref()).await {
            Ok(true) => {}
            Ok(false) => debug!(job = %self.job.name, "schedule: advisory write raced, ignored"),
            Err(e) => debug!(job = %self.job.name, error = %e, "schedule: advisory write failed, ignored"),
        }
    }

    /// Give back the lease if this worker still owns it.
    ///
    /// Idempotent: a missing lease, someone else's lease, or a concurrent
    /// change to the record all leave the store untouched.
    pub async fn release(&self) -> Result<ReleaseOutcome, CoordinationError> {
        let result = self.release_inner().await;
        match &result {
            Ok(outcome) => {
                *self.held.lock().await = None;
                if let Some(m) = &self.metrics {
                    m.record_release(&self.job.name, outcome.as_label());
                }
            }
            Err(_) => {
                if let Some(m) = &self.metrics {
                    m.record_release(&self.job.name, "error");
                }
            }
        }
        result
    }

    async fn release_inner(&self) -> Result<ReleaseOutcome, CoordinationError> {
        if self.job.per_worker {
            return Ok(ReleaseOutcome::NotHeld);
        }
        let Some((state, etag)) = self.read_state().await? else {
            debug!(job = %self.job.name, "release: record missing");
            return Ok(ReleaseOutcome::NotHeld);
        };
        match &state.lease {
            Some(lease) if lease.is_owned_by(&self.worker_id) => {}
            other => {
                debug!(job = %self.job.name, worker_id = %self.worker_id, holder = ?other.as_ref().map(|l| &l.owner), "release: not our lease");
                return Ok(ReleaseOutcome::NotHeld);
            }
        }

        let cleared = state.without_lease();
        if self
            .store
            .put_conditional(&self.key, self.encode(&cleared)?, Some(&etag))
            .await?
        {
            info!(job = %self.job.name, worker_id = %self.worker_id, "schedule: released");
            Ok(ReleaseOutcome::Released)
        } else {
            // Stale at worst: the next acquirer waits out the timeout.
            debug!(job = %self.job.name, "release: record changed concurrently, leaving it");
            Ok(ReleaseOutcome::Conflict)
        }
    }
}

#[async_trait]
impl Releasable for ScheduleCoordinator {
    fn name(&self) -> &str {
        &self.job.name
    }

    /// Shutdown path: release only if we believe we hold a lease, never fail.
    async fn force_release(&self) {
        if !self.holds_lease().await {
            return;
        }
        match self.release().await {
            Ok(outcome) => {
                debug!(job = %self.job.name, outcome = ?outcome, "schedule: force released")
            }
            Err(e) => {
                warn!(job = %self.job.name, error = %e, "schedule: force release failed, lease will expire")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn coordinator(store: &MemoryStore, worker: &str, job: JobConfig) -> ScheduleCoordinator {
        ScheduleCoordinator::new(
            Arc::new(store.clone()),
            job,
            CoordinatorOptions::new(worker, "test"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn absent_record_is_created_on_first_acquire() {
        let store = MemoryStore::new();
        let a = coordinator(&store, "a", JobConfig::cloud("job", 1_000, 500).with_lease_safety_margin_ms(100));

        assert!(a.try_acquire(0).await.unwrap().is_acquired());
        let state = a.load_state().await.unwrap().unwrap();
        assert_eq!(state.last_executed_ms, Some(0));
        assert_eq!(state.lease, Some(LeaseState::grant("a", 0, 600)));
        assert!(a.holds_lease().await);
    }

    #[tokio::test]
    async fn release_clears_held_marker() {
        let store = MemoryStore::new();
        let a = coordinator(&store, "a", JobConfig::cloud("job", 1_000, 500));
        a.try_acquire(0).await.unwrap();
        assert_eq!(a.release().await.unwrap(), ReleaseOutcome::Released);
        assert!(!a.holds_lease().await);
        assert_eq!(a.release().await.unwrap(), ReleaseOutcome::NotHeld);
    }

    #[tokio::test]
    async fn invalid_job_is_rejected() {
        let store = MemoryStore::new();
        let err = ScheduleCoordinator::new(
            Arc::new(store),
            JobConfig::cloud("", 1, 1),
            CoordinatorOptions::new("a", "test"),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CoordinationError::InvalidJob(JobConfigError::EmptyName)));
    }

    #[tokio::test]
    async fn malformed_record_is_permanent() {
        let store = MemoryStore::new();
        let a = coordinator(&store, "a", JobConfig::cloud("job", 1_000, 500));
        store
            .put_unconditional(a.key(), Bytes::from_static(b"\x07garbage"))
            .await;
        let err = a.try_acquire(0).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Codec { .. }));
        assert!(!err.is_transient());
    }
}
