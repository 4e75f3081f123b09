mod test_helpers;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use leasehold::codec::{decode_schedule_state, encode_schedule_state};
use leasehold::coordinator::{
    AcquireOutcome, CoordinatorOptions, ReleaseOutcome, ScheduleCoordinator, SkipReason,
};
use leasehold::kv::{Etag, KeyValueStore, MemoryStore, StoreError, Versioned};
use leasehold::schedule::{LeaseState, ScheduleState};
use leasehold::settings::JobConfig;
use test_helpers::{SECOND, cleanup_job, coordinator, seed_state};

fn grant(outcome: AcquireOutcome) -> leasehold::coordinator::Grant {
    match outcome {
        AcquireOutcome::Acquired(grant) => grant,
        other => panic!("expected Acquired, got {other:?}"),
    }
}

#[leasehold::test]
async fn cleanup_two_workers_walkthrough() {
    let store = MemoryStore::new();
    let a = coordinator(&store, "worker-a", cleanup_job());
    let b = coordinator(&store, "worker-b", cleanup_job());

    let first = grant(a.try_acquire(0).await.unwrap());
    assert_eq!(first.lease, Some(LeaseState::grant("worker-a", 0, 30 * SECOND)));

    // Not due yet, and leased as well; due-ness is reported first.
    assert_eq!(
        b.try_acquire(5 * SECOND).await.unwrap(),
        AcquireOutcome::Skipped(SkipReason::NotDue {
            next_due_ms: 10 * SECOND
        })
    );

    assert_eq!(a.release().await.unwrap(), ReleaseOutcome::Released);
    let state = a.load_state().await.unwrap().unwrap();
    assert_eq!(state.lease, None);
    assert_eq!(state.last_executed_ms, Some(0));

    let second = grant(b.try_acquire(12 * SECOND).await.unwrap());
    assert_eq!(second.took_over_from, None);

    // B never releases; its lease ran out at 42s.
    let third = grant(a.try_acquire(43 * SECOND).await.unwrap());
    assert_eq!(third.took_over_from.as_deref(), Some("worker-b"));
    let state = a.load_state().await.unwrap().unwrap();
    assert_eq!(state.last_executed_ms, Some(43 * SECOND));
    assert_eq!(state.lease.unwrap().owner, "worker-a");
}

#[leasehold::test]
async fn due_but_leased_is_skipped() {
    let store = MemoryStore::new();
    let a = coordinator(&store, "a", cleanup_job());
    let b = coordinator(&store, "b", cleanup_job());

    a.try_acquire(0).await.unwrap();
    assert_eq!(
        b.try_acquire(15 * SECOND).await.unwrap(),
        AcquireOutcome::Skipped(SkipReason::Leased {
            owner: "a".to_string(),
            timeout_ms: 30 * SECOND,
        })
    );
}

#[leasehold::test]
async fn lease_expiring_exactly_now_is_reclaimable() {
    let store = MemoryStore::new();
    let a = coordinator(&store, "a", cleanup_job());
    let b = coordinator(&store, "b", cleanup_job());

    a.try_acquire(0).await.unwrap();
    assert!(!b.try_acquire(30 * SECOND - 1).await.unwrap().is_acquired());
    assert!(b.try_acquire(30 * SECOND).await.unwrap().is_acquired());
}

#[leasehold::test]
async fn hourly_job_is_not_due_within_a_minute() {
    let store = MemoryStore::new();
    let job = JobConfig::cloud("Hourly", 3_600 * SECOND, 60 * SECOND);
    let a = coordinator(&store, "a", job);

    assert!(a.try_acquire(0).await.unwrap().is_acquired());
    a.release().await.unwrap();
    assert!(matches!(
        a.try_acquire(60 * SECOND).await.unwrap(),
        AcquireOutcome::Skipped(SkipReason::NotDue { .. })
    ));
}

#[leasehold::test]
async fn release_is_idempotent_and_owner_only() {
    let store = MemoryStore::new();
    let a = coordinator(&store, "a", cleanup_job());
    let b = coordinator(&store, "b", cleanup_job());

    // Nothing to release before any acquire.
    assert_eq!(a.release().await.unwrap(), ReleaseOutcome::NotHeld);

    a.try_acquire(0).await.unwrap();
    assert_eq!(b.release().await.unwrap(), ReleaseOutcome::NotHeld);
    assert_eq!(
        b.load_state().await.unwrap().unwrap().lease.unwrap().owner,
        "a"
    );

    assert_eq!(a.release().await.unwrap(), ReleaseOutcome::Released);
    let after_first = a.load_state().await.unwrap();
    assert_eq!(a.release().await.unwrap(), ReleaseOutcome::NotHeld);
    assert_eq!(a.load_state().await.unwrap(), after_first);
}

#[leasehold::test]
async fn release_after_takeover_leaves_new_lease() {
    let store = MemoryStore::new();
    let a = coordinator(&store, "a", cleanup_job());
    let b = coordinator(&store, "b", cleanup_job());

    a.try_acquire(0).await.unwrap();
    b.try_acquire(31 * SECOND).await.unwrap();

    // A overran its lease and finishes late.
    assert_eq!(a.release().await.unwrap(), ReleaseOutcome::NotHeld);
    let lease = b.load_state().await.unwrap().unwrap().lease.unwrap();
    assert_eq!(lease.owner, "b");
}

#[leasehold::test]
async fn persisted_interval_overrides_configuration() {
    let store = MemoryStore::new();
    seed_state(&store, "Cleanup", &ScheduleState::new(3_600 * SECOND, false)).await;
    let a = coordinator(&store, "a", cleanup_job());

    assert!(a.try_acquire(0).await.unwrap().is_acquired());
    a.release().await.unwrap();
    assert!(!a.try_acquire(20 * SECOND).await.unwrap().is_acquired());
    assert_eq!(
        a.load_state().await.unwrap().unwrap().trigger_interval_ms,
        3_600 * SECOND
    );
}

#[leasehold::test]
async fn store_failure_acquires_nothing() {
    let store = MemoryStore::new();
    let a = coordinator(&store, "a", cleanup_job());

    store
        .fail_next(StoreError::Transient("connection reset".into()))
        .await;
    let err = a.try_acquire(0).await.unwrap_err();
    assert!(err.is_transient());
    assert!(!a.holds_lease().await);
    assert_eq!(a.load_state().await.unwrap(), None);

    assert!(a.try_acquire(0).await.unwrap().is_acquired());
}

#[leasehold::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquirers_grant_exactly_once() {
    let store = MemoryStore::new().with_latency(Duration::from_millis(5));

    for round in 0..3i64 {
        let now = round * 40 * SECOND;
        let mut handles = Vec::new();
        for i in 0..12 {
            let c = coordinator(&store, &format!("w{i}"), cleanup_job());
            handles.push(tokio::spawn(async move { c.try_acquire(now).await }));
        }
        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_acquired() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1, "round {round}");
    }
}

#[leasehold::test]
async fn per_worker_jobs_do_not_exclude_each_other() {
    let store = MemoryStore::new();
    let job = JobConfig::per_worker("Heartbeat", 10 * SECOND, 5 * SECOND);
    let a = coordinator(&store, "a", job.clone());
    let b = coordinator(&store, "b", job);

    let grant_a = grant(a.try_acquire(0).await.unwrap());
    assert_eq!(grant_a.lease, None);
    assert!(b.try_acquire(SECOND).await.unwrap().is_acquired());

    // Each worker tracks its own last execution.
    assert!(!a.try_acquire(5 * SECOND).await.unwrap().is_acquired());
    assert!(b.try_acquire(5 * SECOND).await.is_ok());
    assert!(a.try_acquire(10 * SECOND).await.unwrap().is_acquired());

    let advisory = a.load_state().await.unwrap().unwrap();
    assert!(advisory.per_worker);
    assert_eq!(advisory.lease, None);
    assert_eq!(a.release().await.unwrap(), ReleaseOutcome::NotHeld);
}

#[leasehold::test]
async fn per_worker_ignores_store_failures() {
    let store = MemoryStore::new();
    let a = coordinator(&store, "a", JobConfig::per_worker("Heartbeat", 10 * SECOND, SECOND));

    store.fail_next(StoreError::Permanent("denied".into())).await;
    store.fail_next(StoreError::Permanent("denied".into())).await;
    assert!(a.try_acquire(0).await.unwrap().is_acquired());
    assert!(!a.try_acquire(SECOND).await.unwrap().is_acquired());
}

#[leasehold::test]
async fn default_margin_applies_without_override() {
    let store = MemoryStore::new();
    let c = ScheduleCoordinator::new(
        Arc::new(store),
        JobConfig::cloud("Sync", 60 * SECOND, 20 * SECOND),
        CoordinatorOptions::new("a", "test").with_default_lease_safety_margin_ms(7 * SECOND),
    )
    .unwrap();
    assert_eq!(c.lease_duration_ms(), 27 * SECOND);
}

#[leasehold::test]
async fn takeover_and_outcomes_are_counted() {
    let metrics = leasehold::metrics::init().unwrap();
    let store = MemoryStore::new();
    let with_metrics = |worker: &str| {
        Arc::new(
            ScheduleCoordinator::new(
                Arc::new(store.clone()),
                cleanup_job(),
                CoordinatorOptions::new(worker, "test").with_metrics(metrics.clone()),
            )
            .unwrap(),
        )
    };
    let a = with_metrics("a");
    let b = with_metrics("b");

    a.try_acquire(0).await.unwrap();
    b.try_acquire(5 * SECOND).await.unwrap();
    b.try_acquire(31 * SECOND).await.unwrap();

    assert_eq!(metrics.acquire_count("Cleanup", "acquired"), 2);
    assert_eq!(metrics.acquire_count("Cleanup", "not_due"), 1);
}

/// Lets a test rewrite a record between a reader's `get` and its conditional write.
struct InterleavingStore {
    inner: MemoryStore,
    edit_before_next_put: AtomicBool,
    puts: AtomicUsize,
}

impl InterleavingStore {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            edit_before_next_put: AtomicBool::new(false),
            puts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl KeyValueStore for InterleavingStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.inner.get(key).await
    }

    async fn put_conditional(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<&Etag>,
    ) -> Result<bool, StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.edit_before_next_put.swap(false, Ordering::SeqCst) {
            let current = self.inner.get(key).await?.expect("record to edit");
            let mut edited = decode_schedule_state(&current.value).unwrap();
            edited.trigger_interval_ms = 99;
            self.inner
                .put_unconditional(key, Bytes::from(encode_schedule_state(&edited).unwrap()))
                .await;
        }
        self.inner.put_conditional(key, value, expected).await
    }

    async fn delete_if_exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete_if_exists(key).await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_by_prefix(prefix).await
    }
}

#[leasehold::test]
async fn release_reports_conflict_when_record_changes_underneath() {
    let memory = MemoryStore::new();
    let store = Arc::new(InterleavingStore::new(memory.clone()));
    let a = ScheduleCoordinator::new(
        store.clone(),
        cleanup_job(),
        CoordinatorOptions::new("a", "test"),
    )
    .unwrap();
    a.try_acquire(0).await.unwrap();
    assert!(a.holds_lease().await);

    store.edit_before_next_put.store(true, Ordering::SeqCst);
    let puts_before = store.puts.load(Ordering::SeqCst);
    assert_eq!(a.release().await.unwrap(), ReleaseOutcome::Conflict);
    // One conditional write, no retry.
    assert_eq!(store.puts.load(Ordering::SeqCst), puts_before + 1);

    // The concurrent edit wins and the lease is left to expire.
    let state = a.load_state().await.unwrap().unwrap();
    assert_eq!(state.trigger_interval_ms, 99);
    assert_eq!(state.lease.map(|l| l.owner).as_deref(), Some("a"));
    assert!(!a.holds_lease().await);
}
