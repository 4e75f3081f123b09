use std::time::{SystemTime, UNIX_EPOCH};

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::Serialize;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// An exclusive, time-bounded claim on a schedule by one worker.
///
/// After `timeout_ms` the lease is abandoned and any worker may overwrite it.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize, Serialize)]
#[archive(check_bytes)]
pub struct LeaseState {
    pub owner: String,
    pub acquired_ms: i64,
    pub timeout_ms: i64,
}

impl LeaseState {
    /// Grant a lease starting at `now_ms`. Durations below one millisecond are
    /// raised to one so that `timeout_ms > acquired_ms` always holds.
    pub fn grant(owner: impl Into<String>, now_ms: i64, duration_ms: i64) -> Self {
        Self {
            owner: owner.into(),
            acquired_ms: now_ms,
            timeout_ms: now_ms.saturating_add(duration_ms.max(1)),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.timeout_ms <= now_ms
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.owner == worker_id
    }
}

/// Persisted per-job scheduling record.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize, Serialize)]
#[archive(check_bytes)]
pub struct ScheduleState {
    /// Minimum time between two granted executions.
    pub trigger_interval_ms: i64,
    /// When execution was last granted, `None` if never.
    pub last_executed_ms: Option<i64>,
    pub lease: Option<LeaseState>,
    /// Worker-scoped jobs run on every worker and never carry a lease.
    pub per_worker: bool,
}

impl ScheduleState {
    pub fn new(trigger_interval_ms: i64, per_worker: bool) -> Self {
        Self {
            trigger_interval_ms,
            last_executed_ms: None,
            lease: None,
            per_worker,
        }
    }

    /// A job is due unless `now - trigger_interval < last_executed`.
    pub fn is_due(&self, now_ms: i64) -> bool {
        match self.last_executed_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(self.trigger_interval_ms) >= last,
        }
    }

    /// The lease, if one is present and has not yet expired at `now_ms`.
    pub fn active_lease(&self, now_ms: i64) -> Option<&LeaseState> {
        self.lease.as_ref().filter(|l| !l.is_expired(now_ms))
    }

    /// The state after granting an execution at `now_ms`.
    pub fn granted(&self, now_ms: i64, lease: Option<LeaseState>) -> Self {
        Self {
            trigger_interval_ms: self.trigger_interval_ms,
            last_executed_ms: Some(now_ms),
            lease: if self.per_worker { None } else { lease },
            per_worker: self.per_worker,
        }
    }

    pub fn without_lease(&self) -> Self {
        Self {
            lease: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_executed_is_due() {
        let state = ScheduleState::new(10_000, false);
        assert!(state.is_due(0));
        assert!(state.is_due(i64::MIN));
    }

    #[test]
    fn due_boundary_is_inclusive() {
        let state = ScheduleState::new(10_000, false).granted(1_000, None);
        assert!(!state.is_due(10_999));
        assert!(state.is_due(11_000));
    }

    #[test]
    fn lease_expires_at_timeout() {
        let lease = LeaseState::grant("a", 0, 30_000);
        assert!(!lease.is_expired(29_999));
        assert!(lease.is_expired(30_000));
    }

    #[test]
    fn zero_duration_lease_still_ends_after_it_starts() {
        let lease = LeaseState::grant("a", 5, 0);
        assert!(lease.timeout_ms > lease.acquired_ms);
    }

    #[test]
    fn negative_duration_is_clamped_to_one_millisecond() {
        let lease = LeaseState::grant("a", 5, -30_000);
        assert_eq!(lease.timeout_ms, 6);
        assert!(!lease.is_expired(5));
        assert!(lease.is_expired(6));
    }

    #[test]
    fn per_worker_state_never_keeps_a_lease() {
        let state = ScheduleState::new(1_000, true);
        let granted = state.granted(0, Some(LeaseState::grant("a", 0, 10)));
        assert!(granted.lease.is_none());
        assert_eq!(granted.last_executed_ms, Some(0));
    }
}
