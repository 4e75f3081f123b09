use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::coordinator::{
    AcquireOutcome, CoordinationError, Grant, ReleaseOutcome, ScheduleCoordinator, SkipReason,
};
use crate::metrics::Metrics;
use crate::shutdown::ShutdownFinalizer;

/// What a job body is told about the execution it was granted.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: String,
    pub worker_id: String,
    pub started_ms: i64,
    /// When the lease expires and other workers may start the job. None for worker-scoped jobs.
    pub lease_timeout_ms: Option<i64>,
    shutdown: watch::Receiver<bool>,
}

impl JobContext {
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown begins, for bodies that want to stop at a safe point.
    /// Never resolves if the finalizer is gone.
    pub async fn shutdown_requested(&mut self) {
        let signalled = self.shutdown.wait_for(|v| *v).await.is_ok();
        if !signalled {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()>;
}

struct FnJob<F>(F);

#[async_trait]
impl<F, Fut> ScheduledJob for FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Adapt a closure returning a future into a job body.
pub fn job_fn<F, Fut>(f: F) -> Arc<dyn ScheduledJob>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnJob(f))
}

#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing ran.
    Skipped(SkipReason),
    /// The body ran to completion. `release` is None when releasing failed
    /// (the lease then expires on its own) or the job is worker-scoped.
    Completed {
        grant: Grant,
        release: Option<ReleaseOutcome>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The tick failed before anything was acquired.
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error("job {job} failed: {error:#}")]
    Job { job: String, error: anyhow::Error },
    #[error("job {job} exceeded its execution timeout of {timeout_ms}ms")]
    TimedOut { job: String, timeout_ms: i64 },
    #[error("job {job} was cancelled by shutdown")]
    Cancelled { job: String },
}

enum Execution {
    Succeeded,
    Failed(anyhow::Error),
    TimedOut,
    Cancelled,
    Panicked(Box<dyn Any + Send>),
}

impl Execution {
    fn as_label(&self) -> &'static str {
        match self {
            Execution::Succeeded => "succeeded",
            Execution::Failed(_) => "failed",
            Execution::TimedOut => "timed_out",
            Execution::Cancelled => "cancelled",
            Execution::Panicked(_) => "panicked",
        }
    }
}

/// Releases the lease even when the tick future is dropped mid-execution.
struct ReleaseGuard {
    coordinator: Option<Arc<ScheduleCoordinator>>,
}

impl ReleaseGuard {
    async fn release(mut self) -> Option<ReleaseOutcome> {
        let coordinator = self.coordinator.take()?;
        match coordinator.release().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(job = %coordinator.job_name(), error = %e, "runner: release failed, lease will expire");
                None
            }
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(coordinator) = self.coordinator.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = coordinator.release().await {
                    warn!(job = %coordinator.job_name(), error = %e, "runner: release after cancellation failed");
                }
            });
        }
    }
}

/// Runs one job body whenever its coordinator grants an execution.
pub struct PeriodicJobRunner {
    coordinator: Arc<ScheduleCoordinator>,
    job: Arc<dyn ScheduledJob>,
    finalizer: Arc<ShutdownFinalizer>,
    metrics: Option<Metrics>,
}

impl PeriodicJobRunner {
    pub fn new(
        coordinator: Arc<ScheduleCoordinator>,
        job: Arc<dyn ScheduledJob>,
        finalizer: Arc<ShutdownFinalizer>,
    ) -> Self {
        Self {
            coordinator,
            job,
            finalizer,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn coordinator(&self) -> &Arc<ScheduleCoordinator> {
        &self.coordinator
    }

    pub fn job_name(&self) -> &str {
        self.coordinator.job_name()
    }

    /// One polling tick: acquire, run the body, release.
    ///
    /// The lease is released whatever the body does. Body failures are
    /// returned after the release attempt, and a panicking body resumes its
    /// panic after it. Release failures are only logged.
    ///
    /// Once shutdown has begun the tick returns `Cancelled` without touching
    /// the store, so the interval stays due for the rest of the fleet.
    pub async fn tick(&self, now_ms: i64) -> Result<TickOutcome, RunnerError> {
        if self.finalizer.is_shutting_down() {
            debug!(job = %self.job_name(), "runner: shutting down, not acquiring");
            return Err(RunnerError::Cancelled {
                job: self.job_name().to_string(),
            });
        }
        let grant = match self.coordinator.try_acquire(now_ms).await? {
            AcquireOutcome::Skipped(reason) => return Ok(TickOutcome::Skipped(reason)),
            AcquireOutcome::Acquired(grant) => grant,
        };

        let leased = grant.lease.is_some();
        let registration = leased.then(|| self.finalizer.register(self.coordinator.clone()));
        let guard = ReleaseGuard {
            coordinator: leased.then(|| self.coordinator.clone()),
        };

        let ctx = JobContext {
            job: grant.job.clone(),
            worker_id: grant.worker_id.clone(),
            started_ms: grant.acquired_ms,
            lease_timeout_ms: grant.lease.as_ref().map(|l| l.timeout_ms),
            shutdown: self.finalizer.subscribe(),
        };
        let started = tokio::time::Instant::now();
        let execution = self.execute(ctx).await;
        let elapsed = started.elapsed();

        let release = guard.release().await;
        drop(registration);

        if let Some(m) = &self.metrics {
            m.record_job_run(self.job_name(), execution.as_label(), elapsed.as_secs_f64());
        }

        let job = self.job_name().to_string();
        match execution {
            Execution::Succeeded => {
                info!(job = %job, elapsed_ms = elapsed.as_millis() as u64, "runner: job completed");
                Ok(TickOutcome::Completed { grant, release })
            }
            Execution::Failed(error) => {
                error!(job = %job, error = %format!("{error:#}"), "runner: job failed");
                Err(RunnerError::Job { job, error })
            }
            Execution::TimedOut => {
                let timeout_ms = self.coordinator.job().execution_timeout_ms;
                error!(job = %job, timeout_ms, "runner: job timed out");
                Err(RunnerError::TimedOut { job, timeout_ms })
            }
            Execution::Cancelled => {
                warn!(job = %job, "runner: job cancelled by shutdown");
                Err(RunnerError::Cancelled { job })
            }
            Execution::Panicked(payload) => {
                error!(job = %job, "runner: job panicked");
                std::panic::resume_unwind(payload)
            }
        }
    }

    async fn execute(&self, ctx: JobContext) -> Execution {
        let mut shutdown = self.finalizer.subscribe();
        if *shutdown.borrow() {
            return Execution::Cancelled;
        }
        let timeout =
            Duration::from_millis(self.coordinator.job().execution_timeout_ms.max(0) as u64);
        let body = AssertUnwindSafe(self.job.run(ctx)).catch_unwind();

        tokio::select! {
            result = tokio::time::timeout(timeout, body) => match result {
                Ok(Ok(Ok(()))) => Execution::Succeeded,
                Ok(Ok(Err(e))) => Execution::Failed(e),
                Ok(Err(payload)) => Execution::Panicked(payload),
                Err(_) => Execution::TimedOut,
            },
            // Disabled if the finalizer is dropped without signalling.
            Ok(_) = shutdown.wait_for(|v| *v) => Execution::Cancelled,
        }
    }
}
