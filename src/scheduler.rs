use std::collections::HashSet;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::coordinator::{CoordinationError, CoordinatorOptions, ScheduleCoordinator};
use crate::kv::KeyValueStore;
use crate::metrics::{self, Metrics};
use crate::retry::RetryingStore;
use crate::runner::{PeriodicJobRunner, RunnerError, ScheduledJob, TickOutcome};
use crate::schedule::now_ms;
use crate::settings::{AppConfig, JobConfig};
use crate::shutdown::ShutdownFinalizer;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("job {0} is already registered")]
    DuplicateJob(String),
    #[error("job {0} has no [[jobs]] entry in the configuration")]
    UnknownJob(String),
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

/// Result of one job's tick within a round.
#[derive(Debug)]
pub struct JobTick {
    pub job: String,
    pub result: Result<TickOutcome, RunnerError>,
}

pub struct SchedulerBuilder {
    store: Arc<dyn KeyValueStore>,
    options: CoordinatorOptions,
    configured: Vec<JobConfig>,
    poll_interval: Duration,
    finalizer: Arc<ShutdownFinalizer>,
    metrics_addr: Option<String>,
    names: HashSet<String>,
    runners: Vec<Arc<PeriodicJobRunner>>,
}

impl SchedulerBuilder {
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.options = self.options.with_metrics(metrics);
        self
    }

    /// Share a finalizer with other components of the host process.
    pub fn with_finalizer(mut self, finalizer: Arc<ShutdownFinalizer>) -> Self {
        self.finalizer = finalizer;
        self
    }

    /// Register a job body with explicit scheduling parameters.
    pub fn register(
        mut self,
        job: JobConfig,
        body: Arc<dyn ScheduledJob>,
    ) -> Result<Self, SchedulerError> {
        if self.names.contains(&job.name) {
            return Err(SchedulerError::DuplicateJob(job.name));
        }
        let coordinator = Arc::new(ScheduleCoordinator::new(
            self.store.clone(),
            job,
            self.options.clone(),
        )?);
        let mut runner = PeriodicJobRunner::new(coordinator, body, self.finalizer.clone());
        if let Some(metrics) = &self.options.metrics {
            runner = runner.with_metrics(metrics.clone());
        }
        self.names.insert(runner.job_name().to_string());
        self.runners.push(Arc::new(runner));
        Ok(self)
    }

    /// Register a job body using the `[[jobs]]` entry of the same name.
    pub fn register_configured(
        self,
        name: &str,
        body: Arc<dyn ScheduledJob>,
    ) -> Result<Self, SchedulerError> {
        let job = self
            .configured
            .iter()
            .find(|j| j.name == name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        self.register(job, body)
    }

    pub fn build(self) -> Scheduler {
        Scheduler {
            worker_id: self.options.worker_id,
            poll_interval: self.poll_interval,
            finalizer: self.finalizer,
            metrics: self.options.metrics,
            metrics_addr: self.metrics_addr,
            runners: self.runners,
        }
    }
}

/// Hosts every registered job of one worker process.
pub struct Scheduler {
    worker_id: String,
    poll_interval: Duration,
    finalizer: Arc<ShutdownFinalizer>,
    metrics: Option<Metrics>,
    metrics_addr: Option<String>,
    runners: Vec<Arc<PeriodicJobRunner>>,
}

impl Scheduler {
    /// Start building a scheduler over `store`. Store calls are retried per
    /// `config.retry` on transient errors.
    ///
    /// With `metrics.addr` set, jobs record into a fresh registry that `run`
    /// serves on that address. `with_metrics` replaces the registry.
    pub fn builder(store: Arc<dyn KeyValueStore>, config: &AppConfig) -> SchedulerBuilder {
        let store: Arc<dyn KeyValueStore> =
            Arc::new(RetryingStore::new(store, config.retry.clone()));
        let mut options = CoordinatorOptions::new(
            config.scheduler.resolved_worker_id(),
            config.scheduler.key_prefix.clone(),
        )
        .with_default_lease_safety_margin_ms(config.scheduler.lease_safety_margin_ms);
        if config.metrics.addr.is_some() {
            match metrics::init() {
                Ok(m) => options = options.with_metrics(m),
                Err(e) => warn!(error = %e, "scheduler: metrics registry unavailable"),
            }
        }
        SchedulerBuilder {
            store,
            options,
            configured: config.jobs.clone(),
            poll_interval: Duration::from_millis(config.scheduler.poll_interval_ms.max(1)),
            finalizer: Arc::new(ShutdownFinalizer::new()),
            metrics_addr: config.metrics.addr.clone(),
            names: HashSet::new(),
            runners: Vec::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn finalizer(&self) -> &Arc<ShutdownFinalizer> {
        &self.finalizer
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.runners.iter().map(|r| r.job_name()).collect()
    }

    /// One polling round over every job, concurrently. A panicking job body
    /// propagates its panic from here.
    pub async fn tick_all(&self, now_ms: i64) -> Vec<JobTick> {
        futures::future::join_all(self.runners.iter().map(|runner| async move {
            JobTick {
                job: runner.job_name().to_string(),
                result: runner.tick(now_ms).await,
            }
        }))
        .await
    }

    /// Poll every job until `shutdown` turns true (or its sender is dropped),
    /// then finalize: in-flight bodies are cancelled and held leases released.
    /// Returns the number of claims the finalizer released.
    ///
    /// The `/metrics` endpoint, when configured, is served until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> usize {
        info!(worker_id = %self.worker_id, jobs = self.runners.len(), "scheduler: starting");
        let mut loops = JoinSet::new();
        if let (Some(addr), Some(registry)) = (&self.metrics_addr, &self.metrics) {
            match addr.parse::<SocketAddr>() {
                Ok(addr) => {
                    let registry = registry.clone();
                    let shutdown = shutdown.clone();
                    loops.spawn(async move {
                        if let Err(e) = metrics::run_metrics_server(addr, registry, shutdown).await {
                            error!(addr = %addr, error = %e, "scheduler: metrics server failed");
                        }
                    });
                }
                Err(e) => error!(addr = %addr, error = %e, "scheduler: invalid metrics.addr, not serving"),
            }
        }
        for runner in &self.runners {
            loops.spawn(poll_loop(
                runner.clone(),
                self.poll_interval,
                shutdown.clone(),
            ));
        }

        let _ = shutdown.wait_for(|v| *v).await;
        info!(worker_id = %self.worker_id, "scheduler: shutting down");
        let released = self.finalizer.finalize().await;

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "scheduler: poll loop ended abnormally");
            }
        }
        info!(worker_id = %self.worker_id, released, "scheduler: stopped");
        released
    }
}

async fn poll_loop(
    runner: Arc<PeriodicJobRunner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|v| *v) => break,
        }
        match AssertUnwindSafe(runner.tick(now_ms())).catch_unwind().await {
            Ok(Ok(TickOutcome::Skipped(reason))) => {
                debug!(job = %runner.job_name(), reason = ?reason, "scheduler: skipped")
            }
            Ok(Ok(TickOutcome::Completed { .. })) => {}
            // Already logged by the runner or coordinator.
            Ok(Err(_)) => {}
            Err(_) => error!(job = %runner.job_name(), "scheduler: job panicked, continuing"),
        }
    }
    debug!(job = %runner.job_name(), "scheduler: poll loop stopped");
}
