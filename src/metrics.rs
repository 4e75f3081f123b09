//! Prometheus metrics for schedule coordination.
//!
//! ```ignore
//! let metrics = leasehold::metrics::init()?;
//! leasehold::metrics::run_metrics_server(addr, metrics.clone(), shutdown_rx).await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder, core::Collector,
};
use tokio::sync::watch;
use tracing::{debug, error};

const JOB_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0,
];

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    acquire_attempts: CounterVec,
    lease_takeovers: CounterVec,
    lease_releases: CounterVec,
    job_runs: CounterVec,
    job_duration: HistogramVec,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// `outcome` is one of `acquired`, `not_due`, `leased`, `contended`, `error`.
    pub fn record_acquire(&self, job: &str, outcome: &str) {
        self.acquire_attempts
            .with_label_values(&[job, outcome])
            .inc();
    }

    pub fn record_takeover(&self, job: &str) {
        self.lease_takeovers.with_label_values(&[job]).inc();
    }

    /// `outcome` is one of `released`, `not_held`, `conflict`, `error`.
    pub fn record_release(&self, job: &str, outcome: &str) {
        self.lease_releases.with_label_values(&[job, outcome]).inc();
    }

    /// `result` is one of `succeeded`, `failed`, `timed_out`, `cancelled`, `panicked`.
    pub fn record_job_run(&self, job: &str, result: &str, duration_secs: f64) {
        self.job_runs.with_label_values(&[job, result]).inc();
        self.job_duration
            .with_label_values(&[job])
            .observe(duration_secs);
    }

    pub fn acquire_count(&self, job: &str, outcome: &str) -> u64 {
        self.acquire_attempts
            .with_label_values(&[job, outcome])
            .get() as u64
    }

    pub fn job_run_count(&self, job: &str, result: &str) -> u64 {
        self.job_runs.with_label_values(&[job, result]).get() as u64
    }
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Create the metric instruments on a fresh registry.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let acquire_attempts = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "leasehold_acquire_attempts_total",
                "Schedule acquisition attempts by outcome",
            ),
            &["job", "outcome"],
        )?,
    );

    let lease_takeovers = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "leasehold_lease_takeovers_total",
                "Expired leases of other workers reclaimed by this worker",
            ),
            &["job"],
        )?,
    );

    let lease_releases = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "leasehold_lease_releases_total",
                "Lease release attempts by outcome",
            ),
            &["job", "outcome"],
        )?,
    );

    let job_runs = register(
        &registry,
        CounterVec::new(
            Opts::new("leasehold_job_runs_total", "Job body executions by result"),
            &["job", "result"],
        )?,
    );

    let job_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "leasehold_job_duration_seconds",
                "Wall-clock duration of job body executions",
            )
            .buckets(JOB_DURATION_BUCKETS.to_vec()),
            &["job"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        acquire_attempts,
        lease_takeovers,
        lease_releases,
        job_runs,
        job_duration,
    })
}

async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = metrics.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Serve `/metrics` on `addr` until `shutdown` turns true.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
