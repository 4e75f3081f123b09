use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Passed to `trace::init` by the host process.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Per-job scheduling parameters, matched to job bodies by name at registration.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Backend,
    /// Object store URL such as `s3://bucket/prefix`. Ignored for `memory`.
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    S3,
    Gcs,
    Azure,
    /// Any URL `object_store::parse_url` understands.
    Url,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Stable identity of this worker in lease records. Defaults to `<hostname>-<random>`.
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Added to a job's execution timeout to form its lease duration, unless the job overrides it.
    #[serde(default = "default_lease_safety_margin_ms")]
    pub lease_safety_margin_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            key_prefix: default_key_prefix(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_safety_margin_ms: default_lease_safety_margin_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn resolved_worker_id(&self) -> String {
        match &self.worker_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => generate_worker_id(),
        }
    }
}

fn default_key_prefix() -> String {
    "leasehold".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_lease_safety_margin_ms() -> i64 {
    5 * 60 * 1_000
}

/// `<hostname>-<8 hex chars>`, unique per process even when hostnames collide.
pub fn generate_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    /// Address for the Prometheus `/metrics` endpoint, e.g. `127.0.0.1:9090`.
    /// Served by `Scheduler::run` while the scheduler is up.
    #[serde(default)]
    pub addr: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Scheduling parameters of one periodic job.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub name: String,
    pub trigger_interval_ms: i64,
    /// Run on every worker independently instead of once across the fleet.
    #[serde(default)]
    pub per_worker: bool,
    pub execution_timeout_ms: i64,
    /// Overrides `scheduler.lease_safety_margin_ms` for this job.
    #[serde(default)]
    pub lease_safety_margin_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobConfigError {
    #[error("job name must not be empty")]
    EmptyName,
    #[error("job name {0:?} must not contain '/'")]
    InvalidName(String),
    #[error("job {name}: {field} must be positive, got {value}")]
    NonPositive {
        name: String,
        field: &'static str,
        value: i64,
    },
}

impl JobConfig {
    pub fn cloud(name: impl Into<String>, trigger_interval_ms: i64, execution_timeout_ms: i64) -> Self {
        Self {
            name: name.into(),
            trigger_interval_ms,
            per_worker: false,
            execution_timeout_ms,
            lease_safety_margin_ms: None,
        }
    }

    pub fn per_worker(
        name: impl Into<String>,
        trigger_interval_ms: i64,
        execution_timeout_ms: i64,
    ) -> Self {
        Self {
            per_worker: true,
            ..Self::cloud(name, trigger_interval_ms, execution_timeout_ms)
        }
    }

    pub fn with_lease_safety_margin_ms(mut self, margin_ms: i64) -> Self {
        self.lease_safety_margin_ms = Some(margin_ms);
        self
    }

    pub fn validate(&self) -> Result<(), JobConfigError> {
        if self.name.is_empty() {
            return Err(JobConfigError::EmptyName);
        }
        if self.name.contains('/') {
            return Err(JobConfigError::InvalidName(self.name.clone()));
        }
        let positive = [
            ("trigger_interval_ms", self.trigger_interval_ms),
            ("execution_timeout_ms", self.execution_timeout_ms),
        ];
        for (field, value) in positive {
            if value <= 0 {
                return Err(JobConfigError::NonPositive {
                    name: self.name.clone(),
                    field,
                    value,
                });
            }
        }
        if let Some(margin) = self.lease_safety_margin_ms {
            if margin < 0 {
                return Err(JobConfigError::NonPositive {
                    name: self.name.clone(),
                    field: "lease_safety_margin_ms",
                    value: margin,
                });
            }
        }
        Ok(())
    }

    /// Lease duration: execution timeout plus the job's (or the default) safety margin.
    pub fn lease_duration_ms(&self, default_margin_ms: i64) -> i64 {
        self.execution_timeout_ms
            .saturating_add(self.lease_safety_margin_ms.unwrap_or(default_margin_ms).max(0))
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                for job in &cfg.jobs {
                    job.validate()?;
                }
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }
}
