//! Library side of `leaseholdctl`, shared by the binary and tests.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::admin::{ScheduleAdmin, ScheduleEntry};
use crate::kv::{KeyValueStore, ObjectKvStore};
use crate::retry::RetryingStore;
use crate::schedule::{LeaseState, ScheduleState, now_ms};
use crate::settings::{AppConfig, Backend};

/// Options that apply to every leaseholdctl command
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    /// TOML config naming the store and key prefix
    pub config: Option<PathBuf>,
    /// Overrides `scheduler.key_prefix` from the config
    pub key_prefix: Option<String>,
    /// Output JSON instead of human-readable text
    pub json: bool,
}

pub fn load_config(opts: &GlobalOptions) -> anyhow::Result<AppConfig> {
    AppConfig::load(opts.config.as_deref())
}

/// Open the configured store and wrap it for administration.
///
/// The in-process memory backend is refused: it starts empty and is shared
/// with no worker, so every command would report nothing.
pub fn open_admin(opts: &GlobalOptions, config: &AppConfig) -> anyhow::Result<ScheduleAdmin> {
    if config.store.backend == Backend::Memory {
        anyhow::bail!(
            "store backend is `memory`, which no worker shares; pass --config with a [store] section naming the shared store"
        );
    }
    let store: Arc<dyn KeyValueStore> = Arc::new(ObjectKvStore::open(&config.store)?);
    let store: Arc<dyn KeyValueStore> =
        Arc::new(RetryingStore::new(store, config.retry.clone()));
    let key_prefix = opts
        .key_prefix
        .clone()
        .unwrap_or_else(|| config.scheduler.key_prefix.clone());
    Ok(ScheduleAdmin::new(store, key_prefix))
}

fn format_timestamp_ms(ms: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(ms) {
        Some(dt) => format!("{} ({}ms)", dt.to_rfc3339(), ms),
        None => format!("{}ms", ms),
    }
}

fn lease_summary(lease: Option<&LeaseState>, now: i64) -> String {
    match lease {
        None => "-".to_string(),
        Some(l) if l.is_expired(now) => format!("{} (expired)", l.owner),
        Some(l) => l.owner.clone(),
    }
}

/// The serialized entry plus the `due` and `lease.expired` flags as of `now`.
fn entry_json(entry: &ScheduleEntry, now: i64) -> anyhow::Result<serde_json::Value> {
    let mut value = serde_json::to_value(entry)?;
    value["due"] = entry.state.is_due(now).into();
    if let Some(lease) = &entry.state.lease {
        value["lease"]["expired"] = lease.is_expired(now).into();
    }
    Ok(value)
}

/// List every schedule record
pub async fn schedules_list<W: Write>(
    admin: &ScheduleAdmin,
    opts: &GlobalOptions,
    out: &mut W,
) -> anyhow::Result<()> {
    let entries = admin.list().await?;
    let now = now_ms();

    if opts.json {
        let rows = entries
            .iter()
            .map(|e| entry_json(e, now))
            .collect::<anyhow::Result<Vec<_>>>()?;
        writeln!(out, "{}", serde_json::to_string_pretty(&rows)?)?;
        return Ok(());
    }

    if entries.is_empty() {
        writeln!(out, "No schedules found.")?;
        return Ok(());
    }
    writeln!(
        out,
        "{:<32}  {:>14}  {:<10}  {:<28}  Lease",
        "Job", "Interval (ms)", "Scope", "Last executed"
    )?;
    writeln!(out, "{}", "-".repeat(100))?;
    for entry in &entries {
        let state = &entry.state;
        writeln!(
            out,
            "{:<32}  {:>14}  {:<10}  {:<28}  {}",
            entry.job,
            state.trigger_interval_ms,
            if state.per_worker { "worker" } else { "cloud" },
            state
                .last_executed_ms
                .map(format_timestamp_ms)
                .unwrap_or_else(|| "never".to_string()),
            lease_summary(state.lease.as_ref(), now),
        )?;
    }
    Ok(())
}

fn write_state<W: Write>(out: &mut W, job: &str, state: &ScheduleState, now: i64) -> anyhow::Result<()> {
    writeln!(out, "Schedule: {}", job)?;
    writeln!(out, "Interval:        {}ms", state.trigger_interval_ms)?;
    writeln!(
        out,
        "Scope:           {}",
        if state.per_worker { "worker" } else { "cloud" }
    )?;
    match state.last_executed_ms {
        Some(ms) => writeln!(out, "Last executed:   {}", format_timestamp_ms(ms))?,
        None => writeln!(out, "Last executed:   never")?,
    }
    writeln!(out, "Due:             {}", state.is_due(now))?;
    if let Some(lease) = &state.lease {
        writeln!(out, "Lease owner:     {}", lease.owner)?;
        writeln!(out, "Lease acquired:  {}", format_timestamp_ms(lease.acquired_ms))?;
        writeln!(
            out,
            "Lease timeout:   {}{}",
            format_timestamp_ms(lease.timeout_ms),
            if lease.is_expired(now) { " (expired)" } else { "" }
        )?;
    }
    Ok(())
}

/// Show one schedule record
pub async fn schedules_show<W: Write>(
    admin: &ScheduleAdmin,
    opts: &GlobalOptions,
    out: &mut W,
    job: &str,
) -> anyhow::Result<()> {
    let entry = admin
        .get(job)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no schedule record for job '{}'", job))?;
    let now = now_ms();
    if opts.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&entry_json(&entry, now)?)?)?;
    } else {
        write_state(out, &entry.job, &entry.state, now)?;
    }
    Ok(())
}

/// Clear a stuck lease
pub async fn schedules_clear_lease<W: Write>(
    admin: &ScheduleAdmin,
    opts: &GlobalOptions,
    out: &mut W,
    job: &str,
) -> anyhow::Result<()> {
    let cleared = admin.clear_lease(job).await?;
    if opts.json {
        let json_output = serde_json::json!({
            "job": job,
            "cleared": cleared.is_some(),
            "previous_owner": cleared.as_ref().map(|l| l.owner.clone()),
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&json_output)?)?;
    } else {
        match cleared {
            Some(lease) => writeln!(out, "Cleared lease of '{}' held by {}", job, lease.owner)?,
            None => writeln!(out, "Schedule '{}' holds no lease", job)?,
        }
    }
    Ok(())
}

/// Change a schedule's trigger interval
pub async fn schedules_set_interval<W: Write>(
    admin: &ScheduleAdmin,
    opts: &GlobalOptions,
    out: &mut W,
    job: &str,
    trigger_interval_ms: i64,
) -> anyhow::Result<()> {
    let state = admin.set_trigger_interval(job, trigger_interval_ms).await?;
    if opts.json {
        let json_output = serde_json::json!({
            "job": job,
            "trigger_interval_ms": state.trigger_interval_ms,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&json_output)?)?;
    } else {
        writeln!(
            out,
            "Schedule '{}' now triggers every {}ms",
            job, state.trigger_interval_ms
        )?;
    }
    Ok(())
}

/// Delete a schedule record
pub async fn schedules_remove<W: Write>(
    admin: &ScheduleAdmin,
    opts: &GlobalOptions,
    out: &mut W,
    job: &str,
) -> anyhow::Result<()> {
    let removed = admin.remove(job).await?;
    if opts.json {
        let json_output = serde_json::json!({ "job": job, "removed": removed });
        writeln!(out, "{}", serde_json::to_string_pretty(&json_output)?)?;
    } else if removed {
        writeln!(out, "Removed schedule '{}'", job)?;
    } else {
        writeln!(out, "Schedule '{}' did not exist", job)?;
    }
    Ok(())
}
