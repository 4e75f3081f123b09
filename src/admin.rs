//! Operator inspection and repair of schedule records.
//!
//! Every mutation is a conditional write against the etag just read, so an
//! edit racing a worker's acquire fails with [`AdminError::Conflict`] instead
//! of clobbering it.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::codec::{CodecError, decode_schedule_state, encode_schedule_state};
use crate::keys::{parse_schedule_key, schedule_key, schedules_prefix};
use crate::kv::{Etag, KeyValueStore, StoreError};
use crate::schedule::{LeaseState, ScheduleState};

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed schedule record at {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: CodecError,
    },
    #[error("no schedule record for job {0}")]
    NotFound(String),
    #[error("schedule record for job {0} changed concurrently, retry")]
    Conflict(String),
    #[error("trigger interval must be positive, got {0}")]
    InvalidInterval(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleEntry {
    pub job: String,
    pub key: String,
    #[serde(flatten)]
    pub state: ScheduleState,
}

pub struct ScheduleAdmin {
    store: Arc<dyn KeyValueStore>,
    key_prefix: String,
}

impl ScheduleAdmin {
    pub fn new(store: Arc<dyn KeyValueStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<(ScheduleState, Etag)>, AdminError> {
        let Some(versioned) = self.store.get(key).await? else {
            return Ok(None);
        };
        let state = decode_schedule_state(&versioned.value).map_err(|source| AdminError::Codec {
            key: key.to_string(),
            source,
        })?;
        Ok(Some((state, versioned.etag)))
    }

    async fn write(
        &self,
        job: &str,
        key: &str,
        state: &ScheduleState,
        etag: &Etag,
    ) -> Result<(), AdminError> {
        let bytes = encode_schedule_state(state).map_err(|source| AdminError::Codec {
            key: key.to_string(),
            source,
        })?;
        if self
            .store
            .put_conditional(key, Bytes::from(bytes), Some(etag))
            .await?
        {
            Ok(())
        } else {
            Err(AdminError::Conflict(job.to_string()))
        }
    }

    /// All schedule records under the prefix, sorted by job name. Records
    /// deleted between listing and reading are left out.
    pub async fn list(&self) -> Result<Vec<ScheduleEntry>, AdminError> {
        let mut keys = self
            .store
            .list_by_prefix(&schedules_prefix(&self.key_prefix))
            .await?;
        keys.sort();

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(job) = parse_schedule_key(&self.key_prefix, &key) else {
                continue;
            };
            let job = job.to_string();
            if let Some((state, _)) = self.read(&key).await? {
                entries.push(ScheduleEntry { job, key, state });
            }
        }
        Ok(entries)
    }

    pub async fn get(&self, job: &str) -> Result<Option<ScheduleEntry>, AdminError> {
        let key = schedule_key(&self.key_prefix, job);
        Ok(self.read(&key).await?.map(|(state, _)| ScheduleEntry {
            job: job.to_string(),
            key,
            state,
        }))
    }

    /// Drop whatever lease the record carries, expired or not. Returns the
    /// cleared lease, or None if there was none.
    pub async fn clear_lease(&self, job: &str) -> Result<Option<LeaseState>, AdminError> {
        let key = schedule_key(&self.key_prefix, job);
        let (state, etag) = self
            .read(&key)
            .await?
            .ok_or_else(|| AdminError::NotFound(job.to_string()))?;
        let Some(lease) = state.lease.clone() else {
            return Ok(None);
        };
        self.write(job, &key, &state.without_lease(), &etag).await?;
        info!(job, owner = %lease.owner, "admin: cleared lease");
        Ok(Some(lease))
    }

    /// Change the persisted trigger interval. Takes precedence over the
    /// interval in worker configuration once written.
    pub async fn set_trigger_interval(
        &self,
        job: &str,
        trigger_interval_ms: i64,
    ) -> Result<ScheduleState, AdminError> {
        if trigger_interval_ms <= 0 {
            return Err(AdminError::InvalidInterval(trigger_interval_ms));
        }
        let key = schedule_key(&self.key_prefix, job);
        let (state, etag) = self
            .read(&key)
            .await?
            .ok_or_else(|| AdminError::NotFound(job.to_string()))?;
        let updated = ScheduleState {
            trigger_interval_ms,
            ..state
        };
        self.write(job, &key, &updated, &etag).await?;
        info!(job, trigger_interval_ms, "admin: set trigger interval");
        Ok(updated)
    }

    /// Delete the record. The next acquire recreates it from configuration.
    pub async fn remove(&self, job: &str) -> Result<bool, AdminError> {
        let key = schedule_key(&self.key_prefix, job);
        let removed = self.store.delete_if_exists(&key).await?;
        if removed {
            info!(job, "admin: removed schedule record");
        }
        Ok(removed)
    }
}
