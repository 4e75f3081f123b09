//! KeyValueStore over an `object_store` backend.
//!
//! Conditional writes map onto `PutMode::Create` (no expected etag) and
//! `PutMode::Update` (expected etag). Backends without conditional-put support
//! reject those modes with `NotImplemented`, which surfaces as a permanent
//! error rather than silently degrading to unconditional writes.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::path::Path;
use object_store::{
    Error as ObjectStoreError, ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload,
    UpdateVersion,
};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::{Etag, KeyValueStore, StoreError, Versioned};
use crate::settings::{Backend, StoreConfig};

/// Classify an object store failure for the retry layer.
///
/// `Generic` carries the HTTP client's transport and 5xx errors, so it is the
/// one class worth retrying. Everything else (bad paths, auth, unsupported
/// operations, configuration) will fail the same way again.
pub fn classify(err: ObjectStoreError) -> StoreError {
    match err {
        ObjectStoreError::Generic { .. } => StoreError::Transient(err.to_string()),
        other => StoreError::Permanent(other.to_string()),
    }
}

fn etag_of(meta: &ObjectMeta) -> Result<Etag, StoreError> {
    meta.e_tag
        .clone()
        .or_else(|| meta.version.clone())
        .map(Etag::new)
        .ok_or_else(|| {
            StoreError::Permanent(format!(
                "object store reported no etag or version for {}",
                meta.location
            ))
        })
}

fn invalid_config(path: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Permanent(format!("invalid object store url {path}: {err}"))
}

pub struct ObjectKvStore {
    store: Arc<dyn ObjectStore>,
    root: Path,
}

impl ObjectKvStore {
    /// Wrap an object store, placing every key under `root`.
    pub fn new(store: Arc<dyn ObjectStore>, root: Path) -> Self {
        Self { store, root }
    }

    /// Build a store from configuration. Cloud credentials come from the
    /// backend's usual environment variables.
    pub fn open(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn ObjectStore> = match cfg.backend {
            Backend::Memory => {
                return Ok(Self::new(
                    Arc::new(object_store::memory::InMemory::new()),
                    Path::default(),
                ));
            }
            Backend::S3 => Arc::new(
                object_store::aws::AmazonS3Builder::from_env()
                    .with_url(cfg.path.as_str())
                    .build()
                    .map_err(|e| invalid_config(&cfg.path, e))?,
            ),
            Backend::Gcs => Arc::new(
                object_store::gcp::GoogleCloudStorageBuilder::from_env()
                    .with_url(cfg.path.as_str())
                    .build()
                    .map_err(|e| invalid_config(&cfg.path, e))?,
            ),
            Backend::Azure => Arc::new(
                object_store::azure::MicrosoftAzureBuilder::from_env()
                    .with_url(cfg.path.as_str())
                    .build()
                    .map_err(|e| invalid_config(&cfg.path, e))?,
            ),
            Backend::Url => {
                let url = Url::parse(&cfg.path).map_err(|e| invalid_config(&cfg.path, e))?;
                let (store, root) =
                    object_store::parse_url(&url).map_err(|e| invalid_config(&cfg.path, e))?;
                return Ok(Self::new(Arc::from(store), root));
            }
        };
        let url = Url::parse(&cfg.path).map_err(|e| invalid_config(&cfg.path, e))?;
        let root = Path::from_url_path(url.path()).map_err(|e| invalid_config(&cfg.path, e))?;
        debug!(backend = ?cfg.backend, root = %root, "opened object store");
        Ok(Self::new(store, root))
    }

    fn location(&self, key: &str) -> Path {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.child(part))
    }

    fn key_of(&self, location: &Path) -> Option<String> {
        let parts = location.prefix_match(&self.root)?;
        Some(
            parts
                .map(|p| p.as_ref().to_string())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }
}

#[async_trait]
impl KeyValueStore for ObjectKvStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        match self.store.get(&self.location(key)).await {
            Ok(result) => {
                let etag = etag_of(&result.meta)?;
                let value = result.bytes().await.map_err(classify)?;
                Ok(Some(Versioned { value, etag }))
            }
            Err(ObjectStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(classify(e)),
        }
    }

    async fn put_conditional(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<&Etag>,
    ) -> Result<bool, StoreError> {
        let mode = match expected {
            None => PutMode::Create,
            Some(etag) => PutMode::Update(UpdateVersion {
                e_tag: Some(etag.as_str().to_string()),
                version: None,
            }),
        };
        match self
            .store
            .put_opts(&self.location(key), PutPayload::from(value), PutOptions::from(mode))
            .await
        {
            Ok(_) => Ok(true),
            // Update against a deleted key reports NotFound on some backends.
            Err(ObjectStoreError::AlreadyExists { .. })
            | Err(ObjectStoreError::Precondition { .. })
            | Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }

    async fn delete_if_exists(&self, key: &str) -> Result<bool, StoreError> {
        let location = self.location(key);
        match self.store.head(&location).await {
            Ok(_) => {}
            Err(ObjectStoreError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(classify(e)),
        }
        match self.store.delete(&location).await {
            Ok(()) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // object_store lists by path segment, so list the prefix's directory and filter.
        let dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let dir_path = self.location(dir);
        let mut listing = self.store.list(Some(&dir_path));
        let mut keys = Vec::new();
        while let Some(meta) = listing.next().await {
            let meta = meta.map_err(classify)?;
            if let Some(key) = self.key_of(&meta.location) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory() -> ObjectKvStore {
        ObjectKvStore::new(
            Arc::new(object_store::memory::InMemory::new()),
            Path::from("root"),
        )
    }

    #[tokio::test]
    async fn conditional_update_follows_etag() {
        let store = in_memory();
        assert!(store.put_conditional("a/b", Bytes::from_static(b"1"), None).await.unwrap());
        assert!(!store.put_conditional("a/b", Bytes::from_static(b"2"), None).await.unwrap());

        let read = store.get("a/b").await.unwrap().unwrap();
        assert!(store
            .put_conditional("a/b", Bytes::from_static(b"3"), Some(&read.etag))
            .await
            .unwrap());
        assert!(!store
            .put_conditional("a/b", Bytes::from_static(b"4"), Some(&read.etag))
            .await
            .unwrap());
        assert_eq!(
            store.get("a/b").await.unwrap().unwrap().value,
            Bytes::from_static(b"3")
        );
    }

    #[tokio::test]
    async fn missing_key_reads_as_none_and_deletes_as_false() {
        let store = in_memory();
        assert!(store.get("nope").await.unwrap().is_none());
        assert!(!store.delete_if_exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn lists_keys_relative_to_root() {
        let store = in_memory();
        for key in ["s/schedules/b", "s/schedules/a", "s/other/c"] {
            store.put_conditional(key, Bytes::new(), None).await.unwrap();
        }
        assert_eq!(
            store.list_by_prefix("s/schedules/").await.unwrap(),
            vec!["s/schedules/a", "s/schedules/b"]
        );
        assert!(store.delete_if_exists("s/schedules/a").await.unwrap());
        assert_eq!(
            store.list_by_prefix("s/schedules/").await.unwrap(),
            vec!["s/schedules/b"]
        );
    }

    #[test]
    fn generic_errors_are_transient() {
        let err = ObjectStoreError::Generic {
            store: "test",
            source: "connection reset".into(),
        };
        assert!(classify(err).is_transient());
        let err = ObjectStoreError::NotImplemented;
        assert!(!classify(err).is_transient());
    }
}
