use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tracing::{debug, info};

/// Something holding a shared-store claim that must be given back on shutdown.
#[async_trait]
pub trait Releasable: Send + Sync {
    fn name(&self) -> &str;

    /// Release whatever is held. Must not fail; errors are logged by the implementor.
    async fn force_release(&self);
}

type Registry = Mutex<BTreeMap<u64, Arc<dyn Releasable>>>;

/// Tracks claims held by in-flight executions and releases them during process
/// teardown, so competitors need not wait out lease timeouts.
///
/// Shutdown is explicit: the host calls [`ShutdownFinalizer::finalize`], which
/// signals subscribers and then awaits every registered release before returning.
pub struct ShutdownFinalizer {
    next_id: AtomicU64,
    registered: Arc<Registry>,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for ShutdownFinalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownFinalizer {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            next_id: AtomicU64::new(1),
            registered: Arc::new(Mutex::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Register a releasable until the returned guard is dropped.
    pub fn register(&self, releasable: Arc<dyn Releasable>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, name = releasable.name(), "finalizer: registered");
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, releasable);
        Registration {
            id,
            registry: Arc::downgrade(&self.registered),
        }
    }

    /// Receiver that flips to `true` once shutdown begins.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn registered_count(&self) -> usize {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Signal shutdown, then force-release every registered claim, awaiting each.
    /// Returns how many releasables were released. Safe to call repeatedly.
    pub async fn finalize(&self) -> usize {
        self.shutdown_tx.send_replace(true);
        let pending: Vec<Arc<dyn Releasable>> = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for releasable in &pending {
            releasable.force_release().await;
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "finalizer: released held claims");
        }
        pending.len()
    }
}

/// Unregisters its releasable on drop.
#[must_use = "dropping the registration unregisters immediately"]
pub struct Registration {
    id: u64,
    registry: Weak<Registry>,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        releases: AtomicUsize,
    }

    #[async_trait]
    impl Releasable for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn force_release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn finalize_releases_only_registered() {
        let finalizer = ShutdownFinalizer::new();
        let kept = Arc::new(Counting { releases: AtomicUsize::new(0) });
        let dropped = Arc::new(Counting { releases: AtomicUsize::new(0) });

        let _keep = finalizer.register(kept.clone());
        drop(finalizer.register(dropped.clone()));
        assert_eq!(finalizer.registered_count(), 1);

        assert_eq!(finalizer.finalize().await, 1);
        assert_eq!(kept.releases.load(Ordering::SeqCst), 1);
        assert_eq!(dropped.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn finalize_signals_subscribers() {
        let finalizer = ShutdownFinalizer::new();
        let mut rx = finalizer.subscribe();
        assert!(!*rx.borrow());
        finalizer.finalize().await;
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(finalizer.is_shutting_down());
    }
}
