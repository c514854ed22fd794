use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tasklane_types::Task;
use tokio::sync::{watch, Notify};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Skip the background bulk read that normally follows a write.
    pub suppress_revalidate: bool,
}

impl ApplyOptions {
    pub fn revalidate() -> Self {
        Self {
            suppress_revalidate: false,
        }
    }

    pub fn suppressed() -> Self {
        Self {
            suppress_revalidate: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheContent {
    Uninitialized,
    Loaded(Vec<Task>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot {
    pub version: u64,
    pub tasks: Option<Vec<Task>>,
}

#[derive(Debug)]
struct CacheInner {
    content: CacheContent,
    version: u64,
}

/// Process-wide task cache.
///
/// Writes replace the whole sequence with whatever the caller's updater
/// returns; merge policy belongs to the callers. Every change bumps the
/// version, and writes without `suppress_revalidate` queue a background
/// bulk read for the session's revalidation worker.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<RwLock<CacheInner>>,
    changes: Arc<watch::Sender<u64>>,
    revalidate: Arc<Notify>,
    revalidation_requests: Arc<AtomicU64>,
}

impl CacheStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(CacheInner {
                content: CacheContent::Uninitialized,
                version: 0,
            })),
            changes: Arc::new(changes),
            revalidate: Arc::new(Notify::new()),
            revalidation_requests: Arc::new(AtomicU64::new(0)),
        }
    }

    /// `None` until the first bulk read lands; `Some(vec![])` means zero tasks.
    pub fn read(&self) -> Option<Vec<Task>> {
        match &self.inner.read().content {
            CacheContent::Uninitialized => None,
            CacheContent::Loaded(tasks) => Some(tasks.clone()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.inner.read().content, CacheContent::Loaded(_))
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let inner = self.inner.read();
        CacheSnapshot {
            version: inner.version,
            tasks: match &inner.content {
                CacheContent::Uninitialized => None,
                CacheContent::Loaded(tasks) => Some(tasks.clone()),
            },
        }
    }

    /// Replaces the loaded sequence with `updater(current)`.
    ///
    /// The updater runs under the store's write lock and must not call back
    /// into the store. Returns `false` and leaves the content untouched while
    /// the store is uninitialized.
    pub fn apply<F>(&self, updater: F, options: ApplyOptions) -> bool
    where
        F: FnOnce(&[Task]) -> Vec<Task>,
    {
        let version = {
            let mut inner = self.inner.write();
            let next = match &inner.content {
                CacheContent::Uninitialized => None,
                CacheContent::Loaded(tasks) => Some(updater(tasks)),
            };
            next.map(|tasks| {
                inner.content = CacheContent::Loaded(tasks);
                inner.version += 1;
                inner.version
            })
        };
        if let Some(version) = version {
            self.changes.send_replace(version);
        }
        if !options.suppress_revalidate {
            self.request_revalidation();
        }
        version.is_some()
    }

    /// Replaces the whole content, leaving the uninitialized state if needed.
    pub fn load(&self, tasks: Vec<Task>, options: ApplyOptions) {
        let version = {
            let mut inner = self.inner.write();
            inner.content = CacheContent::Loaded(tasks);
            inner.version += 1;
            inner.version
        };
        self.changes.send_replace(version);
        if !options.suppress_revalidate {
            self.request_revalidation();
        }
    }

    /// Loads `tasks` only if nothing was written since `expected_version`.
    pub fn load_if_version(&self, expected_version: u64, tasks: Vec<Task>) -> bool {
        let version = {
            let mut inner = self.inner.write();
            if inner.version != expected_version {
                return false;
            }
            inner.content = CacheContent::Loaded(tasks);
            inner.version += 1;
            inner.version
        };
        self.changes.send_replace(version);
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn request_revalidation(&self) {
        self.revalidation_requests.fetch_add(1, Ordering::Relaxed);
        self.revalidate.notify_one();
    }

    pub fn revalidation_requests(&self) -> u64 {
        self.revalidation_requests.load(Ordering::Relaxed)
    }

    /// Resolves once a revalidation has been requested. Requests made while
    /// nobody waits are kept and resolve the next call immediately.
    pub async fn revalidation_requested(&self) {
        self.revalidate.notified().await;
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}
