//! Bounded LRU cache of open documents with deduplicated opens

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;

use crate::backend::{DocumentBackend, DocumentHandle};
use crate::error::{ViewResult, ViewerError};

/// Default number of open documents kept alive
pub const DEFAULT_DOCUMENT_CAPACITY: usize = 3;

/// Identity of one successful open
///
/// Page text cached under a superseded id can never collide with the active
/// document, even when a stale background task inserts after a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocId(pub u64);

/// An open document as the rest of the crate sees it
#[derive(Clone)]
pub struct OpenedDocument {
    pub id: DocId,
    pub path: Arc<Path>,
    pub handle: Arc<dyn DocumentHandle>,
}

impl fmt::Debug for OpenedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedDocument")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("pages", &self.handle.page_count())
            .finish()
    }
}

type SharedOpen = Shared<BoxFuture<'static, ViewResult<OpenedDocument>>>;

struct CacheState {
    entries: LruCache<PathBuf, OpenedDocument>,
    in_flight: HashMap<PathBuf, SharedOpen>,
    epoch: u64,
    next_id: u64,
}

/// Keeps the few most recently used documents open
///
/// A hit promotes the entry to most recently used. A miss joins the
/// in-flight open for the same path when one exists, so the backend sees at
/// most one open per path no matter how many callers arrive; all of them
/// receive the same handle (or the same failure). Eviction only drops the
/// cache's reference; the handle itself is released when its last holder
/// lets go.
pub struct DocumentCache {
    backend: Arc<dyn DocumentBackend>,
    state: Arc<Mutex<CacheState>>,
}

impl DocumentCache {
    #[must_use]
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self::with_capacity(backend, DEFAULT_DOCUMENT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(backend: Arc<dyn DocumentBackend>, capacity: usize) -> Self {
        let capacity =
            NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            backend,
            state: Arc::new(Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                in_flight: HashMap::new(),
                epoch: 0,
                next_id: 0,
            })),
        }
    }

    /// Return the document at `path`, opening it at most once
    pub async fn open(&self, path: &Path) -> ViewResult<OpenedDocument> {
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(doc) = state.entries.get(path) {
                return Ok(doc.clone());
            }
            if let Some(pending) = state.in_flight.get(path) {
                pending.clone()
            } else {
                let pending = Self::start_open(
                    Arc::clone(&self.backend),
                    Arc::clone(&self.state),
                    path.to_path_buf(),
                    state.epoch,
                );
                state.in_flight.insert(path.to_path_buf(), pending.clone());
                pending
            }
        };
        pending.await
    }

    fn start_open(
        backend: Arc<dyn DocumentBackend>,
        state: Arc<Mutex<CacheState>>,
        path: PathBuf,
        epoch: u64,
    ) -> SharedOpen {
        async move {
            let opened = backend.open(&path).await;
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            // A clear() while the open was in flight already drained the
            // in-flight table; removing here could orphan a newer open.
            let fresh = state.epoch == epoch;
            if fresh {
                state.in_flight.remove(&path);
            }
            let handle = opened.map_err(|fault| ViewerError::Open {
                path: path.display().to_string(),
                reason: fault.0,
            })?;
            state.next_id += 1;
            let doc = OpenedDocument {
                id: DocId(state.next_id),
                path: Arc::from(path.as_path()),
                handle,
            };
            if fresh {
                if let Some((evicted, _)) = state.entries.push(path, doc.clone()) {
                    if evicted.as_path() != doc.path.as_ref() {
                        log::debug!("document cache evicted {}", evicted.display());
                    }
                }
            }
            Ok(doc)
        }
        .boxed()
        .shared()
    }

    /// Drop every entry and orphan in-flight opens
    ///
    /// An orphaned open still resolves its waiters but never repopulates the
    /// cache.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.epoch += 1;
        state.entries.clear();
        state.in_flight.clear();
    }

    /// Check if a path is cached without promoting it
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains(path)
    }

    /// Number of cached documents
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Check if the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .cap()
            .get()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::testing::{DocumentScript, PageScript, ScriptedBackend};

    fn backend_with(paths: &[&str]) -> Arc<ScriptedBackend> {
        let backend = Arc::new(ScriptedBackend::new());
        for path in paths {
            backend.script(
                *path,
                DocumentScript::with_pages(vec![PageScript::new(), PageScript::new()]),
            );
        }
        backend
    }

    #[tokio::test]
    async fn open_caches_and_reuses_the_handle() {
        let backend = backend_with(&["a.pdf"]);
        let cache = DocumentCache::new(Arc::clone(&backend) as Arc<dyn DocumentBackend>);

        let first = cache.open(Path::new("a.pdf")).await.unwrap();
        let second = cache.open(Path::new("a.pdf")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(Arc::ptr_eq(&first.handle, &second.handle));
        assert_eq!(backend.open_calls(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn lru_eviction_keeps_the_three_newest() {
        let backend = backend_with(&["a.pdf", "b.pdf", "c.pdf", "d.pdf"]);
        let cache = DocumentCache::new(Arc::clone(&backend) as Arc<dyn DocumentBackend>);

        for path in ["a.pdf", "b.pdf", "c.pdf", "d.pdf"] {
            cache.open(Path::new(path)).await.unwrap();
        }

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(Path::new("a.pdf")));
        assert!(cache.contains(Path::new("b.pdf")));
        assert!(cache.contains(Path::new("c.pdf")));
        assert!(cache.contains(Path::new("d.pdf")));
    }

    #[tokio::test]
    async fn a_hit_promotes_the_entry_to_most_recently_used() {
        let backend = backend_with(&["a.pdf", "b.pdf", "c.pdf", "d.pdf"]);
        let cache = DocumentCache::new(Arc::clone(&backend) as Arc<dyn DocumentBackend>);

        for path in ["a.pdf", "b.pdf", "c.pdf"] {
            cache.open(Path::new(path)).await.unwrap();
        }
        // Touch the oldest entry, then overflow the cache.
        cache.open(Path::new("a.pdf")).await.unwrap();
        cache.open(Path::new("d.pdf")).await.unwrap();

        assert!(cache.contains(Path::new("a.pdf")));
        assert!(!cache.contains(Path::new("b.pdf")));
    }

    #[tokio::test]
    async fn concurrent_opens_share_one_backend_call() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(
            "slow.pdf",
            DocumentScript::with_pages(vec![PageScript::new()]).manual_open(),
        );
        let cache = Arc::new(DocumentCache::new(
            Arc::clone(&backend) as Arc<dyn DocumentBackend>
        ));

        let first = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.open(Path::new("slow.pdf")).await }
        });
        let second = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.open(Path::new("slow.pdf")).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(backend.open_calls(), 1);

        backend.release_opens(1);
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert!(Arc::ptr_eq(&first.handle, &second.handle));
        assert_eq!(backend.open_calls(), 1);
    }

    #[tokio::test]
    async fn open_failure_reaches_every_waiter_and_caches_nothing() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(
            "bad.pdf",
            DocumentScript::failing_open("corrupt xref").manual_open(),
        );
        let cache = Arc::new(DocumentCache::new(
            Arc::clone(&backend) as Arc<dyn DocumentBackend>
        ));

        let first = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.open(Path::new("bad.pdf")).await }
        });
        let second = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.open(Path::new("bad.pdf")).await }
        });
        tokio::task::yield_now().await;
        backend.release_opens(1);

        let first = first.await.unwrap().unwrap_err();
        let second = second.await.unwrap().unwrap_err();
        assert_eq!(first, second);
        assert!(matches!(first, ViewerError::Open { .. }));
        assert!(cache.is_empty());
        assert_eq!(backend.open_calls(), 1);
    }

    #[tokio::test]
    async fn a_failed_open_is_retried_on_the_next_call() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("flaky.pdf", DocumentScript::failing_open("io error"));
        let cache = DocumentCache::new(Arc::clone(&backend) as Arc<dyn DocumentBackend>);

        assert!(cache.open(Path::new("flaky.pdf")).await.is_err());

        backend.script(
            "flaky.pdf",
            DocumentScript::with_pages(vec![PageScript::new()]),
        );
        assert!(cache.open(Path::new("flaky.pdf")).await.is_ok());
        assert_eq!(backend.open_calls(), 2);
    }

    #[tokio::test]
    async fn clear_orphans_an_in_flight_open() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(
            "slow.pdf",
            DocumentScript::with_pages(vec![PageScript::new()]).manual_open(),
        );
        let cache = Arc::new(DocumentCache::new(
            Arc::clone(&backend) as Arc<dyn DocumentBackend>
        ));

        let pending = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.open(Path::new("slow.pdf")).await }
        });
        tokio::task::yield_now().await;
        cache.clear();
        backend.release_opens(1);

        // The orphaned open still resolves its waiter.
        assert!(pending.await.unwrap().is_ok());
        // But the cleared cache was not repopulated.
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn reopening_an_evicted_document_assigns_a_new_id() {
        let backend = backend_with(&["a.pdf", "b.pdf"]);
        let cache = DocumentCache::with_capacity(Arc::clone(&backend) as Arc<dyn DocumentBackend>, 1);

        let first = cache.open(Path::new("a.pdf")).await.unwrap();
        cache.open(Path::new("b.pdf")).await.unwrap();
        let second = cache.open(Path::new("a.pdf")).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(backend.open_calls(), 3);
    }

    #[tokio::test]
    async fn unknown_paths_surface_an_open_error() {
        let backend = Arc::new(ScriptedBackend::new());
        let cache = DocumentCache::new(backend as Arc<dyn DocumentBackend>);

        let fault = cache.open(&PathBuf::from("missing.pdf")).await.unwrap_err();
        assert!(matches!(fault, ViewerError::Open { .. }));
    }
}
