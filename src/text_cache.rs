//! Unbounded cache of extracted page text with deduplicated extractions

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::backend::TextRun;
use crate::document_cache::{DocId, OpenedDocument};
use crate::error::{ViewResult, ViewerError};

/// Extracted text of one page
///
/// `text` is the no-separator concatenation of the run texts, computed once
/// at extraction time for substring scans over the whole page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageTextContent {
    pub runs: Vec<TextRun>,
    pub text: String,
}

impl PageTextContent {
    #[must_use]
    pub fn new(runs: Vec<TextRun>) -> Self {
        let text = runs.iter().map(|run| run.text.as_str()).collect();
        Self { runs, text }
    }
}

type TextKey = (DocId, usize);
type SharedExtract = Shared<BoxFuture<'static, ViewResult<Arc<PageTextContent>>>>;

#[derive(Default)]
struct TextState {
    entries: HashMap<TextKey, Arc<PageTextContent>>,
    in_flight: HashMap<TextKey, SharedExtract>,
    epoch: u64,
}

/// Page text per `(document, page)` key
///
/// Grows until [`PageTextCache::clear`]; extracted text is small next to
/// raster output, so no eviction runs here. Keying by [`DocId`] keeps inserts
/// from a superseded document apart from the active one. Concurrent fetches
/// of the same key share a single backend extraction.
#[derive(Default)]
pub struct PageTextCache {
    state: Arc<Mutex<TextState>>,
}

impl PageTextCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Extracted text for `page` of `doc`, fetching at most once per key
    pub async fn page_text(
        &self,
        doc: &OpenedDocument,
        page: usize,
    ) -> ViewResult<Arc<PageTextContent>> {
        let key = (doc.id, page);
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(content) = state.entries.get(&key) {
                return Ok(Arc::clone(content));
            }
            if let Some(pending) = state.in_flight.get(&key) {
                pending.clone()
            } else {
                let pending =
                    Self::start_extract(Arc::clone(&self.state), doc.clone(), page, state.epoch);
                state.in_flight.insert(key, pending.clone());
                pending
            }
        };
        pending.await
    }

    fn start_extract(
        state: Arc<Mutex<TextState>>,
        doc: OpenedDocument,
        page: usize,
        epoch: u64,
    ) -> SharedExtract {
        async move {
            let extracted = extract(&doc, page).await;
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let fresh = state.epoch == epoch;
            if fresh {
                state.in_flight.remove(&(doc.id, page));
            }
            let content = Arc::new(extracted?);
            if fresh {
                state.entries.insert((doc.id, page), Arc::clone(&content));
            }
            Ok(content)
        }
        .boxed()
        .shared()
    }

    /// Check if a page's text is cached
    #[must_use]
    pub fn contains(&self, doc: DocId, page: usize) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains_key(&(doc, page))
    }

    /// Number of cached pages across all documents
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

    /// Drop every entry and orphan in-flight extractions
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.epoch += 1;
        state.entries.clear();
        state.in_flight.clear();
    }
}

async fn extract(doc: &OpenedDocument, page: usize) -> ViewResult<PageTextContent> {
    let page_ref = doc
        .handle
        .page(page)
        .await
        .map_err(|fault| ViewerError::Extract {
            page,
            reason: fault.0,
        })?;
    let runs = page_ref
        .text_content()
        .await
        .map_err(|fault| ViewerError::Extract {
            page,
            reason: fault.0,
        })?;
    Ok(PageTextContent::new(runs))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::backend::DocumentBackend;
    use crate::document_cache::DocumentCache;
    use crate::testing::{DocumentScript, PageScript, ScriptedBackend};

    async fn opened_doc(backend: &Arc<ScriptedBackend>, script: DocumentScript) -> OpenedDocument {
        backend.script("doc.pdf", script);
        let cache = DocumentCache::new(Arc::clone(backend) as Arc<dyn DocumentBackend>);
        cache.open(Path::new("doc.pdf")).await.unwrap()
    }

    #[tokio::test]
    async fn concatenates_runs_without_separators() {
        let content = PageTextContent::new(vec![
            TextRun {
                text: "Hello ".to_string(),
                transform: [12.0, 0.0, 0.0, 12.0, 10.0, 100.0],
                width: 36.0,
            },
            TextRun {
                text: "World".to_string(),
                transform: [12.0, 0.0, 0.0, 12.0, 46.0, 100.0],
                width: 30.0,
            },
        ]);
        assert_eq!(content.text, "Hello World");
    }

    #[tokio::test]
    async fn caches_extracted_text_per_page() {
        let backend = Arc::new(ScriptedBackend::new());
        let doc = opened_doc(
            &backend,
            DocumentScript::with_pages(vec![
                PageScript::new().run("one", 12.0, 0.0, 100.0, 18.0),
                PageScript::new().run("two", 12.0, 0.0, 100.0, 18.0),
            ]),
        )
        .await;
        let cache = PageTextCache::new();

        let first = cache.page_text(&doc, 1).await.unwrap();
        let again = cache.page_text(&doc, 1).await.unwrap();

        assert_eq!(first.text, "one");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(backend.text_calls(Path::new("doc.pdf"), 1), 1);
        assert!(cache.contains(doc.id, 1));
        assert!(!cache.contains(doc.id, 2));
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_extraction() {
        let backend = Arc::new(ScriptedBackend::new());
        let doc = opened_doc(
            &backend,
            DocumentScript::with_pages(vec![
                PageScript::new().run("slow page", 12.0, 0.0, 100.0, 54.0).manual_text(),
            ]),
        )
        .await;
        let cache = Arc::new(PageTextCache::new());

        let first = tokio::spawn({
            let cache = Arc::clone(&cache);
            let doc = doc.clone();
            async move { cache.page_text(&doc, 1).await }
        });
        let second = tokio::spawn({
            let cache = Arc::clone(&cache);
            let doc = doc.clone();
            async move { cache.page_text(&doc, 1).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(backend.text_calls(Path::new("doc.pdf"), 1), 1);

        backend.release_texts(1);
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.text_calls(Path::new("doc.pdf"), 1), 1);
    }

    #[tokio::test]
    async fn extraction_failure_surfaces_and_is_not_cached() {
        let backend = Arc::new(ScriptedBackend::new());
        let doc = opened_doc(
            &backend,
            DocumentScript::with_pages(vec![PageScript::new().failing_text()]),
        )
        .await;
        let cache = PageTextCache::new();

        let fault = cache.page_text(&doc, 1).await.unwrap_err();
        assert!(matches!(fault, ViewerError::Extract { page: 1, .. }));
        assert!(cache.is_empty());

        // The failure was not memoized either: the next call extracts again.
        assert!(cache.page_text(&doc, 1).await.is_err());
        assert_eq!(backend.text_calls(Path::new("doc.pdf"), 1), 2);
    }

    #[tokio::test]
    async fn clear_orphans_an_in_flight_extraction() {
        let backend = Arc::new(ScriptedBackend::new());
        let doc = opened_doc(
            &backend,
            DocumentScript::with_pages(vec![
                PageScript::new().run("text", 12.0, 0.0, 100.0, 24.0).manual_text(),
            ]),
        )
        .await;
        let cache = Arc::new(PageTextCache::new());

        let pending = tokio::spawn({
            let cache = Arc::clone(&cache);
            let doc = doc.clone();
            async move { cache.page_text(&doc, 1).await }
        });
        tokio::task::yield_now().await;
        cache.clear();
        backend.release_texts(1);

        assert!(pending.await.unwrap().is_ok());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn documents_do_not_share_entries() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(
            "a.pdf",
            DocumentScript::with_pages(vec![PageScript::new().run("alpha", 12.0, 0.0, 100.0, 30.0)]),
        );
        backend.script(
            "b.pdf",
            DocumentScript::with_pages(vec![PageScript::new().run("beta", 12.0, 0.0, 100.0, 24.0)]),
        );
        let docs = DocumentCache::new(Arc::clone(&backend) as Arc<dyn DocumentBackend>);
        let first = docs.open(Path::new("a.pdf")).await.unwrap();
        let second = docs.open(Path::new("b.pdf")).await.unwrap();
        let cache = PageTextCache::new();

        let alpha = cache.page_text(&first, 1).await.unwrap();
        let beta = cache.page_text(&second, 1).await.unwrap();

        assert_eq!(alpha.text, "alpha");
        assert_eq!(beta.text, "beta");
        assert_eq!(cache.len(), 2);
    }
}
