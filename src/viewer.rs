//! Composition root wiring the caches, pipeline, and schedulers together
//!
//! One [`Viewer`] owns every cache and scheduler, constructed once with the
//! injected backend, search index, and render target. The embedder drives it
//! through a handful of operations and observes results through a `watch`
//! snapshot channel; only the newest render pass ever commits a snapshot.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::backend::{DocumentBackend, PageRef, RenderTarget, SearchIndex};
use crate::document_cache::{DEFAULT_DOCUMENT_CAPACITY, DocumentCache, OpenedDocument};
use crate::error::ViewResult;
use crate::glyphs::{self, GlyphIndex, GlyphKey};
use crate::highlight::{self, PageHighlights};
use crate::navigation::{Direction, NavigationResolver, NavigationState};
use crate::pipeline::{PassOutcome, RenderPipeline};
use crate::prewarm::{DEFAULT_RAPID_NAV_WINDOW, PrewarmScheduler};
use crate::scheduling::{Debounce, Token, YieldBudget};
use crate::state::{RenderMetrics, ViewSnapshot};
use crate::text_cache::PageTextCache;

/// Minimum allowed zoom factor
pub const MIN_ZOOM: f32 = 0.1;
/// Delay before a resize triggers a re-render
pub const DEFAULT_RESIZE_DEBOUNCE: Duration = Duration::from_millis(80);
/// Most hit pages requested from the search index per query
pub const DEFAULT_MAX_HIT_PAGES: usize = 256;

/// Tunables consumed once at construction
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub document_capacity: usize,
    pub glyph_capacity: usize,
    /// Device pixels per CSS pixel of the embedder's display
    pub device_pixel_ratio: f32,
    pub resize_debounce: Duration,
    /// Navigations closer together than this deepen the prewarm neighborhood
    pub rapid_nav_window: Duration,
    pub max_hit_pages: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            document_capacity: DEFAULT_DOCUMENT_CAPACITY,
            glyph_capacity: glyphs::DEFAULT_GLYPH_CAPACITY,
            device_pixel_ratio: 1.0,
            resize_debounce: DEFAULT_RESIZE_DEBOUNCE,
            rapid_nav_window: DEFAULT_RAPID_NAV_WINDOW,
            max_hit_pages: DEFAULT_MAX_HIT_PAGES,
        }
    }
}

/// Clamp a zoom factor to the valid range, handling NaN/Inf
#[must_use]
pub fn clamp_zoom(factor: f32) -> f32 {
    if factor.is_finite() {
        factor.max(MIN_ZOOM)
    } else {
        1.0
    }
}

struct Session {
    doc: Option<OpenedDocument>,
    nav: NavigationState,
    zoom: f32,
    query: String,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            doc: None,
            nav: NavigationState::default(),
            zoom: 1.0,
            query: String::new(),
        }
    }
}

/// The paginated document viewer core
pub struct Viewer {
    documents: DocumentCache,
    texts: Arc<PageTextCache>,
    glyphs: Arc<GlyphIndex>,
    pipeline: Arc<RenderPipeline>,
    prewarm: Arc<PrewarmScheduler>,
    resolver: NavigationResolver,
    index: Option<Arc<dyn SearchIndex>>,
    target: Arc<dyn RenderTarget>,
    config: ViewerConfig,
    session: Mutex<Session>,
    published: watch::Sender<ViewSnapshot>,
    resize: Debounce,
}

impl Viewer {
    #[must_use]
    pub fn new(backend: Arc<dyn DocumentBackend>, target: Arc<dyn RenderTarget>) -> Self {
        Self::with_config(backend, target, ViewerConfig::default())
    }

    #[must_use]
    pub fn with_config(
        backend: Arc<dyn DocumentBackend>,
        target: Arc<dyn RenderTarget>,
        config: ViewerConfig,
    ) -> Self {
        let texts = Arc::new(PageTextCache::new());
        let glyphs = Arc::new(GlyphIndex::with_capacity(config.glyph_capacity));
        let prewarm = Arc::new(PrewarmScheduler::with_rapid_window(
            Arc::clone(&texts),
            Arc::clone(&glyphs),
            config.rapid_nav_window,
        ));
        let resolver = NavigationResolver::new(Arc::clone(&texts));
        let (published, _) = watch::channel(ViewSnapshot::default());
        Self {
            documents: DocumentCache::with_capacity(backend, config.document_capacity),
            texts,
            glyphs,
            pipeline: Arc::new(RenderPipeline::new()),
            prewarm,
            resolver,
            index: None,
            target,
            resize: Debounce::new(config.resize_debounce),
            config,
            session: Mutex::new(Session::default()),
            published,
        }
    }

    /// Attach a full-text search index for hit-page lookups
    #[must_use]
    pub fn search_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Open the document at `path` and show its first page
    ///
    /// Switching documents invalidates the page-text cache and the glyph
    /// index, supersedes every background warm-up, and starts a fresh
    /// whole-document warm-up for the new document.
    pub async fn open_document(&self, path: &Path) -> ViewResult<()> {
        let doc = self.documents.open(path).await?;
        self.texts.clear();
        self.glyphs.invalidate_all();
        self.pipeline.reset_progress();
        self.prewarm.supersede();

        let query = {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            session.doc = Some(doc.clone());
            session.nav = NavigationState {
                current_page: 1,
                hit_pages: None,
            };
            session.query.clone()
        };
        self.published.send_modify(|snap| {
            snap.page = 1;
            snap.page_count = doc.handle.page_count();
            snap.error = None;
            snap.highlights = Vec::new();
            snap.scroll_target = None;
            snap.match_context = None;
            snap.metrics = None;
        });

        if !query.is_empty() {
            self.refresh_hits(&doc, &query).await;
        }

        let warm_token = self.prewarm.issue_document_warm();
        tokio::spawn({
            let prewarm = Arc::clone(&self.prewarm);
            let doc = doc.clone();
            async move { prewarm.warm_document(doc, warm_token).await }
        });

        self.render_current().await;
        Ok(())
    }

    /// Show page `page`, clamped to the open document's bounds
    pub async fn set_page(&self, page: usize) {
        {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            let last = match &session.doc {
                Some(doc) => doc.handle.page_count().max(1),
                None => return,
            };
            session.nav.current_page = page.clamp(1, last);
        }
        self.render_current().await;
    }

    /// Change the zoom factor; the whole glyph index becomes stale
    pub async fn set_zoom(&self, factor: f32) {
        let factor = clamp_zoom(factor);
        {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            session.zoom = factor;
        }
        self.glyphs.invalidate_all();
        self.published.send_modify(|snap| snap.zoom = factor);
        self.render_current().await;
    }

    /// Change the active search query and refresh its hit pages
    pub async fn set_query(&self, text: &str) {
        let doc = {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            session.query = text.to_string();
            session.doc.clone()
        };
        let Some(doc) = doc else { return };
        if text.is_empty() {
            self.store_hits(&doc, None);
        } else {
            self.refresh_hits(&doc, text).await;
        }
        self.render_current().await;
    }

    /// Jump to the nearest page of matches in `direction`
    ///
    /// Returns the new page, or `None` when no match exists in that
    /// direction (navigation never wraps around) or the lookup was
    /// superseded. A successful jump warms the hit pages around the new
    /// position in the background.
    pub async fn goto_adjacent_match(&self, direction: Direction) -> Option<usize> {
        let (doc, nav, query, zoom) = {
            let session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            let doc = session.doc.clone()?;
            (doc, session.nav.clone(), session.query.clone(), session.zoom)
        };
        if query.is_empty() {
            return None;
        }

        let next = self.resolver.resolve(&doc, &nav, direction, &query).await?;
        {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            if session.doc.as_ref().is_some_and(|active| active.id == doc.id) {
                session.nav.current_page = next;
            } else {
                return None;
            }
        }

        let depth = self.prewarm.record_navigation();
        if let Some(hits) = nav.hit_pages {
            let token = self.prewarm.neighborhood_token();
            let device_scale = zoom * self.config.device_pixel_ratio;
            tokio::spawn({
                let prewarm = Arc::clone(&self.prewarm);
                let doc = doc.clone();
                async move {
                    prewarm
                        .warm_neighborhood(doc, next, &hits, device_scale, depth, token)
                        .await;
                }
            });
        }

        self.render_current().await;
        Some(next)
    }

    /// Note that the viewport container was resized
    ///
    /// The size itself stays the embedder's concern; the notification
    /// re-renders the current page once the resize settles, so a window
    /// being dragged does not re-render on every intermediate size.
    pub async fn viewport_resized(&self) {
        if self.resize.settle().await {
            self.render_current().await;
        }
    }

    /// The latest published snapshot
    #[must_use]
    pub fn snapshot(&self) -> ViewSnapshot {
        self.published.borrow().clone()
    }

    /// Subscribe to snapshot updates
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ViewSnapshot> {
        self.published.subscribe()
    }

    /// Tear down: supersede everything in flight and drop every cache entry
    pub fn clear(&self) {
        self.pipeline.supersede();
        self.pipeline.reset_progress();
        self.prewarm.supersede();
        self.documents.clear();
        self.texts.clear();
        self.glyphs.invalidate_all();
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Session::default();
        self.published.send_replace(ViewSnapshot::default());
    }

    async fn refresh_hits(&self, doc: &OpenedDocument, query: &str) {
        let Some(index) = &self.index else {
            self.store_hits(doc, None);
            return;
        };
        let hits = match index
            .page_hits(&doc.path, query, self.config.max_hit_pages)
            .await
        {
            Ok(mut hits) => {
                hits.sort_unstable();
                hits.dedup();
                Some(hits)
            }
            Err(fault) => {
                log::debug!("search index lookup for {query:?} failed: {fault}");
                None
            }
        };
        self.store_hits(doc, hits);
    }

    fn store_hits(&self, doc: &OpenedDocument, hits: Option<Vec<usize>>) {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.doc.as_ref().is_some_and(|active| active.id == doc.id) {
            session.nav.hit_pages = hits;
        }
    }

    /// Run one progressive render pass for the current page and commit its
    /// snapshot unless a newer pass supersedes it on the way
    async fn render_current(&self) {
        let (doc, page, zoom, query) = {
            let session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(doc) = session.doc.clone() else {
                return;
            };
            (
                doc,
                session.nav.current_page,
                session.zoom,
                session.query.clone(),
            )
        };
        let token = self.pipeline.issue();
        let device_scale = zoom * self.config.device_pixel_ratio;
        self.published.send_modify(|snap| {
            snap.loading = true;
            snap.error = None;
        });

        let start = Instant::now();
        let outcome = self
            .pipeline
            .render_page(&doc.handle, page, device_scale, &self.target, token, |_| {
                // The quick paint made the page presentable.
                self.published.send_modify(|snap| snap.loading = false);
            })
            .await;
        let page_ref = match outcome {
            PassOutcome::Committed { page, .. } => page,
            PassOutcome::Superseded => return,
            PassOutcome::Failed(fault) => {
                if self.pipeline.is_current(token) {
                    self.published.send_modify(|snap| {
                        snap.loading = false;
                        snap.error = Some(fault.to_string());
                    });
                }
                return;
            }
        };

        let mut metrics = RenderMetrics {
            render: start.elapsed(),
            ..RenderMetrics::default()
        };
        let highlights = if query.is_empty() {
            PageHighlights::default()
        } else {
            match self
                .page_highlights(&doc, &page_ref, device_scale, &query, token, &mut metrics)
                .await
            {
                Some(highlights) => highlights,
                None => return,
            }
        };

        if !self.pipeline.is_current(token) {
            return;
        }
        self.published.send_modify(|snap| {
            snap.page = page;
            snap.page_count = doc.handle.page_count();
            snap.zoom = zoom;
            snap.loading = false;
            snap.error = None;
            snap.highlights = highlights.rects;
            snap.scroll_target = highlights.scroll;
            snap.match_context = highlights.context;
            snap.metrics = Some(metrics);
        });
    }

    /// Highlights for the just-rendered page; `None` once superseded
    ///
    /// Faults on this path never fail the render: the page image stays, the
    /// overlay degrades to zero highlights.
    async fn page_highlights(
        &self,
        doc: &OpenedDocument,
        page_ref: &Arc<dyn PageRef>,
        device_scale: f32,
        query: &str,
        token: Token,
        metrics: &mut RenderMetrics,
    ) -> Option<PageHighlights> {
        let page = page_ref.page_number();
        metrics.text_cache_hit = self.texts.contains(doc.id, page);
        let content = match self.texts.page_text(doc, page).await {
            Ok(content) => content,
            Err(fault) => {
                log::warn!("highlights dropped for page {page}: {fault}");
                return Some(PageHighlights::default());
            }
        };

        let key = GlyphKey::new(page, device_scale);
        let sheet = match self.glyphs.get(&key) {
            Some(sheet) => {
                metrics.glyph_cache_hit = true;
                sheet
            }
            None => {
                let build_start = Instant::now();
                let viewport = page_ref.viewport(device_scale);
                let mut budget =
                    YieldBudget::new(glyphs::YIELD_STRIDE, glyphs::YIELD_MIN_ELAPSED);
                let built = glyphs::build_sheet(&content.runs, &viewport, &mut budget, || {
                    !self.pipeline.is_current(token)
                })
                .await?;
                metrics.glyph_build = build_start.elapsed();
                if !self.pipeline.is_current(token) {
                    return None;
                }
                let sheet = Arc::new(built);
                self.glyphs.insert(key, Arc::clone(&sheet));
                sheet
            }
        };

        let highlight_start = Instant::now();
        let highlights = highlight::compute(&sheet, query, self.config.device_pixel_ratio);
        metrics.highlight = highlight_start.elapsed();
        Some(highlights)
    }
}
