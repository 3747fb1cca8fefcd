//! Background warm-up of the text cache and glyph index
//!
//! Two best-effort task kinds run behind the visible page: a whole-document
//! walk that extracts every page's text shortly after open, and a
//! neighborhood warm-up around the current page after each match
//! navigation. Both populate the same caches a foreground render reads,
//! never paint, swallow every failure, and die quietly once their
//! generation moves on (a document change supersedes both kinds).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::document_cache::OpenedDocument;
use crate::glyphs::{self, GlyphIndex, GlyphKey};
use crate::scheduling::{Generation, Token, YieldBudget};
use crate::text_cache::PageTextCache;

/// Pages between scheduler yields during whole-document warm-up
const WARMUP_YIELD_STRIDE: usize = 5;
/// Navigations closer together than this count as rapid paging
pub const DEFAULT_RAPID_NAV_WINDOW: Duration = Duration::from_millis(600);
/// Hit pages warmed on each side of the current page while paging rapidly
const DEPTH_RAPID: usize = 3;
/// Hit pages warmed on each side otherwise
const DEPTH_IDLE: usize = 1;

/// Schedules cache warm-ups around the user's position
pub struct PrewarmScheduler {
    texts: Arc<PageTextCache>,
    glyphs: Arc<GlyphIndex>,
    document_warm: Generation,
    neighborhood_warm: Generation,
    last_navigation: Mutex<Option<Instant>>,
    rapid_window: Duration,
}

impl PrewarmScheduler {
    #[must_use]
    pub fn new(texts: Arc<PageTextCache>, glyphs: Arc<GlyphIndex>) -> Self {
        Self::with_rapid_window(texts, glyphs, DEFAULT_RAPID_NAV_WINDOW)
    }

    #[must_use]
    pub fn with_rapid_window(
        texts: Arc<PageTextCache>,
        glyphs: Arc<GlyphIndex>,
        rapid_window: Duration,
    ) -> Self {
        Self {
            texts,
            glyphs,
            document_warm: Generation::new(),
            neighborhood_warm: Generation::new(),
            last_navigation: Mutex::new(None),
            rapid_window,
        }
    }

    /// Supersede every outstanding warm-up; called on document change
    pub fn supersede(&self) {
        self.document_warm.bump();
        self.neighborhood_warm.bump();
        *self
            .last_navigation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Token for a new whole-document warm-up, superseding earlier ones
    pub fn issue_document_warm(&self) -> Token {
        self.document_warm.issue()
    }

    /// Token neighborhood warm-ups run under until the document changes
    #[must_use]
    pub fn neighborhood_token(&self) -> Token {
        self.neighborhood_warm.current()
    }

    /// Record one match navigation; returns the neighborhood depth the next
    /// warm-up should use, deeper while the user is paging quickly
    pub fn record_navigation(&self) -> usize {
        let now = Instant::now();
        let mut last = self
            .last_navigation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let depth = match *last {
            Some(previous) if now.duration_since(previous) < self.rapid_window => DEPTH_RAPID,
            _ => DEPTH_IDLE,
        };
        *last = Some(now);
        depth
    }

    /// Walk every page of `doc` into the text cache
    ///
    /// Yields every few pages, skips pages that fail to extract, and stops
    /// once `token` is superseded.
    pub async fn warm_document(&self, doc: OpenedDocument, token: Token) {
        let mut budget = YieldBudget::new(WARMUP_YIELD_STRIDE, Duration::ZERO);
        for page in 1..=doc.handle.page_count() {
            if !self.document_warm.is_current(token) {
                log::debug!("document warm-up superseded at page {page}");
                return;
            }
            if let Err(fault) = self.texts.page_text(&doc, page).await {
                log::debug!("document warm-up skipped page {page}: {fault}");
            }
            budget.tick().await;
        }
    }

    /// Warm the hit pages nearest to `current_page`
    ///
    /// Takes up to `depth` hits on each side from the ascending hit list and
    /// fills the text cache and glyph index for them exactly as a render
    /// would, without painting.
    pub async fn warm_neighborhood(
        &self,
        doc: OpenedDocument,
        current_page: usize,
        hit_pages: &[usize],
        device_scale: f32,
        depth: usize,
        token: Token,
    ) {
        for page in neighborhood(hit_pages, current_page, depth) {
            if !self.neighborhood_warm.is_current(token) {
                return;
            }
            self.warm_page(&doc, page, device_scale, token).await;
        }
    }

    async fn warm_page(&self, doc: &OpenedDocument, page: usize, device_scale: f32, token: Token) {
        let content = match self.texts.page_text(doc, page).await {
            Ok(content) => content,
            Err(fault) => {
                log::debug!("neighborhood warm-up skipped page {page}: {fault}");
                return;
            }
        };
        let key = GlyphKey::new(page, device_scale);
        if self.glyphs.contains(&key) {
            return;
        }
        let page_ref = match doc.handle.page(page).await {
            Ok(page_ref) => page_ref,
            Err(fault) => {
                log::debug!("neighborhood warm-up skipped page {page}: {fault}");
                return;
            }
        };
        let viewport = page_ref.viewport(device_scale);
        let mut budget = YieldBudget::new(glyphs::YIELD_STRIDE, glyphs::YIELD_MIN_ELAPSED);
        let sheet = glyphs::build_sheet(&content.runs, &viewport, &mut budget, || {
            !self.neighborhood_warm.is_current(token)
        })
        .await;
        // The insert itself is guarded too: a sheet finished for a document
        // that is no longer active must not land in the index.
        if let Some(sheet) = sheet {
            if self.neighborhood_warm.is_current(token) {
                self.glyphs.insert(key, Arc::new(sheet));
            }
        }
    }
}

/// Up to `depth` hit pages after `current`, then up to `depth` before it,
/// nearest first; `current` itself is never warmed
fn neighborhood(hit_pages: &[usize], current: usize, depth: usize) -> Vec<usize> {
    let first_after = hit_pages.partition_point(|&page| page <= current);
    let first_at_or_after = hit_pages.partition_point(|&page| page < current);
    let mut pages = Vec::with_capacity(depth * 2);
    pages.extend(hit_pages[first_after..].iter().take(depth).copied());
    pages.extend(
        hit_pages[..first_at_or_after]
            .iter()
            .rev()
            .take(depth)
            .copied(),
    );
    pages
}
