//! Published view state

use std::time::Duration;

use crate::highlight::{HighlightRect, ScrollTarget};

/// Timings and cache outcomes of the latest committed render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderMetrics {
    /// Time from pass start to the full-scale paint
    pub render: Duration,
    /// Time spent building the glyph sheet (zero on a cache hit)
    pub glyph_build: Duration,
    /// Time spent matching and building highlight rects
    pub highlight: Duration,
    /// Whether the page text was already cached when the pass began
    pub text_cache_hit: bool,
    /// Whether the glyph sheet was already cached when the pass began
    pub glyph_cache_hit: bool,
}

/// One snapshot of what the embedder should show
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    /// 1-based page on display
    pub page: usize,
    /// Pages in the open document, zero when none is open
    pub page_count: usize,
    /// Current zoom factor (1.0 = 100%)
    pub zoom: f32,
    /// Whether a render pass is still under way
    pub loading: bool,
    /// Displayable message of the last failed pass
    pub error: Option<String>,
    /// Highlight rects for the active query on the visible page
    pub highlights: Vec<HighlightRect>,
    /// Where to scroll so the first match is visible
    pub scroll_target: Option<ScrollTarget>,
    /// Text around the first match, for status display
    pub match_context: Option<String>,
    /// Metrics of the last committed render
    pub metrics: Option<RenderMetrics>,
}

impl Default for ViewSnapshot {
    fn default() -> Self {
        Self {
            page: 1,
            page_count: 0,
            zoom: 1.0,
            loading: false,
            error: None,
            highlights: Vec::new(),
            scroll_target: None,
            match_context: None,
            metrics: None,
        }
    }
}
