//! Per-scale character geometry and its bounded index
//!
//! A glyph sheet approximates where every character of a page sits at one
//! render scale, reconstructed from the backend's text runs: the run origin
//! and font height come from the composed viewport and run transforms, and
//! the run's characters share its device width evenly. Sheets are what the
//! highlight pass measures match rectangles against.

use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lru::LruCache;

use crate::backend::{PageViewport, TextRun};
use crate::scheduling::YieldBudget;

/// Default number of `(page, scale)` sheets kept
pub const DEFAULT_GLYPH_CAPACITY: usize = 12;
/// Runs between yield checks while building a sheet
pub(crate) const YIELD_STRIDE: usize = 12;
/// Minimum time between yields while building a sheet
pub(crate) const YIELD_MIN_ELAPSED: Duration = Duration::from_millis(12);

/// Render scale quantized to millionths for stable hashing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScaleKey(u32);

impl ScaleKey {
    #[must_use]
    pub fn quantize(scale: f32) -> Self {
        Self((scale * 1_000_000.0) as u32)
    }

    /// The quantized scale in millionths
    #[must_use]
    pub fn millionths(self) -> u32 {
        self.0
    }
}

/// Cache key: one page at one quantized scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlyphKey {
    pub page: usize,
    pub scale: ScaleKey,
}

impl GlyphKey {
    #[must_use]
    pub fn new(page: usize, scale: f32) -> Self {
        Self {
            page,
            scale: ScaleKey::quantize(scale),
        }
    }
}

/// One positioned character in device pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Glyph {
    pub ch: char,
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// Geometry and searchable text of one page at one scale
///
/// `text_lower` holds exactly one lowercase char per glyph (the first char
/// of the full lowercase expansion), so byte ranges found in it map back to
/// glyph index ranges through the per-glyph offset table even when
/// lowercasing changes byte lengths.
#[derive(Debug, Clone, PartialEq)]
pub struct GlyphSheet {
    pub glyphs: Vec<Glyph>,
    pub text: String,
    pub text_lower: String,
    lower_offsets: Vec<usize>,
}

impl GlyphSheet {
    pub(crate) fn from_glyphs(glyphs: Vec<Glyph>) -> Self {
        let mut text = String::with_capacity(glyphs.len());
        let mut text_lower = String::with_capacity(glyphs.len());
        let mut lower_offsets = Vec::with_capacity(glyphs.len() + 1);
        for glyph in &glyphs {
            text.push(glyph.ch);
            lower_offsets.push(text_lower.len());
            text_lower.push(glyph.ch.to_lowercase().next().unwrap_or(glyph.ch));
        }
        lower_offsets.push(text_lower.len());
        Self {
            glyphs,
            text,
            text_lower,
            lower_offsets,
        }
    }

    /// Number of glyphs on the sheet
    #[must_use]
    pub fn len(&self) -> usize {
        self.glyphs.len()
    }

    /// Check if the sheet has no glyphs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.glyphs.is_empty()
    }

    /// Map a byte range of `text_lower` to the glyph range covering it
    pub(crate) fn glyph_range(&self, bytes: Range<usize>) -> Range<usize> {
        let start = self.lower_offsets.partition_point(|&offset| offset < bytes.start);
        let end = self.lower_offsets.partition_point(|&offset| offset < bytes.end);
        start..end
    }
}

/// 2x3 affine product: apply `inner`, then `outer`
fn compose(outer: &[f32; 6], inner: &[f32; 6]) -> [f32; 6] {
    [
        outer[0] * inner[0] + outer[2] * inner[1],
        outer[1] * inner[0] + outer[3] * inner[1],
        outer[0] * inner[2] + outer[2] * inner[3],
        outer[1] * inner[2] + outer[3] * inner[3],
        outer[0] * inner[4] + outer[2] * inner[5] + outer[4],
        outer[1] * inner[4] + outer[3] * inner[5] + outer[5],
    ]
}

/// Build the glyph sheet for one page's runs at `viewport`'s scale
///
/// Long pages pace themselves through `budget`; after each actual yield the
/// build re-checks `cancelled` and returns `None`, discarding partial work,
/// once its caller has moved on.
pub async fn build_sheet<F>(
    runs: &[TextRun],
    viewport: &PageViewport,
    budget: &mut YieldBudget,
    cancelled: F,
) -> Option<GlyphSheet>
where
    F: Fn() -> bool,
{
    let mut glyphs = Vec::new();
    for run in runs {
        if budget.tick().await && cancelled() {
            return None;
        }
        append_run_glyphs(&mut glyphs, run, viewport);
    }
    Some(GlyphSheet::from_glyphs(glyphs))
}

fn append_run_glyphs(glyphs: &mut Vec<Glyph>, run: &TextRun, viewport: &PageViewport) {
    let char_count = run.text.chars().count();
    if char_count == 0 {
        return;
    }
    let m = compose(&viewport.transform, &run.transform);
    let font_height = m[2].hypot(m[3]);
    if font_height <= 0.0 {
        return;
    }
    let device_width = run.width * viewport.scale;
    let char_width = device_width / char_count as f32;
    let top = m[5] - font_height;
    for (i, ch) in run.text.chars().enumerate() {
        glyphs.push(Glyph {
            ch,
            left: m[4] + char_width * i as f32,
            top,
            width: char_width,
            height: font_height,
        });
    }
}

/// Bounded LRU of glyph sheets keyed by page and quantized scale
pub struct GlyphIndex {
    entries: Mutex<LruCache<GlyphKey, Arc<GlyphSheet>>>,
}

impl GlyphIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_GLYPH_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity =
            NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Get a sheet, promoting it in the LRU order
    #[must_use]
    pub fn get(&self, key: &GlyphKey) -> Option<Arc<GlyphSheet>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Check if a key is present without promoting it
    #[must_use]
    pub fn contains(&self, key: &GlyphKey) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Insert a sheet, evicting the least recently used one when full
    pub fn insert(&self, key: GlyphKey, sheet: Arc<GlyphSheet>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((evicted, _)) = entries.push(key, sheet) {
            if evicted != key {
                log::debug!(
                    "glyph index evicted page {} at scale {}",
                    evicted.page,
                    evicted.scale.millionths()
                );
            }
        }
    }

    /// Drop every sheet; called on zoom or document change
    pub fn invalidate_all(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of cached sheets
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cap()
            .get()
    }
}

impl Default for GlyphIndex {
    fn default() -> Self {
        Self::new()
    }
}
