//! Match scanning and highlight rectangles over glyph sheets
//!
//! Matching is a case-insensitive substring scan over the sheet's lowercase
//! concatenation; because runs concatenate without separators, a match may
//! span adjacent runs (and, as a known accuracy trade-off, two visually
//! unrelated ones). Nothing here fails: anomalies degrade to zero
//! highlights with a log line, never a failed render.

use std::ops::Range;

use crate::glyphs::{Glyph, GlyphSheet};

/// Fraction of a glyph's height tolerated as same-line jitter before a
/// match splits into separate line rectangles
const LINE_SPLIT_RATIO: f32 = 0.4;
/// Bytes of context kept on each side of a match for status display
const CONTEXT_RADIUS: usize = 60;

/// One highlight rectangle in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HighlightRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// Scroll position the embedder should bring into view
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollTarget {
    /// CSS-pixel top edge of the first highlight; the embedder centers it
    /// in the viewport with smooth scrolling
    pub top: f32,
}

/// Everything the highlight pass produces for one page
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageHighlights {
    pub rects: Vec<HighlightRect>,
    pub scroll: Option<ScrollTarget>,
    pub context: Option<String>,
}

/// Glyph ranges of every case-insensitive occurrence of `query`, in order
#[must_use]
pub fn find_matches(sheet: &GlyphSheet, query: &str) -> Vec<Range<usize>> {
    let needle = query.to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    let mut matches = Vec::new();
    let mut from = 0;
    while let Some(found) = sheet.text_lower[from..].find(&needle) {
        let start = from + found;
        let end = start + needle.len();
        matches.push(sheet.glyph_range(start..end));
        from = end;
    }
    matches
}

/// Highlight rects for one matched glyph range, split into visual lines
///
/// Consecutive glyphs whose tops differ by more than a fraction of the
/// incoming glyph's height start a new line rectangle.
#[must_use]
pub fn rects_for_match(
    sheet: &GlyphSheet,
    range: &Range<usize>,
    device_pixel_ratio: f32,
) -> Vec<HighlightRect> {
    let Some(glyphs) = sheet.glyphs.get(range.clone()) else {
        log::warn!(
            "match range {range:?} outside a sheet of {} glyphs",
            sheet.len()
        );
        return Vec::new();
    };
    if glyphs.is_empty() {
        return Vec::new();
    }
    let mut rects = Vec::new();
    let mut line_start = 0;
    for i in 1..glyphs.len() {
        let tolerance = (glyphs[i].height * LINE_SPLIT_RATIO).max(1.0);
        if (glyphs[i].top - glyphs[i - 1].top).abs() > tolerance {
            rects.push(line_rect(&glyphs[line_start..i], device_pixel_ratio));
            line_start = i;
        }
    }
    rects.push(line_rect(&glyphs[line_start..], device_pixel_ratio));
    rects
}

/// One rectangle spanning a same-line slice of glyphs, device to CSS pixels
fn line_rect(glyphs: &[Glyph], device_pixel_ratio: f32) -> HighlightRect {
    let first = &glyphs[0];
    let last = &glyphs[glyphs.len() - 1];
    let mut min_top = f32::INFINITY;
    let mut max_top = f32::NEG_INFINITY;
    let mut max_height = 0.0f32;
    for glyph in glyphs {
        min_top = min_top.min(glyph.top);
        max_top = max_top.max(glyph.top);
        max_height = max_height.max(glyph.height);
    }
    let right = last.left + last.width;
    HighlightRect {
        left: first.left / device_pixel_ratio,
        top: min_top / device_pixel_ratio,
        width: (right - first.left) / device_pixel_ratio,
        height: (max_top + max_height - min_top) / device_pixel_ratio,
    }
}

/// Scroll target derived from the first highlight rect
#[must_use]
pub fn scroll_target(rects: &[HighlightRect]) -> Option<ScrollTarget> {
    rects.first().map(|rect| ScrollTarget { top: rect.top })
}

/// Original-case text around a matched glyph range, clamped to char
/// boundaries and trimmed, for status display
#[must_use]
pub fn match_context(sheet: &GlyphSheet, range: &Range<usize>) -> Option<String> {
    if range.start >= range.end || range.end > sheet.len() {
        return None;
    }
    let text = &sheet.text;
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(offset, _)| offset)
        .chain([text.len()])
        .collect();
    let start = *offsets.get(range.start)?;
    let end = *offsets.get(range.end)?;
    let from = prev_char_boundary(text, start.saturating_sub(CONTEXT_RADIUS));
    let to = next_char_boundary(text, (end + CONTEXT_RADIUS).min(text.len()));
    let snippet = text[from..to].trim();
    (!snippet.is_empty()).then(|| snippet.to_string())
}

/// Every highlight artifact for `query` on one sheet
#[must_use]
pub fn compute(sheet: &GlyphSheet, query: &str, device_pixel_ratio: f32) -> PageHighlights {
    let matches = find_matches(sheet, query);
    let mut rects = Vec::new();
    for range in &matches {
        rects.extend(rects_for_match(sheet, range, device_pixel_ratio));
    }
    let scroll = scroll_target(&rects);
    let context = matches
        .first()
        .and_then(|range| match_context(sheet, range));
    PageHighlights {
        rects,
        scroll,
        context,
    }
}

fn prev_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn next_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}
