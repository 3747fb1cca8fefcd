//! Rendering, highlight, and cache core for a paginated document viewer
//!
//! `folio` renders one page of a large document at a time, overlays
//! highlights for every occurrence of a search string on the visible page,
//! and jumps between pages containing matches. It stays responsive under
//! fast paging, zoom, and resize through three layered caches (open
//! documents, page text, per-scale glyph geometry), a cancellable
//! progressive render pipeline, and best-effort background prewarming.
//!
//! Parsing and rasterization live outside the crate behind
//! [`backend::DocumentBackend`]; the embedder injects them, plus an optional
//! [`backend::SearchIndex`] and the shared [`backend::RenderTarget`], into a
//! [`Viewer`] and observes results through its snapshot channel.

pub mod backend;
pub mod document_cache;
pub mod error;
pub mod glyphs;
pub mod highlight;
pub mod navigation;
pub mod pipeline;
pub mod prewarm;
pub mod scheduling;
pub mod state;
pub mod text_cache;
pub mod viewer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use document_cache::{DocId, DocumentCache, OpenedDocument};
pub use error::{ViewResult, ViewerError};
pub use glyphs::{Glyph, GlyphIndex, GlyphKey, GlyphSheet, ScaleKey};
pub use highlight::{HighlightRect, PageHighlights, ScrollTarget};
pub use navigation::{Direction, NavigationResolver, NavigationState};
pub use pipeline::RenderPipeline;
pub use prewarm::PrewarmScheduler;
pub use state::{RenderMetrics, ViewSnapshot};
pub use text_cache::{PageTextCache, PageTextContent};
pub use viewer::{Viewer, ViewerConfig};
