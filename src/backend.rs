//! Boundary traits for the document backend and the full-text search index
//!
//! Everything behind these traits lives outside the viewer core: the parsing
//! and rasterization engine, the byte loader, and the search index. The
//! boundary carries a fixed schema ([`TextRun`], [`PageViewport`]) and plain
//! [`BackendError`] reasons; the call site that pulls a failure across the
//! boundary classifies it into a [`crate::error::ViewerError`] variant.

use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Failure reason reported by a backend or index implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    /// Build a reason from anything displayable
    pub fn new(reason: impl fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

/// Result alias for the backend boundary
pub type BackendResult<T> = Result<T, BackendError>;

/// One run of text as the backend reports it
///
/// `transform` is a 2x3 affine `[a, b, c, d, e, f]` placing the run in page
/// space; `width` is the run's declared width in text-space units.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub transform: [f32; 6],
    pub width: f32,
}

/// A page viewport at one concrete render scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageViewport {
    /// Device-pixel width of the page at this scale
    pub width: f32,
    /// Device-pixel height of the page at this scale
    pub height: f32,
    /// Page-space to device-space transform
    pub transform: [f32; 6],
    /// Device pixels per text-space unit
    pub scale: f32,
}

/// Terminal state of one rasterization task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Opens documents from storage
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Open the document at `path`
    async fn open(&self, path: &Path) -> BackendResult<Arc<dyn DocumentHandle>>;
}

/// An open document
///
/// Dropping the last clone of the handle releases the backend resources, so
/// cache eviction can never free a document an in-flight caller still holds.
#[async_trait]
pub trait DocumentHandle: Send + Sync {
    /// Number of pages in the document
    fn page_count(&self) -> usize;

    /// Load one page; page numbers are 1-based
    async fn page(&self, page: usize) -> BackendResult<Arc<dyn PageRef>>;
}

/// One loaded page
#[async_trait]
pub trait PageRef: Send + Sync {
    /// 1-based page number of this page
    fn page_number(&self) -> usize;

    /// Text runs of the page in reading order
    async fn text_content(&self) -> BackendResult<Vec<TextRun>>;

    /// Viewport of this page at `scale` device pixels per text-space unit
    fn viewport(&self, scale: f32) -> PageViewport;

    /// Start rasterizing this page into `target` and return the running task
    fn render(&self, target: Arc<dyn RenderTarget>, viewport: PageViewport) -> Arc<dyn RenderTask>;
}

/// A rasterization in flight
#[async_trait]
pub trait RenderTask: Send + Sync {
    /// Request cancellation; idempotent, and a no-op once the task finished
    fn cancel(&self);

    /// Wait for the task to reach a terminal state
    async fn finish(&self) -> TaskOutcome;
}

/// Opaque shared output surface owned by the embedder
///
/// At most one task writes to it at a time; the render pipeline enforces
/// that by cancelling the previous task before starting a new one.
pub trait RenderTarget: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Full-text index over whole documents
///
/// Index failures never surface to users; the viewer logs them and degrades
/// to scan-based match navigation.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Pages of `path` containing `query`, ascending, at most `max_pages`
    async fn page_hits(&self, path: &Path, query: &str, max_pages: usize)
    -> BackendResult<Vec<usize>>;
}
