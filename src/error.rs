//! Fault types surfaced by the viewer core

use thiserror::Error;

/// Faults a viewer operation can surface.
///
/// Every variant carries a plain reason string, so a fault stays cloneable
/// and one backend failure can reach every caller awaiting the same
/// deduplicated operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewerError {
    /// The backend could not open the document
    #[error("failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    /// Text extraction failed for one page
    #[error("text extraction failed on page {page}: {reason}")]
    Extract { page: usize, reason: String },

    /// Page load or rasterization failed for one page
    #[error("render failed on page {page}: {reason}")]
    Render { page: usize, reason: String },
}

/// Result alias used across the crate
pub type ViewResult<T> = Result<T, ViewerError>;
