//! Match navigation between pages
//!
//! The fast path steps through the ascending hit list the search index
//! produced; when no list is available the resolver walks page text
//! linearly toward the document boundary. Neither path wraps around.

use std::sync::Arc;

use crate::document_cache::OpenedDocument;
use crate::scheduling::Generation;
use crate::text_cache::PageTextCache;

/// Direction of a match navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Where match navigation currently stands
#[derive(Debug, Clone, Default)]
pub struct NavigationState {
    /// 1-based page on display
    pub current_page: usize,
    /// Ascending pages known to contain the query; `None` when the index
    /// was unavailable and matches must be found by scanning
    pub hit_pages: Option<Vec<usize>>,
}

/// Nearest hit strictly beyond `current` in `direction`
///
/// `None` at the boundary: navigation never wraps around.
#[must_use]
pub fn next_hit(hit_pages: &[usize], current: usize, direction: Direction) -> Option<usize> {
    match direction {
        Direction::Forward => {
            let index = hit_pages.partition_point(|&page| page <= current);
            hit_pages.get(index).copied()
        }
        Direction::Backward => {
            let index = hit_pages.partition_point(|&page| page < current);
            index.checked_sub(1).and_then(|i| hit_pages.get(i)).copied()
        }
    }
}

/// Finds the next page of matches
pub struct NavigationResolver {
    texts: Arc<PageTextCache>,
    scans: Generation,
}

impl NavigationResolver {
    #[must_use]
    pub fn new(texts: Arc<PageTextCache>) -> Self {
        Self {
            texts,
            scans: Generation::new(),
        }
    }

    /// Next page of matches from `state`, or `None` when there is none
    ///
    /// Uses the hit list when one is cached; otherwise falls back to a
    /// linear scan through page text.
    pub async fn resolve(
        &self,
        doc: &OpenedDocument,
        state: &NavigationState,
        direction: Direction,
        query: &str,
    ) -> Option<usize> {
        match &state.hit_pages {
            Some(hits) => next_hit(hits, state.current_page, direction),
            None => self.scan(doc, state.current_page, direction, query).await,
        }
    }

    /// Walk pages from `current` to the document boundary looking for
    /// `query`; the first page containing it wins
    ///
    /// Each scan supersedes the previous one, and a superseded scan checks
    /// its token before every page step and gives up with `None`. Pages
    /// whose text cannot be extracted are skipped.
    pub async fn scan(
        &self,
        doc: &OpenedDocument,
        current: usize,
        direction: Direction,
        query: &str,
    ) -> Option<usize> {
        let token = self.scans.issue();
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return None;
        }
        let page_count = doc.handle.page_count();
        let mut page = current;
        loop {
            page = match direction {
                Direction::Forward if page < page_count => page + 1,
                Direction::Backward if page > 1 => page - 1,
                _ => return None,
            };
            if !self.scans.is_current(token) {
                return None;
            }
            match self.texts.page_text(doc, page).await {
                Ok(content) if content.text.to_lowercase().contains(&needle) => {
                    return Some(page);
                }
                Ok(_) => {}
                Err(fault) => log::debug!("match scan skipped page {page}: {fault}"),
            }
        }
    }
}
