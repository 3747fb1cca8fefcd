//! Scripted backend and recording target for tests
//!
//! The scripted backend plays the role of the parsing/rasterization engine:
//! tests declare per-path documents and per-page text runs up front, then
//! exercise the caches and the pipeline against them. Any step can be gated
//! (held until the test releases it) so interleavings are deterministic, or
//! scripted to fail.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use crate::backend::{
    BackendError, BackendResult, DocumentBackend, DocumentHandle, PageRef, PageViewport,
    RenderTarget, RenderTask, SearchIndex, TaskOutcome, TextRun,
};

/// Letter-size page bounds used by every scripted viewport
const PAGE_WIDTH: f32 = 612.0;
const PAGE_HEIGHT: f32 = 792.0;

/// Script for one document the backend knows how to open
#[derive(Clone, Default)]
pub struct DocumentScript {
    pages: Vec<PageScript>,
    open_failure: Option<String>,
    manual_open: bool,
}

impl DocumentScript {
    /// A document whose pages follow `pages`, in order, 1-based
    #[must_use]
    pub fn with_pages(pages: Vec<PageScript>) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    /// A document whose open always fails with `reason`
    #[must_use]
    pub fn failing_open(reason: &str) -> Self {
        Self {
            open_failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Hold the open until the test calls [`ScriptedBackend::release_opens`]
    #[must_use]
    pub fn manual_open(mut self) -> Self {
        self.manual_open = true;
        self
    }
}

/// Script for one page of a scripted document
#[derive(Clone, Default)]
pub struct PageScript {
    runs: Vec<TextRun>,
    text_failure: bool,
    manual_text: bool,
    manual_page: bool,
    manual_render: bool,
    render_failure: Option<String>,
}

impl PageScript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one horizontal run at `font_size`, origin `(x, y)`, declared
    /// `width` in text-space units
    #[must_use]
    pub fn run(mut self, text: &str, font_size: f32, x: f32, y: f32, width: f32) -> Self {
        self.runs.push(TextRun {
            text: text.to_string(),
            transform: [font_size, 0.0, 0.0, font_size, x, y],
            width,
        });
        self
    }

    /// Make text extraction fail for this page
    #[must_use]
    pub fn failing_text(mut self) -> Self {
        self.text_failure = true;
        self
    }

    /// Hold text extraction until [`ScriptedBackend::release_texts`]
    #[must_use]
    pub fn manual_text(mut self) -> Self {
        self.manual_text = true;
        self
    }

    /// Hold the page load until [`ScriptedBackend::release_pages`]
    #[must_use]
    pub fn manual_page(mut self) -> Self {
        self.manual_page = true;
        self
    }

    /// Hold rasterization until released or cancelled
    #[must_use]
    pub fn manual_render(mut self) -> Self {
        self.manual_render = true;
        self
    }

    /// Make rasterization fail with `reason`
    #[must_use]
    pub fn failing_render(mut self, reason: &str) -> Self {
        self.render_failure = Some(reason.to_string());
        self
    }
}

/// Gates shared by every scripted document of one backend
struct Gates {
    opens: Semaphore,
    texts: Semaphore,
    pages: Semaphore,
    renders: Semaphore,
}

impl Default for Gates {
    fn default() -> Self {
        Self {
            opens: Semaphore::new(0),
            texts: Semaphore::new(0),
            pages: Semaphore::new(0),
            renders: Semaphore::new(0),
        }
    }
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    texts: Mutex<HashMap<(PathBuf, usize), usize>>,
}

/// Backend that serves pre-scripted documents
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<PathBuf, DocumentScript>>,
    gates: Arc<Gates>,
    counters: Arc<Counters>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script (or re-script) the document at `path`
    pub fn script(&self, path: impl AsRef<Path>, script: DocumentScript) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.as_ref().to_path_buf(), script);
    }

    /// Let `count` gated opens proceed
    pub fn release_opens(&self, count: usize) {
        self.gates.opens.add_permits(count);
    }

    /// Let `count` gated text extractions proceed
    pub fn release_texts(&self, count: usize) {
        self.gates.texts.add_permits(count);
    }

    /// Let `count` gated page loads proceed
    pub fn release_pages(&self, count: usize) {
        self.gates.pages.add_permits(count);
    }

    /// Let `count` gated rasterizations proceed
    pub fn release_renders(&self, count: usize) {
        self.gates.renders.add_permits(count);
    }

    /// How many opens reached the backend (counted before any gate)
    #[must_use]
    pub fn open_calls(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// How many text extractions reached the backend for one page
    #[must_use]
    pub fn text_calls(&self, path: &Path, page: usize) -> usize {
        self.counters
            .texts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(path.to_path_buf(), page))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentBackend for ScriptedBackend {
    async fn open(&self, path: &Path) -> BackendResult<Arc<dyn DocumentHandle>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned();
        let Some(script) = script else {
            return Err(BackendError::new(format!(
                "no scripted document at {}",
                path.display()
            )));
        };
        if script.manual_open {
            pass_gate(&self.gates.opens).await;
        }
        if let Some(reason) = script.open_failure {
            return Err(BackendError(reason));
        }
        Ok(Arc::new(ScriptedDocument {
            path: path.to_path_buf(),
            pages: script.pages,
            gates: Arc::clone(&self.gates),
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct ScriptedDocument {
    path: PathBuf,
    pages: Vec<PageScript>,
    gates: Arc<Gates>,
    counters: Arc<Counters>,
}

#[async_trait]
impl DocumentHandle for ScriptedDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    async fn page(&self, page: usize) -> BackendResult<Arc<dyn PageRef>> {
        let script = page
            .checked_sub(1)
            .and_then(|index| self.pages.get(index))
            .cloned()
            .ok_or_else(|| BackendError::new(format!("page {page} out of range")))?;
        if script.manual_page {
            pass_gate(&self.gates.pages).await;
        }
        Ok(Arc::new(ScriptedPage {
            path: self.path.clone(),
            number: page,
            script,
            gates: Arc::clone(&self.gates),
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct ScriptedPage {
    path: PathBuf,
    number: usize,
    script: PageScript,
    gates: Arc<Gates>,
    counters: Arc<Counters>,
}

#[async_trait]
impl PageRef for ScriptedPage {
    fn page_number(&self) -> usize {
        self.number
    }

    async fn text_content(&self) -> BackendResult<Vec<TextRun>> {
        *self
            .counters
            .texts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((self.path.clone(), self.number))
            .or_insert(0) += 1;
        if self.script.manual_text {
            pass_gate(&self.gates.texts).await;
        }
        if self.script.text_failure {
            return Err(BackendError::new("scripted extraction failure"));
        }
        Ok(self.script.runs.clone())
    }

    fn viewport(&self, scale: f32) -> PageViewport {
        PageViewport {
            width: PAGE_WIDTH * scale,
            height: PAGE_HEIGHT * scale,
            transform: [scale, 0.0, 0.0, scale, 0.0, 0.0],
            scale,
        }
    }

    fn render(&self, target: Arc<dyn RenderTarget>, viewport: PageViewport) -> Arc<dyn RenderTask> {
        Arc::new(ScriptedRenderTask {
            record: PaintRecord {
                page: self.number,
                scale: viewport.scale,
            },
            target,
            gated: self.script.manual_render,
            failure: self.script.render_failure.clone(),
            gates: Arc::clone(&self.gates),
            cancelled: AtomicBool::new(false),
            cancel_signal: Notify::new(),
        })
    }
}

struct ScriptedRenderTask {
    record: PaintRecord,
    target: Arc<dyn RenderTarget>,
    gated: bool,
    failure: Option<String>,
    gates: Arc<Gates>,
    cancelled: AtomicBool,
    cancel_signal: Notify,
}

#[async_trait]
impl RenderTask for ScriptedRenderTask {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_signal.notify_one();
    }

    async fn finish(&self) -> TaskOutcome {
        if self.gated {
            tokio::select! {
                () = self.cancel_signal.notified() => return TaskOutcome::Cancelled,
                permit = self.gates.renders.acquire() => {
                    permit.expect("render gate closed").forget();
                }
            }
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return TaskOutcome::Cancelled;
        }
        if let Some(reason) = &self.failure {
            return TaskOutcome::Failed(reason.clone());
        }
        if let Some(recorder) = self.target.as_any().downcast_ref::<RecordingTarget>() {
            recorder.record(self.record);
        }
        TaskOutcome::Completed
    }
}

async fn pass_gate(gate: &Semaphore) {
    gate.acquire().await.expect("gate closed").forget();
}

/// One completed paint as seen by the recording target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaintRecord {
    pub page: usize,
    pub scale: f32,
}

/// Render target that remembers every completed paint, in order
#[derive(Default)]
pub struct RecordingTarget {
    paints: Mutex<Vec<PaintRecord>>,
}

impl RecordingTarget {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, paint: PaintRecord) {
        self.paints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(paint);
    }

    /// Every completed paint so far
    #[must_use]
    pub fn paints(&self) -> Vec<PaintRecord> {
        self.paints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RenderTarget for RecordingTarget {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Search index that answers from a fixed table (or always fails)
#[derive(Default)]
pub struct ScriptedIndex {
    hits: Mutex<HashMap<(PathBuf, String), Vec<usize>>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the hit pages for one `(path, query)` pair
    pub fn hits(&self, path: impl AsRef<Path>, query: &str, pages: Vec<usize>) {
        self.hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((path.as_ref().to_path_buf(), query.to_string()), pages);
    }

    /// Make every lookup fail from now on
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// How many lookups reached the index
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchIndex for ScriptedIndex {
    async fn page_hits(
        &self,
        path: &Path,
        query: &str,
        max_pages: usize,
    ) -> BackendResult<Vec<usize>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::new("index unavailable"));
        }
        let mut pages = self
            .hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(path.to_path_buf(), query.to_string()))
            .cloned()
            .unwrap_or_default();
        pages.truncate(max_pages);
        Ok(pages)
    }
}
