//! Cancellable progressive render pipeline
//!
//! Every document, page, or scale change starts a new pass and supersedes
//! the previous one; a step that completes under a stale token discards its
//! result, so commits happen in pass order no matter how backend I/O
//! interleaves. On sharp displays the first paint is a cheap half-scale
//! pass so the page turns presentable early; the full-scale pass follows
//! and, once a page completed it, later passes skip the quick step.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::{DocumentHandle, PageRef, PageViewport, RenderTarget, RenderTask, TaskOutcome};
use crate::error::ViewerError;
use crate::glyphs::ScaleKey;
use crate::scheduling::{Generation, Token};

/// Device scale above which a half-scale quick pass precedes the full pass
pub const QUICK_PASS_THRESHOLD: f32 = 1.2;
/// Scale ratio of the quick pass
pub const QUICK_PASS_RATIO: f32 = 0.5;

/// Progress reported from inside a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassProgress {
    /// The half-scale paint landed; the page is presentable
    QuickPaintDone,
}

/// Terminal result of one pass
pub enum PassOutcome {
    /// The full-scale paint landed
    Committed {
        page: Arc<dyn PageRef>,
        quick_pass: bool,
    },
    /// A newer pass took over; nothing changed
    Superseded,
    /// Page load or rasterization failed
    Failed(ViewerError),
}

enum RasterOutcome {
    Painted,
    Superseded,
    Failed(String),
}

/// Runs progressive render passes against one shared target
pub struct RenderPipeline {
    passes: Generation,
    progressive_done: Mutex<HashSet<(usize, ScaleKey)>>,
    active: Mutex<Option<Arc<dyn RenderTask>>>,
}

impl RenderPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self {
            passes: Generation::new(),
            progressive_done: Mutex::new(HashSet::new()),
            active: Mutex::new(None),
        }
    }

    /// Start a new pass, superseding every outstanding one
    pub fn issue(&self) -> Token {
        self.passes.issue()
    }

    /// Supersede outstanding passes without starting a new one
    pub fn supersede(&self) {
        self.passes.bump();
    }

    /// Whether `token` still names the newest pass
    #[must_use]
    pub fn is_current(&self, token: Token) -> bool {
        self.passes.is_current(token)
    }

    /// Forget which pages completed a full-scale pass
    ///
    /// Called on document change so the quick pass runs again; scale changes
    /// need nothing here because the key carries the scale.
    pub fn reset_progress(&self) {
        self.progressive_done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Run one progressive pass for `page_number` at `device_scale`
    ///
    /// `progress` fires when the quick paint lands so the caller can drop
    /// its loading indicator before the full-scale paint follows.
    pub async fn render_page<F>(
        &self,
        handle: &Arc<dyn DocumentHandle>,
        page_number: usize,
        device_scale: f32,
        target: &Arc<dyn RenderTarget>,
        token: Token,
        progress: F,
    ) -> PassOutcome
    where
        F: Fn(PassProgress),
    {
        let page = match handle.page(page_number).await {
            Ok(page) => page,
            Err(fault) => {
                return PassOutcome::Failed(ViewerError::Render {
                    page: page_number,
                    reason: fault.0,
                });
            }
        };
        if !self.is_current(token) {
            return PassOutcome::Superseded;
        }

        let progressive_key = (page_number, ScaleKey::quantize(device_scale));
        let quick_pass = device_scale > QUICK_PASS_THRESHOLD && !self.is_done(progressive_key);
        if quick_pass {
            let viewport = page.viewport(device_scale * QUICK_PASS_RATIO);
            match self.rasterize(&page, viewport, target, token).await {
                RasterOutcome::Painted => progress(PassProgress::QuickPaintDone),
                RasterOutcome::Superseded => return PassOutcome::Superseded,
                RasterOutcome::Failed(reason) => {
                    return PassOutcome::Failed(ViewerError::Render {
                        page: page_number,
                        reason,
                    });
                }
            }
        }

        let viewport = page.viewport(device_scale);
        match self.rasterize(&page, viewport, target, token).await {
            RasterOutcome::Painted => {
                self.progressive_done
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(progressive_key);
                PassOutcome::Committed { page, quick_pass }
            }
            RasterOutcome::Superseded => PassOutcome::Superseded,
            RasterOutcome::Failed(reason) => PassOutcome::Failed(ViewerError::Render {
                page: page_number,
                reason,
            }),
        }
    }

    /// One rasterization, cancelling whatever was in flight on the target
    async fn rasterize(
        &self,
        page: &Arc<dyn PageRef>,
        viewport: PageViewport,
        target: &Arc<dyn RenderTarget>,
        token: Token,
    ) -> RasterOutcome {
        let task = page.render(Arc::clone(target), viewport);
        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&task));
        if let Some(previous) = previous {
            previous.cancel();
        }

        let outcome = task.finish().await;

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &task))
        {
            *active = None;
        }
        drop(active);

        if !self.is_current(token) {
            return RasterOutcome::Superseded;
        }
        match outcome {
            TaskOutcome::Completed => RasterOutcome::Painted,
            TaskOutcome::Cancelled => RasterOutcome::Superseded,
            TaskOutcome::Failed(reason) => RasterOutcome::Failed(reason),
        }
    }

    fn is_done(&self, key: (usize, ScaleKey)) -> bool {
        self.progressive_done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
    }
}

impl Default for RenderPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use super::*;
    use crate::backend::{DocumentBackend, RenderTarget};
    use crate::document_cache::DocumentCache;
    use crate::testing::{DocumentScript, PageScript, RecordingTarget, ScriptedBackend};

    async fn handle_for(backend: &Arc<ScriptedBackend>, pages: Vec<PageScript>) -> Arc<dyn DocumentHandle> {
        backend.script("doc.pdf", DocumentScript::with_pages(pages));
        let cache = DocumentCache::new(Arc::clone(backend) as Arc<dyn DocumentBackend>);
        cache.open(Path::new("doc.pdf")).await.unwrap().handle
    }

    fn recording_target() -> (Arc<RecordingTarget>, Arc<dyn RenderTarget>) {
        let recorder = Arc::new(RecordingTarget::new());
        let target = Arc::clone(&recorder) as Arc<dyn RenderTarget>;
        (recorder, target)
    }

    #[tokio::test]
    async fn sharp_scales_paint_quick_then_full() {
        let backend = Arc::new(ScriptedBackend::new());
        let handle = handle_for(&backend, vec![PageScript::new()]).await;
        let (recorder, target) = recording_target();
        let pipeline = RenderPipeline::new();
        let events = Mutex::new(Vec::new());

        let token = pipeline.issue();
        let outcome = pipeline
            .render_page(&handle, 1, 2.0, &target, token, |progress| {
                events.lock().unwrap().push(progress);
            })
            .await;

        assert!(matches!(
            outcome,
            PassOutcome::Committed { quick_pass: true, .. }
        ));
        let paints = recorder.paints();
        assert_eq!(paints.len(), 2);
        assert!((paints[0].scale - 1.0).abs() < 1e-4);
        assert!((paints[1].scale - 2.0).abs() < 1e-4);
        assert_eq!(events.into_inner().unwrap(), vec![PassProgress::QuickPaintDone]);
    }

    #[tokio::test]
    async fn coarse_scales_skip_the_quick_pass() {
        let backend = Arc::new(ScriptedBackend::new());
        let handle = handle_for(&backend, vec![PageScript::new()]).await;
        let (recorder, target) = recording_target();
        let pipeline = RenderPipeline::new();

        let token = pipeline.issue();
        let outcome = pipeline
            .render_page(&handle, 1, 1.0, &target, token, |_| {})
            .await;

        assert!(matches!(
            outcome,
            PassOutcome::Committed { quick_pass: false, .. }
        ));
        assert_eq!(recorder.paints().len(), 1);
    }

    #[tokio::test]
    async fn the_quick_pass_runs_once_per_page_and_scale() {
        let backend = Arc::new(ScriptedBackend::new());
        let handle = handle_for(&backend, vec![PageScript::new()]).await;
        let (recorder, target) = recording_target();
        let pipeline = RenderPipeline::new();

        let token = pipeline.issue();
        pipeline
            .render_page(&handle, 1, 2.0, &target, token, |_| {})
            .await;
        let token = pipeline.issue();
        pipeline
            .render_page(&handle, 1, 2.0, &target, token, |_| {})
            .await;

        // Quick + full on the first pass, full only on the second.
        let scales: Vec<f32> = recorder.paints().iter().map(|paint| paint.scale).collect();
        assert_eq!(scales.len(), 3);
        assert!((scales[2] - 2.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn reset_progress_restores_the_quick_pass() {
        let backend = Arc::new(ScriptedBackend::new());
        let handle = handle_for(&backend, vec![PageScript::new()]).await;
        let (recorder, target) = recording_target();
        let pipeline = RenderPipeline::new();

        let token = pipeline.issue();
        pipeline
            .render_page(&handle, 1, 2.0, &target, token, |_| {})
            .await;
        pipeline.reset_progress();
        let token = pipeline.issue();
        pipeline
            .render_page(&handle, 1, 2.0, &target, token, |_| {})
            .await;

        assert_eq!(recorder.paints().len(), 4);
    }

    #[tokio::test]
    async fn a_newer_pass_cancels_the_in_flight_raster() {
        let backend = Arc::new(ScriptedBackend::new());
        let handle = handle_for(
            &backend,
            vec![PageScript::new().manual_render(), PageScript::new()],
        )
        .await;
        let (recorder, target) = recording_target();
        let pipeline = Arc::new(RenderPipeline::new());

        let stale = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            let handle = Arc::clone(&handle);
            let target = Arc::clone(&target);
            async move {
                let token = pipeline.issue();
                pipeline
                    .render_page(&handle, 1, 1.0, &target, token, |_| {})
                    .await
            }
        });
        tokio::task::yield_now().await;

        let token = pipeline.issue();
        let fresh = pipeline
            .render_page(&handle, 2, 1.0, &target, token, |_| {})
            .await;

        assert!(matches!(fresh, PassOutcome::Committed { .. }));
        assert!(matches!(stale.await.unwrap(), PassOutcome::Superseded));
        let paints = recorder.paints();
        assert_eq!(paints.len(), 1);
        assert_eq!(paints[0].page, 2);
    }

    #[tokio::test]
    async fn slow_page_io_commits_nothing_once_superseded() {
        let backend = Arc::new(ScriptedBackend::new());
        let handle = handle_for(
            &backend,
            vec![PageScript::new().manual_page(), PageScript::new()],
        )
        .await;
        let (recorder, target) = recording_target();
        let pipeline = Arc::new(RenderPipeline::new());

        // Pass A blocks loading page 1; pass B commits page 2; then A's load
        // resolves late and must be discarded.
        let stale = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            let handle = Arc::clone(&handle);
            let target = Arc::clone(&target);
            async move {
                let token = pipeline.issue();
                pipeline
                    .render_page(&handle, 1, 1.0, &target, token, |_| {})
                    .await
            }
        });
        tokio::task::yield_now().await;

        let token = pipeline.issue();
        let fresh = pipeline
            .render_page(&handle, 2, 1.0, &target, token, |_| {})
            .await;
        assert!(matches!(fresh, PassOutcome::Committed { .. }));

        backend.release_pages(1);
        assert!(matches!(stale.await.unwrap(), PassOutcome::Superseded));
        let paints = recorder.paints();
        assert_eq!(paints.len(), 1);
        assert_eq!(paints[0].page, 2);
    }

    #[tokio::test]
    async fn raster_failures_surface_as_render_faults() {
        let backend = Arc::new(ScriptedBackend::new());
        let handle = handle_for(&backend, vec![PageScript::new().failing_render("oom")]).await;
        let (_, target) = recording_target();
        let pipeline = RenderPipeline::new();

        let token = pipeline.issue();
        let outcome = pipeline
            .render_page(&handle, 1, 1.0, &target, token, |_| {})
            .await;

        match outcome {
            PassOutcome::Failed(ViewerError::Render { page, reason }) => {
                assert_eq!(page, 1);
                assert_eq!(reason, "oom");
            }
            _ => panic!("expected a render fault"),
        }
    }

    #[tokio::test]
    async fn missing_pages_surface_as_render_faults() {
        let backend = Arc::new(ScriptedBackend::new());
        let handle = handle_for(&backend, vec![PageScript::new()]).await;
        let (_, target) = recording_target();
        let pipeline = RenderPipeline::new();

        let token = pipeline.issue();
        let outcome = pipeline
            .render_page(&handle, 9, 1.0, &target, token, |_| {})
            .await;

        assert!(matches!(
            outcome,
            PassOutcome::Failed(ViewerError::Render { page: 9, .. })
        ));
    }
}
