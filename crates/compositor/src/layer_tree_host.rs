use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gpu_runtime::PlatformDisplay;
use protocol::{CompositionRequestId, CompositionResponseId, PresentedFrameInfo};
use render_protocol::{Color, IntSize};
use scene::{SceneLayer, SceneState, scene_state};
use threads::FeedbackConsumer;
use tiles::{ImageStore, PaintingConfig, PaintingEngine};
use view::SceneAttributes;

use crate::CompositorError;
use crate::layer::{CoordinatedLayer, LayerId};
use crate::settings::CompositorSettings;
use crate::surface::FrameSink;
use crate::threaded_compositor::ThreadedCompositor;

/// Upper bound on one blocking wait inside [`LayerTreeHost::run_until`], so conditions
/// that change without feedback, such as the compositor going idle, are noticed.
const RUN_UNTIL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// The page whose layer tree is composited. Called on the owning thread only.
pub trait PageClient {
    /// Viewport size in layer units.
    fn size(&self) -> IntSize;

    fn device_scale_factor(&self) -> f32 {
        1.0
    }

    /// Runs layout and applies the resulting layer tree changes.
    fn update_rendering(&mut self, layers: &mut LayerTreeContext<'_>);

    fn did_complete_rendering_update(&mut self) {}

    fn will_render_frame(&mut self) {}

    fn did_render_frame(&mut self, _presented: Option<PresentedFrameInfo>) {}
}

/// Layer tree mutations available to [`PageClient::update_rendering`].
pub struct LayerTreeContext<'a> {
    scene: &'a mut SceneState<CoordinatedLayer>,
    composition_required: &'a mut bool,
}

impl LayerTreeContext<'_> {
    pub fn root_layer(&self) -> &Arc<CoordinatedLayer> {
        self.scene.root()
    }

    /// Makes the layer part of the composited scene.
    pub fn attach_layer(&mut self, layer: Arc<CoordinatedLayer>) {
        self.scene.add_layer(layer);
    }

    pub fn detach_layer(&mut self, id: LayerId) {
        self.scene.remove_layer(id);
    }

    pub fn is_attached(&self, id: LayerId) -> bool {
        self.scene.layer(id).is_some()
    }

    /// Top-level composition order.
    pub fn set_root_layers(&mut self, layers: Vec<Arc<CoordinatedLayer>>) {
        self.scene.set_root_children(layers);
    }

    /// Forces a composition at the end of this flush even if no layer changed.
    pub fn notify_composition_required(&mut self) {
        *self.composition_required = true;
    }
}

struct PendingForceRepaint {
    callback: Box<dyn FnOnce()>,
    /// The composition that must be presented before the callback runs; `None` while
    /// the repaint itself waits for the renderer.
    request: Option<CompositionRequestId>,
}

/// Owning-thread side of the compositor.
///
/// Batches layer tree changes into flushes, allowing one composition in flight: flushes
/// requested while waiting for the renderer collapse into a single flush once the
/// compositor reports the frame. The owner drives it by calling
/// [`LayerTreeHost::process_pending_work`] from its event loop, for instance whenever
/// [`LayerTreeHost::feedback_notifier`] fires.
pub struct LayerTreeHost<P: PageClient> {
    page: P,
    scene: SceneState<CoordinatedLayer>,
    engine: PaintingEngine,
    compositor: ThreadedCompositor,
    feedback: FeedbackConsumer,
    layer_flush_scheduled: bool,
    is_flushing_layers: bool,
    layer_tree_state_is_frozen: bool,
    is_suspended: bool,
    is_waiting_for_renderer: bool,
    scheduled_while_waiting_for_renderer: bool,
    composition_required: bool,
    pending_resize: bool,
    force_frame_sync: bool,
    wait_until_painting_complete: bool,
    pending_force_repaint: bool,
    composition_request_id: CompositionRequestId,
    force_repaint: Option<PendingForceRepaint>,
    invalidated: bool,
}

impl<P: PageClient> LayerTreeHost<P> {
    pub fn new(
        page: P,
        display: Arc<PlatformDisplay>,
        sink: Box<dyn FrameSink>,
        painting: PaintingConfig,
        settings: CompositorSettings,
    ) -> Result<Self, CompositorError> {
        let attributes = SceneAttributes::new(page.size(), page.device_scale_factor())?;
        let root = CoordinatedLayer::new();
        root.set_size(page.size());
        let (scene, committer) = scene_state(root);
        let engine = PaintingEngine::new(painting, display.clone(), ImageStore::new())?;
        let (compositor, feedback) =
            ThreadedCompositor::new(display, committer, sink, settings, attributes)?;

        let mut host = Self {
            page,
            scene,
            engine,
            compositor,
            feedback,
            layer_flush_scheduled: false,
            is_flushing_layers: false,
            layer_tree_state_is_frozen: false,
            is_suspended: false,
            is_waiting_for_renderer: false,
            scheduled_while_waiting_for_renderer: false,
            composition_required: false,
            pending_resize: false,
            force_frame_sync: false,
            wait_until_painting_complete: false,
            pending_force_repaint: false,
            composition_request_id: CompositionRequestId::default(),
            force_repaint: None,
            invalidated: false,
        };
        host.schedule_layer_flush();
        Ok(host)
    }

    pub fn page(&self) -> &P {
        &self.page
    }

    pub fn page_mut(&mut self) -> &mut P {
        &mut self.page
    }

    pub fn root_layer(&self) -> &Arc<CoordinatedLayer> {
        self.scene.root()
    }

    pub fn scene(&self) -> &SceneState<CoordinatedLayer> {
        &self.scene
    }

    pub fn engine(&self) -> &PaintingEngine {
        &self.engine
    }

    pub fn compositor(&self) -> &ThreadedCompositor {
        &self.compositor
    }

    pub fn composition_request_id(&self) -> CompositionRequestId {
        self.composition_request_id
    }

    pub fn is_waiting_for_renderer(&self) -> bool {
        self.is_waiting_for_renderer
    }

    pub fn is_layer_flush_scheduled(&self) -> bool {
        self.layer_flush_scheduled
    }

    /// Nothing is scheduled, in flight or being composited.
    pub fn is_idle(&self) -> bool {
        !self.layer_flush_scheduled
            && !self.is_waiting_for_renderer
            && !self.scheduled_while_waiting_for_renderer
            && !self.compositor.is_active()
    }

    pub fn attach_layer(&mut self, layer: Arc<CoordinatedLayer>) {
        self.scene.add_layer(layer);
        self.schedule_layer_flush();
    }

    pub fn detach_layer(&mut self, id: LayerId) {
        self.scene.remove_layer(id);
        self.schedule_layer_flush();
    }

    pub fn set_root_layers(&mut self, layers: Vec<Arc<CoordinatedLayer>>) {
        self.scene.set_root_children(layers);
        self.schedule_layer_flush();
    }

    /// Arms the zero-delay flush. While a composition is in flight the request is
    /// remembered and served when the compositor reports back.
    pub fn schedule_layer_flush(&mut self) {
        if self.layer_tree_state_is_frozen || self.invalidated {
            return;
        }
        if self.page.size().is_empty() {
            return;
        }
        if self.is_waiting_for_renderer {
            self.scheduled_while_waiting_for_renderer = true;
            return;
        }
        self.layer_flush_scheduled = true;
    }

    pub fn cancel_pending_layer_flush(&mut self) {
        self.layer_flush_scheduled = false;
    }

    pub fn set_layer_tree_state_is_frozen(&mut self, frozen: bool) {
        if self.layer_tree_state_is_frozen == frozen {
            return;
        }
        self.layer_tree_state_is_frozen = frozen;
        if frozen {
            self.cancel_pending_layer_flush();
        } else {
            self.schedule_layer_flush();
        }
    }

    pub fn is_layer_tree_state_frozen(&self) -> bool {
        self.layer_tree_state_is_frozen
    }

    /// Dispatches compositor feedback and runs a due layer flush. Returns whether
    /// anything happened.
    pub fn process_pending_work(&mut self) -> bool {
        let dispatched = self.dispatch_compositor_feedback();
        if self.layer_flush_scheduled {
            self.layer_flush_timer_fired();
            return true;
        }
        dispatched
    }

    /// Wakes whenever the compositor has feedback for [`Self::process_pending_work`].
    pub fn feedback_notifier(&self) -> crossbeam_channel::Receiver<()> {
        self.feedback.notifier()
    }

    /// Pumps pending work until `done` holds or `timeout` elapses.
    pub fn run_until(&mut self, timeout: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_pending_work();
            if done(self) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if !self.layer_flush_scheduled {
                self.feedback
                    .wait((deadline - now).min(RUN_UNTIL_POLL_INTERVAL));
            }
        }
    }

    fn dispatch_compositor_feedback(&mut self) -> bool {
        let Some(feedback) = self.feedback.drain() else {
            return false;
        };
        if feedback.will_render_frames > 0 {
            self.page.will_render_frame();
        }
        if feedback.did_render_frames > 0 {
            self.page.did_render_frame(feedback.presented.last().copied());
        }
        if let Some(response) = feedback.composition_response {
            self.did_composite(response);
        }
        true
    }

    fn layer_flush_timer_fired(&mut self) {
        self.layer_flush_scheduled = false;
        if self.is_suspended || self.is_waiting_for_renderer {
            return;
        }
        self.flush_layers();
    }

    #[tracing::instrument(level = "debug", skip_all)]
    fn flush_layers(&mut self) {
        if self.is_flushing_layers {
            debug_assert!(false, "re-entrant layer flush");
            return;
        }
        if self.layer_tree_state_is_frozen || self.invalidated {
            return;
        }
        self.is_flushing_layers = true;

        let mut context = LayerTreeContext {
            scene: &mut self.scene,
            composition_required: &mut self.composition_required,
        };
        self.page.update_rendering(&mut context);

        let size = self.page.size();
        let device_scale_factor = self.page.device_scale_factor();
        if self.pending_resize {
            if let Err(error) = self.compositor.set_size(size, device_scale_factor) {
                tracing::warn!(%error, ?size, "ignoring invalid viewport");
            }
            self.scene.root().set_size(size);
        }

        let mut layers_committed = false;
        let mut retry_needed = false;
        for layer in std::iter::once(self.scene.root()).chain(self.scene.layers().layers()) {
            let outcome = layer.flush_layer_state(&self.engine, device_scale_factor);
            layers_committed |= outcome.committed;
            retry_needed |= outcome.retry_needed;
        }
        if layers_committed {
            self.scene.layers_did_change();
        }

        let did_change_scene = self.scene.flush();
        if self.composition_required
            || self.pending_resize
            || self.force_frame_sync
            || did_change_scene
        {
            self.commit_scene_state();
        }
        self.composition_required = false;
        self.pending_resize = false;
        self.force_frame_sync = false;

        self.page.did_complete_rendering_update();
        if std::mem::take(&mut self.wait_until_painting_complete) {
            self.scene.wait_until_painting_complete();
        }
        self.is_flushing_layers = false;

        if retry_needed {
            tracing::debug!("tiles left dirty, scheduling another flush");
            self.schedule_layer_flush();
        }
    }

    fn commit_scene_state(&mut self) {
        self.is_waiting_for_renderer = true;
        self.composition_request_id = self.compositor.request_composition();
        tracing::trace!(request = ?self.composition_request_id, "scene committed");
    }

    /// The compositor presented everything up to `response`.
    pub fn did_composite(&mut self, response: CompositionResponseId) {
        let satisfied = self
            .force_repaint
            .as_ref()
            .and_then(|pending| pending.request)
            .is_some_and(|request| response.satisfies(request));
        if satisfied {
            if let Some(pending) = self.force_repaint.take() {
                (pending.callback)();
            }
        }

        if !self.is_waiting_for_renderer || response.satisfies(self.composition_request_id) {
            self.is_waiting_for_renderer = false;
            let scheduled = std::mem::take(&mut self.scheduled_while_waiting_for_renderer);
            if self.pending_force_repaint {
                if self.layer_tree_state_is_frozen {
                    self.pending_force_repaint = false;
                    if let Some(pending) = self.force_repaint.take() {
                        (pending.callback)();
                    }
                } else {
                    self.force_repaint();
                    let request = self.composition_request_id;
                    if let Some(pending) = self.force_repaint.as_mut() {
                        pending.request = Some(request);
                    }
                }
            } else if !self.is_suspended
                && !self.layer_tree_state_is_frozen
                && (scheduled || self.layer_flush_scheduled)
            {
                self.cancel_pending_layer_flush();
                self.flush_layers();
            }
        }

        if !self.is_waiting_for_renderer {
            let lost_target = std::iter::once(self.scene.root())
                .chain(self.scene.layers().layers())
                .any(|layer| layer.needs_full_repaint());
            if lost_target {
                self.schedule_layer_flush();
            }
        }
    }

    /// Repaints every layer and commits, unless a composition is in flight.
    pub fn force_repaint(&mut self) {
        if self.is_waiting_for_renderer {
            if self.force_repaint.is_some() {
                self.pending_force_repaint = true;
            }
            return;
        }
        self.pending_force_repaint = false;
        for layer in std::iter::once(self.scene.root()).chain(self.scene.layers().layers()) {
            layer.set_needs_display();
        }
        self.force_frame_sync = true;
        self.wait_until_painting_complete = true;
        if self.is_flushing_layers {
            return;
        }
        self.cancel_pending_layer_flush();
        self.flush_layers();
    }

    /// Runs `callback` once a full repaint has been presented.
    pub fn force_repaint_async(&mut self, callback: impl FnOnce() + 'static) {
        debug_assert!(self.force_repaint.is_none(), "force repaint already pending");
        if self.layer_tree_state_is_frozen || self.invalidated {
            callback();
            return;
        }
        self.force_repaint = Some(PendingForceRepaint {
            callback: Box::new(callback),
            request: None,
        });
        self.force_repaint();
        let request = (!self.pending_force_repaint).then_some(self.composition_request_id);
        if let Some(pending) = self.force_repaint.as_mut() {
            pending.request = request;
        }
    }

    /// Blocking form of [`Self::force_repaint_async`].
    pub fn force_repaint_sync(&mut self, timeout: Duration) -> bool {
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        self.force_repaint_async(move || flag.set(true));
        self.run_until(timeout, |_| done.get())
    }

    /// The page was resized; flushes right away unless a composition is in flight.
    pub fn size_did_change(&mut self) {
        self.pending_resize = true;
        if self.is_waiting_for_renderer {
            self.schedule_layer_flush();
        } else {
            self.cancel_pending_layer_flush();
            self.flush_layers();
        }
    }

    pub fn pause_rendering(&mut self) {
        if self.is_suspended {
            return;
        }
        self.is_suspended = true;
        self.compositor.suspend();
    }

    pub fn resume_rendering(&mut self) {
        if !self.is_suspended {
            return;
        }
        self.is_suspended = false;
        self.compositor.resume();
        self.schedule_layer_flush();
    }

    pub fn is_suspended(&self) -> bool {
        self.is_suspended
    }

    pub fn notify_composition_required(&mut self) {
        self.composition_required = true;
    }

    pub fn is_composition_required_or_ongoing(&self) -> bool {
        self.composition_required || self.force_frame_sync || self.compositor.is_active()
    }

    pub fn background_color_did_change(&self, color: Color) {
        self.compositor.background_color_did_change(color);
    }

    /// Tears down both sides. Also run on drop.
    pub fn invalidate(&mut self) {
        if std::mem::replace(&mut self.invalidated, true) {
            return;
        }
        if let Some(pending) = self.force_repaint.take() {
            (pending.callback)();
        }
        self.cancel_pending_layer_flush();
        self.scene.invalidate();
        self.engine.wait_until_idle();
        self.compositor.invalidate();
        tracing::debug!("layer tree host invalidated");
    }
}

impl<P: PageClient> Drop for LayerTreeHost<P> {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl<P: PageClient> std::fmt::Debug for LayerTreeHost<P> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LayerTreeHost")
            .field("layers", &self.scene.layers().len())
            .field("request", &self.composition_request_id)
            .field("waiting_for_renderer", &self.is_waiting_for_renderer)
            .field("flush_scheduled", &self.layer_flush_scheduled)
            .field("frozen", &self.layer_tree_state_is_frozen)
            .field("suspended", &self.is_suspended)
            .finish()
    }
}

impl<P: PageClient> LayerTreeHost<P> {
    /// Layer ids currently attached, for diagnostics.
    pub fn attached_layer_ids(&self) -> Vec<LayerId> {
        self.scene.layers().layers().map(|layer| layer.id()).collect()
    }
}
