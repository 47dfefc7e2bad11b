use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use gpu_runtime::{ContextPurpose, GlContext, PlatformDisplay};
use parking_lot::Mutex;
use protocol::{CompositionRequestId, CompositionResponseId, CompositorFeedback};
use render_protocol::{Color, IntSize};
use scene::SceneCommitter;
use threads::{
    CompositingRunLoop, FeedbackConsumer, FeedbackProducer, RunLoopHandle, ScheduleOutcome,
    feedback_channel,
};
use view::SceneAttributes;

use crate::CompositorError;
use crate::damage::Damage;
use crate::layer::{CoordinatedLayer, PaintContext};
use crate::settings::{CompositorSettings, DamagePropagation, FpsCounter};
use crate::surface::{FrameSink, SurfaceError, SwapChainSurface};
use crate::texture_mapper::TextureMapper;

struct CompositorShared {
    attributes: Mutex<SceneAttributes>,
    request: AtomicU32,
    response: AtomicU32,
}

/// Everything the compositing thread owns besides its GL context.
struct FrameState {
    mapper: Option<TextureMapper>,
    scene: SceneCommitter<CoordinatedLayer>,
    surface: SwapChainSurface,
    feedback: FeedbackProducer,
    fps: Option<FpsCounter>,
    damage_propagation: Option<DamagePropagation>,
    background_color: Color,
    shared: Arc<CompositorShared>,
}

struct CompositingState {
    context: Option<GlContext>,
    frame: FrameState,
}

impl CompositingState {
    fn render_layer_tree(&mut self, handle: &RunLoopHandle) {
        let Some(context) = self.context.as_ref() else {
            self.frame.skip_composition("no compositing context");
            return;
        };
        if !context.make_context_current() {
            self.frame.skip_composition("compositing context is not current");
            return;
        }
        self.frame.render(context, handle);
    }

    fn invalidate(&mut self) {
        let Some(context) = self.context.as_ref() else {
            return;
        };
        if !context.make_context_current() {
            return;
        }
        self.frame.update_scene_state(context);
        self.frame.scene.invalidate_committed_layers();
        self.frame.mapper = None;
        self.frame.surface.will_destroy_gl_context();
        self.context = None;
        tracing::debug!("compositing context released");
    }
}

impl FrameState {
    fn update_scene_state(&mut self, context: &GlContext) {
        self.mapper.get_or_insert_with(TextureMapper::new);
        self.scene.root().flush_compositing_state(context);
        for layer in self.scene.committed_layers().layers() {
            layer.flush_compositing_state(context);
        }
    }

    #[tracing::instrument(level = "trace", skip_all)]
    fn render(&mut self, context: &GlContext, handle: &RunLoopHandle) {
        let attributes = *self.shared.attributes.lock();
        if attributes.is_empty() {
            self.skip_composition("empty viewport");
            return;
        }
        match self
            .surface
            .will_render_frame(attributes.device_size(), context)
        {
            Ok(()) => {}
            // Retried once the sink hands a target back.
            Err(SurfaceError::NoFreeTarget) => {
                tracing::debug!("frame deferred until a target is released");
                return;
            }
            Err(SurfaceError::ZeroSize) => {
                self.skip_composition("surface size is empty");
                return;
            }
        }
        self.feedback.push(CompositorFeedback::will_render_frame());

        let animating = self.paint_to_current_gl_context(context, &attributes);
        if let Some(fps) = self.fps.as_mut() {
            fps.frame_presented(Instant::now());
        }

        let response = CompositionResponseId(self.shared.request.load(Ordering::Acquire));
        if let Err(error) = context.swap_buffers() {
            tracing::warn!(%error, "swap failed");
        }
        let producer_fence = match context.create_fence() {
            Ok(fence) => Some(fence),
            Err(error) => {
                tracing::debug!(%error, "presenting without a producer fence");
                None
            }
        };
        let presented = self.surface.did_render_frame(producer_fence);
        self.shared.response.store(response.0, Ordering::Release);
        self.feedback
            .push(CompositorFeedback::did_render_frame(response, presented));

        if animating {
            handle.schedule_update();
        }
    }

    /// Answers every request made so far without presenting, so the controlling thread
    /// stops waiting for a frame that will not come.
    fn skip_composition(&mut self, reason: &'static str) {
        let response = CompositionResponseId(self.shared.request.load(Ordering::Acquire));
        self.shared.response.store(response.0, Ordering::Release);
        self.feedback
            .push(CompositorFeedback::composition_skipped(response));
        tracing::debug!(reason, ?response, "composition skipped");
    }

    /// Returns whether an animation still runs.
    fn paint_to_current_gl_context(
        &mut self,
        context: &GlContext,
        attributes: &SceneAttributes,
    ) -> bool {
        self.update_scene_state(context);

        let transform = attributes.viewport_transform();
        let device_rect = attributes.device_rect();
        let layers: Vec<Arc<CoordinatedLayer>> = std::iter::once(self.scene.root())
            .chain(self.scene.current().root_children())
            .cloned()
            .collect();

        let now = Instant::now();
        let animating = layers
            .iter()
            .fold(false, |running, layer| layer.apply_animations(now) | running);

        let mut clip = device_rect;
        match self.damage_propagation {
            Some(propagation) => {
                let mut damage =
                    Damage::new(device_rect.size(), propagation.frame_damage_mode());
                for layer in &layers {
                    layer.collect_damage((0.0, 0.0), transform, false, &mut damage);
                }
                self.surface.set_frame_damage(damage);
                if propagation.use_for_compositing {
                    if let Some(since_last_use) = self.surface.frame_damage_since_last_use() {
                        let bounds = since_last_use.bounds();
                        if !bounds.contains(clip) {
                            clip = bounds;
                        }
                    }
                }
            }
            None => {
                // Still consumes the per-layer damage so it does not pile up.
                let mut damage = Damage::full(device_rect.size());
                for layer in &layers {
                    layer.collect_damage((0.0, 0.0), transform, false, &mut damage);
                }
            }
        }

        let Some(backbuffer) = self.surface.backbuffer_mut() else {
            return animating;
        };
        let mapper = self.mapper.get_or_insert_with(TextureMapper::new);
        mapper.begin_painting(backbuffer, clip, self.background_color);
        let mut paint_context = PaintContext {
            mapper,
            target: backbuffer,
            transform,
        };
        for layer in &layers {
            layer.paint(&mut paint_context, (0.0, 0.0), 1.0);
        }
        paint_context.mapper.end_painting();
        tracing::trace!(?clip, layers = layers.len(), "scene painted");
        animating
    }
}

/// Composites the committed scene on a dedicated thread.
///
/// The compositing GL context is created on that thread and never leaves it. Frames are
/// driven by [`ThreadedCompositor::request_composition`]; progress is reported through
/// the [`FeedbackConsumer`] returned by [`ThreadedCompositor::new`].
pub struct ThreadedCompositor {
    run_loop: Option<CompositingRunLoop<CompositingState>>,
    shared: Arc<CompositorShared>,
    suspend_count: u32,
}

impl ThreadedCompositor {
    pub fn new(
        display: Arc<PlatformDisplay>,
        scene: SceneCommitter<CoordinatedLayer>,
        sink: Box<dyn FrameSink>,
        settings: CompositorSettings,
        attributes: SceneAttributes,
    ) -> Result<(Self, FeedbackConsumer), CompositorError> {
        let shared = Arc::new(CompositorShared {
            attributes: Mutex::new(attributes),
            request: AtomicU32::new(0),
            response: AtomicU32::new(0),
        });
        let (feedback, consumer) = feedback_channel(settings.feedback_capacity);
        let surface = SwapChainSurface::new(sink, settings.swap_chain_depth);
        let frame_shared = shared.clone();

        let run_loop = CompositingRunLoop::spawn(
            "compositing",
            move |handle| {
                surface.releaser().set_waker(handle.clone());
                let context = match display.create_context(ContextPurpose::Compositing) {
                    Ok(context) => {
                        context.make_context_current();
                        Some(context)
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to create the compositing context");
                        None
                    }
                };
                CompositingState {
                    context,
                    frame: FrameState {
                        mapper: None,
                        scene,
                        surface,
                        feedback,
                        fps: settings.fps_interval.map(FpsCounter::new),
                        damage_propagation: settings.damage_propagation,
                        background_color: settings.background_color,
                        shared: frame_shared,
                    },
                }
            },
            |state, handle| state.render_layer_tree(handle),
        )?;

        let has_context = run_loop.perform_task_sync(|state, _| state.context.is_some())?;
        if !has_context {
            tracing::warn!("compositor has no GL context and will not render");
        }
        tracing::info!(
            depth = settings.swap_chain_depth,
            damage = ?settings.damage_propagation,
            "threaded compositor started"
        );

        Ok((
            Self {
                run_loop: Some(run_loop),
                shared,
                suspend_count: 0,
            },
            consumer,
        ))
    }

    /// Synchronous teardown: releases every committed layer target and the GL context on
    /// the compositing thread, then joins it.
    pub fn invalidate(&mut self) {
        let Some(run_loop) = self.run_loop.take() else {
            return;
        };
        run_loop.stop_updates();
        if let Err(error) = run_loop.perform_task_sync(|state, _| state.invalidate()) {
            tracing::warn!(%error, "compositor teardown task did not run");
        }
        drop(run_loop);
        tracing::debug!("threaded compositor invalidated");
    }

    pub fn is_invalidated(&self) -> bool {
        self.run_loop.is_none()
    }

    /// Nested; only the outermost call hides the surface.
    pub fn suspend(&mut self) {
        let Some(run_loop) = self.run_loop.as_ref() else {
            return;
        };
        self.suspend_count += 1;
        if self.suspend_count == 1 {
            if let Err(error) = run_loop.perform_task(|state, _| {
                state.frame.surface.visibility_did_change(false);
            }) {
                tracing::trace!(%error, "visibility change dropped");
            }
        }
        run_loop.suspend();
    }

    pub fn resume(&mut self) {
        let Some(run_loop) = self.run_loop.as_ref() else {
            return;
        };
        debug_assert!(self.suspend_count > 0, "resume without matching suspend");
        if self.suspend_count == 0 {
            return;
        }
        self.suspend_count -= 1;
        if self.suspend_count == 0 {
            if let Err(error) = run_loop.perform_task(|state, _| {
                state.frame.surface.visibility_did_change(true);
            }) {
                tracing::trace!(%error, "visibility change dropped");
            }
        }
        run_loop.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_count > 0
    }

    pub fn set_scene_attributes(&self, attributes: SceneAttributes) {
        *self.shared.attributes.lock() = attributes;
    }

    pub fn set_size(&self, size: IntSize, device_scale_factor: f32) -> Result<(), CompositorError> {
        self.set_scene_attributes(SceneAttributes::new(size, device_scale_factor)?);
        Ok(())
    }

    pub fn scene_attributes(&self) -> SceneAttributes {
        *self.shared.attributes.lock()
    }

    pub fn set_damage_propagation(&self, damage_propagation: Option<DamagePropagation>) {
        if let Some(run_loop) = self.run_loop.as_ref() {
            if let Err(error) = run_loop.perform_task(move |state, _| {
                state.frame.damage_propagation = damage_propagation;
            }) {
                tracing::trace!(%error, "damage propagation change dropped");
            }
        }
    }

    pub fn background_color_did_change(&self, color: Color) {
        if let Some(run_loop) = self.run_loop.as_ref() {
            if let Err(error) = run_loop.perform_task(move |state, handle| {
                state.frame.background_color = color;
                handle.schedule_update();
            }) {
                tracing::trace!(%error, "background color change dropped");
            }
        }
    }

    /// Asks for a frame showing everything committed so far.
    pub fn request_composition(&self) -> CompositionRequestId {
        let id = self
            .shared
            .request
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);
        self.schedule_update();
        CompositionRequestId(id)
    }

    pub fn schedule_update(&self) -> ScheduleOutcome {
        match self.run_loop.as_ref() {
            Some(run_loop) => run_loop.schedule_update(),
            None => ScheduleOutcome::Ignored,
        }
    }

    /// An update is scheduled or running.
    pub fn is_active(&self) -> bool {
        self.run_loop
            .as_ref()
            .is_some_and(|run_loop| run_loop.is_active())
    }

    pub fn composition_request_id(&self) -> CompositionRequestId {
        CompositionRequestId(self.shared.request.load(Ordering::Acquire))
    }

    pub fn composition_response_id(&self) -> CompositionResponseId {
        CompositionResponseId(self.shared.response.load(Ordering::Acquire))
    }

    pub fn completed_cycles(&self) -> u64 {
        self.run_loop
            .as_ref()
            .map_or(0, |run_loop| run_loop.handle().completed_cycles())
    }
}

impl Drop for ThreadedCompositor {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl std::fmt::Debug for ThreadedCompositor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ThreadedCompositor")
            .field("request", &self.composition_request_id())
            .field("response", &self.composition_response_id())
            .field("suspend_count", &self.suspend_count)
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}
