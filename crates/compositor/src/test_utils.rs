//! Fakes for exercising the compositor end to end without a real driver.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use gpu_runtime::{
    ContextId, ContextPurpose, Fence, FenceId, FenceKind, GlBackend, GlError, PlatformDisplay,
    SoftwareGl,
};
use parking_lot::Mutex;
use protocol::PresentedFrameInfo;
use render_protocol::{Color, FloatRect, IntRect, IntSize, PixelBuffer};
use threads::PoolSizes;
use tiles::{GraphicsContext, LayerPainter, PaintingConfig, PlatformProfile};

use crate::layer_tree_host::{LayerTreeContext, PageClient};
use crate::settings::CompositorSettings;
use crate::surface::{FrameSink, PresentedFrame, TargetReleaser};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlEvent {
    FenceCreated {
        context: ContextId,
        fence: FenceId,
    },
    ServerWait {
        context: ContextId,
        fence: FenceId,
    },
    Swap {
        context: ContextId,
    },
}

/// Software driver whose painting fences only signal once some context server-waits on
/// them, so a signaled fence proves the compositor ordered its reads after the painting.
pub struct RecordingGl {
    inner: SoftwareGl,
    purposes: Mutex<HashMap<ContextId, ContextPurpose>>,
    events: Mutex<Vec<GlEvent>>,
    painting_fences: Mutex<Vec<Fence>>,
    failing_waits: AtomicUsize,
}

impl RecordingGl {
    pub fn new(accelerated_buffers: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: SoftwareGl::new(accelerated_buffers),
            purposes: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            painting_fences: Mutex::new(Vec::new()),
            failing_waits: AtomicUsize::new(0),
        })
    }

    pub fn display(self: &Arc<Self>) -> Arc<PlatformDisplay> {
        PlatformDisplay::new(self.clone())
    }

    pub fn events(&self) -> Vec<GlEvent> {
        self.events.lock().clone()
    }

    pub fn painting_fences(&self) -> Vec<Fence> {
        self.painting_fences.lock().clone()
    }

    /// The next `count` server waits fail as if the context had timed out.
    pub fn fail_next_server_waits(&self, count: usize) {
        self.failing_waits.store(count, Ordering::SeqCst);
    }

    pub fn live_contexts(&self) -> usize {
        self.inner.live_contexts()
    }

    pub fn contexts_with_purpose(&self, purpose: ContextPurpose) -> usize {
        self.purposes
            .lock()
            .values()
            .filter(|candidate| **candidate == purpose)
            .count()
    }

    fn purpose(&self, context: ContextId) -> Option<ContextPurpose> {
        self.purposes.lock().get(&context).copied()
    }
}

impl GlBackend for RecordingGl {
    fn can_use_accelerated_buffers(&self) -> bool {
        self.inner.can_use_accelerated_buffers()
    }

    fn create_context(&self, purpose: ContextPurpose) -> Result<ContextId, GlError> {
        let context = self.inner.create_context(purpose)?;
        self.purposes.lock().insert(context, purpose);
        Ok(context)
    }

    fn destroy_context(&self, context: ContextId) {
        self.purposes.lock().remove(&context);
        self.inner.destroy_context(context);
    }

    fn make_current(&self, context: ContextId) -> Result<(), GlError> {
        self.inner.make_current(context)
    }

    fn create_fence(&self, context: ContextId) -> Result<Fence, GlError> {
        if self.purpose(context) != Some(ContextPurpose::Painting) {
            return self.inner.create_fence(context);
        }
        let fence = Fence::new(FenceKind::GpuSync);
        self.events.lock().push(GlEvent::FenceCreated {
            context,
            fence: fence.id(),
        });
        self.painting_fences.lock().push(fence.clone());
        Ok(fence)
    }

    fn server_wait(&self, context: ContextId, fence: &Fence) -> Result<(), GlError> {
        self.events.lock().push(GlEvent::ServerWait {
            context,
            fence: fence.id(),
        });
        let failing = self
            .failing_waits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
            .is_ok();
        if failing {
            return Err(GlError::FenceTimeout(fence.id()));
        }
        fence.signal();
        self.inner.server_wait(context, fence)
    }

    fn swap_buffers(&self, context: ContextId) -> Result<(), GlError> {
        self.events.lock().push(GlEvent::Swap { context });
        self.inner.swap_buffers(context)
    }
}

/// Paints its whole dirty area with one color.
pub struct SolidPainter {
    color: Mutex<Color>,
    paints: AtomicUsize,
}

impl SolidPainter {
    pub fn new(color: Color) -> Arc<Self> {
        Arc::new(Self {
            color: Mutex::new(color),
            paints: AtomicUsize::new(0),
        })
    }

    pub fn set_color(&self, color: Color) {
        *self.color.lock() = color;
    }

    pub fn paints(&self) -> usize {
        self.paints.load(Ordering::SeqCst)
    }
}

impl LayerPainter for SolidPainter {
    fn paint_contents(&self, context: &mut GraphicsContext<'_>, clip: FloatRect) {
        self.paints.fetch_add(1, Ordering::SeqCst);
        context.fill_rect(clip, *self.color.lock());
    }
}

type PageUpdate = Box<dyn FnOnce(&mut LayerTreeContext<'_>)>;

pub struct TestPageStats {
    pub update_rendering_count: Arc<AtomicUsize>,
    pub completed_updates: Arc<AtomicUsize>,
    pub will_render_frames: Arc<AtomicUsize>,
    pub presented: Arc<Mutex<Vec<PresentedFrameInfo>>>,
}

/// Page whose layout step runs whatever updates the test queued.
pub struct TestPage {
    size: IntSize,
    device_scale_factor: f32,
    updates: Vec<PageUpdate>,
    update_rendering_count: Arc<AtomicUsize>,
    completed_updates: Arc<AtomicUsize>,
    will_render_frames: Arc<AtomicUsize>,
    presented: Arc<Mutex<Vec<PresentedFrameInfo>>>,
}

impl TestPage {
    pub fn new(size: IntSize) -> (Self, TestPageStats) {
        let update_rendering_count = Arc::new(AtomicUsize::new(0));
        let completed_updates = Arc::new(AtomicUsize::new(0));
        let will_render_frames = Arc::new(AtomicUsize::new(0));
        let presented = Arc::new(Mutex::new(Vec::new()));
        let page = Self {
            size,
            device_scale_factor: 1.0,
            updates: Vec::new(),
            update_rendering_count: update_rendering_count.clone(),
            completed_updates: completed_updates.clone(),
            will_render_frames: will_render_frames.clone(),
            presented: presented.clone(),
        };
        let stats = TestPageStats {
            update_rendering_count,
            completed_updates,
            will_render_frames,
            presented,
        };
        (page, stats)
    }

    pub fn set_size(&mut self, size: IntSize) {
        self.size = size;
    }

    /// Runs `update` during the next layout.
    pub fn queue_update(&mut self, update: impl FnOnce(&mut LayerTreeContext<'_>) + 'static) {
        self.updates.push(Box::new(update));
    }
}

impl PageClient for TestPage {
    fn size(&self) -> IntSize {
        self.size
    }

    fn device_scale_factor(&self) -> f32 {
        self.device_scale_factor
    }

    fn update_rendering(&mut self, layers: &mut LayerTreeContext<'_>) {
        self.update_rendering_count.fetch_add(1, Ordering::SeqCst);
        for update in self.updates.drain(..) {
            update(layers);
        }
    }

    fn did_complete_rendering_update(&mut self) {
        self.completed_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn will_render_frame(&mut self) {
        self.will_render_frames.fetch_add(1, Ordering::SeqCst);
    }

    fn did_render_frame(&mut self, presented: Option<PresentedFrameInfo>) {
        if let Some(info) = presented {
            self.presented.lock().push(info);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub frame_number: u64,
    pub pixels: PixelBuffer,
    /// `None` when the whole frame was damaged.
    pub damage: Option<Vec<IntRect>>,
    pub producer_fence_signaled: bool,
}

#[derive(Debug, Default)]
pub struct SinkLog {
    pub frames: Vec<CapturedFrame>,
    pub visibility: Vec<bool>,
}

/// Copies every presented frame and hands the target straight back.
pub struct CollectingSink {
    log: Arc<Mutex<SinkLog>>,
}

impl CollectingSink {
    pub fn new() -> (Box<Self>, Arc<Mutex<SinkLog>>) {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        (Box::new(Self { log: log.clone() }), log)
    }
}

impl FrameSink for CollectingSink {
    fn present(&mut self, frame: PresentedFrame<'_>, releaser: &TargetReleaser) {
        self.log.lock().frames.push(CapturedFrame {
            frame_number: frame.frame_number,
            pixels: frame.pixels.clone(),
            damage: frame.damage.map(|damage| damage.rects().to_vec()),
            producer_fence_signaled: frame
                .producer_fence
                .as_ref()
                .is_some_and(|fence| fence.is_signaled()),
        });
        releaser.release(frame.target, None);
    }

    fn visibility_did_change(&mut self, visible: bool) {
        self.log.lock().visibility.push(visible);
    }
}

/// Routes `tracing` output through the test harness; honors `RUST_LOG`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn cpu_painting(threads: usize) -> PaintingConfig {
    let mut config = PaintingConfig::defaults(
        PlatformProfile::Desktop,
        PoolSizes {
            cpu_threads: threads,
            gpu_threads: 0,
        },
    );
    config.force_cpu_rendering = true;
    config
}

pub fn gpu_painting(threads: usize) -> PaintingConfig {
    PaintingConfig::defaults(
        PlatformProfile::Desktop,
        PoolSizes {
            cpu_threads: 0,
            gpu_threads: threads,
        },
    )
}

pub fn test_settings() -> CompositorSettings {
    CompositorSettings {
        fps_interval: None,
        ..CompositorSettings::default()
    }
}
