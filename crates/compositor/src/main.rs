use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use compositor::{
    CompositorError, CompositorSettings, CoordinatedLayer, FrameSink, LayerTreeContext,
    LayerTreeHost, PageClient, PresentedFrame, TargetReleaser, TranslateAnimation,
};
use gpu_runtime::{PlatformDisplay, SoftwareGl};
use protocol::PresentedFrameInfo;
use render_protocol::{Color, FloatRect, IntSize};
use tiles::{GraphicsContext, LayerPainter, PaintingConfig, PlatformProfile};
use tracing_subscriber::EnvFilter;

const VIEWPORT: IntSize = IntSize::new(640, 480);
const CHECKER_CELL: f32 = 32.0;
const RUN_FOR: Duration = Duration::from_secs(2);
const REPAINT_EVERY: Duration = Duration::from_millis(250);
const REPAINT_TIMEOUT: Duration = Duration::from_secs(2);

/// Alternating two-color grid whose phase flips on every repaint.
struct Checkerboard {
    phase: AtomicU32,
}

impl LayerPainter for Checkerboard {
    fn paint_contents(&self, context: &mut GraphicsContext<'_>, clip: FloatRect) {
        let phase = self.phase.load(Ordering::Relaxed);
        let first_column = (clip.x / CHECKER_CELL).floor() as i32;
        let first_row = (clip.y / CHECKER_CELL).floor() as i32;
        let last_column = (clip.max_x() / CHECKER_CELL).ceil() as i32;
        let last_row = (clip.max_y() / CHECKER_CELL).ceil() as i32;
        for row in first_row..last_row {
            for column in first_column..last_column {
                let dark = (row + column) as u32 % 2 == phase % 2;
                let color = if dark {
                    Color::rgba(40, 40, 48, 255)
                } else {
                    Color::rgba(220, 220, 230, 255)
                };
                let cell = FloatRect::new(
                    column as f32 * CHECKER_CELL,
                    row as f32 * CHECKER_CELL,
                    CHECKER_CELL,
                    CHECKER_CELL,
                );
                context.fill_rect(cell, color);
            }
        }
    }
}

struct Solid(Color);

impl LayerPainter for Solid {
    fn paint_contents(&self, context: &mut GraphicsContext<'_>, clip: FloatRect) {
        context.fill_rect(clip, self.0);
    }
}

struct DemoPage {
    checker: Arc<Checkerboard>,
    board: Arc<CoordinatedLayer>,
    sprite: Arc<CoordinatedLayer>,
    attached: bool,
    frames: u64,
}

impl DemoPage {
    fn new() -> Self {
        let checker = Arc::new(Checkerboard {
            phase: AtomicU32::new(0),
        });
        let board = CoordinatedLayer::new();
        board.set_position(64.0, 48.0);
        board.set_size(IntSize::new(512, 384));
        board.set_contents_opaque(true);
        board.set_painter(Some(checker.clone()));

        let sprite = CoordinatedLayer::new();
        sprite.set_size(IntSize::new(48, 48));
        sprite.set_opacity(0.8);
        sprite.set_painter(Some(Arc::new(Solid(Color::rgba(230, 80, 40, 255)))));
        sprite.set_animation(Some(TranslateAnimation {
            from: (0.0, 0.0),
            to: (464.0, 336.0),
            duration: Duration::from_millis(1500),
            repeat: true,
        }));
        board.set_children(vec![sprite.clone()]);

        Self {
            checker,
            board,
            sprite,
            attached: false,
            frames: 0,
        }
    }

    fn flip_checker(&self) {
        self.checker.phase.fetch_add(1, Ordering::Relaxed);
        self.board.set_needs_display();
    }
}

impl PageClient for DemoPage {
    fn size(&self) -> IntSize {
        VIEWPORT
    }

    fn update_rendering(&mut self, layers: &mut LayerTreeContext<'_>) {
        if std::mem::replace(&mut self.attached, true) {
            return;
        }
        layers.attach_layer(self.board.clone());
        layers.attach_layer(self.sprite.clone());
        layers.set_root_layers(vec![self.board.clone()]);
    }

    fn did_render_frame(&mut self, presented: Option<PresentedFrameInfo>) {
        self.frames += 1;
        if let Some(info) = presented {
            tracing::debug!(
                frame = info.frame_number,
                target = info.target_id,
                damage_rects = info.damage_rect_count,
                "frame presented"
            );
        }
    }
}

/// Logs each frame and returns the target right away.
struct LoggingSink;

impl FrameSink for LoggingSink {
    fn present(&mut self, frame: PresentedFrame<'_>, releaser: &TargetReleaser) {
        let damaged = frame.damage.map_or(frame.size.area(), |damage| {
            damage.rects().iter().map(|rect| rect.area()).sum()
        });
        tracing::trace!(
            frame = frame.frame_number,
            target = frame.target.0,
            damaged_pixels = damaged,
            "sink received frame"
        );
        releaser.release(frame.target, frame.producer_fence);
    }

    fn visibility_did_change(&mut self, visible: bool) {
        tracing::info!(visible, "surface visibility changed");
    }
}

fn main() -> Result<(), CompositorError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let backend = Arc::new(SoftwareGl::new(true));
    let display = PlatformDisplay::new(backend);
    let painting = PaintingConfig::from_env(
        PlatformProfile::Desktop,
        display.can_use_accelerated_buffers(),
    );
    let settings = CompositorSettings::from_env();
    tracing::info!(?painting, ?settings, "starting compositor demo");

    let mut host = LayerTreeHost::new(
        DemoPage::new(),
        display,
        Box::new(LoggingSink),
        painting,
        settings,
    )?;

    let started = Instant::now();
    let mut next_repaint = started + REPAINT_EVERY;
    while started.elapsed() < RUN_FOR {
        let now = Instant::now();
        if now >= next_repaint {
            host.page().flip_checker();
            host.schedule_layer_flush();
            next_repaint = now + REPAINT_EVERY;
        }
        let until = next_repaint.min(started + RUN_FOR);
        host.run_until(until.saturating_duration_since(Instant::now()), |_| false);
    }

    host.pause_rendering();
    host.resume_rendering();
    if !host.force_repaint_sync(REPAINT_TIMEOUT) {
        tracing::warn!("final repaint did not complete in time");
    }

    tracing::info!(
        frames = host.page().frames,
        request = host.composition_request_id().0,
        cycles = host.compositor().completed_cycles(),
        "demo finished"
    );
    host.invalidate();
    Ok(())
}
