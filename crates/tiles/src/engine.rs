use std::cell::RefCell;
use std::sync::Arc;

use gpu_runtime::{
    ContextPurpose, DEFAULT_FENCE_WAIT_TIMEOUT, GlContext, GlError, PlatformDisplay,
};
use render_protocol::{IntRect, RenderingMode};
use threads::{PoolKind, PoolOccupancy, RunLoopError, WorkerPoolPair};

use crate::buffer::{BufferAllocator, PooledBufferAllocator, TexturePool, TileBuffer, TileBufferError};
use crate::config::PaintingConfig;
use crate::image_store::ImageStore;
use crate::policy::TilePaintingPolicy;
use crate::recording::{LayerPainter, RecordedTile};

/// Worker-local state of a GPU painting thread: a painting context created on first use.
pub struct GpuPaintingWorker {
    display: Arc<PlatformDisplay>,
    context: Option<GlContext>,
}

impl GpuPaintingWorker {
    fn context(&mut self) -> Result<&GlContext, GlError> {
        if self.context.is_none() {
            self.context = Some(self.display.create_context(ContextPurpose::Painting)?);
        }
        match &self.context {
            Some(context) => Ok(context),
            None => Err(GlError::ContextCreationFailed {
                purpose: ContextPurpose::Painting,
            }),
        }
    }

    fn drop_context(&mut self) {
        self.context = None;
    }
}

/// Tile rasterization front end shared by every layer of a session.
///
/// With no worker pools, tiles are painted synchronously on the calling thread. Otherwise
/// they are recorded on the calling thread and replayed on the CPU or GPU pool.
pub struct PaintingEngine {
    config: PaintingConfig,
    display: Arc<PlatformDisplay>,
    images: Arc<ImageStore>,
    allocator: Arc<dyn BufferAllocator>,
    policy: TilePaintingPolicy,
    pools: WorkerPoolPair<(), GpuPaintingWorker>,
    main_context: RefCell<Option<GlContext>>,
}

impl PaintingEngine {
    pub fn new(
        config: PaintingConfig,
        display: Arc<PlatformDisplay>,
        images: Arc<ImageStore>,
    ) -> Result<Self, RunLoopError> {
        let textures = TexturePool::new(TexturePool::DEFAULT_CAPACITY, config.use_linear_tile_textures);
        Self::with_allocator(
            config,
            display,
            images,
            Arc::new(PooledBufferAllocator::new(textures)),
        )
    }

    pub fn with_allocator(
        config: PaintingConfig,
        display: Arc<PlatformDisplay>,
        images: Arc<ImageStore>,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<Self, RunLoopError> {
        let mut sizes = config.pool_sizes();
        if sizes.gpu_threads > 0 && !display.can_use_accelerated_buffers() {
            tracing::warn!("accelerated buffers unavailable, GPU painting threads disabled");
            sizes.gpu_threads = 0;
        }
        let worker_display = display.clone();
        let pools = WorkerPoolPair::new(
            sizes,
            |_| (),
            move |_| GpuPaintingWorker {
                display: worker_display.clone(),
                context: None,
            },
        )?;
        tracing::info!(
            cpu_threads = sizes.cpu_threads,
            gpu_threads = sizes.gpu_threads,
            strategy = config.strategy.name(),
            "painting engine created"
        );
        Ok(Self {
            policy: TilePaintingPolicy::from_config(&config),
            config,
            display,
            images,
            allocator,
            pools,
            main_context: RefCell::new(None),
        })
    }

    pub fn config(&self) -> &PaintingConfig {
        &self.config
    }

    pub fn images(&self) -> &Arc<ImageStore> {
        &self.images
    }

    pub fn use_threaded_rendering(&self) -> bool {
        self.pools.has_any_pool()
    }

    pub fn is_hybrid_mode(&self) -> bool {
        self.pools.has_pool(PoolKind::Cpu)
            && self.pools.has_pool(PoolKind::Gpu)
            && self.display.can_use_accelerated_buffers()
    }

    pub fn occupancy(&self) -> PoolOccupancy {
        self.pools.occupancy()
    }

    pub fn pools(&self) -> &WorkerPoolPair<(), GpuPaintingWorker> {
        &self.pools
    }

    /// Mode for a tile about to be recorded.
    pub fn decide_hybrid_rendering_mode(&self, area: u64, scale: f32) -> RenderingMode {
        if self.is_hybrid_mode() {
            return self
                .policy
                .decide(self.pools.occupancy(), area, scale, &mut rand::rng());
        }
        if self.pools.has_pool(PoolKind::Gpu) && self.display.can_use_accelerated_buffers() {
            RenderingMode::Accelerated
        } else {
            RenderingMode::Unaccelerated
        }
    }

    /// Paints a tile synchronously on the calling thread.
    #[tracing::instrument(level = "trace", skip(self, painter))]
    pub fn paint(
        &self,
        painter: &dyn LayerPainter,
        dirty_rect: IntRect,
        opaque: bool,
        scale: f32,
    ) -> Result<Arc<TileBuffer>, TileBufferError> {
        let mode = if self.display.can_use_accelerated_buffers() && !self.config.force_cpu_rendering
        {
            RenderingMode::Accelerated
        } else {
            RenderingMode::Unaccelerated
        };
        let buffer = self.allocator.allocate(dirty_rect.size(), mode)?;
        buffer.begin_painting();
        let tile = RecordedTile::record(painter, &self.images, dirty_rect, opaque, scale, mode);

        self.replay_inline(&tile, &buffer, mode)?;
        Ok(buffer)
    }

    fn replay_inline(
        &self,
        tile: &RecordedTile,
        buffer: &TileBuffer,
        mode: RenderingMode,
    ) -> Result<(), TileBufferError> {
        let result = match mode {
            RenderingMode::Accelerated => self.replay_on_main_context(tile, buffer),
            RenderingMode::Unaccelerated => {
                replay_unaccelerated(tile, buffer).map_err(TileBufferError::from)
            }
        };
        if result.is_err() {
            buffer.fail_painting();
        }
        result
    }

    fn replay_on_main_context(
        &self,
        tile: &RecordedTile,
        buffer: &TileBuffer,
    ) -> Result<(), TileBufferError> {
        let mut slot = self.main_context.borrow_mut();
        if slot.is_none() {
            *slot = Some(self.display.create_context(ContextPurpose::Painting)?);
        }
        let Some(context) = slot.as_ref() else {
            return Err(GlError::ContextCreationFailed {
                purpose: ContextPurpose::Painting,
            }
            .into());
        };
        let result = replay_accelerated(context, tile, buffer);
        if result.is_err() {
            slot.take();
        }
        result.map_err(TileBufferError::from)
    }

    /// Captures the painter's output for `dirty_rect` without rasterizing it.
    #[tracing::instrument(level = "trace", skip(self, painter))]
    pub fn record(
        &self,
        painter: &dyn LayerPainter,
        dirty_rect: IntRect,
        opaque: bool,
        scale: f32,
    ) -> RecordedTile {
        let mode = self.decide_hybrid_rendering_mode(dirty_rect.area(), scale);
        RecordedTile::record(painter, &self.images, dirty_rect, opaque, scale, mode)
    }

    /// Allocates the tile's buffer and queues its rasterization. The buffer is returned
    /// immediately and flagged complete by the worker.
    #[tracing::instrument(level = "trace", skip(self, tile))]
    pub fn replay(
        &self,
        tile: RecordedTile,
        dirty_rect: IntRect,
    ) -> Result<Arc<TileBuffer>, TileBufferError> {
        let mut mode = tile.mode();
        // Fenced images must be consumed by a GL context, so only fence-free GPU tiles may
        // be moved to the CPU.
        if mode.is_accelerated() && !tile.has_fences() && self.is_hybrid_mode() {
            mode = self.decide_hybrid_rendering_mode(dirty_rect.area(), tile.scale());
        }
        let buffer = self.allocator.allocate(dirty_rect.size(), mode)?;
        buffer.begin_painting();

        let posted = match mode {
            RenderingMode::Accelerated => {
                let worker_buffer = buffer.clone();
                let tile = Arc::new(tile);
                let worker_tile = tile.clone();
                self.pools
                    .post_gpu_task(move |worker| {
                        replay_on_worker(worker, &worker_tile, &worker_buffer)
                    })
                    .map_err(|error| (error, tile))
            }
            RenderingMode::Unaccelerated => {
                let worker_buffer = buffer.clone();
                let tile = Arc::new(tile);
                let worker_tile = tile.clone();
                self.pools
                    .post_cpu_task(move |_| {
                        if let Err(error) = replay_unaccelerated(&worker_tile, &worker_buffer) {
                            tracing::warn!(%error, "CPU tile replay failed");
                            worker_buffer.fail_painting();
                        }
                    })
                    .map_err(|error| (error, tile))
            }
        };

        if let Err((error, tile)) = posted {
            tracing::trace!(%error, "replaying tile inline");
            self.replay_inline(&tile, &buffer, mode)?;
        }
        Ok(buffer)
    }

    /// Blocks until every queued replay has run.
    pub fn wait_until_idle(&self) {
        self.pools.wait_until_idle();
    }
}

impl std::fmt::Debug for PaintingEngine {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PaintingEngine")
            .field("config", &self.config)
            .field("pools", &self.pools)
            .finish()
    }
}

fn replay_on_worker(worker: &mut GpuPaintingWorker, tile: &RecordedTile, buffer: &TileBuffer) {
    let result = worker
        .context()
        .and_then(|context| replay_accelerated(context, tile, buffer));
    if let Err(error) = result {
        tracing::warn!(%error, "GPU tile replay failed, dropping painting context");
        worker.drop_context();
        buffer.fail_painting();
    }
}

fn replay_accelerated(
    context: &GlContext,
    tile: &RecordedTile,
    buffer: &TileBuffer,
) -> Result<(), GlError> {
    if !context.make_context_current() {
        return Err(GlError::MakeCurrentFailed(context.id()));
    }
    {
        let mut pixels = buffer.pixels_mut();
        tile.replay_into(pixels.pixels_mut(), |fence| context.server_wait(fence))?;
    }
    let fence = context.create_fence()?;
    buffer.complete_painting(Some(fence));
    Ok(())
}

fn replay_unaccelerated(tile: &RecordedTile, buffer: &TileBuffer) -> Result<(), GlError> {
    {
        let mut pixels = buffer.pixels_mut();
        tile.replay_into(pixels.pixels_mut(), |fence| {
            // No GL context here: the CPU has to see the producer's writes.
            if fence.client_wait(DEFAULT_FENCE_WAIT_TIMEOUT) {
                Ok(())
            } else {
                Err(GlError::FenceTimeout(fence.id()))
            }
        })?;
    }
    buffer.complete_painting(None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PaintingState;
    use crate::config::{HybridPaintingStrategy, PlatformProfile};
    use crate::recording::GraphicsContext;
    use gpu_runtime::SoftwareGl;
    use render_protocol::{Color, FloatRect, ImageHandle, IntSize, PixelBuffer};
    use std::time::Duration;
    use threads::PoolSizes;

    struct Solid(Color);

    impl LayerPainter for Solid {
        fn paint_contents(&self, context: &mut GraphicsContext<'_>, clip: FloatRect) {
            context.fill_rect(clip, self.0);
        }
    }

    struct ImagePainter(ImageHandle);

    impl LayerPainter for ImagePainter {
        fn paint_contents(&self, context: &mut GraphicsContext<'_>, _clip: FloatRect) {
            context.draw_image(self.0, FloatRect::new(0.0, 0.0, 4.0, 4.0), 1.0);
        }
    }

    fn engine(cpu_threads: usize, gpu_threads: usize, accelerated: bool) -> PaintingEngine {
        let mut config = PaintingConfig::defaults(
            PlatformProfile::Desktop,
            PoolSizes {
                cpu_threads,
                gpu_threads,
            },
        );
        config.strategy = HybridPaintingStrategy::PreferCPUIfIdle;
        let display = PlatformDisplay::new(Arc::new(SoftwareGl::new(accelerated)));
        PaintingEngine::new(config, display, ImageStore::new()).unwrap()
    }

    #[test]
    fn paints_synchronously_without_pools() {
        let engine = engine(0, 0, false);
        assert!(!engine.use_threaded_rendering());
        let buffer = engine
            .paint(&Solid(Color::BLACK), IntRect::new(0, 0, 16, 16), false, 1.0)
            .unwrap();
        assert_eq!(buffer.mode(), RenderingMode::Unaccelerated);
        assert_eq!(buffer.painting_state(), PaintingState::Complete);
        assert_eq!(buffer.with_pixels(|pixels| pixels.pixel(8, 8)), Some([0, 0, 0, 255]));
    }

    #[test]
    fn synchronous_accelerated_paint_sets_producer_fence() {
        let engine = engine(0, 0, true);
        let buffer = engine
            .paint(&Solid(Color::WHITE), IntRect::new(32, 32, 8, 8), true, 1.0)
            .unwrap();
        assert_eq!(buffer.mode(), RenderingMode::Accelerated);
        assert!(buffer.fence().is_some());
        assert_eq!(
            buffer.with_pixels(|pixels| pixels.pixel(0, 0)),
            Some([255, 255, 255, 255])
        );
    }

    #[test]
    fn threaded_replay_completes_on_cpu_pool() {
        let engine = engine(2, 0, false);
        assert!(engine.use_threaded_rendering());
        assert!(!engine.is_hybrid_mode());
        let rect = IntRect::new(0, 0, 32, 32);
        let tile = engine.record(&Solid(Color::BLACK), rect, true, 1.0);
        assert_eq!(tile.mode(), RenderingMode::Unaccelerated);

        let buffer = engine.replay(tile, rect).unwrap();
        assert_eq!(buffer.wait_until_painting_complete(), PaintingState::Complete);
        assert_eq!(buffer.with_pixels(|pixels| pixels.pixel(31, 31)), Some([0, 0, 0, 255]));
        engine.wait_until_idle();
        assert_eq!(engine.occupancy().cpu_tasks, 0);
    }

    #[test]
    fn gpu_replay_waits_for_image_producer() {
        let engine = engine(0, 1, true);
        let handle = engine
            .images()
            .insert(PixelBuffer::new(IntSize::new(4, 4)));
        let image = engine.images().get(handle).unwrap();
        let fence = image.begin_production();

        let rect = IntRect::new(0, 0, 4, 4);
        let tile = engine.record(&ImagePainter(handle), rect, false, 1.0);
        assert_eq!(tile.mode(), RenderingMode::Accelerated);
        assert!(tile.has_fences());
        let buffer = engine.replay(tile, rect).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        image.write(|pixels| pixels.clear(Color::rgba(0, 0, 255, 255)));
        fence.signal();

        assert_eq!(buffer.wait_until_painting_complete(), PaintingState::Complete);
        assert_eq!(
            buffer.with_pixels(|pixels| pixels.pixel(2, 2)),
            Some([0, 0, 255, 255])
        );
    }

    #[test]
    fn busy_cpu_worker_sends_tiles_to_gpu_until_it_drains() {
        let engine = engine(1, 1, true);
        assert!(engine.is_hybrid_mode());
        let rect = IntRect::new(0, 0, 16, 16);

        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        engine
            .pools()
            .post_cpu_task(move |_| {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(engine.occupancy().cpu_tasks, 1);
        assert_eq!(
            engine.decide_hybrid_rendering_mode(rect.area(), 1.0),
            RenderingMode::Accelerated
        );
        let tile = engine.record(&Solid(Color::BLACK), rect, true, 1.0);
        assert_eq!(tile.mode(), RenderingMode::Accelerated);

        release_tx.send(()).unwrap();
        engine.wait_until_idle();
        assert_eq!(engine.occupancy().cpu_tasks, 0);
        assert_eq!(
            engine.decide_hybrid_rendering_mode(rect.area(), 1.0),
            RenderingMode::Unaccelerated
        );
        let tile = engine.record(&Solid(Color::BLACK), rect, true, 1.0);
        assert_eq!(tile.mode(), RenderingMode::Unaccelerated);
    }

    #[test]
    fn hybrid_mode_only_reroutes_fence_free_gpu_tiles() {
        let engine = engine(1, 1, true);
        assert!(engine.is_hybrid_mode());
        let rect = IntRect::new(0, 0, 8, 8);

        let plain = RecordedTile::record(
            &Solid(Color::BLACK),
            engine.images(),
            rect,
            true,
            1.0,
            RenderingMode::Accelerated,
        );
        let rerouted = engine.replay(plain, rect).unwrap();
        assert_eq!(rerouted.mode(), RenderingMode::Unaccelerated);

        let handle = engine
            .images()
            .insert(PixelBuffer::new(IntSize::new(4, 4)));
        engine
            .images()
            .get(handle)
            .unwrap()
            .begin_production()
            .signal();
        let fenced = RecordedTile::record(
            &ImagePainter(handle),
            engine.images(),
            rect,
            false,
            1.0,
            RenderingMode::Accelerated,
        );
        let kept = engine.replay(fenced, rect).unwrap();
        assert_eq!(kept.mode(), RenderingMode::Accelerated);

        engine.wait_until_idle();
        assert!(rerouted.is_painting_complete() && kept.is_painting_complete());
    }
}
