use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use gpu_runtime::{Fence, GlError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use render_protocol::{IntSize, PixelBuffer, RenderingMode};

/// Largest tile buffer edge the allocator accepts.
pub const MAX_BUFFER_EDGE: i32 = 8192;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TileBufferError {
    #[error("tile buffer of size {0:?} is not allocatable")]
    InvalidSize(IntSize),
    #[error("out of {} tile buffers", .0.label())]
    AllocationFailed(RenderingMode),
    #[error("tile painting context unavailable: {0}")]
    Context(#[from] GlError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(u64);

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

/// GPU-resident tile storage. Pixels are kept host-side by the software backend.
#[derive(Debug)]
pub struct Texture {
    id: TextureId,
    linear: bool,
    pixels: PixelBuffer,
}

impl Texture {
    fn new(size: IntSize, linear: bool) -> Self {
        Self {
            id: TextureId(NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed)),
            linear,
            pixels: PixelBuffer::new(size),
        }
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn is_linear(&self) -> bool {
        self.linear
    }

    pub fn size(&self) -> IntSize {
        self.pixels.size()
    }
}

/// Bounded free list of tile textures. Releasing into a full pool drops the texture.
#[derive(Debug)]
pub struct TexturePool {
    free: ArrayQueue<Texture>,
    linear: bool,
    created: AtomicU64,
}

impl TexturePool {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new(capacity: usize, linear: bool) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(capacity.max(1)),
            linear,
            created: AtomicU64::new(0),
        })
    }

    pub fn acquire(&self, size: IntSize) -> Texture {
        // Scan each free texture at most once; mismatches go back to the tail.
        for _ in 0..self.free.len() {
            let Some(texture) = self.free.pop() else {
                break;
            };
            if texture.size() == size {
                return texture;
            }
            if let Err(texture) = self.free.push(texture) {
                drop(texture);
            }
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        Texture::new(size, self.linear)
    }

    pub fn release(&self, texture: Texture) {
        if let Err(evicted) = self.free.push(texture) {
            tracing::trace!(texture = ?evicted.id(), "texture pool full, evicting");
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}

enum Storage {
    Memory(PixelBuffer),
    Texture(Texture),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintingState {
    InProgress,
    Complete,
    Failed,
}

/// Destination of one tile's rasterization, CPU memory or a pooled texture.
///
/// Shared between the painting worker and the consumer. A consumer must wait for
/// [`PaintingState::Complete`] and, for accelerated buffers, for the producer fence before
/// reading pixels.
pub struct TileBuffer {
    size: IntSize,
    mode: RenderingMode,
    storage: Mutex<Storage>,
    painting: Mutex<PaintingState>,
    painting_done: Condvar,
    fence: Mutex<Option<Fence>>,
    pool: Option<Arc<TexturePool>>,
}

impl TileBuffer {
    pub fn unaccelerated(size: IntSize) -> Arc<Self> {
        Arc::new(Self::with_storage(
            size,
            RenderingMode::Unaccelerated,
            Storage::Memory(PixelBuffer::new(size)),
            None,
        ))
    }

    pub fn accelerated(texture: Texture, pool: Option<Arc<TexturePool>>) -> Arc<Self> {
        Arc::new(Self::with_storage(
            texture.size(),
            RenderingMode::Accelerated,
            Storage::Texture(texture),
            pool,
        ))
    }

    fn with_storage(
        size: IntSize,
        mode: RenderingMode,
        storage: Storage,
        pool: Option<Arc<TexturePool>>,
    ) -> Self {
        Self {
            size,
            mode,
            storage: Mutex::new(storage),
            painting: Mutex::new(PaintingState::Complete),
            painting_done: Condvar::new(),
            fence: Mutex::new(None),
            pool,
        }
    }

    pub fn size(&self) -> IntSize {
        self.size
    }

    pub fn mode(&self) -> RenderingMode {
        self.mode
    }

    pub fn begin_painting(&self) {
        *self.painting.lock() = PaintingState::InProgress;
        self.fence.lock().take();
    }

    /// Marks the buffer ready. Accelerated buffers carry the fence of their producer.
    pub fn complete_painting(&self, fence: Option<Fence>) {
        debug_assert!(fence.is_none() || self.mode.is_accelerated());
        *self.fence.lock() = fence;
        self.finish(PaintingState::Complete);
    }

    pub fn fail_painting(&self) {
        self.finish(PaintingState::Failed);
    }

    fn finish(&self, state: PaintingState) {
        let mut painting = self.painting.lock();
        *painting = state;
        self.painting_done.notify_all();
    }

    pub fn painting_state(&self) -> PaintingState {
        *self.painting.lock()
    }

    pub fn is_painting_complete(&self) -> bool {
        self.painting_state() != PaintingState::InProgress
    }

    pub fn wait_until_painting_complete(&self) -> PaintingState {
        let mut painting = self.painting.lock();
        while *painting == PaintingState::InProgress {
            self.painting_done.wait(&mut painting);
        }
        *painting
    }

    /// Like [`Self::wait_until_painting_complete`] with a deadline. Returns the state seen
    /// when the wait ended.
    pub fn wait_for_painting(&self, timeout: Duration) -> PaintingState {
        let mut painting = self.painting.lock();
        if *painting == PaintingState::InProgress {
            let _ = self
                .painting_done
                .wait_while_for(&mut painting, |state| *state == PaintingState::InProgress, timeout);
        }
        *painting
    }

    pub fn fence(&self) -> Option<Fence> {
        self.fence.lock().clone()
    }

    pub fn pixels_mut(&self) -> PixelsGuard<'_> {
        PixelsGuard {
            storage: self.storage.lock(),
        }
    }

    pub fn with_pixels<R>(&self, f: impl FnOnce(&PixelBuffer) -> R) -> R {
        let guard = self.pixels_mut();
        f(guard.pixels())
    }

    pub fn texture_id(&self) -> Option<TextureId> {
        match &*self.storage.lock() {
            Storage::Texture(texture) => Some(texture.id()),
            _ => None,
        }
    }
}

/// Locked access to a tile buffer's pixels.
pub struct PixelsGuard<'a> {
    storage: MutexGuard<'a, Storage>,
}

impl PixelsGuard<'_> {
    pub fn pixels(&self) -> &PixelBuffer {
        match &*self.storage {
            Storage::Memory(pixels) => pixels,
            Storage::Texture(texture) => &texture.pixels,
        }
    }

    pub fn pixels_mut(&mut self) -> &mut PixelBuffer {
        match &mut *self.storage {
            Storage::Memory(pixels) => pixels,
            Storage::Texture(texture) => &mut texture.pixels,
        }
    }
}

impl Drop for TileBuffer {
    fn drop(&mut self) {
        let empty = Storage::Memory(PixelBuffer::new(IntSize::default()));
        let storage = std::mem::replace(self.storage.get_mut(), empty);
        if let (Storage::Texture(texture), Some(pool)) = (storage, &self.pool) {
            pool.release(texture);
        }
    }
}

impl std::fmt::Debug for TileBuffer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TileBuffer")
            .field("size", &self.size)
            .field("mode", &self.mode)
            .field("painting", &self.painting_state())
            .finish()
    }
}

/// Source of tile buffers. Allocation failure is recoverable: the caller keeps the tile
/// dirty and retries on a later flush.
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, size: IntSize, mode: RenderingMode)
    -> Result<Arc<TileBuffer>, TileBufferError>;
}

#[derive(Debug)]
pub struct PooledBufferAllocator {
    textures: Arc<TexturePool>,
}

impl PooledBufferAllocator {
    pub fn new(textures: Arc<TexturePool>) -> Self {
        Self { textures }
    }

    pub fn textures(&self) -> &Arc<TexturePool> {
        &self.textures
    }
}

impl BufferAllocator for PooledBufferAllocator {
    fn allocate(
        &self,
        size: IntSize,
        mode: RenderingMode,
    ) -> Result<Arc<TileBuffer>, TileBufferError> {
        if size.is_empty() || size.width > MAX_BUFFER_EDGE || size.height > MAX_BUFFER_EDGE {
            return Err(TileBufferError::InvalidSize(size));
        }
        Ok(match mode {
            RenderingMode::Unaccelerated => TileBuffer::unaccelerated(size),
            RenderingMode::Accelerated => {
                TileBuffer::accelerated(self.textures.acquire(size), Some(self.textures.clone()))
            }
        })
    }
}
