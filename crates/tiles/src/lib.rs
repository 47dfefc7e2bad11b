//! Tile rasterization: backing store grids, display list recording and the hybrid
//! CPU/GPU painting engine that replays recordings on worker pools.

mod backing_store;
mod buffer;
mod config;
mod engine;
mod image_store;
mod policy;
mod recording;

pub use backing_store::{BackingStoreUpdate, TILE_SIZE, TileCoordinate, TileUpdate, TiledBackingStore};
pub use buffer::{
    BufferAllocator, MAX_BUFFER_EDGE, PaintingState, PixelsGuard, PooledBufferAllocator, Texture,
    TextureId, TexturePool, TileBuffer, TileBufferError,
};
pub use config::{
    CPU_PAINTING_THREADS_ENV, ENABLE_CPU_RENDERING_ENV, GPU_MIN_FRACTION_ENV,
    GPU_PAINTING_MIN_AREA_ENV, GPU_PAINTING_THREADS_ENV, HYBRID_PAINTING_STRATEGY_ENV,
    HybridPaintingStrategy, PaintingConfig, PlatformProfile, USE_LINEAR_TILE_TEXTURES_ENV,
};
pub use engine::{GpuPaintingWorker, PaintingEngine};
pub use image_store::{GpuImage, ImageStore};
pub use policy::TilePaintingPolicy;
pub use recording::{DisplayItem, GraphicsContext, LayerPainter, RecordedTile};
