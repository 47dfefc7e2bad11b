//! Threaded compositing of a coordinated layer tree.
//!
//! The owning thread builds a tree of [`CoordinatedLayer`]s through a [`LayerTreeHost`],
//! which paints their tiles on the worker pools of a [`tiles::PaintingEngine`] and commits
//! the result. A [`ThreadedCompositor`] picks up each commit on its own thread, waits for
//! the painted tiles, composites them into a swap chain target and hands the frame to a
//! [`FrameSink`].

mod damage;
mod layer;
mod layer_tree_host;
mod settings;
mod surface;
mod texture_mapper;
mod threaded_compositor;

#[cfg(test)]
mod test_utils;

pub use damage::{Damage, DamageMode, MAX_DAMAGE_RECTS};
pub use layer::{CoordinatedLayer, LayerFlushOutcome, LayerId, SharedPainter, TranslateAnimation};
pub use layer_tree_host::{LayerTreeContext, LayerTreeHost, PageClient};
pub use settings::{
    CompositorSettings, DAMAGE_PROPAGATION_ENV, DamagePropagation, FpsCounter, SHOW_FPS_ENV,
};
pub use surface::{
    BufferFormat, FrameSink, PresentedFrame, SurfaceError, SwapChainSurface, TargetId,
    TargetReleaser,
};
pub use texture_mapper::{TextureMapper, TextureMapperStats};
pub use threaded_compositor::ThreadedCompositor;

#[derive(Debug, thiserror::Error)]
pub enum CompositorError {
    #[error(transparent)]
    RunLoop(#[from] threads::RunLoopError),
    #[error("invalid scene attributes: {0}")]
    ViewTransform(#[from] view::ViewTransformError),
}
