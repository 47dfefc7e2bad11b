use std::collections::HashMap;
use std::sync::Arc;

use gpu_runtime::{Fence, GlError};
use render_protocol::{
    Color, CompositeOperator, FloatRect, ImageHandle, IntRect, PixelBuffer, RenderingMode,
};
use smallvec::SmallVec;

use crate::image_store::{GpuImage, ImageStore};

/// Content source of a layer. Called on the recording thread with the context already
/// mapped from layer coordinates into the tile.
pub trait LayerPainter {
    /// `clip` is the dirty area in layer coordinates.
    fn paint_contents(&self, context: &mut GraphicsContext<'_>, clip: FloatRect);
}

/// One recorded drawing operation, already in tile-local pixels and clipped to the tile.
#[derive(Debug, Clone)]
pub enum DisplayItem {
    FillRect {
        rect: IntRect,
        color: Color,
        operator: CompositeOperator,
    },
    DrawImage {
        handle: ImageHandle,
        image: Arc<GpuImage>,
        destination: FloatRect,
        opacity: f32,
        clip: IntRect,
    },
}

#[derive(Debug, Clone, Copy)]
struct ContextState {
    offset_x: f32,
    offset_y: f32,
    scale: f32,
    clip: IntRect,
}

impl ContextState {
    fn map_rect(&self, rect: FloatRect) -> FloatRect {
        rect.scaled(self.scale)
            .translated(self.offset_x, self.offset_y)
    }
}

/// Recording canvas handed to [`LayerPainter`]s.
///
/// Supports a uniform scale plus translation, which is all tile recording needs.
pub struct GraphicsContext<'a> {
    images: &'a ImageStore,
    state: ContextState,
    saved: SmallVec<[ContextState; 4]>,
    items: Vec<DisplayItem>,
    image_fences: HashMap<ImageHandle, Fence>,
}

impl<'a> GraphicsContext<'a> {
    pub(crate) fn new(images: &'a ImageStore, bounds: IntRect) -> Self {
        Self {
            images,
            state: ContextState {
                offset_x: 0.0,
                offset_y: 0.0,
                scale: 1.0,
                clip: bounds,
            },
            saved: SmallVec::new(),
            items: Vec::new(),
            image_fences: HashMap::new(),
        }
    }

    pub fn save(&mut self) {
        self.saved.push(self.state);
    }

    pub fn restore(&mut self) {
        debug_assert!(!self.saved.is_empty(), "unbalanced GraphicsContext::restore");
        if let Some(state) = self.saved.pop() {
            self.state = state;
        }
    }

    pub fn translate(&mut self, dx: f32, dy: f32) {
        self.state.offset_x += dx * self.state.scale;
        self.state.offset_y += dy * self.state.scale;
    }

    pub fn scale(&mut self, factor: f32) {
        self.state.scale *= factor;
    }

    pub fn clip(&mut self, rect: FloatRect) {
        let mapped = self.state.map_rect(rect).enclosing_int_rect();
        self.state.clip = self.state.clip.intersection(mapped);
    }

    pub fn fill_rect(&mut self, rect: FloatRect, color: Color) {
        self.fill_rect_with_operator(rect, color, CompositeOperator::SourceOver);
    }

    pub fn fill_rect_with_operator(
        &mut self,
        rect: FloatRect,
        color: Color,
        operator: CompositeOperator,
    ) {
        let rect = self
            .state
            .map_rect(rect)
            .enclosing_int_rect()
            .intersection(self.state.clip);
        if rect.is_empty() {
            return;
        }
        self.items.push(DisplayItem::FillRect {
            rect,
            color,
            operator,
        });
    }

    /// Draws a stored image. The image's current producer fence is captured now, so replay
    /// waits on exactly that pass.
    pub fn draw_image(&mut self, handle: ImageHandle, destination: FloatRect, opacity: f32) {
        let Some(image) = self.images.get(handle) else {
            tracing::debug!(?handle, "draw of unknown image skipped");
            return;
        };
        let destination = self.state.map_rect(destination);
        if destination.enclosing_int_rect().intersection(self.state.clip).is_empty() {
            return;
        }
        if let Some(fence) = image.current_fence() {
            self.image_fences.entry(handle).or_insert(fence);
        }
        self.items.push(DisplayItem::DrawImage {
            handle,
            image,
            destination,
            opacity,
            clip: self.state.clip,
        });
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    fn finish(self) -> (Vec<DisplayItem>, HashMap<ImageHandle, Fence>) {
        (self.items, self.image_fences)
    }
}

/// Immutable display list for one dirty rectangle of a layer.
#[derive(Debug)]
pub struct RecordedTile {
    items: Vec<DisplayItem>,
    image_fences: HashMap<ImageHandle, Fence>,
    rect: IntRect,
    mode: RenderingMode,
    opaque: bool,
    scale: f32,
}

impl RecordedTile {
    /// Records `painter` over `dirty_rect`, which is in scaled layer pixels.
    pub fn record(
        painter: &dyn LayerPainter,
        images: &ImageStore,
        dirty_rect: IntRect,
        opaque: bool,
        scale: f32,
        mode: RenderingMode,
    ) -> Self {
        let mut context = GraphicsContext::new(images, IntRect::from_size(dirty_rect.size()));
        context.translate(-(dirty_rect.x as f32), -(dirty_rect.y as f32));
        context.scale(scale);
        let clip = FloatRect::from(dirty_rect).scaled(1.0 / scale);
        context.clip(clip);
        painter.paint_contents(&mut context, clip);
        let (items, image_fences) = context.finish();
        Self {
            items,
            image_fences,
            rect: dirty_rect,
            mode,
            opaque,
            scale,
        }
    }

    pub fn items(&self) -> &[DisplayItem] {
        &self.items
    }

    pub fn has_fences(&self) -> bool {
        !self.image_fences.is_empty()
    }

    pub fn fence_for(&self, handle: ImageHandle) -> Option<&Fence> {
        self.image_fences.get(&handle)
    }

    pub fn rect(&self) -> IntRect {
        self.rect
    }

    pub fn mode(&self) -> RenderingMode {
        self.mode
    }

    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Rasterizes the display list into `target`.
    ///
    /// Before the first draw of an image with a recorded fence, `wait_for_fence` is called
    /// for it; a failed wait aborts the replay.
    pub fn replay_into<W>(
        &self,
        target: &mut PixelBuffer,
        mut wait_for_fence: W,
    ) -> Result<(), GlError>
    where
        W: FnMut(&Fence) -> Result<(), GlError>,
    {
        let background = if self.opaque {
            Color::WHITE
        } else {
            Color::TRANSPARENT_BLACK
        };
        target.clear(background);

        let mut waited: SmallVec<[ImageHandle; 4]> = SmallVec::new();
        for item in &self.items {
            match item {
                DisplayItem::FillRect {
                    rect,
                    color,
                    operator,
                } => target.fill_rect(*rect, *color, *operator),
                DisplayItem::DrawImage {
                    handle,
                    image,
                    destination,
                    opacity,
                    clip,
                } => {
                    if !waited.contains(handle) {
                        if let Some(fence) = self.image_fences.get(handle) {
                            wait_for_fence(fence)?;
                        }
                        waited.push(*handle);
                    }
                    target.draw_buffer(&image.read(), *destination, *opacity, *clip);
                }
            }
        }
        Ok(())
    }
}
