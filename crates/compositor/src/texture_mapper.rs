use render_protocol::{Color, CompositeOperator, FloatRect, IntRect, PixelBuffer};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureMapperStats {
    pub frames: u64,
    pub textures_drawn: u64,
    pub solid_rects_drawn: u64,
}

/// Software compositor drawing tile textures into a backbuffer in device pixels.
///
/// Only one frame is in flight at a time; clip state lives between
/// [`TextureMapper::begin_painting`] and [`TextureMapper::end_painting`].
#[derive(Debug, Default)]
pub struct TextureMapper {
    clip_stack: SmallVec<[IntRect; 8]>,
    painting: bool,
    stats: TextureMapperStats,
}

impl TextureMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a frame clipped to `clip` and clears that region to `background`.
    pub fn begin_painting(&mut self, target: &mut PixelBuffer, clip: IntRect, background: Color) {
        debug_assert!(!self.painting, "begin_painting while already painting");
        self.clip_stack.clear();
        let clip = clip.intersection(target.bounds());
        self.clip_stack.push(clip);
        self.painting = true;
        target.fill_rect(clip, background, CompositeOperator::Copy);
    }

    pub fn end_painting(&mut self) {
        debug_assert!(self.painting, "end_painting without begin_painting");
        debug_assert_eq!(self.clip_stack.len(), 1, "unbalanced clip stack");
        self.clip_stack.clear();
        self.painting = false;
        self.stats.frames += 1;
    }

    pub fn is_painting(&self) -> bool {
        self.painting
    }

    pub fn clip(&self) -> IntRect {
        self.clip_stack.last().copied().unwrap_or_default()
    }

    pub fn begin_clip(&mut self, rect: FloatRect) {
        let clip = self.clip().intersection(rect.enclosing_int_rect());
        self.clip_stack.push(clip);
    }

    pub fn end_clip(&mut self) {
        debug_assert!(self.clip_stack.len() > 1, "end_clip without begin_clip");
        if self.clip_stack.len() > 1 {
            self.clip_stack.pop();
        }
    }

    pub fn draw_texture(
        &mut self,
        target: &mut PixelBuffer,
        texture: &PixelBuffer,
        destination: FloatRect,
        opacity: f32,
    ) {
        let clip = self.clip();
        if clip.is_empty() || !clip.intersects(destination.enclosing_int_rect()) {
            return;
        }
        target.draw_buffer(texture, destination, opacity, clip);
        self.stats.textures_drawn += 1;
    }

    pub fn draw_solid_color(
        &mut self,
        target: &mut PixelBuffer,
        rect: FloatRect,
        color: Color,
        opacity: f32,
    ) {
        let rect = rect.enclosing_int_rect().intersection(self.clip());
        if rect.is_empty() {
            return;
        }
        let alpha = (color.a as f32 * opacity.clamp(0.0, 1.0)).round() as u8;
        if alpha == 0 {
            return;
        }
        target.fill_rect(
            rect,
            Color { a: alpha, ..color },
            CompositeOperator::SourceOver,
        );
        self.stats.solid_rects_drawn += 1;
    }

    pub fn stats(&self) -> TextureMapperStats {
        self.stats
    }
}
