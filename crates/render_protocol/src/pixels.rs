use crate::{Color, CompositeOperator, FloatRect, IntRect, IntSize};

pub const BYTES_PER_PIXEL: usize = 4;

/// Tightly packed, premultiplied RGBA8 pixels, row-major.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    size: IntSize,
    data: Vec<u8>,
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PixelBuffer")
            .field("size", &self.size)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl PixelBuffer {
    pub fn new(size: IntSize) -> Self {
        let size = if size.is_empty() {
            IntSize::default()
        } else {
            size
        };
        Self {
            size,
            data: vec![0; size.area() as usize * BYTES_PER_PIXEL],
        }
    }

    pub fn size(&self) -> IntSize {
        self.size
    }

    pub fn stride(&self) -> usize {
        self.size.width.max(0) as usize * BYTES_PER_PIXEL
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bounds(&self) -> IntRect {
        IntRect::from_size(self.size)
    }

    /// Premultiplied pixel at `(x, y)`, `None` outside the buffer.
    pub fn pixel(&self, x: i32, y: i32) -> Option<[u8; 4]> {
        if x < 0 || y < 0 || x >= self.size.width || y >= self.size.height {
            return None;
        }
        let offset = self.offset(x, y);
        let mut out = [0; 4];
        out.copy_from_slice(&self.data[offset..offset + BYTES_PER_PIXEL]);
        Some(out)
    }

    pub fn clear(&mut self, color: Color) {
        let value = color.premultiplied();
        for pixel in self.data.chunks_exact_mut(BYTES_PER_PIXEL) {
            pixel.copy_from_slice(&value);
        }
    }

    pub fn fill_rect(&mut self, rect: IntRect, color: Color, operator: CompositeOperator) {
        let target = rect.intersection(self.bounds());
        if target.is_empty() {
            return;
        }
        let source = color.premultiplied();
        for y in target.y..target.max_y() {
            for x in target.x..target.max_x() {
                let offset = self.offset(x, y);
                let destination = &mut self.data[offset..offset + BYTES_PER_PIXEL];
                composite_pixel(destination, source, operator);
            }
        }
    }

    /// Draws `source` scaled into `destination`, nearest-neighbour sampled,
    /// restricted to `clip` (in this buffer's coordinates).
    pub fn draw_buffer(
        &mut self,
        source: &PixelBuffer,
        destination: FloatRect,
        opacity: f32,
        clip: IntRect,
    ) {
        if source.size.is_empty() || destination.is_empty() || opacity <= 0.0 {
            return;
        }
        let target = destination
            .enclosing_int_rect()
            .intersection(clip)
            .intersection(self.bounds());
        if target.is_empty() {
            return;
        }
        let scale_x = source.size.width as f32 / destination.width;
        let scale_y = source.size.height as f32 / destination.height;
        let alpha = (opacity.clamp(0.0, 1.0) * 255.0).round() as u32;
        for y in target.y..target.max_y() {
            let source_y = ((y as f32 + 0.5 - destination.y) * scale_y).floor() as i32;
            if source_y < 0 || source_y >= source.size.height {
                continue;
            }
            for x in target.x..target.max_x() {
                let source_x = ((x as f32 + 0.5 - destination.x) * scale_x).floor() as i32;
                if source_x < 0 || source_x >= source.size.width {
                    continue;
                }
                let source_offset = source.offset(source_x, source_y);
                let mut texel = [0u8; 4];
                texel.copy_from_slice(&source.data[source_offset..source_offset + BYTES_PER_PIXEL]);
                if alpha < 255 {
                    for channel in texel.iter_mut() {
                        *channel = ((*channel as u32 * alpha + 127) / 255) as u8;
                    }
                }
                let offset = self.offset(x, y);
                composite_pixel(
                    &mut self.data[offset..offset + BYTES_PER_PIXEL],
                    texel,
                    CompositeOperator::SourceOver,
                );
            }
        }
    }

    fn offset(&self, x: i32, y: i32) -> usize {
        y as usize * self.stride() + x as usize * BYTES_PER_PIXEL
    }
}

fn composite_pixel(destination: &mut [u8], source: [u8; 4], operator: CompositeOperator) {
    match operator {
        CompositeOperator::Copy => destination.copy_from_slice(&source),
        CompositeOperator::SourceOver => {
            let inverse_alpha = 255 - source[3] as u32;
            for (channel, value) in destination.iter_mut().zip(source) {
                *channel = (value as u32 + (*channel as u32 * inverse_alpha + 127) / 255).min(255) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_rect_is_clipped_to_bounds() {
        let mut buffer = PixelBuffer::new(IntSize::new(4, 4));
        buffer.fill_rect(IntRect::new(2, 2, 10, 10), Color::WHITE, CompositeOperator::SourceOver);
        assert_eq!(buffer.pixel(3, 3), Some([255, 255, 255, 255]));
        assert_eq!(buffer.pixel(1, 1), Some([0, 0, 0, 0]));
        assert_eq!(buffer.pixel(4, 4), None);
    }

    #[test]
    fn copy_operator_replaces_destination_alpha() {
        let mut buffer = PixelBuffer::new(IntSize::new(1, 1));
        buffer.clear(Color::WHITE);
        buffer.fill_rect(
            IntRect::new(0, 0, 1, 1),
            Color::TRANSPARENT_BLACK,
            CompositeOperator::Copy,
        );
        assert_eq!(buffer.pixel(0, 0), Some([0, 0, 0, 0]));
    }

    #[test]
    fn draw_buffer_scales_nearest_neighbour() {
        let mut source = PixelBuffer::new(IntSize::new(1, 1));
        source.clear(Color::rgba(0, 255, 0, 255));
        let mut target = PixelBuffer::new(IntSize::new(4, 4));
        target.draw_buffer(
            &source,
            FloatRect::new(0.0, 0.0, 2.0, 2.0),
            1.0,
            target.bounds(),
        );
        assert_eq!(target.pixel(1, 1), Some([0, 255, 0, 255]));
        assert_eq!(target.pixel(2, 2), Some([0, 0, 0, 0]));
    }

    #[test]
    fn empty_size_allocates_nothing() {
        let buffer = PixelBuffer::new(IntSize::new(-3, 4));
        assert!(buffer.bytes().is_empty());
        assert_eq!(buffer.stride(), 0);
    }
}
