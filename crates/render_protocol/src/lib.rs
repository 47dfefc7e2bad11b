mod pixels;

pub use pixels::{BYTES_PER_PIXEL, PixelBuffer};

slotmap::new_key_type! {
    pub struct ImageHandle;
}

/// Where a tile (or a whole layer) ends up rasterized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderingMode {
    /// GPU-texture-backed buffer, painted with a GL context current.
    Accelerated,
    /// CPU-backed pixel buffer.
    Unaccelerated,
}

impl RenderingMode {
    pub const fn is_accelerated(self) -> bool {
        matches!(self, RenderingMode::Accelerated)
    }

    pub const fn label(self) -> &'static str {
        match self {
            RenderingMode::Accelerated => "GPU",
            RenderingMode::Unaccelerated => "CPU",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositeOperator {
    SourceOver,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const TRANSPARENT_BLACK: Self = Self::rgba(0, 0, 0, 0);
    pub const BLACK: Self = Self::rgba(0, 0, 0, 255);
    pub const WHITE: Self = Self::rgba(255, 255, 255, 255);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn is_opaque(self) -> bool {
        self.a == 255
    }

    /// Premultiplied RGBA8 bytes.
    pub fn premultiplied(self) -> [u8; 4] {
        let alpha = self.a as u32;
        let scale = |channel: u8| ((channel as u32 * alpha + 127) / 255) as u8;
        [scale(self.r), scale(self.g), scale(self.b), self.a]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IntPoint {
    pub x: i32,
    pub y: i32,
}

impl IntPoint {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IntSize {
    pub width: i32,
    pub height: i32,
}

impl IntSize {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.width as u64 * self.height as u64
    }

    /// Scales and rounds up so the scaled size never loses a partial pixel.
    pub fn scaled(self, scale: f32) -> Self {
        Self {
            width: (self.width as f32 * scale).ceil() as i32,
            height: (self.height as f32 * scale).ceil() as i32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IntRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl IntRect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn from_size(size: IntSize) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub const fn location(self) -> IntPoint {
        IntPoint::new(self.x, self.y)
    }

    pub const fn size(self) -> IntSize {
        IntSize::new(self.width, self.height)
    }

    pub const fn max_x(self) -> i32 {
        self.x + self.width
    }

    pub const fn max_y(self) -> i32 {
        self.y + self.height
    }

    pub const fn is_empty(self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(self) -> u64 {
        self.size().area()
    }

    pub fn contains(self, other: IntRect) -> bool {
        other.is_empty()
            || (self.x <= other.x
                && self.y <= other.y
                && self.max_x() >= other.max_x()
                && self.max_y() >= other.max_y())
    }

    pub fn intersects(self, other: IntRect) -> bool {
        !self.intersection(other).is_empty()
    }

    pub fn intersection(self, other: IntRect) -> IntRect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let max_x = self.max_x().min(other.max_x());
        let max_y = self.max_y().min(other.max_y());
        if max_x <= x || max_y <= y {
            return IntRect::default();
        }
        IntRect::new(x, y, max_x - x, max_y - y)
    }

    pub fn union(self, other: IntRect) -> IntRect {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let max_x = self.max_x().max(other.max_x());
        let max_y = self.max_y().max(other.max_y());
        IntRect::new(x, y, max_x - x, max_y - y)
    }

    pub fn translated(self, dx: i32, dy: i32) -> IntRect {
        IntRect::new(self.x + dx, self.y + dy, self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FloatRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FloatRect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn max_x(self) -> f32 {
        self.x + self.width
    }

    pub fn max_y(self) -> f32 {
        self.y + self.height
    }

    pub fn is_empty(self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    pub fn scaled(self, scale: f32) -> FloatRect {
        FloatRect::new(
            self.x * scale,
            self.y * scale,
            self.width * scale,
            self.height * scale,
        )
    }

    pub fn translated(self, dx: f32, dy: f32) -> FloatRect {
        FloatRect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    pub fn intersection(self, other: FloatRect) -> FloatRect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let max_x = self.max_x().min(other.max_x());
        let max_y = self.max_y().min(other.max_y());
        if max_x <= x || max_y <= y {
            return FloatRect::default();
        }
        FloatRect::new(x, y, max_x - x, max_y - y)
    }

    /// Smallest integer rect covering every touched pixel.
    pub fn enclosing_int_rect(self) -> IntRect {
        if self.is_empty() {
            return IntRect::default();
        }
        let x = self.x.floor() as i32;
        let y = self.y.floor() as i32;
        let max_x = self.max_x().ceil() as i32;
        let max_y = self.max_y().ceil() as i32;
        IntRect::new(x, y, max_x - x, max_y - y)
    }
}

impl From<IntRect> for FloatRect {
    fn from(rect: IntRect) -> Self {
        FloatRect::new(
            rect.x as f32,
            rect.y as f32,
            rect.width as f32,
            rect.height as f32,
        )
    }
}
