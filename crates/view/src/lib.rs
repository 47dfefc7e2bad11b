use render_protocol::{FloatRect, IntRect, IntSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ViewTransformError {
    #[error("scale must be finite and positive")]
    InvalidScale,
    #[error("viewport must have a positive size")]
    InvalidViewport,
}

/// Uniform scale mapping scene coordinates to device pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportTransform {
    scale: f32,
}

impl Default for ViewportTransform {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

impl ViewportTransform {
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn map_rect(&self, rect: FloatRect) -> FloatRect {
        rect.scaled(self.scale)
    }
}

/// Viewport state read by the compositing thread at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneAttributes {
    /// Size in CSS pixels.
    pub viewport_size: IntSize,
    pub device_scale_factor: f32,
}

impl Default for SceneAttributes {
    fn default() -> Self {
        Self {
            viewport_size: IntSize::default(),
            device_scale_factor: 1.0,
        }
    }
}

impl SceneAttributes {
    pub fn new(
        viewport_size: IntSize,
        device_scale_factor: f32,
    ) -> Result<Self, ViewTransformError> {
        if !device_scale_factor.is_finite() || device_scale_factor <= 0.0 {
            return Err(ViewTransformError::InvalidScale);
        }
        if viewport_size.width < 0 || viewport_size.height < 0 {
            return Err(ViewTransformError::InvalidViewport);
        }
        Ok(Self {
            viewport_size,
            device_scale_factor,
        })
    }

    /// Backbuffer size in device pixels.
    pub fn device_size(&self) -> IntSize {
        self.viewport_size.scaled(self.device_scale_factor)
    }

    pub fn device_rect(&self) -> IntRect {
        IntRect::from_size(self.device_size())
    }

    pub fn is_empty(&self) -> bool {
        self.viewport_size.is_empty()
    }

    pub fn viewport_transform(&self) -> ViewportTransform {
        ViewportTransform {
            scale: self.device_scale_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_attributes() {
        assert_eq!(
            SceneAttributes::new(IntSize::new(10, 10), 0.0),
            Err(ViewTransformError::InvalidScale)
        );
        assert_eq!(
            SceneAttributes::new(IntSize::new(10, 10), f32::NAN),
            Err(ViewTransformError::InvalidScale)
        );
        assert_eq!(
            SceneAttributes::new(IntSize::new(-1, 10), 1.0),
            Err(ViewTransformError::InvalidViewport)
        );
    }

    #[test]
    fn viewport_transform_scales_scene_rects_to_device_pixels() {
        let attributes = SceneAttributes::new(IntSize::new(100, 50), 2.0).unwrap();
        let mapped = attributes
            .viewport_transform()
            .map_rect(FloatRect::new(3.0, 4.0, 10.0, 5.0));
        assert_eq!(mapped, FloatRect::new(6.0, 8.0, 20.0, 10.0));
        let identity = ViewportTransform::default().map_rect(FloatRect::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(identity, FloatRect::new(1.0, 2.0, 3.0, 4.0));
    }

    #[test]
    fn device_size_follows_scale_factor() {
        let attributes = SceneAttributes::new(IntSize::new(801, 600), 1.5).unwrap();
        assert_eq!(attributes.device_size(), IntSize::new(1202, 900));
        assert_eq!(attributes.viewport_transform().scale(), 1.5);
        assert!(SceneAttributes::default().is_empty());
    }
}
