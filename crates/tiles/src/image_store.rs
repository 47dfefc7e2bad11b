use std::sync::Arc;

use gpu_runtime::{Fence, FenceKind};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use render_protocol::{ImageHandle, IntSize, PixelBuffer};
use slotmap::SlotMap;

/// A GPU-resident image that tiles may draw, possibly still being produced elsewhere.
#[derive(Debug)]
pub struct GpuImage {
    pixels: RwLock<PixelBuffer>,
    producer_fence: Mutex<Option<Fence>>,
}

impl GpuImage {
    pub fn new(pixels: PixelBuffer) -> Self {
        Self {
            pixels: RwLock::new(pixels),
            producer_fence: Mutex::new(None),
        }
    }

    pub fn size(&self) -> IntSize {
        self.pixels.read().size()
    }

    /// Starts a new producer pass. The returned fence must be signaled once the producer's
    /// writes are finished; recordings made from now on depend on it.
    pub fn begin_production(&self) -> Fence {
        let fence = Fence::new(FenceKind::GpuSync);
        *self.producer_fence.lock() = Some(fence.clone());
        fence
    }

    /// Fence of the most recent producer, if any.
    pub fn current_fence(&self) -> Option<Fence> {
        self.producer_fence.lock().clone()
    }

    pub fn write(&self, f: impl FnOnce(&mut PixelBuffer)) {
        f(&mut self.pixels.write());
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PixelBuffer> {
        self.pixels.read()
    }
}

/// Images addressable from display lists, shared by the recording and replaying threads.
#[derive(Debug, Default)]
pub struct ImageStore {
    images: RwLock<SlotMap<ImageHandle, Arc<GpuImage>>>,
}

impl ImageStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, pixels: PixelBuffer) -> ImageHandle {
        self.images.write().insert(Arc::new(GpuImage::new(pixels)))
    }

    pub fn get(&self, handle: ImageHandle) -> Option<Arc<GpuImage>> {
        self.images.read().get(handle).cloned()
    }

    /// Display lists recorded earlier keep their own reference to the image.
    pub fn remove(&self, handle: ImageHandle) -> bool {
        self.images.write().remove(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.images.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_protocol::Color;

    #[test]
    fn producer_fence_tracks_latest_pass() {
        let store = ImageStore::new();
        let handle = store.insert(PixelBuffer::new(IntSize::new(2, 2)));
        let image = store.get(handle).unwrap();
        assert!(image.current_fence().is_none());

        let first = image.begin_production();
        let second = image.begin_production();
        assert_ne!(first.id(), second.id());
        assert_eq!(image.current_fence().map(|fence| fence.id()), Some(second.id()));

        image.write(|pixels| pixels.clear(Color::BLACK));
        second.signal();
        assert!(image.current_fence().is_some_and(|fence| fence.is_signaled()));
        assert_eq!(image.read().pixel(1, 1), Some([0, 0, 0, 255]));
    }

    #[test]
    fn removed_image_outlives_store_entry_while_referenced() {
        let store = ImageStore::new();
        let handle = store.insert(PixelBuffer::new(IntSize::new(1, 1)));
        let image = store.get(handle).unwrap();
        assert!(store.remove(handle));
        assert!(store.get(handle).is_none());
        assert!(store.is_empty());
        assert_eq!(image.size(), IntSize::new(1, 1));
    }
}
