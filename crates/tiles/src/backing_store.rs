use std::sync::Arc;

use bitvec::prelude::{BitVec, Lsb0};
use render_protocol::{FloatRect, IntRect, IntSize};
use static_assertions::const_assert;

use crate::buffer::TileBuffer;
use crate::engine::PaintingEngine;
use crate::recording::LayerPainter;

/// Edge of a backing store tile in device pixels.
pub const TILE_SIZE: u32 = 256;
const_assert!(TILE_SIZE.is_power_of_two());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoordinate {
    pub x: u32,
    pub y: u32,
}

impl TileCoordinate {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TileDirtyBitset {
    tiles_per_row: u32,
    tiles_per_column: u32,
    bits: BitVec<usize, Lsb0>,
    dirty_count: usize,
}

impl TileDirtyBitset {
    fn new(tiles_per_row: u32, tiles_per_column: u32) -> Self {
        let tile_count = tiles_per_row as usize * tiles_per_column as usize;
        Self {
            tiles_per_row,
            tiles_per_column,
            bits: BitVec::repeat(false, tile_count),
            dirty_count: 0,
        }
    }

    fn index(&self, tile: TileCoordinate) -> Option<usize> {
        (tile.x < self.tiles_per_row && tile.y < self.tiles_per_column)
            .then(|| tile.y as usize * self.tiles_per_row as usize + tile.x as usize)
    }

    fn is_set(&self, tile: TileCoordinate) -> bool {
        self.index(tile)
            .and_then(|index| self.bits.get(index).map(|bit| *bit))
            .unwrap_or(false)
    }

    fn assign(&mut self, tile: TileCoordinate, dirty: bool) {
        let Some(index) = self.index(tile) else {
            return;
        };
        let Some(mut slot) = self.bits.get_mut(index) else {
            return;
        };
        if *slot != dirty {
            *slot = dirty;
            if dirty {
                self.dirty_count += 1;
            } else {
                self.dirty_count -= 1;
            }
        }
    }

    fn set_all(&mut self) {
        self.bits.fill(true);
        self.dirty_count = self.bits.len();
    }

    fn iter_dirty_tiles(&self) -> impl Iterator<Item = TileCoordinate> + '_ {
        let tiles_per_row = self.tiles_per_row as usize;
        self.bits.iter_ones().map(move |index| {
            TileCoordinate::new((index % tiles_per_row) as u32, (index / tiles_per_row) as u32)
        })
    }
}

/// One tile repainted by [`TiledBackingStore::update`]. The buffer may still be painting.
#[derive(Debug)]
pub struct TileUpdate {
    pub coordinate: TileCoordinate,
    /// Tile bounds in device pixels.
    pub rect: IntRect,
    pub buffer: Arc<TileBuffer>,
}

#[derive(Debug, Default)]
pub struct BackingStoreUpdate {
    pub tiles: Vec<TileUpdate>,
    /// Some tile could not get a buffer and is still dirty.
    pub retry_needed: bool,
}

/// Grid of fixed-size tiles covering a layer at a given contents scale, tracking which
/// tiles must be repainted.
#[derive(Debug, Clone)]
pub struct TiledBackingStore {
    size: IntSize,
    scale: f32,
    scaled_size: IntSize,
    dirty: TileDirtyBitset,
}

impl TiledBackingStore {
    /// `size` is in layer units. Every tile starts dirty.
    pub fn new(size: IntSize, scale: f32) -> Self {
        let mut store = Self {
            size: IntSize::default(),
            scale: 1.0,
            scaled_size: IntSize::default(),
            dirty: TileDirtyBitset::new(0, 0),
        };
        store.resize(size, scale);
        store
    }

    pub fn size(&self) -> IntSize {
        self.size
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn tiles_per_row(&self) -> u32 {
        self.dirty.tiles_per_row
    }

    pub fn tiles_per_column(&self) -> u32 {
        self.dirty.tiles_per_column
    }

    /// Rebuilds the grid. A change of size or scale invalidates everything.
    pub fn resize(&mut self, size: IntSize, scale: f32) {
        if size == self.size && scale == self.scale && !self.dirty.bits.is_empty() {
            return;
        }
        let scale = if scale > 0.0 { scale } else { 1.0 };
        self.size = size;
        self.scale = scale;
        self.scaled_size = size.scaled(scale);
        let width = self.scaled_size.width.max(0) as u32;
        let height = self.scaled_size.height.max(0) as u32;
        self.dirty = TileDirtyBitset::new(width.div_ceil(TILE_SIZE), height.div_ceil(TILE_SIZE));
        self.dirty.set_all();
    }

    /// Device pixel bounds of `tile`, clipped to the layer.
    pub fn tile_rect(&self, tile: TileCoordinate) -> IntRect {
        let rect = IntRect::new(
            (tile.x * TILE_SIZE) as i32,
            (tile.y * TILE_SIZE) as i32,
            TILE_SIZE as i32,
            TILE_SIZE as i32,
        );
        rect.intersection(IntRect::from_size(self.scaled_size))
    }

    /// Marks every tile touching `rect` (layer units) dirty.
    pub fn invalidate(&mut self, rect: IntRect) {
        let scaled = FloatRect::from(rect)
            .scaled(self.scale)
            .enclosing_int_rect()
            .intersection(IntRect::from_size(self.scaled_size));
        if scaled.is_empty() {
            return;
        }
        let tile = TILE_SIZE as i32;
        for y in scaled.y / tile..=(scaled.max_y() - 1) / tile {
            for x in scaled.x / tile..=(scaled.max_x() - 1) / tile {
                self.dirty.assign(TileCoordinate::new(x as u32, y as u32), true);
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        self.dirty.set_all();
    }

    pub fn is_dirty(&self, tile: TileCoordinate) -> bool {
        self.dirty.is_set(tile)
    }

    pub fn dirty_tile_count(&self) -> usize {
        self.dirty.dirty_count
    }

    pub fn has_dirty_tiles(&self) -> bool {
        self.dirty.dirty_count > 0
    }

    /// Repaints every dirty tile through `engine`, recording and replaying on the worker
    /// pools when threaded rendering is enabled. Tiles whose buffer cannot be allocated
    /// stay dirty.
    pub fn update(
        &mut self,
        engine: &PaintingEngine,
        painter: &dyn LayerPainter,
        opaque: bool,
    ) -> BackingStoreUpdate {
        let mut update = BackingStoreUpdate::default();
        let dirty: Vec<TileCoordinate> = self.dirty.iter_dirty_tiles().collect();
        for coordinate in dirty {
            let rect = self.tile_rect(coordinate);
            if rect.is_empty() {
                self.dirty.assign(coordinate, false);
                continue;
            }
            let result = if engine.use_threaded_rendering() {
                let tile = engine.record(painter, rect, opaque, self.scale);
                engine.replay(tile, rect)
            } else {
                engine.paint(painter, rect, opaque, self.scale)
            };
            match result {
                Ok(buffer) => {
                    self.dirty.assign(coordinate, false);
                    update.tiles.push(TileUpdate {
                        coordinate,
                        rect,
                        buffer,
                    });
                }
                Err(error) => {
                    tracing::debug!(?coordinate, %error, "tile left dirty for retry");
                    update.retry_needed = true;
                }
            }
        }
        update
    }
}
