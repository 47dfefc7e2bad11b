//! Layers shared between the thread that builds the layer tree and the compositing
//! thread.
//!
//! Each [`CoordinatedLayer`] has three parts, each behind its own lock:
//! the client state (properties, painter, backing store) touched only by the owning
//! thread, a pending commit filled by [`CoordinatedLayer::flush_layer_state`], and the
//! compositing target built from that commit by
//! [`CoordinatedLayer::flush_compositing_state`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use gpu_runtime::{GlContext, GlError};
use parking_lot::Mutex;
use render_protocol::{Color, FloatRect, IntRect, IntSize, PixelBuffer};
use scene::SceneLayer;
use smallvec::SmallVec;
use tiles::{
    LayerPainter, PaintingEngine, PaintingState, TileBuffer, TileCoordinate, TileUpdate,
    TiledBackingStore,
};
use view::ViewportTransform;

use crate::damage::Damage;
use crate::texture_mapper::TextureMapper;

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

impl LayerId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

pub type SharedPainter = Arc<dyn LayerPainter + Send + Sync>;

/// Linear translation between two offsets, applied on the compositing thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranslateAnimation {
    pub from: (f32, f32),
    pub to: (f32, f32),
    pub duration: Duration,
    /// Restart from `from` after every period instead of holding `to`.
    pub repeat: bool,
}

impl TranslateAnimation {
    /// Offset after `elapsed`, and whether the animation still runs.
    pub fn sample(&self, elapsed: Duration) -> ((f32, f32), bool) {
        if self.duration.is_zero() {
            return (self.to, false);
        }
        let progress = elapsed.as_secs_f32() / self.duration.as_secs_f32();
        let (progress, running) = if self.repeat {
            (progress.fract(), true)
        } else {
            (progress.min(1.0), progress < 1.0)
        };
        let lerp = |from: f32, to: f32| from + (to - from) * progress;
        (
            (lerp(self.from.0, self.to.0), lerp(self.from.1, self.to.1)),
            running,
        )
    }
}

#[derive(Clone)]
struct LayerProperties {
    position: (f32, f32),
    size: IntSize,
    opacity: f32,
    background_color: Option<Color>,
    contents_opaque: bool,
    children: Vec<Arc<CoordinatedLayer>>,
    animation: Option<TranslateAnimation>,
}

impl Default for LayerProperties {
    fn default() -> Self {
        Self {
            position: (0.0, 0.0),
            size: IntSize::default(),
            opacity: 1.0,
            background_color: None,
            contents_opaque: false,
            children: Vec::new(),
            animation: None,
        }
    }
}

struct ClientState {
    properties: LayerProperties,
    properties_changed: bool,
    painter: Option<SharedPainter>,
    backing_store: Option<TiledBackingStore>,
    detached: bool,
}

#[derive(Default)]
struct PendingCommit {
    properties: Option<LayerProperties>,
    tiles: Vec<TileUpdate>,
    /// The tile grid changed; every tile the target holds is stale.
    reset_tiles: bool,
    contents_scale: Option<f32>,
}

struct TargetTile {
    /// Device pixels within the layer.
    rect: IntRect,
    buffer: Arc<TileBuffer>,
}

struct LayerTarget {
    properties: LayerProperties,
    contents_scale: f32,
    tiles: BTreeMap<TileCoordinate, TargetTile>,
    /// Repainted areas in layer units.
    damage: SmallVec<[FloatRect; 4]>,
    full_damage: bool,
    animation_start: Option<Instant>,
    animated_offset: (f32, f32),
    /// Device bounds of the layer and its descendants when last painted.
    painted_bounds: Option<FloatRect>,
}

impl Default for LayerTarget {
    fn default() -> Self {
        Self {
            properties: LayerProperties::default(),
            contents_scale: 1.0,
            tiles: BTreeMap::new(),
            damage: SmallVec::new(),
            full_damage: true,
            animation_start: None,
            animated_offset: (0.0, 0.0),
            painted_bounds: None,
        }
    }
}

impl LayerTarget {
    fn origin(&self, parent: (f32, f32)) -> (f32, f32) {
        (
            parent.0 + self.properties.position.0 + self.animated_offset.0,
            parent.1 + self.properties.position.1 + self.animated_offset.1,
        )
    }

    fn bounds(&self, origin: (f32, f32)) -> FloatRect {
        FloatRect::new(
            origin.0,
            origin.1,
            self.properties.size.width as f32,
            self.properties.size.height as f32,
        )
    }
}

#[derive(Debug, thiserror::Error)]
enum TileConsumeError {
    #[error("tile painting failed")]
    PaintingFailed,
    #[error(transparent)]
    Gl(#[from] GlError),
}

/// What [`CoordinatedLayer::flush_layer_state`] produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerFlushOutcome {
    /// Something was queued for the compositing thread.
    pub committed: bool,
    /// Some tile could not be painted and is still dirty.
    pub retry_needed: bool,
}

/// Borrowed state of one compositing pass.
pub(crate) struct PaintContext<'a> {
    pub mapper: &'a mut TextureMapper,
    pub target: &'a mut PixelBuffer,
    pub transform: ViewportTransform,
}

pub struct CoordinatedLayer {
    id: LayerId,
    client: Mutex<ClientState>,
    pending: Mutex<PendingCommit>,
    target: Mutex<Option<LayerTarget>>,
    needs_full_repaint: AtomicBool,
}

impl CoordinatedLayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: LayerId(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed)),
            client: Mutex::new(ClientState {
                properties: LayerProperties::default(),
                properties_changed: true,
                painter: None,
                backing_store: None,
                detached: false,
            }),
            pending: Mutex::new(PendingCommit::default()),
            target: Mutex::new(None),
            needs_full_repaint: AtomicBool::new(false),
        })
    }

    pub fn layer_id(&self) -> LayerId {
        self.id
    }

    fn update_properties(&self, update: impl FnOnce(&mut LayerProperties) -> bool) {
        let mut client = self.client.lock();
        if client.detached {
            tracing::trace!(layer = ?self.id, "property change on a detached layer ignored");
            return;
        }
        if update(&mut client.properties) {
            client.properties_changed = true;
        }
    }

    pub fn set_position(&self, x: f32, y: f32) {
        self.update_properties(|properties| {
            let changed = properties.position != (x, y);
            properties.position = (x, y);
            changed
        });
    }

    /// Size in layer units.
    pub fn set_size(&self, size: IntSize) {
        self.update_properties(|properties| {
            let changed = properties.size != size;
            properties.size = size;
            changed
        });
    }

    pub fn set_opacity(&self, opacity: f32) {
        let opacity = opacity.clamp(0.0, 1.0);
        self.update_properties(|properties| {
            let changed = properties.opacity != opacity;
            properties.opacity = opacity;
            changed
        });
    }

    pub fn set_background_color(&self, color: Option<Color>) {
        self.update_properties(|properties| {
            let changed = properties.background_color != color;
            properties.background_color = color;
            changed
        });
    }

    pub fn set_contents_opaque(&self, opaque: bool) {
        let mut client = self.client.lock();
        if client.properties.contents_opaque != opaque {
            client.properties.contents_opaque = opaque;
            client.properties_changed = true;
            if let Some(store) = client.backing_store.as_mut() {
                store.invalidate_all();
            }
        }
    }

    pub fn set_children(&self, children: Vec<Arc<CoordinatedLayer>>) {
        debug_assert!(
            children.iter().all(|child| child.id != self.id),
            "layer is its own child"
        );
        self.update_properties(|properties| {
            let unchanged = properties.children.len() == children.len()
                && properties
                    .children
                    .iter()
                    .zip(&children)
                    .all(|(old, new)| Arc::ptr_eq(old, new));
            properties.children = children;
            !unchanged
        });
    }

    pub fn set_animation(&self, animation: Option<TranslateAnimation>) {
        self.update_properties(|properties| {
            let changed = properties.animation != animation;
            properties.animation = animation;
            changed
        });
    }

    /// Installs the content source. `None` makes the layer draw only its background.
    pub fn set_painter(&self, painter: Option<SharedPainter>) {
        let mut client = self.client.lock();
        if client.detached {
            return;
        }
        client.painter = painter;
        if let Some(store) = client.backing_store.as_mut() {
            store.invalidate_all();
        }
    }

    pub fn set_needs_display(&self) {
        if let Some(store) = self.client.lock().backing_store.as_mut() {
            store.invalidate_all();
        }
    }

    /// `rect` is in layer units.
    pub fn set_needs_display_in_rect(&self, rect: IntRect) {
        if let Some(store) = self.client.lock().backing_store.as_mut() {
            store.invalidate(rect);
        }
    }

    pub fn size(&self) -> IntSize {
        self.client.lock().properties.size
    }

    pub fn children(&self) -> Vec<Arc<CoordinatedLayer>> {
        self.client.lock().properties.children.clone()
    }

    pub fn draws_content(&self) -> bool {
        self.client.lock().painter.is_some()
    }

    /// Set by the compositing thread when it had to throw the layer's tiles away.
    pub fn needs_full_repaint(&self) -> bool {
        self.needs_full_repaint.load(Ordering::Acquire)
    }

    pub fn has_pending_commit(&self) -> bool {
        let pending = self.pending.lock();
        pending.properties.is_some() || !pending.tiles.is_empty() || pending.reset_tiles
    }

    /// Paints dirty tiles and queues property changes for the compositing thread.
    /// Owning thread only.
    pub fn flush_layer_state(
        &self,
        engine: &PaintingEngine,
        contents_scale: f32,
    ) -> LayerFlushOutcome {
        let mut guard = self.client.lock();
        let client = &mut *guard;
        if client.detached {
            return LayerFlushOutcome::default();
        }

        let size = client.properties.size;
        let opaque = client.properties.contents_opaque;
        let mut reset_tiles = false;
        let mut tiles = Vec::new();
        let mut retry_needed = false;

        match client.painter.as_ref() {
            Some(painter) if !size.is_empty() => {
                if client.backing_store.is_none() {
                    reset_tiles = true;
                }
                let store = client
                    .backing_store
                    .get_or_insert_with(|| TiledBackingStore::new(size, contents_scale));
                if self.needs_full_repaint.swap(false, Ordering::AcqRel) {
                    tracing::debug!(layer = ?self.id, "repainting layer after target loss");
                    store.invalidate_all();
                }
                if store.size() != size || store.scale() != contents_scale {
                    store.resize(size, contents_scale);
                    reset_tiles = true;
                }
                if store.has_dirty_tiles() {
                    let update = store.update(engine, painter.as_ref(), opaque);
                    tiles = update.tiles;
                    retry_needed = update.retry_needed;
                }
            }
            _ => {
                if client.backing_store.take().is_some() {
                    reset_tiles = true;
                }
            }
        }

        let properties = std::mem::take(&mut client.properties_changed)
            .then(|| client.properties.clone());
        if properties.is_none() && tiles.is_empty() && !reset_tiles {
            return LayerFlushOutcome {
                committed: false,
                retry_needed,
            };
        }

        let mut pending = self.pending.lock();
        if let Some(properties) = properties {
            pending.properties = Some(properties);
        }
        if reset_tiles {
            pending.reset_tiles = true;
            pending.tiles.clear();
        }
        tracing::trace!(layer = ?self.id, tiles = tiles.len(), "layer state flushed");
        pending.tiles.extend(tiles);
        pending.contents_scale = Some(contents_scale);
        LayerFlushOutcome {
            committed: true,
            retry_needed,
        }
    }

    /// Adopts the pending commit into the compositing target, waiting for every new tile
    /// to finish painting and for its producer fence. Compositing thread only.
    ///
    /// A tile that cannot be consumed drops all of the layer's tiles and flags the layer
    /// for a full repaint.
    pub fn flush_compositing_state(&self, context: &GlContext) {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut guard = self.target.lock();
        let target = guard.get_or_insert_with(LayerTarget::default);

        if let Some(properties) = pending.properties {
            if properties.animation != target.properties.animation {
                target.animation_start = None;
                target.animated_offset = (0.0, 0.0);
            }
            target.properties = properties;
            target.full_damage = true;
        }
        if pending.reset_tiles {
            target.tiles.clear();
            target.full_damage = true;
        }
        if let Some(scale) = pending.contents_scale {
            target.contents_scale = scale;
        }

        for update in pending.tiles {
            if let Err(error) = consume_tile(context, &update.buffer) {
                tracing::warn!(layer = ?self.id, tile = ?update.coordinate, %error, "layer target lost");
                target.tiles.clear();
                target.full_damage = true;
                self.needs_full_repaint.store(true, Ordering::Release);
                return;
            }
            target.damage.push(
                FloatRect::from(update.rect).scaled(1.0 / target.contents_scale),
            );
            target.tiles.insert(
                update.coordinate,
                TargetTile {
                    rect: update.rect,
                    buffer: update.buffer,
                },
            );
        }
    }

    /// Advances translation animations. Returns whether any in the subtree still runs.
    pub(crate) fn apply_animations(&self, now: Instant) -> bool {
        let (running, children) = {
            let mut guard = self.target.lock();
            let Some(target) = guard.as_mut() else {
                return false;
            };
            let running = match target.properties.animation {
                Some(animation) => {
                    let start = *target.animation_start.get_or_insert(now);
                    let (offset, running) = animation.sample(now.saturating_duration_since(start));
                    if offset != target.animated_offset {
                        target.animated_offset = offset;
                        target.full_damage = true;
                    }
                    running
                }
                None => false,
            };
            (running, target.properties.children.clone())
        };
        children
            .iter()
            .fold(running, |running, child| child.apply_animations(now) | running)
    }

    /// Adds what changed since the last paint, in device pixels. A moved or resized
    /// ancestor damages the whole subtree.
    pub(crate) fn collect_damage(
        &self,
        parent_origin: (f32, f32),
        transform: ViewportTransform,
        ancestor_changed: bool,
        damage: &mut Damage,
    ) {
        let (origin, changed, children) = {
            let mut guard = self.target.lock();
            let Some(target) = guard.as_mut() else {
                return;
            };
            let origin = target.origin(parent_origin);
            let changed = ancestor_changed || target.full_damage;
            if changed {
                if let Some(previous) = target.painted_bounds {
                    damage.add_float(previous);
                }
                damage.add_float(transform.map_rect(target.bounds(origin)));
            }
            for rect in target.damage.drain(..) {
                damage.add_float(transform.map_rect(rect.translated(origin.0, origin.1)));
            }
            target.full_damage = false;
            (origin, changed, target.properties.children.clone())
        };
        for child in &children {
            child.collect_damage(origin, transform, changed, damage);
        }
    }

    /// Draws the layer and its subtree. Returns the device bounds painted.
    pub(crate) fn paint(
        &self,
        context: &mut PaintContext<'_>,
        parent_origin: (f32, f32),
        parent_opacity: f32,
    ) -> Option<FloatRect> {
        let (origin, opacity, children, mut bounds) = {
            let guard = self.target.lock();
            let target = guard.as_ref()?;
            let origin = target.origin(parent_origin);
            let opacity = parent_opacity * target.properties.opacity;
            let bounds = context.transform.map_rect(target.bounds(origin));
            if opacity > 0.0 {
                if let Some(color) = target.properties.background_color {
                    context
                        .mapper
                        .draw_solid_color(context.target, bounds, color, opacity);
                }
                for tile in target.tiles.values() {
                    let destination = context.transform.map_rect(
                        FloatRect::from(tile.rect)
                            .scaled(1.0 / target.contents_scale)
                            .translated(origin.0, origin.1),
                    );
                    tile.buffer.with_pixels(|pixels| {
                        context
                            .mapper
                            .draw_texture(context.target, pixels, destination, opacity)
                    });
                }
            }
            (origin, opacity, target.properties.children.clone(), bounds)
        };

        for child in &children {
            if let Some(child_bounds) = child.paint(context, origin, opacity) {
                bounds = unite(bounds, child_bounds);
            }
        }
        if let Some(target) = self.target.lock().as_mut() {
            target.painted_bounds = Some(bounds);
        }
        Some(bounds)
    }

    pub fn has_target(&self) -> bool {
        self.target.lock().is_some()
    }

    pub fn target_tile_count(&self) -> usize {
        self.target
            .lock()
            .as_ref()
            .map_or(0, |target| target.tiles.len())
    }
}

fn consume_tile(context: &GlContext, buffer: &TileBuffer) -> Result<(), TileConsumeError> {
    if buffer.wait_until_painting_complete() != PaintingState::Complete {
        return Err(TileConsumeError::PaintingFailed);
    }
    if let Some(fence) = buffer.fence() {
        context.server_wait(&fence)?;
    }
    Ok(())
}

fn unite(a: FloatRect, b: FloatRect) -> FloatRect {
    if a.is_empty() {
        return b;
    }
    if b.is_empty() {
        return a;
    }
    let x = a.x.min(b.x);
    let y = a.y.min(b.y);
    FloatRect::new(x, y, a.max_x().max(b.max_x()) - x, a.max_y().max(b.max_y()) - y)
}

impl SceneLayer for CoordinatedLayer {
    type Id = LayerId;

    fn id(&self) -> LayerId {
        self.id
    }

    fn invalidate_target(&self) {
        if self.target.lock().take().is_some() {
            tracing::trace!(layer = ?self.id, "layer target released");
        }
    }

    fn invalidate_client(&self) {
        let mut client = self.client.lock();
        client.detached = true;
        client.painter = None;
        client.backing_store = None;
        client.properties.children.clear();
        drop(client);
        *self.pending.lock() = PendingCommit::default();
    }

    fn wait_until_painting_complete(&self) {
        let buffers: Vec<Arc<TileBuffer>> = self
            .pending
            .lock()
            .tiles
            .iter()
            .map(|tile| tile.buffer.clone())
            .collect();
        for buffer in buffers {
            buffer.wait_until_painting_complete();
        }
    }
}

impl std::fmt::Debug for CoordinatedLayer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CoordinatedLayer")
            .field("id", &self.id)
            .field("has_target", &self.has_target())
            .finish()
    }
}
