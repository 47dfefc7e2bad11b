//! Hand-off of the set of layers to composite between the thread that mutates the layer
//! tree and the compositing thread.
//!
//! Three generations exist: the live set owned by [`SceneState`], a pending snapshot
//! taken by [`SceneState::flush`], and the committed set owned by [`SceneCommitter`],
//! which adopts the pending snapshot once per frame.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

/// A layer as seen by the scene. Layers are shared between threads; the two invalidation
/// hooks release the resources owned by each side.
pub trait SceneLayer: Send + Sync + 'static {
    type Id: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn id(&self) -> Self::Id;

    /// Releases the compositing side render target. Compositing thread only.
    fn invalidate_target(&self);

    /// Detaches the layer from its client. Owning thread only.
    fn invalidate_client(&self);

    /// Blocks until every tile queued for this layer has been painted.
    fn wait_until_painting_complete(&self) {}
}

/// One generation of the layer set.
pub struct SceneSnapshot<L: SceneLayer> {
    layers: HashMap<L::Id, Arc<L>>,
    root_children: Vec<Arc<L>>,
}

impl<L: SceneLayer> SceneSnapshot<L> {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn contains(&self, id: L::Id) -> bool {
        self.layers.contains_key(&id)
    }

    pub fn get(&self, id: L::Id) -> Option<&Arc<L>> {
        self.layers.get(&id)
    }

    pub fn layers(&self) -> impl Iterator<Item = &Arc<L>> + '_ {
        self.layers.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = L::Id> + '_ {
        self.layers.keys().copied()
    }

    /// Top-level composition order.
    pub fn root_children(&self) -> &[Arc<L>] {
        &self.root_children
    }
}

impl<L: SceneLayer> Default for SceneSnapshot<L> {
    fn default() -> Self {
        Self {
            layers: HashMap::new(),
            root_children: Vec::new(),
        }
    }
}

impl<L: SceneLayer> Clone for SceneSnapshot<L> {
    fn clone(&self) -> Self {
        Self {
            layers: self.layers.clone(),
            root_children: self.root_children.clone(),
        }
    }
}

impl<L: SceneLayer> Debug for SceneSnapshot<L> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SceneSnapshot")
            .field("layers", &self.layers.keys().collect::<Vec<_>>())
            .field(
                "root_children",
                &self.root_children.iter().map(|layer| layer.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

struct SceneShared<L: SceneLayer> {
    root: Arc<L>,
    pending: Mutex<Option<SceneSnapshot<L>>>,
}

/// Creates the two halves of a scene around `root`, which is never part of the layer set
/// itself and lives as long as the scene.
pub fn scene_state<L: SceneLayer>(root: Arc<L>) -> (SceneState<L>, SceneCommitter<L>) {
    let shared = Arc::new(SceneShared {
        root,
        pending: Mutex::new(None),
    });
    (
        SceneState {
            live: SceneSnapshot::default(),
            did_change_layers: false,
            shared: shared.clone(),
        },
        SceneCommitter {
            committed: SceneSnapshot::default(),
            shared,
        },
    )
}

/// The live layer set, mutated by the owning thread.
pub struct SceneState<L: SceneLayer> {
    live: SceneSnapshot<L>,
    did_change_layers: bool,
    shared: Arc<SceneShared<L>>,
}

impl<L: SceneLayer> SceneState<L> {
    pub fn root(&self) -> &Arc<L> {
        &self.shared.root
    }

    pub fn add_layer(&mut self, layer: Arc<L>) {
        let id = layer.id();
        let previous = self.live.layers.insert(id, layer);
        debug_assert!(previous.is_none(), "layer {id:?} added twice");
        self.did_change_layers = true;
    }

    pub fn remove_layer(&mut self, id: L::Id) {
        let removed = self.live.layers.remove(&id);
        debug_assert!(removed.is_some(), "layer {id:?} removed but never added");
        if removed.is_some() {
            self.live.root_children.retain(|child| child.id() != id);
            self.did_change_layers = true;
        }
    }

    pub fn set_root_children(&mut self, children: Vec<Arc<L>>) {
        let unchanged = children.len() == self.live.root_children.len()
            && children
                .iter()
                .zip(&self.live.root_children)
                .all(|(new, old)| Arc::ptr_eq(new, old));
        if unchanged {
            return;
        }
        self.live.root_children = children;
        self.did_change_layers = true;
    }

    /// Marks the live set changed without touching its membership, e.g. after a layer's
    /// own state was updated.
    pub fn layers_did_change(&mut self) {
        self.did_change_layers = true;
    }

    pub fn layer(&self, id: L::Id) -> Option<&Arc<L>> {
        self.live.get(id)
    }

    pub fn layers(&self) -> &SceneSnapshot<L> {
        &self.live
    }

    /// Publishes a copy of the live set for the compositing thread. Returns `false`,
    /// leaving the pending snapshot untouched, when nothing changed since the last flush.
    pub fn flush(&mut self) -> bool {
        if !std::mem::take(&mut self.did_change_layers) {
            return false;
        }
        *self.shared.pending.lock() = Some(self.live.clone());
        tracing::trace!(layers = self.live.len(), "scene flushed");
        true
    }

    pub fn wait_until_painting_complete(&self) {
        self.shared.root.wait_until_painting_complete();
        for layer in self.live.layers() {
            layer.wait_until_painting_complete();
        }
    }

    /// Teardown of the owning side: drops the pending snapshot and detaches every live
    /// layer from its client.
    pub fn invalidate(&mut self) {
        self.shared.root.invalidate_client();
        self.shared.pending.lock().take();
        for layer in self.live.layers() {
            layer.invalidate_client();
        }
        self.live = SceneSnapshot::default();
        self.did_change_layers = false;
    }
}

/// The committed layer set, owned by the compositing thread.
pub struct SceneCommitter<L: SceneLayer> {
    committed: SceneSnapshot<L>,
    shared: Arc<SceneShared<L>>,
}

impl<L: SceneLayer> SceneCommitter<L> {
    pub fn root(&self) -> &Arc<L> {
        &self.shared.root
    }

    pub fn has_pending(&self) -> bool {
        self.shared.pending.lock().is_some()
    }

    /// Adopts the pending snapshot, if any, invalidating the targets of layers it no
    /// longer contains, and returns the committed set.
    pub fn committed_layers(&mut self) -> &SceneSnapshot<L> {
        let pending = self.shared.pending.lock().take();
        if let Some(pending) = pending {
            for (id, layer) in &self.committed.layers {
                if !pending.layers.contains_key(id) {
                    layer.invalidate_target();
                }
            }
            self.committed = pending;
        }
        &self.committed
    }

    /// The committed set as of the last [`Self::committed_layers`] call.
    pub fn current(&self) -> &SceneSnapshot<L> {
        &self.committed
    }

    /// Teardown of the compositing side.
    pub fn invalidate_committed_layers(&mut self) {
        self.shared.root.invalidate_target();
        for layer in self.committed.layers() {
            layer.invalidate_target();
        }
        self.committed = SceneSnapshot::default();
    }
}

impl<L: SceneLayer> Debug for SceneCommitter<L> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SceneCommitter")
            .field("committed", &self.committed)
            .finish()
    }
}
