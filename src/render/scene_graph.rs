//! Scene-graph backend: one parent node per tile with a child per instance.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::types::{Affine3A, Mat4, Vec4};
use crate::render::backend::TileBackend;
use crate::streaming::coords::TileCoords;

/// Child node for one placed instance.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceNode {
    pub preset: i32,
    /// Transform relative to the stream root
    pub local: Mat4,
    pub colour: Vec4,
}

#[derive(Default)]
struct SceneState {
    root: Mat4,
    tiles: HashMap<TileCoords, Vec<InstanceNode>>,
}

/// CPU-side hierarchy: stream root → tile nodes → instance nodes.
pub struct SceneGraphBackend {
    state: Mutex<SceneState>,
}

impl SceneGraphBackend {
    /// Create a graph whose root carries the stream-to-world transform.
    pub fn new(stream_to_world: Affine3A) -> Self {
        Self {
            state: Mutex::new(SceneState {
                root: Mat4::from(stream_to_world),
                tiles: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SceneState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move the stream root, e.g. on a floating-origin shift.
    pub fn set_root_transform(&self, stream_to_world: Affine3A) {
        self.state().root = Mat4::from(stream_to_world);
    }

    /// Tile nodes plus instance nodes (the root is not counted)
    pub fn node_count(&self) -> usize {
        let state = self.state();
        state.tiles.len() + state.tiles.values().map(Vec::len).sum::<usize>()
    }

    /// Children of a tile node
    pub fn children(&self, coords: TileCoords) -> Vec<InstanceNode> {
        self.state().tiles.get(&coords).cloned().unwrap_or_default()
    }

    /// World transform of the `index`th instance of a tile
    pub fn world_transform(&self, coords: TileCoords, index: usize) -> Option<Mat4> {
        let state = self.state();
        let node = state.tiles.get(&coords)?.get(index)?;
        Some(state.root * node.local)
    }
}

impl Default for SceneGraphBackend {
    fn default() -> Self {
        Self::new(Affine3A::IDENTITY)
    }
}

impl TileBackend for SceneGraphBackend {
    fn on_instance_added(&self, coords: TileCoords, preset: i32, local_to_stream: Mat4, colour: Vec4) {
        self.state().tiles.entry(coords).or_default().push(InstanceNode {
            preset,
            local: local_to_stream,
            colour,
        });
    }

    fn on_tile_destroyed(&self, coords: TileCoords) {
        if let Some(children) = self.state().tiles.remove(&coords) {
            log::trace!("Scene graph removed tile {} with {} children", coords, children.len());
        }
    }

    fn loaded_coords(&self) -> Vec<TileCoords> {
        self.state().tiles.keys().copied().collect()
    }
}
