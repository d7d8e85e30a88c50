//! Backend capability trait

use crate::core::types::{Mat4, Vec4};
use crate::streaming::coords::TileCoords;
use crate::streaming::instance::ResidentTile;

/// Receives tile content as the streamer loads and evicts it.
///
/// Callbacks arrive from tokio worker threads, so implementations use
/// interior mutability.
pub trait TileBackend: Send + Sync {
    /// One decoded instance of a tile being loaded
    fn on_instance_added(&self, coords: TileCoords, preset: i32, local_to_stream: Mat4, colour: Vec4);

    /// A tile was unloaded; drop everything created for it
    fn on_tile_destroyed(&self, coords: TileCoords);

    /// Tiles this backend currently holds a representation for
    fn loaded_coords(&self) -> Vec<TileCoords>;

    /// A resident tile's content was edited. Default rebuilds it from scratch.
    fn on_tile_changed(&self, coords: TileCoords, tile: &ResidentTile) {
        self.on_tile_destroyed(coords);
        for instance in tile.iter() {
            self.on_instance_added(coords, instance.preset, instance.local_to_stream(), instance.colour);
        }
    }
}

/// Backend that draws nothing, for headless streams and tools
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl TileBackend for NullBackend {
    fn on_instance_added(&self, _coords: TileCoords, _preset: i32, _local_to_stream: Mat4, _colour: Vec4) {}

    fn on_tile_destroyed(&self, _coords: TileCoords) {}

    fn loaded_coords(&self) -> Vec<TileCoords> {
        Vec::new()
    }
}
