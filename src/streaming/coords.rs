//! Tile grid coordinates and storage paths

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::types::{Vec2, Vec3};

/// File extension for tile files
pub const TILE_FILE_EXTENSION: &str = "sct";

/// Integer address of a square tile on the ground plane.
///
/// `x` runs along world X and `z` along world Z; Y is up and never partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoords {
    pub x: i32,
    pub z: i32,
}

impl TileCoords {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Tile containing a stream-space position
    pub fn from_position(pos: Vec3, tile_width: f32) -> Self {
        Self {
            x: (pos.x / tile_width).floor() as i32,
            z: (pos.z / tile_width).floor() as i32,
        }
    }

    /// Ground-plane centre of the tile
    pub fn center(&self, tile_width: f32) -> Vec2 {
        Vec2::new(
            (self.x as f32 + 0.5) * tile_width,
            (self.z as f32 + 0.5) * tile_width,
        )
    }

    /// Ground-plane corner with the smallest coordinates
    pub fn origin(&self, tile_width: f32) -> Vec2 {
        Vec2::new(self.x as f32 * tile_width, self.z as f32 * tile_width)
    }

    /// Offset by a number of tiles, saturating at the edge of the grid
    pub fn offset(&self, dx: i32, dz: i32) -> Self {
        Self::new(self.x.saturating_add(dx), self.z.saturating_add(dz))
    }
}

impl fmt::Display for TileCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// Directory holding every tile file for one stream
pub fn stream_dir(storage_dir: &Path, stream_id: &str) -> PathBuf {
    storage_dir.join(stream_id)
}

/// Get the file path for a tile
///
/// Format: `storage_dir/<stream_id>/tile_{x}_{z}.sct`
pub fn tile_path(storage_dir: &Path, stream_id: &str, coords: TileCoords) -> PathBuf {
    stream_dir(storage_dir, stream_id)
        .join(format!("tile_{}_{}.{}", coords.x, coords.z, TILE_FILE_EXTENSION))
}
