//! Shared per-stream state
//!
//! Everything a streaming pass, a flush pass or a single tile load needs lives
//! in one [`StreamShared`] behind an `Arc`, so spawned tasks can own it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::time::FrameClock;
use crate::core::types::{Affine3A, Vec3};
use crate::render::TileBackend;
use crate::streaming::budget::{EncodeBudget, FrameLoadBudget};
use crate::streaming::config::StreamConfig;
use crate::streaming::coords::{self, TileCoords};
use crate::streaming::hooks::{LoadCompleteHook, PreloadHook};
use crate::streaming::instance::ResidentTile;
use crate::streaming::lock::ContentLock;
use crate::streaming::stats::StreamStats;

/// The tile collections of one stream.
///
/// Invariants: a coordinate is never both in `loaded` and `being_streamed_in`,
/// `attempted_and_missing` never overlaps `loaded`, and `rejected` is a subset
/// of `attempted_and_missing`.
#[derive(Default)]
pub struct TileSets {
    /// Replaced wholesale by each streaming pass
    pub in_range: Arc<HashSet<TileCoords>>,
    pub loaded: HashMap<TileCoords, ResidentTile>,
    pub being_streamed_in: HashSet<TileCoords>,
    /// Tiles whose last load attempt produced nothing, so storage is not hit every frame
    pub attempted_and_missing: HashSet<TileCoords>,
    /// Memoized tiles that may still have content somewhere: the file was
    /// unreadable or too new, or the pre-load hook vetoed it. Never overwritten
    /// by an edit.
    pub rejected: HashSet<TileCoords>,
    pub dirty: HashSet<TileCoords>,
}

impl TileSets {
    /// Memoize a failed load attempt.
    ///
    /// `has_file` is false only when storage positively reported no file.
    pub fn memoize_missing(&mut self, coords: TileCoords, has_file: bool) {
        self.attempted_and_missing.insert(coords);
        if has_file {
            self.rejected.insert(coords);
        } else {
            self.rejected.remove(&coords);
        }
    }

    /// Drop any memoized load outcome for a tile
    pub fn forget_missing(&mut self, coords: &TileCoords) {
        self.attempted_and_missing.remove(coords);
        self.rejected.remove(coords);
    }

    /// Whether the tile is known to have no backing file at all
    pub fn is_known_empty(&self, coords: &TileCoords) -> bool {
        self.attempted_and_missing.contains(coords) && !self.rejected.contains(coords)
    }

    /// Mark a tile as having unflushed changes.
    ///
    /// Also drops any stale memo so the coming write is not masked.
    pub fn mark_dirty(&mut self, coords: TileCoords) {
        self.dirty.insert(coords);
        self.forget_missing(&coords);
    }

    /// Whether the loader should start a load for this tile
    pub fn needs_load(&self, coords: &TileCoords) -> bool {
        !self.loaded.contains_key(coords)
            && !self.being_streamed_in.contains(coords)
            && !self.attempted_and_missing.contains(coords)
    }

    /// Drop memoized outcomes for tiles outside the current range
    pub fn prune_memo(&mut self) -> usize {
        let in_range = self.in_range.clone();
        let before = self.attempted_and_missing.len();
        self.attempted_and_missing.retain(|c| in_range.contains(c));
        self.rejected.retain(|c| in_range.contains(c));
        before - self.attempted_and_missing.len()
    }
}

pub struct StreamShared {
    pub id: String,
    pub config: StreamConfig,
    pub clock: FrameClock,
    pub lock: ContentLock,
    pub load_budget: FrameLoadBudget,
    pub backend: Arc<dyn TileBackend>,
    pub preload_hook: Option<PreloadHook>,
    pub on_load_complete: Option<LoadCompleteHook>,
    pub tiles: Mutex<TileSets>,
    pub stats: Mutex<StreamStats>,
    /// Stream-to-world transform
    pub transform: Mutex<Affine3A>,
    /// Viewpoint (stream space) used by the last completed pass
    pub last_pass_position: Mutex<Option<Vec3>>,
    pub initialized: AtomicBool,
    pub pass_in_progress: AtomicBool,
}

impl StreamShared {
    pub fn tiles(&self) -> MutexGuard<'_, TileSets> {
        self.tiles.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> MutexGuard<'_, StreamStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tile_path(&self, coords: TileCoords) -> PathBuf {
        coords::tile_path(&self.config.storage_dir, &self.id, coords)
    }

    pub fn stream_dir(&self) -> PathBuf {
        coords::stream_dir(&self.config.storage_dir, &self.id)
    }

    pub fn encode_budget(&self) -> EncodeBudget {
        EncodeBudget::new(self.config.max_encode_time(), self.config.max_encode_items_per_frame)
    }

    /// Convert a world-space point into stream space
    pub fn world_to_stream(&self, world: Vec3) -> Vec3 {
        let transform = *self.transform.lock().unwrap_or_else(|e| e.into_inner());
        transform.inverse().transform_point3(world)
    }
}
