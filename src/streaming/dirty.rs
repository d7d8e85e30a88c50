//! Dirty tile processor: writes tiles with unsaved changes back to storage.

use std::io;

use crate::core::types::Result;
use crate::streaming::budget::EncodeBudget;
use crate::streaming::codec::encode_tile_budgeted;
use crate::streaming::coords::TileCoords;
use crate::streaming::lock::ContentGuard;
use crate::streaming::state::StreamShared;

/// What happened to one dirty tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileFlush {
    /// File rewritten with this many instances
    Written { instances: usize },
    /// Tile became empty; its file was removed and nothing written
    Removed,
    /// Tile was marked dirty without being resident; nothing saved
    NotLoaded,
}

/// Outcome counts of one flush pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub written: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Persist every dirty tile that is not currently being streamed in.
///
/// The caller proves ownership of the content lock with `_guard`; it stays
/// held for every write of the pass. Per-tile failures are logged and the
/// tile stays dirty for the next pass.
pub async fn process_dirty(shared: &StreamShared, _guard: &ContentGuard, budget: &mut EncodeBudget) -> FlushSummary {
    let pending = {
        let tiles = shared.tiles();
        let mut pending: Vec<TileCoords> = tiles
            .dirty
            .iter()
            .filter(|c| !tiles.being_streamed_in.contains(*c))
            .copied()
            .collect();
        pending.sort();
        pending
    };

    let mut summary = FlushSummary::default();
    for coords in pending {
        match flush_tile(shared, coords, budget).await {
            Ok(TileFlush::Written { .. }) => summary.written += 1,
            Ok(TileFlush::Removed) => summary.removed += 1,
            Ok(TileFlush::NotLoaded) => summary.skipped += 1,
            Err(e) => {
                log::error!("Failed to save tile {} of stream '{}': {}", coords, shared.id, e);
                summary.failed += 1;
            }
        }
    }

    {
        let mut stats = shared.stats();
        stats.flushes += 1;
        stats.tiles_flushed += summary.written as u64;
        stats.tiles_deleted += summary.removed as u64;
        stats.flush_failures += summary.failed as u64;
    }
    if summary.written + summary.removed + summary.failed > 0 {
        log::info!(
            "Stream '{}': saved {} tiles, removed {}, {} failed",
            shared.id, summary.written, summary.removed, summary.failed
        );
    }
    summary
}

async fn flush_tile(shared: &StreamShared, coords: TileCoords, budget: &mut EncodeBudget) -> Result<TileFlush> {
    // Snapshot once; the content lock keeps edits out until the write is done
    let snapshot = {
        let mut tiles = shared.tiles();
        match tiles.loaded.get_mut(&coords) {
            Some(tile) => {
                tile.recompute_bounds();
                tile.snapshot()
            }
            None => {
                log::error!("Tile {} is marked dirty but is not loaded; skipping save", coords);
                tiles.dirty.remove(&coords);
                return Ok(TileFlush::NotLoaded);
            }
        }
    };

    let path = shared.tile_path(coords);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let result = if snapshot.is_empty() {
        TileFlush::Removed
    } else {
        let bytes = encode_tile_budgeted(&snapshot, budget, &shared.clock).await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        TileFlush::Written { instances: snapshot.len() }
    };

    {
        let mut tiles = shared.tiles();
        tiles.dirty.remove(&coords);
        tiles.forget_missing(&coords);
    }
    log::debug!("Flushed tile {}: {:?}", coords, result);
    Ok(result)
}
