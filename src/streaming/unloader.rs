//! Tile unloader: evicts loaded tiles that left the streaming range.

use crate::streaming::coords::TileCoords;
use crate::streaming::state::StreamShared;

/// Evict every loaded tile not in the current range. Returns the evicted coordinates.
///
/// No file I/O happens here. Dirty tiles stay resident until the dirty
/// processor has written them. Memoized load failures outside the range are
/// forgotten so the memo does not grow with distance travelled.
pub fn run_unloader(shared: &StreamShared) -> Vec<TileCoords> {
    let evicted = {
        let mut tiles = shared.tiles();
        let in_range = tiles.in_range.clone();
        let stale: Vec<TileCoords> = tiles
            .loaded
            .keys()
            .filter(|c| !in_range.contains(*c))
            .copied()
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for coords in stale {
            if tiles.dirty.contains(&coords) {
                log::debug!("Keeping out-of-range tile {} until its changes are saved", coords);
                continue;
            }
            tiles.loaded.remove(&coords);
            evicted.push(coords);
        }
        let pruned = tiles.prune_memo();
        if pruned > 0 {
            log::trace!("Forgot {} memoized tiles outside the range", pruned);
        }
        evicted
    };

    for coords in &evicted {
        shared.backend.on_tile_destroyed(*coords);
    }

    if !evicted.is_empty() {
        shared.stats().tiles_unloaded += evicted.len() as u64;
        log::debug!("Stream '{}': unloaded {} tiles", shared.id, evicted.len());
    }
    evicted
}
