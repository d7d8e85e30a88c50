//! Tile loader
//!
//! Starts one task per in-range tile that is neither loaded, in flight, nor
//! memoized as missing. Each task runs the pre-load hook, checks storage,
//! waits for the per-frame load budget, decodes, hands instances to the
//! backend and finally publishes the tile under the content lock. Failures
//! stay with their tile.

use std::io;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::core::types::{Vec2, Vec3};
use crate::streaming::codec::decode_tile;
use crate::streaming::coords::TileCoords;
use crate::streaming::hooks::LoadOutcome;
use crate::streaming::instance::ResidentTile;
use crate::streaming::lock::LockOwner;
use crate::streaming::state::StreamShared;

/// Outcome counts of one loader run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderSummary {
    pub loaded: usize,
    pub missing: usize,
    pub vetoed: usize,
    pub failed: usize,
}

impl LoaderSummary {
    fn record(&mut self, outcome: &LoadOutcome) {
        match outcome {
            LoadOutcome::Loaded { .. } => self.loaded += 1,
            LoadOutcome::Missing => self.missing += 1,
            LoadOutcome::Vetoed => self.vetoed += 1,
            LoadOutcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn attempted(&self) -> usize {
        self.loaded + self.missing + self.vetoed + self.failed
    }
}

/// Mark every in-range tile that needs a load as being streamed in and start
/// one task per tile, nearest to `camera` first.
///
/// The tasks do not need the caller's content lock; each one takes the lock
/// only for the moment it publishes its tile.
pub fn spawn_loads(shared: &Arc<StreamShared>, camera: Vec3) -> JoinSet<LoadOutcome> {
    let to_load = {
        let mut tiles = shared.tiles();
        let in_range = tiles.in_range.clone();
        let mut list: Vec<TileCoords> = in_range
            .iter()
            .filter(|c| tiles.needs_load(c))
            .copied()
            .collect();

        let width = shared.config.tile_width;
        let cam = Vec2::new(camera.x, camera.z);
        list.sort_by(|a, b| {
            let da = a.center(width).distance_squared(cam);
            let db = b.center(width).distance_squared(cam);
            da.total_cmp(&db).then_with(|| a.cmp(b))
        });

        for coords in &list {
            tiles.being_streamed_in.insert(*coords);
        }
        list
    };

    let mut tasks = JoinSet::new();
    if to_load.is_empty() {
        return tasks;
    }
    log::debug!("Stream '{}': loading {} tiles", shared.id, to_load.len());

    for coords in to_load {
        let shared = shared.clone();
        tasks.spawn(async move { load_tile(&shared, coords).await });
    }
    tasks
}

/// Wait for every load task and count the outcomes
pub async fn join_loads(mut tasks: JoinSet<LoadOutcome>) -> LoaderSummary {
    let mut summary = LoaderSummary::default();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(outcome) => summary.record(&outcome),
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                log::error!("Tile load task panicked: {}", e);
                summary.failed += 1;
            }
        }
    }
    summary
}

/// Clears the in-flight mark even if a hook or backend panics mid-load, or the
/// task is cancelled. An unpublished tile's backend content is destroyed.
struct InFlight<'a> {
    shared: &'a StreamShared,
    coords: TileCoords,
    backend_notified: bool,
    published: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.shared.tiles().being_streamed_in.remove(&self.coords);
        if self.backend_notified && !self.published {
            self.shared.backend.on_tile_destroyed(self.coords);
        }
    }
}

/// Load a single tile that has already been marked as being streamed in.
pub async fn load_tile(shared: &StreamShared, coords: TileCoords) -> LoadOutcome {
    let mut in_flight = InFlight {
        shared,
        coords,
        backend_notified: false,
        published: false,
    };

    if let Some(hook) = &shared.preload_hook {
        if !hook(coords).await {
            log::debug!("Pre-load hook declined tile {}", coords);
            return finish(shared, coords, LoadOutcome::Vetoed);
        }
    }

    let path = shared.tile_path(coords);
    match tokio::fs::try_exists(&path).await {
        Ok(true) => {}
        Ok(false) => return finish(shared, coords, LoadOutcome::Missing),
        Err(e) => {
            log::warn!("Failed to stat tile {} at {}: {}", coords, path.display(), e);
            return finish(shared, coords, LoadOutcome::Failed(e.to_string()));
        }
    }

    shared.load_budget.acquire(&shared.clock).await;

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return finish(shared, coords, LoadOutcome::Missing);
        }
        Err(e) => {
            log::warn!("Failed to read tile {} at {}: {}", coords, path.display(), e);
            return finish(shared, coords, LoadOutcome::Failed(e.to_string()));
        }
    };

    let decoded = match decode_tile(&bytes) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::warn!("Failed to decode tile {} at {}: {}", coords, path.display(), e);
            return finish(shared, coords, LoadOutcome::Failed(e.to_string()));
        }
    };

    in_flight.backend_notified = true;
    for instance in &decoded.instances {
        shared
            .backend
            .on_instance_added(coords, instance.preset, instance.local_to_stream(), instance.colour);
    }
    let tile = ResidentTile::from_instances(decoded.instances);
    let instances = tile.len();

    // Never publish underneath a save in progress
    let publish = shared.lock.acquire(LockOwner::TilePublish).await;
    {
        let mut tiles = shared.tiles();
        tiles.being_streamed_in.remove(&coords);
        tiles.forget_missing(&coords);
        tiles.loaded.insert(coords, tile);
    }
    in_flight.published = true;
    drop(publish);
    log::trace!("Loaded tile {} (format v{}, {} instances)", coords, decoded.version, instances);

    finish(shared, coords, LoadOutcome::Loaded { instances })
}

fn finish(shared: &StreamShared, coords: TileCoords, outcome: LoadOutcome) -> LoadOutcome {
    {
        let mut tiles = shared.tiles();
        tiles.being_streamed_in.remove(&coords);
        if !outcome.is_loaded() {
            // Only a definite "no file" lets an edit start the tile from scratch
            let has_file = !matches!(outcome, LoadOutcome::Missing);
            tiles.memoize_missing(coords, has_file);
        }
    }

    {
        let mut stats = shared.stats();
        match &outcome {
            LoadOutcome::Loaded { instances } => {
                stats.tiles_loaded += 1;
                stats.instances_loaded += *instances as u64;
            }
            LoadOutcome::Missing => stats.tiles_missing += 1,
            LoadOutcome::Vetoed => stats.tiles_vetoed += 1,
            LoadOutcome::Failed(_) => stats.load_failures += 1,
        }
    }

    if let Some(notify) = &shared.on_load_complete {
        notify(coords, &outcome);
    }
    outcome
}
