//! Per-frame stream driver.
//!
//! [`WorldStream::update`] is called once per frame with the camera position.
//! It starts a dirty flush whenever the content lock is free, and a streaming
//! pass (range recompute, unload, load) when the camera moved far enough and
//! no other pass or lock owner is active. Both run as tokio tasks, so the
//! frame never waits on storage.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::core::error::Error;
use crate::core::time::FrameClock;
use crate::core::types::{Affine3A, Result, Vec3};
use crate::math::Aabb;
use crate::render::{NullBackend, TileBackend};
use crate::streaming::budget::{EncodeBudget, FrameLoadBudget};
use crate::streaming::config::StreamConfig;
use crate::streaming::coords::TileCoords;
use crate::streaming::dirty::{self, FlushSummary};
use crate::streaming::hooks::{LoadCompleteHook, PreloadHook};
use crate::streaming::instance::{PlacedInstance, ResidentTile};
use crate::streaming::loader;
use crate::streaming::lock::{ContentGuard, ContentLock, LockOwner};
use crate::streaming::range;
use crate::streaming::state::{StreamShared, TileSets};
use crate::streaming::stats::StreamStats;
use crate::streaming::unloader;

/// Builder for [`WorldStream`]
pub struct WorldStreamBuilder {
    id: String,
    config: StreamConfig,
    clock: Option<FrameClock>,
    backend: Option<Arc<dyn TileBackend>>,
    transform: Affine3A,
    preload_hook: Option<PreloadHook>,
    on_load_complete: Option<LoadCompleteHook>,
}

impl WorldStreamBuilder {
    /// Share a frame clock with the host loop (a private clock is created otherwise)
    pub fn clock(mut self, clock: FrameClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn TileBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Stream-to-world transform
    pub fn transform(mut self, stream_to_world: Affine3A) -> Self {
        self.transform = stream_to_world;
        self
    }

    pub fn preload_hook(mut self, hook: PreloadHook) -> Self {
        self.preload_hook = Some(hook);
        self
    }

    pub fn on_load_complete(mut self, hook: LoadCompleteHook) -> Self {
        self.on_load_complete = Some(hook);
        self
    }

    pub fn build(self) -> Result<WorldStream> {
        self.config.validate()?;
        if self.id.is_empty() || self.id.contains(['/', '\\']) || self.id == ".." {
            return Err(Error::Config(format!("invalid stream id '{}'", self.id)));
        }

        let shared = StreamShared {
            load_budget: FrameLoadBudget::new(self.config.max_loads_per_frame),
            id: self.id,
            config: self.config,
            clock: self.clock.unwrap_or_default(),
            lock: ContentLock::new(),
            backend: self.backend.unwrap_or_else(|| Arc::new(NullBackend)),
            preload_hook: self.preload_hook,
            on_load_complete: self.on_load_complete,
            tiles: Mutex::new(TileSets::default()),
            stats: Mutex::new(StreamStats::default()),
            transform: Mutex::new(self.transform),
            last_pass_position: Mutex::new(None),
            initialized: AtomicBool::new(false),
            pass_in_progress: AtomicBool::new(false),
        };

        Ok(WorldStream {
            shared: Arc::new(shared),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// What a spawned task is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Pass,
    Flush,
}

/// Resets the single-flight flag however the pass ends.
struct PassFlag<'a>(&'a AtomicBool);

impl Drop for PassFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One independently configured world stream.
pub struct WorldStream {
    shared: Arc<StreamShared>,
    tasks: Mutex<Vec<(TaskKind, JoinHandle<()>)>>,
}

impl WorldStream {
    pub fn builder(id: impl Into<String>, config: StreamConfig) -> WorldStreamBuilder {
        WorldStreamBuilder {
            id: id.into(),
            config,
            clock: None,
            backend: None,
            transform: Affine3A::IDENTITY,
            preload_hook: None,
            on_load_complete: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> &FrameClock {
        &self.shared.clock
    }

    pub fn backend(&self) -> &Arc<dyn TileBackend> {
        &self.shared.backend
    }

    /// Create the stream's storage directory and enable streaming.
    pub async fn init(&self) -> Result<()> {
        let dir = self.shared.stream_dir();
        tokio::fs::create_dir_all(&dir).await?;
        self.shared.initialized.store(true, Ordering::Release);
        log::info!("Stream '{}' initialized at {}", self.shared.id, dir.display());
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    // --- Per-frame driving ---

    /// Per-frame entry point. Never blocks; must be called inside a tokio runtime.
    pub fn update(&self, camera_world: Vec3) {
        if !self.is_initialized() {
            return;
        }
        self.reap_finished();

        let has_dirty = !self.shared.tiles().dirty.is_empty();
        if has_dirty {
            if let Some(guard) = self.shared.lock.try_acquire(LockOwner::DirtyFlush) {
                let shared = self.shared.clone();
                self.spawn(TaskKind::Flush, async move {
                    let mut budget = shared.encode_budget();
                    dirty::process_dirty(&shared, &guard, &mut budget).await;
                });
            }
        }

        let camera = self.shared.world_to_stream(camera_world);
        if !self.moved_enough(camera) {
            return;
        }
        if self
            .shared
            .pass_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(guard) = self.shared.lock.try_acquire(LockOwner::StreamingPass) else {
            self.shared.pass_in_progress.store(false, Ordering::Release);
            return;
        };

        let shared = self.shared.clone();
        self.spawn(TaskKind::Pass, async move {
            streaming_pass(&shared, guard, camera).await;
        });
    }

    /// Run a streaming pass to completion, ignoring the movement threshold.
    ///
    /// Waits for anything spawned by [`update`](Self::update) and for the content lock.
    pub async fn run_streaming_pass(&self, camera_world: Vec3) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        self.wait_idle().await;

        let camera = self.shared.world_to_stream(camera_world);
        let guard = self.shared.lock.acquire(LockOwner::StreamingPass).await;
        self.shared.pass_in_progress.store(true, Ordering::Release);
        streaming_pass(&self.shared, guard, camera).await;
        Ok(())
    }

    /// Persist every dirty tile now, waiting for the content lock.
    pub async fn flush_dirty(&self) -> Result<FlushSummary> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let guard = self.shared.lock.acquire(LockOwner::DirtyFlush).await;
        let mut budget = self.shared.encode_budget();
        Ok(dirty::process_dirty(&self.shared, &guard, &mut budget).await)
    }

    /// Join every pass spawned by [`update`](Self::update).
    ///
    /// Budgeted loads and encodes only progress on frame boundaries, so the
    /// host must keep ticking the clock while this is awaited.
    pub async fn wait_idle(&self) {
        loop {
            let handles = {
                let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *tasks)
            };
            if handles.is_empty() {
                return;
            }
            for (kind, handle) in handles {
                match handle.await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {
                        log::debug!("Stream '{}': {:?} task cancelled", self.shared.id, kind);
                    }
                    Err(e) => log::error!("Stream '{}' task failed: {}", self.shared.id, e),
                }
            }
        }
    }

    /// Save all dirty tiles, evict everything and stop streaming.
    ///
    /// Pending streaming passes are cancelled along with their unfinished
    /// loads, so a stalled pre-load hook cannot hold up the shutdown. Spawned
    /// flushes run to completion.
    pub async fn shutdown(&self) -> Result<FlushSummary> {
        self.shared.initialized.store(false, Ordering::Release);
        {
            let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            for (kind, handle) in tasks.iter() {
                if *kind == TaskKind::Pass {
                    handle.abort();
                }
            }
        }
        self.wait_idle().await;
        let guard = self.shared.lock.acquire(LockOwner::Shutdown).await;

        let mut budget = EncodeBudget::unlimited();
        let summary = dirty::process_dirty(&self.shared, &guard, &mut budget).await;

        self.shared.tiles().in_range = Arc::new(HashSet::new());
        let evicted = unloader::run_unloader(&self.shared);
        log::info!(
            "Stream '{}' shut down: {} tiles saved, {} evicted",
            self.shared.id, summary.written, evicted.len()
        );
        Ok(summary)
    }

    /// Force the next [`update`](Self::update) to start a pass regardless of movement.
    pub fn invalidate_range(&self) {
        *self
            .shared
            .last_pass_position
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn set_transform(&self, stream_to_world: Affine3A) {
        *self.shared.transform.lock().unwrap_or_else(|e| e.into_inner()) = stream_to_world;
        self.invalidate_range();
    }

    fn moved_enough(&self, camera: Vec3) -> bool {
        let last = *self
            .shared
            .last_pass_position
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match last {
            None => true,
            Some(previous) => previous.distance(camera) > self.shared.config.movement_threshold,
        }
    }

    fn spawn<F>(&self, kind: TaskKind, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push((kind, handle));
    }

    fn reap_finished(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|(_, handle)| !handle.is_finished());
    }

    // --- Editing ---

    /// Edit a resident tile under the content lock and mark it dirty.
    ///
    /// A tile known to have no file gets a fresh empty tile to edit. Fails with
    /// [`Error::TileBusy`] while the tile is being streamed in, with
    /// [`Error::TileRejected`] when its file exists but could not be loaded (too
    /// new, corrupt, unreadable or vetoed), and with [`Error::TileNotLoaded`]
    /// for tiles that were never attempted, whose file may hold content not yet
    /// seen. `f` must not call back into the stream.
    pub async fn edit_tile<F, R>(&self, coords: TileCoords, f: F) -> Result<R>
    where
        F: FnOnce(&mut ResidentTile) -> R,
    {
        let _guard = self.shared.lock.acquire(LockOwner::Editor).await;

        let (result, content) = {
            let mut tiles = self.shared.tiles();
            if tiles.being_streamed_in.contains(&coords) {
                return Err(Error::TileBusy(coords));
            }
            if !tiles.loaded.contains_key(&coords) {
                if tiles.rejected.contains(&coords) {
                    return Err(Error::TileRejected(coords));
                }
                if !tiles.is_known_empty(&coords) {
                    return Err(Error::TileNotLoaded(coords));
                }
                tiles.forget_missing(&coords);
                tiles.loaded.insert(coords, ResidentTile::new());
            }

            let tile = tiles
                .loaded
                .get_mut(&coords)
                .ok_or(Error::TileNotLoaded(coords))?;
            let result = f(tile);
            tile.recompute_bounds();
            let content = tile.clone();
            tiles.mark_dirty(coords);
            (result, content)
        };

        self.shared.backend.on_tile_changed(coords, &content);
        Ok(result)
    }

    /// Add an instance (stream space) to the tile containing it.
    pub async fn add_instance(&self, instance: PlacedInstance) -> Result<TileCoords> {
        let coords = TileCoords::from_position(instance.position, self.shared.config.tile_width);
        self.edit_tile(coords, |tile| tile.push(instance)).await?;
        Ok(coords)
    }

    /// Mark a tile dirty without editing it, e.g. after mutating it elsewhere.
    pub async fn mark_dirty(&self, coords: TileCoords) {
        let _guard = self.shared.lock.acquire(LockOwner::Editor).await;
        self.shared.tiles().mark_dirty(coords);
    }

    // --- Queries ---

    pub fn is_loaded(&self, coords: TileCoords) -> bool {
        self.shared.tiles().loaded.contains_key(&coords)
    }

    pub fn is_in_range(&self, coords: TileCoords) -> bool {
        self.shared.tiles().in_range.contains(&coords)
    }

    pub fn is_missing(&self, coords: TileCoords) -> bool {
        self.shared.tiles().attempted_and_missing.contains(&coords)
    }

    /// Memoized with stored content that could not be loaded
    pub fn is_rejected(&self, coords: TileCoords) -> bool {
        self.shared.tiles().rejected.contains(&coords)
    }

    pub fn is_dirty(&self, coords: TileCoords) -> bool {
        self.shared.tiles().dirty.contains(&coords)
    }

    pub fn is_being_streamed_in(&self, coords: TileCoords) -> bool {
        self.shared.tiles().being_streamed_in.contains(&coords)
    }

    /// Snapshot of the tiles found in range by the last pass
    pub fn in_range(&self) -> Arc<HashSet<TileCoords>> {
        self.shared.tiles().in_range.clone()
    }

    pub fn loaded_coords(&self) -> Vec<TileCoords> {
        let mut coords: Vec<_> = self.shared.tiles().loaded.keys().copied().collect();
        coords.sort();
        coords
    }

    pub fn missing_coords(&self) -> Vec<TileCoords> {
        let mut coords: Vec<_> = self.shared.tiles().attempted_and_missing.iter().copied().collect();
        coords.sort();
        coords
    }

    pub fn tile_bounds(&self, coords: TileCoords) -> Option<Aabb> {
        self.shared.tiles().loaded.get(&coords).and_then(ResidentTile::bounds)
    }

    /// Copy of a resident tile's instances
    pub fn tile_instances(&self, coords: TileCoords) -> Option<Vec<PlacedInstance>> {
        self.shared.tiles().loaded.get(&coords).map(ResidentTile::snapshot)
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.stats().clone()
    }

    pub fn lock_owner(&self) -> Option<LockOwner> {
        self.shared.lock.owner()
    }

    pub fn is_pass_in_progress(&self) -> bool {
        self.shared.pass_in_progress.load(Ordering::Acquire)
    }
}

/// Range recompute, unload, then load.
///
/// The lock is held while the range is replaced, tiles are evicted and loads
/// are started. It is released before the loads are awaited so edits and
/// flushes are not held up by a slow tile; each load takes the lock again to
/// publish. The single-flight flag stays set until every load has finished.
async fn streaming_pass(shared: &Arc<StreamShared>, guard: ContentGuard, camera: Vec3) {
    let _flag = PassFlag(&shared.pass_in_progress);
    let start = Instant::now();

    let distance = shared.config.effective_distance();
    let in_range = match range::collect_in_range_async(camera, distance, shared.config.tile_width).await {
        Ok(set) => Arc::new(set),
        Err(e) => {
            log::error!("Stream '{}': range scan failed: {}", shared.id, e);
            return;
        }
    };
    let range_len = in_range.len();
    shared.tiles().in_range = in_range;
    *shared
        .last_pass_position
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(camera);

    let unloaded = unloader::run_unloader(shared);
    let loads = loader::spawn_loads(shared, camera);
    drop(guard);

    let loaded = loader::join_loads(loads).await;
    shared.stats().passes += 1;

    log::debug!(
        "Stream '{}' pass: {} in range, {} unloaded, {} loaded, {} missing, {} failed ({:.1}ms)",
        shared.id,
        range_len,
        unloaded.len(),
        loaded.loaded,
        loaded.missing + loaded.vetoed,
        loaded.failed,
        start.elapsed().as_secs_f64() * 1000.0
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Quat, Vec4};
    use crate::render::BatchedDrawBackend;
    use crate::streaming::codec::{decode_tile, encode_tile};
    use crate::streaming::coords::tile_path;
    use crate::streaming::hooks::{LoadOutcome, load_complete_hook, preload_hook};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    fn test_config(dir: &TempDir) -> StreamConfig {
        StreamConfig {
            tile_width: 10.0,
            streaming_distance: 15.0,
            movement_threshold: 1.0,
            max_loads_per_frame: 64,
            max_encode_time_ms: 1000.0,
            storage_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    async fn test_stream(dir: &TempDir, backend: Arc<dyn TileBackend>) -> WorldStream {
        let stream = WorldStream::builder("trees", test_config(dir))
            .backend(backend)
            .build()
            .expect("build failed");
        stream.init().await.expect("init failed");
        stream
    }

    fn write_tile(dir: &TempDir, coords: TileCoords, instances: &[PlacedInstance]) {
        let path = tile_path(dir.path(), "trees", coords);
        std::fs::create_dir_all(path.parent().expect("tile path has parent")).expect("mkdir failed");
        std::fs::write(path, encode_tile(instances)).expect("write failed");
    }

    fn sample(coords: TileCoords, preset: i32) -> PlacedInstance {
        let c = coords.center(10.0);
        PlacedInstance::new(
            Vec3::new(c.x, 0.0, c.y),
            Quat::IDENTITY,
            Vec3::ONE,
            Vec4::ONE,
            preset,
        )
    }

    async fn settle<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("stream never reached the expected state");
    }

    fn spawn_ticker(clock: &FrameClock) -> JoinHandle<()> {
        let clock = clock.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(1)).await;
                clock.tick();
            }
        })
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = StreamConfig {
            tile_width: -1.0,
            ..Default::default()
        };
        assert!(WorldStream::builder("trees", config).build().is_err());
        assert!(WorldStream::builder("../up", StreamConfig::default()).build().is_err());
        assert!(WorldStream::builder("", StreamConfig::default()).build().is_err());
    }

    #[tokio::test]
    async fn test_pass_requires_init() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let stream = WorldStream::builder("trees", test_config(&dir)).build().expect("build failed");
        assert!(matches!(stream.run_streaming_pass(Vec3::ZERO).await, Err(Error::NotInitialized)));

        // update is a no-op before init
        stream.update(Vec3::ZERO);
        stream.wait_idle().await;
        assert!(stream.in_range().is_empty());
    }

    #[tokio::test]
    async fn test_pass_loads_existing_and_memoizes_missing() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let origin = TileCoords::new(0, 0);
        write_tile(&dir, origin, &[sample(origin, 0), sample(origin, 1)]);

        let backend = Arc::new(BatchedDrawBackend::new());
        let stream = test_stream(&dir, backend.clone()).await;
        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");

        let in_range = stream.in_range();
        assert_eq!(in_range.len(), 4);
        assert!(in_range.contains(&origin));
        assert!(!in_range.contains(&TileCoords::new(3, 3)));

        assert!(stream.is_loaded(origin));
        assert_eq!(stream.loaded_coords(), vec![origin]);
        assert_eq!(stream.missing_coords().len(), 3);
        for coords in in_range.iter() {
            assert!(stream.is_loaded(*coords) ^ stream.is_missing(*coords));
            assert!(!stream.is_being_streamed_in(*coords));
        }

        assert_eq!(backend.total_instances(), 2);
        let bounds = stream.tile_bounds(origin).expect("loaded tile has bounds");
        assert_eq!(bounds.center(), Vec3::new(5.0, 0.0, 5.0));

        let stats = stream.stats();
        assert_eq!(stats.passes, 1);
        assert_eq!(stats.tiles_loaded, 1);
        assert_eq!(stats.tiles_missing, 3);
        assert_eq!(stats.instances_loaded, 2);
        assert_eq!(stream.lock_owner(), None);
        assert!(!stream.is_pass_in_progress());
    }

    #[tokio::test]
    async fn test_missing_tile_then_dirty_flush() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let stream = test_stream(&dir, Arc::new(NullBackend)).await;
        let origin = TileCoords::new(0, 0);

        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");
        assert!(stream.is_missing(origin));
        assert!(!stream.is_loaded(origin));

        let instance = sample(origin, 3);
        let coords = stream.add_instance(instance).await.expect("edit failed");
        assert_eq!(coords, origin);
        assert!(stream.is_dirty(origin));
        assert!(!stream.is_missing(origin));

        let summary = stream.flush_dirty().await.expect("flush failed");
        assert_eq!(summary.written, 1);
        assert!(!stream.is_dirty(origin));
        assert!(!stream.is_missing(origin));

        let bytes = std::fs::read(tile_path(dir.path(), "trees", origin)).expect("tile file written");
        let decoded = decode_tile(&bytes).expect("decode failed");
        assert_eq!(decoded.version, 2);
        assert_eq!(decoded.instances, vec![instance]);
    }

    #[tokio::test]
    async fn test_flush_removes_missing_memo() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let stream = test_stream(&dir, Arc::new(NullBackend)).await;
        let origin = TileCoords::new(0, 0);

        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");
        stream.edit_tile(origin, |tile| tile.push(sample(origin, 0))).await.expect("edit failed");

        // A stale memo left behind must not survive a successful save
        stream.shared.tiles().memoize_missing(origin, true);

        stream.flush_dirty().await.expect("flush failed");
        assert!(!stream.is_missing(origin));
        assert!(!stream.is_rejected(origin));
    }

    #[tokio::test]
    async fn test_empty_tile_flush_deletes_file() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let origin = TileCoords::new(0, 0);
        write_tile(&dir, origin, &[sample(origin, 0)]);

        let stream = test_stream(&dir, Arc::new(NullBackend)).await;
        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");
        assert!(stream.is_loaded(origin));

        stream.edit_tile(origin, ResidentTile::clear).await.expect("edit failed");
        let summary = stream.flush_dirty().await.expect("flush failed");
        assert_eq!(summary.removed, 1);
        assert!(!tile_path(dir.path(), "trees", origin).exists());
        assert_eq!(stream.stats().tiles_deleted, 1);
    }

    #[tokio::test]
    async fn test_edit_untouched_tile_is_rejected() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let stream = test_stream(&dir, Arc::new(NullBackend)).await;
        let far = TileCoords::new(50, 50);

        let result = stream.edit_tile(far, |tile| tile.len()).await;
        assert!(matches!(result, Err(Error::TileNotLoaded(c)) if c == far));
        assert!(!stream.is_dirty(far));
    }

    #[tokio::test]
    async fn test_dirty_unloaded_tile_is_skipped() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let stream = test_stream(&dir, Arc::new(NullBackend)).await;
        let far = TileCoords::new(50, 50);

        stream.mark_dirty(far).await;
        let summary = stream.flush_dirty().await.expect("flush failed");
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert!(!stream.is_dirty(far));
        assert!(!tile_path(dir.path(), "trees", far).exists());
    }

    #[tokio::test]
    async fn test_unload_on_move_and_idempotent() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let origin = TileCoords::new(0, 0);
        write_tile(&dir, origin, &[sample(origin, 0)]);

        let backend = Arc::new(BatchedDrawBackend::new());
        let stream = test_stream(&dir, backend.clone()).await;
        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");
        assert!(stream.is_loaded(origin));

        stream.run_streaming_pass(Vec3::new(500.0, 0.0, 500.0)).await.expect("pass failed");
        assert!(!stream.is_loaded(origin));
        assert_eq!(backend.total_instances(), 0);
        assert_eq!(stream.stats().tiles_unloaded, 1);
        // Memoized misses around the old position are forgotten
        assert!(!stream.is_missing(TileCoords::new(-1, -1)));
        assert!(stream.missing_coords().iter().all(|c| stream.is_in_range(*c)));

        // Second run with the same range evicts nothing
        assert!(unloader::run_unloader(&stream.shared).is_empty());
        assert_eq!(stream.stats().tiles_unloaded, 1);
    }

    #[tokio::test]
    async fn test_dirty_tile_survives_unload_until_saved() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let stream = test_stream(&dir, Arc::new(NullBackend)).await;
        let origin = TileCoords::new(0, 0);

        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");
        stream.add_instance(sample(origin, 0)).await.expect("edit failed");

        stream.run_streaming_pass(Vec3::new(500.0, 0.0, 500.0)).await.expect("pass failed");
        assert!(stream.is_loaded(origin));

        stream.flush_dirty().await.expect("flush failed");
        stream.run_streaming_pass(Vec3::new(501.0, 0.0, 500.0)).await.expect("pass failed");
        assert!(!stream.is_loaded(origin));
        assert!(tile_path(dir.path(), "trees", origin).exists());
    }

    #[tokio::test]
    async fn test_preload_hook_veto() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let origin = TileCoords::new(0, 0);
        write_tile(&dir, origin, &[sample(origin, 0)]);

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let recorded = outcomes.clone();
        let stream = WorldStream::builder("trees", test_config(&dir))
            .preload_hook(preload_hook(|coords: TileCoords| async move { coords != TileCoords::new(0, 0) }))
            .on_load_complete(load_complete_hook(move |coords, outcome| {
                recorded.lock().expect("poisoned").push((coords, outcome.clone()));
            }))
            .build()
            .expect("build failed");
        stream.init().await.expect("init failed");

        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");
        assert!(!stream.is_loaded(origin));
        assert!(stream.is_missing(origin));
        assert!(stream.is_rejected(origin));

        // The file may exist remotely, so an edit must not start it from scratch
        let result = stream.add_instance(sample(origin, 0)).await;
        assert!(matches!(result, Err(Error::TileRejected(c)) if c == origin));

        let outcomes = outcomes.lock().expect("poisoned");
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.contains(&(origin, LoadOutcome::Vetoed)));
        assert_eq!(outcomes.iter().filter(|(_, o)| *o == LoadOutcome::Missing).count(), 3);
        assert_eq!(stream.stats().tiles_vetoed, 1);
    }

    #[tokio::test]
    async fn test_unsupported_version_is_memoized() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let origin = TileCoords::new(0, 0);
        let path = tile_path(dir.path(), "trees", origin);
        std::fs::create_dir_all(path.parent().expect("tile path has parent")).expect("mkdir failed");
        let mut bytes = encode_tile(&[sample(origin, 0)]);
        bytes[..4].copy_from_slice(&3u32.to_le_bytes());
        std::fs::write(&path, bytes).expect("write failed");

        let backend = Arc::new(BatchedDrawBackend::new());
        let stream = test_stream(&dir, backend.clone()).await;
        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");

        assert!(!stream.is_loaded(origin));
        assert!(stream.is_missing(origin));
        assert_eq!(backend.total_instances(), 0);
        assert_eq!(stream.stats().load_failures, 1);
    }

    #[tokio::test]
    async fn test_edit_never_overwrites_newer_file() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let origin = TileCoords::new(0, 0);
        let path = tile_path(dir.path(), "trees", origin);
        std::fs::create_dir_all(path.parent().expect("tile path has parent")).expect("mkdir failed");
        let instances: Vec<_> = (0..50).map(|i| sample(origin, i)).collect();
        let mut original = encode_tile(&instances);
        original[..4].copy_from_slice(&3u32.to_le_bytes());
        std::fs::write(&path, &original).expect("write failed");

        let stream = test_stream(&dir, Arc::new(NullBackend)).await;
        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");
        assert!(stream.is_rejected(origin));

        let result = stream.add_instance(sample(origin, 0)).await;
        assert!(matches!(result, Err(Error::TileRejected(c)) if c == origin));
        assert!(!stream.is_dirty(origin));

        stream.flush_dirty().await.expect("flush failed");
        assert_eq!(std::fs::read(&path).expect("file still there"), original);

        // A tile with no file at all can still be started from scratch
        let empty = TileCoords::new(-1, -1);
        assert!(stream.is_missing(empty) && !stream.is_rejected(empty));
        stream.edit_tile(empty, |tile| tile.push(sample(empty, 0))).await.expect("edit failed");
    }

    #[tokio::test]
    async fn test_stalled_hook_does_not_block_other_work() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let stalled = TileCoords::new(0, 0);
        write_tile(&dir, stalled, &[sample(stalled, 0)]);

        let stream = WorldStream::builder("trees", test_config(&dir))
            .preload_hook(preload_hook(move |coords: TileCoords| async move {
                if coords == stalled {
                    std::future::pending::<()>().await;
                }
                true
            }))
            .build()
            .expect("build failed");
        stream.init().await.expect("init failed");

        stream.update(Vec3::ZERO);
        settle(|| {
            stream.is_being_streamed_in(stalled)
                && stream.missing_coords().len() == 3
                && stream.lock_owner().is_none()
        })
        .await;
        assert!(stream.is_pass_in_progress());

        // Unrelated work goes ahead while the hook is stuck
        let other = TileCoords::new(-1, -1);
        tokio::time::timeout(Duration::from_millis(500), stream.add_instance(sample(other, 0)))
            .await
            .expect("edit blocked by stalled load")
            .expect("edit failed");
        let summary = tokio::time::timeout(Duration::from_millis(500), stream.flush_dirty())
            .await
            .expect("flush blocked by stalled load")
            .expect("flush failed");
        assert_eq!(summary.written, 1);

        let result = stream.edit_tile(stalled, |tile| tile.len()).await;
        assert!(matches!(result, Err(Error::TileBusy(c)) if c == stalled));

        // Still single-flight: no second pass while the first has loads pending
        stream.invalidate_range();
        stream.update(Vec3::ZERO);
        assert_eq!(stream.stats().passes, 0);

        tokio::time::timeout(Duration::from_millis(500), stream.shutdown())
            .await
            .expect("shutdown blocked by stalled load")
            .expect("shutdown failed");
        assert!(tile_path(dir.path(), "trees", other).exists());
    }

    #[tokio::test]
    async fn test_load_publish_waits_for_flush() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let origin = TileCoords::new(0, 0);
        write_tile(&dir, origin, &[sample(origin, 0)]);

        let gate = Arc::new(Notify::new());
        let hook_gate = gate.clone();
        let stream = WorldStream::builder("trees", test_config(&dir))
            .preload_hook(preload_hook(move |coords: TileCoords| {
                let gate = hook_gate.clone();
                async move {
                    if coords == origin {
                        gate.notified().await;
                    }
                    true
                }
            }))
            .build()
            .expect("build failed");
        stream.init().await.expect("init failed");

        stream.update(Vec3::ZERO);
        settle(|| stream.missing_coords().len() == 3 && stream.lock_owner().is_none()).await;
        let other = TileCoords::new(-1, -1);
        stream.add_instance(sample(other, 0)).await.expect("edit failed");

        // A flush holds the lock while the gated load runs to its publish step
        let flush = stream.shared.lock.try_acquire(LockOwner::DirtyFlush).expect("lock is free");
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stream.is_loaded(origin));
        assert!(stream.is_being_streamed_in(origin));

        let summary = dirty::process_dirty(&stream.shared, &flush, &mut EncodeBudget::unlimited()).await;
        assert_eq!(summary.written, 1);
        assert!(!stream.is_loaded(origin));
        assert_eq!(stream.lock_owner(), Some(LockOwner::DirtyFlush));

        drop(flush);
        stream.wait_idle().await;
        assert!(stream.is_loaded(origin));
        assert!(!stream.is_being_streamed_in(origin));
        assert_eq!(stream.stats().passes, 1);
    }

    #[tokio::test]
    async fn test_flush_spreads_encode_over_frames() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config = StreamConfig {
            max_encode_items_per_frame: 2,
            ..test_config(&dir)
        };
        let clock = FrameClock::new();
        let stream = WorldStream::builder("trees", config)
            .clock(clock.clone())
            .build()
            .expect("build failed");
        stream.init().await.expect("init failed");

        let origin = TileCoords::new(0, 0);
        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");
        for preset in 0..6 {
            stream.add_instance(sample(origin, preset)).await.expect("edit failed");
        }

        let ticker = spawn_ticker(&clock);
        let start_frame = clock.frame();
        let summary = stream.flush_dirty().await.expect("flush failed");
        ticker.abort();

        assert_eq!(summary.written, 1);
        assert!(clock.frame() >= start_frame + 3);
        let bytes = std::fs::read(tile_path(dir.path(), "trees", origin)).expect("tile file written");
        assert_eq!(decode_tile(&bytes).expect("decode failed").instances.len(), 6);
    }

    #[tokio::test]
    async fn test_load_budget_spreads_loads_over_frames() {
        let dir = TempDir::new().expect("failed to create temp dir");
        for x in -1..=0 {
            for z in -1..=0 {
                let c = TileCoords::new(x, z);
                write_tile(&dir, c, &[sample(c, 0)]);
            }
        }

        let config = StreamConfig {
            max_loads_per_frame: 1,
            ..test_config(&dir)
        };
        let clock = FrameClock::new();
        let stream = WorldStream::builder("trees", config)
            .clock(clock.clone())
            .build()
            .expect("build failed");
        stream.init().await.expect("init failed");

        let ticker = spawn_ticker(&clock);
        let start_frame = clock.frame();
        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");
        ticker.abort();

        assert_eq!(stream.loaded_coords().len(), 4);
        assert!(clock.frame() >= start_frame + 3);
    }

    #[tokio::test]
    async fn test_update_single_flight_and_threshold() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let origin = TileCoords::new(0, 0);
        write_tile(&dir, origin, &[sample(origin, 0)]);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let stream = WorldStream::builder("trees", test_config(&dir))
            .on_load_complete(load_complete_hook(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .build()
            .expect("build failed");
        stream.init().await.expect("init failed");

        stream.update(Vec3::ZERO);
        // A second update while the first pass is pending starts nothing
        stream.update(Vec3::ZERO);
        stream.wait_idle().await;
        assert_eq!(stream.stats().passes, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(stream.is_loaded(origin));

        // Under the movement threshold: no pass
        stream.update(Vec3::new(0.5, 0.0, 0.0));
        stream.wait_idle().await;
        assert_eq!(stream.stats().passes, 1);

        stream.update(Vec3::new(3.0, 0.0, 0.0));
        stream.wait_idle().await;
        assert_eq!(stream.stats().passes, 2);
        // Only (1, -1) and (1, 0) are new; loaded and memoized tiles are not retried
        assert_eq!(stream.in_range().len(), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_update_flushes_before_next_pass() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let stream = test_stream(&dir, Arc::new(NullBackend)).await;
        let origin = TileCoords::new(0, 0);

        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");
        stream.add_instance(sample(origin, 0)).await.expect("edit failed");

        // The flush takes the lock, so this frame's pass is deferred
        stream.update(Vec3::new(500.0, 0.0, 500.0));
        stream.wait_idle().await;
        assert!(!stream.is_dirty(origin));
        assert_eq!(stream.stats().passes, 1);
        assert_eq!(stream.stats().flushes, 1);

        stream.update(Vec3::new(500.0, 0.0, 500.0));
        stream.wait_idle().await;
        assert_eq!(stream.stats().passes, 2);
        assert!(!stream.is_loaded(origin));
    }

    #[tokio::test]
    async fn test_stream_transform_offsets_camera() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let target = TileCoords::new(0, 0);
        write_tile(&dir, target, &[sample(target, 0)]);

        let stream = WorldStream::builder("trees", test_config(&dir))
            .transform(Affine3A::from_translation(Vec3::new(1000.0, 0.0, 0.0)))
            .build()
            .expect("build failed");
        stream.init().await.expect("init failed");

        stream.run_streaming_pass(Vec3::new(1000.0, 0.0, 0.0)).await.expect("pass failed");
        assert!(stream.is_loaded(target));
    }

    #[tokio::test]
    async fn test_shutdown_saves_and_evicts() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let backend = Arc::new(BatchedDrawBackend::new());
        let stream = test_stream(&dir, backend.clone()).await;
        let origin = TileCoords::new(0, 0);

        stream.run_streaming_pass(Vec3::ZERO).await.expect("pass failed");
        stream.add_instance(sample(origin, 2)).await.expect("edit failed");
        assert_eq!(backend.instance_count(2), 1);

        let summary = stream.shutdown().await.expect("shutdown failed");
        assert_eq!(summary.written, 1);
        assert!(stream.loaded_coords().is_empty());
        assert_eq!(backend.total_instances(), 0);
        assert!(!stream.is_initialized());
        assert!(tile_path(dir.path(), "trees", origin).exists());
    }
}
