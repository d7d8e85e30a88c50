//! External hooks consulted by the tile loader

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::streaming::coords::TileCoords;

/// Boxed future returned by async hooks
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Called before a tile load touches storage, e.g. to fetch the file from a
/// remote store. Resolving to `false` vetoes this attempt and memoizes the
/// tile as missing.
pub type PreloadHook = Arc<dyn Fn(TileCoords) -> BoxFuture<bool> + Send + Sync>;

/// Fired after every load attempt, whatever the outcome.
pub type LoadCompleteHook = Arc<dyn Fn(TileCoords, &LoadOutcome) + Send + Sync>;

/// Result of one tile load attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Published to the loaded set
    Loaded { instances: usize },
    /// No backing file
    Missing,
    /// Pre-load hook declined the load
    Vetoed,
    /// Read or decode failed
    Failed(String),
}

impl LoadOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadOutcome::Loaded { .. })
    }
}

/// Wrap an async closure as a [`PreloadHook`]
pub fn preload_hook<F, Fut>(f: F) -> PreloadHook
where
    F: Fn(TileCoords) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move |coords: TileCoords| -> BoxFuture<bool> { Box::pin(f(coords)) })
}

/// Wrap a closure as a [`LoadCompleteHook`]
pub fn load_complete_hook<F>(f: F) -> LoadCompleteHook
where
    F: Fn(TileCoords, &LoadOutcome) + Send + Sync + 'static,
{
    Arc::new(f)
}
