//! Streaming statistics

use serde::Serialize;

/// Cumulative counters for one stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Completed streaming passes
    pub passes: u64,
    /// Completed dirty flush passes
    pub flushes: u64,
    /// Tiles published to the loaded set
    pub tiles_loaded: u64,
    /// Load attempts that found no backing file
    pub tiles_missing: u64,
    /// Load attempts declined by the pre-load hook
    pub tiles_vetoed: u64,
    /// Load attempts that failed to read or decode
    pub load_failures: u64,
    /// Tiles evicted by the unloader
    pub tiles_unloaded: u64,
    /// Tiles written by the dirty processor
    pub tiles_flushed: u64,
    /// Tiles whose file was removed because they became empty
    pub tiles_deleted: u64,
    /// Dirty tiles that could not be written
    pub flush_failures: u64,
    /// Instances delivered to the backend
    pub instances_loaded: u64,
}
