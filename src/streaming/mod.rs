//! Tile streaming of scattered instances
//!
//! The world is cut into square tiles on the ground plane. Tiles within the
//! streaming distance of the viewpoint are loaded from per-tile files, tiles
//! that leave the range are evicted, and edited tiles are written back.

pub mod coords;
pub mod instance;
pub mod codec;
pub mod budget;
pub mod range;
pub mod lock;
pub mod hooks;
pub mod stats;
pub mod config;
pub mod state;
pub mod loader;
pub mod unloader;
pub mod dirty;
pub mod orchestrator;

pub use coords::{TileCoords, tile_path, stream_dir};
pub use instance::{PlacedInstance, ResidentTile};
pub use codec::{
    CodecError, DecodedTile,
    decode_tile, encode_tile, encode_tile_budgeted,
    TILE_FORMAT_VERSION, MAX_SUPPORTED_VERSION,
};
pub use budget::{EncodeBudget, FrameLoadBudget};
pub use range::{collect_in_range, collect_in_range_async};
pub use lock::{ContentGuard, ContentLock, LockOwner};
pub use hooks::{LoadCompleteHook, LoadOutcome, PreloadHook, load_complete_hook, preload_hook};
pub use stats::StreamStats;
pub use config::StreamConfig;
pub use dirty::{FlushSummary, TileFlush};
pub use loader::LoaderSummary;
pub use orchestrator::{WorldStream, WorldStreamBuilder};
