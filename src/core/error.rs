//! Error types for the scatter streaming engine

use thiserror::Error;

use crate::streaming::codec::CodecError;
use crate::streaming::coords::TileCoords;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tile codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Tile {0} is not loaded")]
    TileNotLoaded(TileCoords),

    #[error("Tile {0} has stored content that could not be loaded; refusing to overwrite it")]
    TileRejected(TileCoords),

    #[error("Tile {0} is currently being streamed in")]
    TileBusy(TileCoords),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Stream has not been initialized")]
    NotInitialized,
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Task(e.to_string())
    }
}
