//! Stream configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// Configuration for one world stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Tile edge length in stream units
    pub tile_width: f32,
    /// Radius around the viewpoint that is kept resident
    pub streaming_distance: f32,
    /// Global quality scale applied to `streaming_distance`
    pub distance_multiplier: f32,
    /// Viewpoint movement that triggers a new streaming pass
    pub movement_threshold: f32,
    /// Tile loads allowed to start per frame
    pub max_loads_per_frame: usize,
    /// Wall time per frame an encode may use, in milliseconds
    pub max_encode_time_ms: f32,
    /// Instances an encode may write per frame
    pub max_encode_items_per_frame: usize,
    /// Root directory for tile files
    pub storage_dir: PathBuf,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tile_width: 32.0,
            streaming_distance: 256.0,
            distance_multiplier: 1.0,
            movement_threshold: 4.0,
            max_loads_per_frame: 4,
            max_encode_time_ms: 2.0,
            max_encode_items_per_frame: 4096,
            storage_dir: PathBuf::from("assets/scatter"),
        }
    }
}

impl StreamConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Streaming distance after the quality multiplier
    pub fn effective_distance(&self) -> f32 {
        self.streaming_distance * self.distance_multiplier
    }

    pub fn max_encode_time(&self) -> Duration {
        Duration::from_micros((self.max_encode_time_ms.max(0.0) * 1000.0) as u64)
    }

    /// Reject values the streaming engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(self.tile_width.is_finite() && self.tile_width > 0.0) {
            return Err(Error::Config(format!("tile_width must be positive, got {}", self.tile_width)));
        }
        if !(self.streaming_distance.is_finite() && self.streaming_distance >= 0.0) {
            return Err(Error::Config(format!(
                "streaming_distance must be non-negative, got {}",
                self.streaming_distance
            )));
        }
        if !(self.distance_multiplier.is_finite() && self.distance_multiplier >= 0.0) {
            return Err(Error::Config(format!(
                "distance_multiplier must be non-negative, got {}",
                self.distance_multiplier
            )));
        }
        if !(self.movement_threshold.is_finite() && self.movement_threshold >= 0.0) {
            return Err(Error::Config(format!(
                "movement_threshold must be non-negative, got {}",
                self.movement_threshold
            )));
        }
        if !(self.max_encode_time_ms.is_finite() && self.max_encode_time_ms > 0.0) {
            return Err(Error::Config(format!(
                "max_encode_time_ms must be positive, got {}",
                self.max_encode_time_ms
            )));
        }
        Ok(())
    }

    /// Save to file (sync)
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file (sync). Missing fields take their default value.
    pub fn load_json(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}
