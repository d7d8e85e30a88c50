//! Tiles within streaming distance of a viewpoint
//!
//! The candidate window is scanned in parallel with rayon, one column of the
//! window per work item, and the passing coordinates are collected into a
//! fresh set.

use std::collections::HashSet;

use rayon::prelude::*;
use tokio::sync::oneshot;

use crate::core::error::Error;
use crate::core::types::{Result, Vec2, Vec3};
use crate::streaming::coords::TileCoords;

/// Widest scan radius, in tiles, on each side of the camera's tile
pub const MAX_INDEX_LIMIT: i32 = 8192;

/// Scan radius in tiles for a distance, clamped to [`MAX_INDEX_LIMIT`]
pub fn index_limit(distance: f32, tile_width: f32) -> i32 {
    let limit = (distance / tile_width).ceil();
    if limit > MAX_INDEX_LIMIT as f32 {
        log::warn!(
            "Streaming distance {} spans {} tiles; scanning only {}",
            distance, limit, MAX_INDEX_LIMIT
        );
        return MAX_INDEX_LIMIT;
    }
    limit as i32
}

/// Tiles whose centre lies within `distance` of the camera's ground-plane position.
///
/// Empty for a non-positive (or non-finite) distance or tile width.
pub fn collect_in_range(camera_in_stream: Vec3, distance: f32, tile_width: f32) -> HashSet<TileCoords> {
    if !(distance > 0.0 && distance.is_finite() && tile_width > 0.0) {
        return HashSet::new();
    }

    let index_limit = index_limit(distance, tile_width);
    let camera = Vec2::new(camera_in_stream.x, camera_in_stream.z);
    let center = TileCoords::from_position(camera_in_stream, tile_width);
    let distance_sq = distance * distance;

    (-index_limit..=index_limit)
        .into_par_iter()
        .flat_map_iter(|dx| {
            (-index_limit..=index_limit).filter_map(move |dz| {
                let coords = center.offset(dx, dz);
                let d_sq = coords.center(tile_width).distance_squared(camera);
                (d_sq <= distance_sq).then_some(coords)
            })
        })
        .collect()
}

/// Run [`collect_in_range`] on the rayon pool and await the result.
///
/// Keeps the scan off the async worker that drives the streaming pass.
pub async fn collect_in_range_async(
    camera_in_stream: Vec3,
    distance: f32,
    tile_width: f32,
) -> Result<HashSet<TileCoords>> {
    let (tx, rx) = oneshot::channel();
    rayon::spawn(move || {
        // The receiver only goes away if the pass was dropped
        let _ = tx.send(collect_in_range(camera_in_stream, distance, tile_width));
    });
    rx.await
        .map_err(|_| Error::Task("range scan was dropped before completing".to_string()))
}
