//! Streaming simulation: seeds a scatter world on disk and flies a camera over it.
//!
//! Usage: cargo run --release --bin stream_sim -- [OPTIONS]
//!
//! Options:
//!   --dir <PATH>        Storage directory (default: assets/scatter)
//!   --tile <METERS>     Tile width (default: 32)
//!   --distance <M>      Streaming distance (default: 160)
//!   --density <N>       Instances per seeded tile (default: 64)
//!   --frames <N>        Frames to simulate (default: 600)
//!   --speed <M>         Camera movement per frame (default: 2.0)
//!   --seed <SEED>       Random seed (default: 12345)
//!   --config <PATH>     Load a StreamConfig JSON instead of the flags above
//!
//! Output structure:
//!   <dir>/sim/
//!     tile_0_0.sct
//!     ...

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use glam::{Quat, Vec3, Vec4};
use rayon::prelude::*;

use scatter_stream::core::FrameClock;
use scatter_stream::render::BatchedDrawBackend;
use scatter_stream::streaming::{
    PlacedInstance, StreamConfig, TileCoords, WorldStream, encode_tile, tile_path,
};

const STREAM_ID: &str = "sim";

fn main() {
    scatter_stream::core::logging::init_with_timestamps();

    let args: Vec<String> = std::env::args().collect();
    let frames = parse_usize_arg(&args, "--frames").unwrap_or(600);
    let speed = parse_f32_arg(&args, "--speed").unwrap_or(2.0);
    let density = parse_usize_arg(&args, "--density").unwrap_or(64);
    let seed = parse_u32_arg(&args, "--seed").unwrap_or(12345);

    let config = match parse_str_arg(&args, "--config") {
        Some(path) => match StreamConfig::load_json(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to load config {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => StreamConfig {
            tile_width: parse_f32_arg(&args, "--tile").unwrap_or(32.0),
            streaming_distance: parse_f32_arg(&args, "--distance").unwrap_or(160.0),
            storage_dir: PathBuf::from(
                parse_str_arg(&args, "--dir").unwrap_or_else(|| "assets/scatter".to_string()),
            ),
            ..Default::default()
        },
    };

    println!("=== Scatter Stream Simulation ===");
    println!("Storage:  {}", config.storage_dir.display());
    println!("Tile:     {}m", config.tile_width);
    println!("Distance: {}m", config.effective_distance());
    println!("Frames:   {} at {}m/frame", frames, speed);
    println!();

    let path_len = frames as f32 * speed;
    let seeded = seed_world(&config, path_len, density, seed);
    println!("Seeded {} tiles", seeded);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Failed to start tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(simulate(config, frames, speed, seed)) {
        log::error!("Simulation failed: {}", e);
        std::process::exit(1);
    }
}

async fn simulate(config: StreamConfig, frames: usize, speed: f32, seed: u32) -> scatter_stream::core::Result<()> {
    let clock = FrameClock::new();
    let backend = Arc::new(BatchedDrawBackend::new());
    let stream = Arc::new(
        WorldStream::builder(STREAM_ID, config)
            .clock(clock.clone())
            .backend(backend.clone())
            .build()?,
    );
    stream.init().await?;

    let start = Instant::now();
    let edits = Arc::new(AtomicUsize::new(0));
    for frame in 0..frames {
        clock.tick();
        let camera = Vec3::new(frame as f32 * speed, 2.0, 0.0);
        stream.update(camera);

        // Drop a new prop next to the camera every second of simulated time.
        // Edits wait for the content lock, so they run beside the frame loop.
        if frame % 60 == 59 {
            let jitter = hash01(seed, frame as u32, 7) * 4.0 - 2.0;
            let instance = PlacedInstance::at(camera + Vec3::new(0.0, -2.0, jitter), 99);
            let stream = stream.clone();
            let edits = edits.clone();
            tokio::spawn(async move {
                match stream.add_instance(instance).await {
                    Ok(_) => {
                        edits.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => log::debug!("Edit at frame {} skipped: {}", frame, e),
                }
            });
        }

        if frame % 120 == 0 {
            log::info!(
                "frame {:>5}: {} loaded, {} instances drawn",
                frame,
                stream.loaded_coords().len(),
                backend.total_instances()
            );
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Budgeted work still in flight needs frames to finish
    let ticker = {
        let clock = clock.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(1)).await;
                clock.tick();
            }
        })
    };
    stream.wait_idle().await;
    let summary = stream.shutdown().await?;
    ticker.abort();
    let elapsed = start.elapsed();

    println!();
    println!("Simulated {} frames in {:.2}s, {} edits, {} tiles saved on shutdown",
        frames, elapsed.as_secs_f64(), edits.load(Ordering::Relaxed), summary.written);
    println!("{}", serde_json::to_string_pretty(&stream.stats())?);
    Ok(())
}

/// Write seeded tiles along the camera path. Returns the number of tiles written.
fn seed_world(config: &StreamConfig, path_len: f32, density: usize, seed: u32) -> usize {
    let width = config.tile_width;
    let reach = (config.effective_distance() / width).ceil() as i32 + 1;
    let max_x = (path_len / width).ceil() as i32 + reach;

    let coords: Vec<TileCoords> = (-reach..=max_x)
        .flat_map(|x| (-reach..=reach).map(move |z| TileCoords::new(x, z)))
        .collect();

    let written = AtomicUsize::new(0);
    coords.par_iter().for_each(|&coords| {
        // Leave some tiles empty so missing-file memoization is exercised
        if hash01(seed, coords.x as u32, coords.z as u32) < 0.2 {
            return;
        }

        let origin = coords.origin(width);
        let instances: Vec<PlacedInstance> = (0..density as u32)
            .map(|i| {
                let salt = i.wrapping_mul(31);
                let h = |k: u32| hash01(seed ^ salt, coords.x as u32 ^ k, coords.z as u32);
                PlacedInstance::new(
                    Vec3::new(origin.x + h(1) * width, 0.0, origin.y + h(2) * width),
                    Quat::from_rotation_y(h(3) * std::f32::consts::TAU),
                    Vec3::splat(0.5 + h(4)),
                    Vec4::new(0.3 + 0.4 * h(5), 0.5 + 0.5 * h(6), 0.2, 1.0),
                    (h(8) * 4.0) as i32,
                )
            })
            .collect();

        let path = tile_path(&config.storage_dir, STREAM_ID, coords);
        let result = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| std::fs::write(&path, encode_tile(&instances)));
        match result {
            Ok(()) => {
                written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::warn!("Failed to seed tile {}: {}", coords, e),
        }
    });

    written.into_inner()
}

/// Cheap integer hash mapped to [0, 1)
fn hash01(seed: u32, a: u32, b: u32) -> f32 {
    let mut h = seed
        .wrapping_mul(0x9E37_79B9)
        ^ a.wrapping_mul(0x85EB_CA6B)
        ^ b.wrapping_mul(0xC2B2_AE35);
    h ^= h >> 16;
    h = h.wrapping_mul(0x7FEB_352D);
    h ^= h >> 15;
    h = h.wrapping_mul(0x846C_A68B);
    h ^= h >> 16;
    (h >> 8) as f32 / (1u32 << 24) as f32
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    parse_str_arg(args, flag).and_then(|s| s.parse().ok())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    parse_str_arg(args, flag).and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    parse_str_arg(args, flag).and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
