//! Batched-draw backend
//!
//! Keeps one instance array per preset, laid out for direct upload to an
//! instance buffer. Each entry remembers its owning tile so an unload can
//! compact the batch in place.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use bytemuck::{Pod, Zeroable};

use crate::core::types::{Mat4, Vec4};
use crate::render::backend::TileBackend;
use crate::streaming::coords::TileCoords;

/// Per-instance GPU data (must match the instancing shader input)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceRaw {
    /// Local-to-stream matrix, column major (64 bytes, offset 0)
    pub model: [[f32; 4]; 4],
    /// RGBA tint (16 bytes, offset 64)
    pub colour: [f32; 4],
}

#[derive(Default)]
struct PresetBatch {
    owners: Vec<TileCoords>,
    instances: Vec<InstanceRaw>,
}

impl PresetBatch {
    /// Drop every instance owned by `coords`, keeping the order of the rest
    fn remove_tile(&mut self, coords: TileCoords) -> usize {
        let mut keep = 0;
        for i in 0..self.owners.len() {
            if self.owners[i] != coords {
                self.owners.swap(keep, i);
                self.instances.swap(keep, i);
                keep += 1;
            }
        }
        let removed = self.owners.len() - keep;
        self.owners.truncate(keep);
        self.instances.truncate(keep);
        removed
    }
}

#[derive(Default)]
struct BatchState {
    batches: BTreeMap<i32, PresetBatch>,
    /// Instance count per tile
    tiles: HashMap<TileCoords, usize>,
}

/// Instance batches keyed by preset index
#[derive(Default)]
pub struct BatchedDrawBackend {
    state: Mutex<BatchState>,
}

impl BatchedDrawBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Presets with at least one instance, ascending
    pub fn presets(&self) -> Vec<i32> {
        self.state()
            .batches
            .iter()
            .filter(|(_, b)| !b.instances.is_empty())
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn instance_count(&self, preset: i32) -> usize {
        self.state().batches.get(&preset).map_or(0, |b| b.instances.len())
    }

    pub fn total_instances(&self) -> usize {
        self.state().batches.values().map(|b| b.instances.len()).sum()
    }

    /// Copy of a preset's instance data
    pub fn instances(&self, preset: i32) -> Vec<InstanceRaw> {
        self.state()
            .batches
            .get(&preset)
            .map(|b| b.instances.clone())
            .unwrap_or_default()
    }

    /// Raw bytes of a preset's instance data, ready for a buffer upload
    pub fn instance_bytes(&self, preset: i32) -> Vec<u8> {
        let state = self.state();
        match state.batches.get(&preset) {
            Some(batch) => bytemuck::cast_slice(&batch.instances).to_vec(),
            None => Vec::new(),
        }
    }
}

impl TileBackend for BatchedDrawBackend {
    fn on_instance_added(&self, coords: TileCoords, preset: i32, local_to_stream: Mat4, colour: Vec4) {
        let mut state = self.state();
        let batch = state.batches.entry(preset).or_default();
        batch.owners.push(coords);
        batch.instances.push(InstanceRaw {
            model: local_to_stream.to_cols_array_2d(),
            colour: colour.to_array(),
        });
        *state.tiles.entry(coords).or_insert(0) += 1;
    }

    fn on_tile_destroyed(&self, coords: TileCoords) {
        let mut state = self.state();
        if state.tiles.remove(&coords).is_none() {
            return;
        }
        let mut removed = 0;
        for batch in state.batches.values_mut() {
            removed += batch.remove_tile(coords);
        }
        state.batches.retain(|_, b| !b.instances.is_empty());
        log::trace!("Batched backend dropped {} instances of tile {}", removed, coords);
    }

    fn loaded_coords(&self) -> Vec<TileCoords> {
        self.state().tiles.keys().copied().collect()
    }
}
