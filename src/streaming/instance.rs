//! Placed instance records and resident tile content

use std::collections::BTreeMap;

use crate::core::types::{Mat4, Quat, Vec3, Vec4};
use crate::math::Aabb;

/// One scattered object: transform in stream space, colour and preset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacedInstance {
    pub position: Vec3,
    /// Unit quaternion
    pub rotation: Quat,
    pub scale: Vec3,
    pub colour: Vec4,
    /// Index into the stream's preset (asset) table
    pub preset: i32,
}

impl PlacedInstance {
    pub fn new(position: Vec3, rotation: Quat, scale: Vec3, colour: Vec4, preset: i32) -> Self {
        Self {
            position,
            rotation,
            scale,
            colour,
            preset,
        }
    }

    /// Unrotated, unit-scale white instance at `position`
    pub fn at(position: Vec3, preset: i32) -> Self {
        Self::new(position, Quat::IDENTITY, Vec3::ONE, Vec4::ONE, preset)
    }

    /// Local-to-stream transform matrix
    pub fn local_to_stream(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}

/// In-memory content of one tile, grouped by preset index.
///
/// Owned by the stream's loaded registry; created on a successful load (or
/// when an edit gives a missing tile its first content) and dropped on unload.
#[derive(Debug, Clone, Default)]
pub struct ResidentTile {
    presets: BTreeMap<i32, Vec<PlacedInstance>>,
    bounds: Option<Aabb>,
}

impl ResidentTile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tile from decoded instances, keeping their order within each preset
    pub fn from_instances<I>(instances: I) -> Self
    where
        I: IntoIterator<Item = PlacedInstance>,
    {
        let mut tile = Self::new();
        for instance in instances {
            tile.push(instance);
        }
        tile.recompute_bounds();
        tile
    }

    pub fn push(&mut self, instance: PlacedInstance) {
        self.presets.entry(instance.preset).or_default().push(instance);
    }

    /// Keep only instances matching the predicate
    pub fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&PlacedInstance) -> bool,
    {
        for list in self.presets.values_mut() {
            list.retain(|i| f(i));
        }
        self.presets.retain(|_, list| !list.is_empty());
    }

    pub fn clear(&mut self) {
        self.presets.clear();
        self.bounds = None;
    }

    /// Instances of a single preset, in insertion order
    pub fn instances_of(&self, preset: i32) -> &[PlacedInstance] {
        self.presets.get(&preset).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Preset indices present in this tile, ascending
    pub fn presets(&self) -> impl Iterator<Item = i32> + '_ {
        self.presets.keys().copied()
    }

    /// All instances, grouped by ascending preset index
    pub fn iter(&self) -> impl Iterator<Item = &PlacedInstance> {
        self.presets.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.presets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.values().all(Vec::is_empty)
    }

    /// Copy of every instance in on-disk order (grouped by preset)
    pub fn snapshot(&self) -> Vec<PlacedInstance> {
        self.iter().copied().collect()
    }

    /// Bounds of the instance origins as of the last recompute
    pub fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }

    pub fn recompute_bounds(&mut self) -> Option<Aabb> {
        self.bounds = Aabb::from_points(self.iter().map(|i| i.position));
        self.bounds
    }
}
