//! Rendering backends fed by the tile streamer
//!
//! The streamer only talks to [`TileBackend`]; the batched-draw and
//! scene-graph backends are interchangeable per stream.

pub mod backend;
pub mod batched;
pub mod scene_graph;

pub use backend::{NullBackend, TileBackend};
pub use batched::{BatchedDrawBackend, InstanceRaw};
pub use scene_graph::{InstanceNode, SceneGraphBackend};
