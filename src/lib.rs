//! Scatter Stream - tile-based streaming of scattered instances

pub mod core;
pub mod math;
pub mod render;
pub mod streaming;
