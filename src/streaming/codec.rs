//! Tile file serialization
//!
//! Little-endian, one fixed-size record per instance:
//!
//! ```text
//! u32          format version
//! repeated until end of file:
//!   f32 x3     position
//!   f32 x4     rotation quaternion (x, y, z, w)
//!   f32 x3     scale
//!   i32        preset index
//!   f32 x4     colour RGBA        (version >= 2 only)
//! ```
//!
//! Version 1 files carry no colour; it decodes as zero. Versions above
//! [`MAX_SUPPORTED_VERSION`] are rejected so that older builds fail cleanly on
//! newer files instead of misparsing them.

use thiserror::Error;

use crate::core::time::FrameClock;
use crate::core::types::{Quat, Vec3, Vec4};
use crate::streaming::budget::EncodeBudget;
use crate::streaming::instance::PlacedInstance;

/// Version written by the encoder
pub const TILE_FORMAT_VERSION: u32 = 2;

/// Highest version the decoder understands. Version 3 is reserved.
pub const MAX_SUPPORTED_VERSION: u32 = 2;

/// Header size in bytes
pub const HEADER_SIZE: usize = 4;

/// Record size for version 1 (no colour)
pub const RECORD_SIZE_V1: usize = 4 * (3 + 4 + 3 + 1);

/// Record size for version 2 and later
pub const RECORD_SIZE_V2: usize = RECORD_SIZE_V1 + 4 * 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("tile data is {len} bytes, too short for a header")]
    MissingHeader { len: usize },

    #[error("unsupported tile format version {found} (max supported {max})")]
    UnsupportedVersion { found: u32, max: u32 },

    #[error("tile data of {len} bytes does not end on a {record_size}-byte record boundary")]
    Truncated { len: usize, record_size: usize },
}

/// Result of decoding one tile file
#[derive(Debug, Clone)]
pub struct DecodedTile {
    pub version: u32,
    pub instances: Vec<PlacedInstance>,
}

/// Record size used by a given format version
pub fn record_size(version: u32) -> Result<usize, CodecError> {
    match version {
        1 => Ok(RECORD_SIZE_V1),
        2 => Ok(RECORD_SIZE_V2),
        found => Err(CodecError::UnsupportedVersion {
            found,
            max: MAX_SUPPORTED_VERSION,
        }),
    }
}

/// Decode a whole tile file.
///
/// Nothing is returned unless the entire buffer decodes, so a rejected file
/// never delivers partial content.
pub fn decode_tile(data: &[u8]) -> Result<DecodedTile, CodecError> {
    if data.len() < HEADER_SIZE {
        return Err(CodecError::MissingHeader { len: data.len() });
    }

    let mut reader = Reader::new(data);
    let version = reader.u32();
    let record_size = record_size(version)?;

    let body_len = data.len() - HEADER_SIZE;
    if body_len % record_size != 0 {
        return Err(CodecError::Truncated {
            len: data.len(),
            record_size,
        });
    }

    let count = body_len / record_size;
    let mut instances = Vec::with_capacity(count);
    for _ in 0..count {
        let position = reader.vec3();
        let rotation = Quat::from_xyzw(reader.f32(), reader.f32(), reader.f32(), reader.f32());
        let scale = reader.vec3();
        let preset = reader.i32();
        let colour = if version >= 2 {
            Vec4::new(reader.f32(), reader.f32(), reader.f32(), reader.f32())
        } else {
            Vec4::ZERO
        };
        instances.push(PlacedInstance {
            position,
            rotation,
            scale,
            colour,
            preset,
        });
    }

    Ok(DecodedTile { version, instances })
}

/// Encode instances in the given order with no frame budget.
///
/// Callers should pass instances grouped by preset (see
/// [`ResidentTile::snapshot`](crate::streaming::instance::ResidentTile::snapshot)).
pub fn encode_tile(instances: &[PlacedInstance]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + instances.len() * RECORD_SIZE_V2);
    buf.extend_from_slice(&TILE_FORMAT_VERSION.to_le_bytes());
    for instance in instances {
        write_record(&mut buf, instance, TILE_FORMAT_VERSION);
    }
    buf
}

/// Encode instances while respecting a per-frame encode budget.
///
/// Suspends on `clock` whenever the budget runs out, so a large tile may take
/// several frames to encode. The budget carries over between calls: one
/// budget shared by every tile of a flush caps the whole flush per frame.
pub async fn encode_tile_budgeted(
    instances: &[PlacedInstance],
    budget: &mut EncodeBudget,
    clock: &FrameClock,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + instances.len() * RECORD_SIZE_V2);
    buf.extend_from_slice(&TILE_FORMAT_VERSION.to_le_bytes());
    for instance in instances {
        write_record(&mut buf, instance, TILE_FORMAT_VERSION);
        budget.record_item(clock).await;
    }
    buf
}

fn write_record(buf: &mut Vec<u8>, instance: &PlacedInstance, version: u32) {
    let mut put = |v: f32| buf.extend_from_slice(&v.to_le_bytes());
    for v in instance.position.to_array() {
        put(v);
    }
    for v in instance.rotation.to_array() {
        put(v);
    }
    for v in instance.scale.to_array() {
        put(v);
    }
    buf.extend_from_slice(&instance.preset.to_le_bytes());
    if version >= 2 {
        for v in instance.colour.to_array() {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

/// Cursor over a buffer whose length has already been validated.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take4(&mut self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        bytes
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take4())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take4())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take4())
    }

    fn vec3(&mut self) -> Vec3 {
        Vec3::new(self.f32(), self.f32(), self.f32())
    }
}
