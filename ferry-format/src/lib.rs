#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Matches are good and extendable, no need to make an exception here.
    clippy::single_match,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

//! Binary model container.
//!
//! A container starts with a fixed `Header`, followed by independently
//! compressed regions. Pointers inside of the CPU regions are stored as
//! offsets relative to the start of their region, and get resolved
//! against the decompressed memory with `fixup`.

mod data;
mod header;
mod metadata;
mod ptr;
mod reader;
mod writer;

pub use data::{
    CpuData, CpuDataHeader, GraphNode, MaterialConstants, MaterialFlags, MaterialTextures,
    MeshRecord,
};
pub use header::{GpuData, GpuRegion, Header, Region};
pub use metadata::{CpuMetadata, CpuMetadataHeader, TextureRecord};
pub use ptr::{MemoryRegion, Offset, Ptr, RegionId, Resolved};
pub use reader::{read_header, read_region};
pub use writer::{ContainerWriter, ModelData, TextureData, WriteSummary};

use std::io;

pub const MAGIC: [u8; 4] = *b"FPAK";
pub const VERSION: u16 = 0x0100;

/// Alignment of every array stored in a CPU region.
pub const ARRAY_ALIGNMENT: usize = 16;
/// Parent index of the root node of a scene graph.
pub const ROOT_PARENT: u32 = u32::MAX;
/// Texture index of a material slot without a texture.
pub const UNSET_TEXTURE: u16 = 0xFFFF;
/// Stride of material constants in the unstructured GPU data.
pub const MATERIAL_CONSTANTS_STRIDE: u32 = ferry_graphics::limits::CONSTANT_BUFFER_ALIGNMENT as u32;

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("invalid magic {0:?}")]
    InvalidMagic([u8; 4]),
    #[error("unsupported version {found:#x}, expected {expected:#x}")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("unknown compression type {0}")]
    UnknownCompression(u32),
    #[error("uncompressed region stores {stored} bytes for {uncompressed}")]
    SizeMismatch { stored: u32, uncompressed: u32 },
    #[error("{size} bytes at offset {offset} exceed the region of {region_size} bytes")]
    PointerOutOfBounds {
        offset: u64,
        size: u64,
        region_size: u64,
    },
    #[error("offset {offset} is not aligned to {alignment}")]
    Misaligned { offset: u64, alignment: usize },
    #[error("pointer was already resolved against another region")]
    ForeignRegion,
    #[error("string at offset {0} is not terminated")]
    UnterminatedString(u64),
    #[error("string at offset {0} is not valid UTF-8")]
    InvalidString(u64),
    #[error("data is too short for {0}")]
    Truncated(&'static str),
    #[error("region of {0} bytes does not fit the container")]
    RegionTooLarge(usize),
    #[error("texture '{name}': {reason}")]
    InvalidTexture { name: String, reason: String },
    #[error(transparent)]
    Codec(#[from] ferry_storage::CodecError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
