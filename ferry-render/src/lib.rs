#![allow(irrefutable_let_patterns, clippy::new_without_default)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

mod defaults;
mod hub;
mod join;
pub mod model;
mod placement;
mod scene;

pub use defaults::DefaultTextures;
pub use hub::{HubDesc, ModelHub};
pub use join::Join;
pub use model::{LoadError, LoadPhase, Model};
pub use placement::{AllocationPlan, GpuAllocation};
pub use scene::SceneGraph;

use ferry_graphics as gpu;
use std::{ops, sync::Arc};

/// Root parameter slots used by `Model::draw`.
pub mod slots {
    pub const MESH_CONSTANTS: u32 = 0;
    pub const MATERIAL_CONSTANTS: u32 = 1;
    pub const MATERIAL_TEXTURES: u32 = 2;
    pub const SAMPLERS: u32 = 3;
    pub const VERTEX_BUFFER: u32 = 0;
}

/// Kind of texture in a material descriptor table, in table order.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, strum::EnumIter, strum::EnumCount)]
pub enum TextureSlot {
    BaseColor = 0,
    MetallicRoughness = 1,
    Normal = 2,
    Emissive = 3,
}

/// How a mesh is blended, as stored in the container.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub enum DrawMode {
    #[default]
    Unknown,
    Opaque,
    Mask,
    Blend,
}

impl DrawMode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Opaque,
            2 => Self::Mask,
            3 => Self::Blend,
            _ => Self::Unknown,
        }
    }

    pub fn into_raw(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Opaque => 1,
            Self::Mask => 2,
            Self::Blend => 3,
        }
    }
}

/// Shared pieces every model needs to load and render.
#[derive(Clone)]
pub struct ModelContext {
    pub gpu: Arc<gpu::Context>,
    pub storage: Arc<ferry_storage::Storage>,
    pub defaults: Arc<DefaultTextures>,
}

/// Byte totals of a loaded model.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct DataSize {
    /// Heap bytes taken by textures.
    pub texture: u64,
    /// Heap bytes taken by the unstructured buffer.
    pub buffer: u64,
    /// Host bytes of the metadata and data regions.
    pub cpu: u64,
    /// Bytes read from the file.
    pub compressed: u64,
    /// Bytes after decompression.
    pub uncompressed: u64,
}

impl ops::AddAssign for DataSize {
    fn add_assign(&mut self, other: Self) {
        self.texture += other.texture;
        self.buffer += other.buffer;
        self.cpu += other.cpu;
        self.compressed += other.compressed;
        self.uncompressed += other.uncompressed;
    }
}
