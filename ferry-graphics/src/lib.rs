#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Redundant matching is more explicit.
    clippy::redundant_pattern_matching,
    // Explicit lifetimes are often easier to reason about.
    clippy::needless_lifetimes,
    // No need for defaults in the internal types.
    clippy::new_without_default,
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

#[path = "soft/mod.rs"]
mod hal;
mod descriptor;
mod util;
pub mod limits {
    /// Alignment of constant buffer views within a buffer.
    pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;
    /// Alignment of a texture row in a copyable layout.
    pub const TEXTURE_PITCH_ALIGNMENT: u64 = 256;
    /// Alignment of a subresource in a copyable layout.
    pub const TEXTURE_PLACEMENT_ALIGNMENT: u64 = 512;
    /// Alignment of a placed resource within a heap.
    pub const RESOURCE_PLACEMENT_ALIGNMENT: u64 = 0x10000;
    pub const RESOURCE_DESCRIPTORS: u32 = 65536;
    pub const SAMPLER_DESCRIPTORS: u32 = 2048;
}

pub use hal::*;
pub use util::copyable_footprints;

#[derive(Debug)]
pub struct ContextDesc {
    /// Check placement and descriptor usage more aggressively.
    pub validation: bool,
    /// Capacity of the shader-visible resource descriptor heap.
    pub resource_descriptors: u32,
    /// Capacity of the shader-visible sampler descriptor heap.
    pub sampler_descriptors: u32,
    /// Total bytes of device memory that heaps may occupy.
    pub memory_budget: Option<u64>,
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            resource_descriptors: limits::RESOURCE_DESCRIPTORS,
            sampler_descriptors: limits::SAMPLER_DESCRIPTORS,
            memory_budget: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("out of device memory: {requested} bytes requested, {available} available")]
    OutOfMemory { requested: u64, available: u64 },
    #[error("{kind:?} descriptor heap is full: {requested} requested, {available} available")]
    DescriptorHeapFull {
        kind: DescriptorKind,
        requested: u32,
        available: u32,
    },
    #[error("{size} bytes at offset {offset} do not fit into heap '{heap}' of {heap_size} bytes")]
    PlacementOutOfBounds {
        heap: String,
        offset: u64,
        size: u64,
        heap_size: u64,
    },
    #[error("offset {offset} is not aligned to {alignment}")]
    Misaligned { offset: u64, alignment: u64 },
    #[error("invalid resource description: {0}")]
    InvalidDesc(&'static str),
    #[error("unknown {0} handle")]
    InvalidHandle(&'static str),
    #[error("access of {size} bytes at offset {offset} exceeds resource size {resource_size}")]
    OutOfRange {
        offset: u64,
        size: u64,
        resource_size: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Memory {
    /// Device-local memory, not visible to the host.
    Device,
    /// Host-visible memory for uploading data.
    Upload,
}

#[repr(u32)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Hash, Eq, Ord, PartialEq, PartialOrd)]
pub enum TextureFormat {
    Rgba8Unorm = 1,
    Rgba8UnormSrgb = 2,
    Bc1Unorm = 3,
    Bc1UnormSrgb = 4,
    Bc3Unorm = 5,
    Bc3UnormSrgb = 6,
    Bc5Unorm = 7,
    Bc7Unorm = 8,
    Bc7UnormSrgb = 9,
}

impl TextureFormat {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Rgba8Unorm,
            2 => Self::Rgba8UnormSrgb,
            3 => Self::Bc1Unorm,
            4 => Self::Bc1UnormSrgb,
            5 => Self::Bc3Unorm,
            6 => Self::Bc3UnormSrgb,
            7 => Self::Bc5Unorm,
            8 => Self::Bc7Unorm,
            9 => Self::Bc7UnormSrgb,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct TexelBlockInfo {
    pub dimensions: (u8, u8),
    pub size: u8,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ResourceDimension {
    Buffer = 1,
    Texture2D = 2,
}

/// Description of a resource, as stored in containers.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ResourceDesc {
    pub dimension: u32,
    pub format: u32,
    pub width: u64,
    pub height: u32,
    pub depth_or_array_size: u16,
    pub mip_level_count: u16,
}

impl ResourceDesc {
    pub fn buffer(size: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer as u32,
            format: 0,
            width: size,
            height: 1,
            depth_or_array_size: 1,
            mip_level_count: 1,
        }
    }

    pub fn texture_2d(format: TextureFormat, width: u32, height: u32, mip_level_count: u16) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D as u32,
            format: format as u32,
            width: width as u64,
            height,
            depth_or_array_size: 1,
            mip_level_count,
        }
    }

    pub fn resource_dimension(&self) -> Option<ResourceDimension> {
        match self.dimension {
            1 => Some(ResourceDimension::Buffer),
            2 => Some(ResourceDimension::Texture2D),
            _ => None,
        }
    }

    pub fn texture_format(&self) -> Option<TextureFormat> {
        TextureFormat::from_raw(self.format)
    }

    pub fn extent(&self) -> Extent {
        Extent {
            width: self.width as u32,
            height: self.height,
            depth: 1,
        }
    }

    pub fn subresource_count(&self) -> u32 {
        match self.resource_dimension() {
            Some(ResourceDimension::Texture2D) => {
                self.mip_level_count as u32 * self.depth_or_array_size as u32
            }
            _ => 1,
        }
    }

    /// Check that the description is something the device can create.
    pub fn validate(&self) -> Result<(), DeviceError> {
        match self.resource_dimension() {
            Some(ResourceDimension::Buffer) => Ok(()),
            Some(ResourceDimension::Texture2D) => {
                if self.texture_format().is_none() {
                    return Err(DeviceError::InvalidDesc("unknown texture format"));
                }
                if self.width == 0 || self.height == 0 || self.width > u32::MAX as u64 {
                    return Err(DeviceError::InvalidDesc("texture extent"));
                }
                if self.mip_level_count == 0
                    || self.mip_level_count as u32 > self.extent().max_mip_levels()
                {
                    return Err(DeviceError::InvalidDesc("mip level count"));
                }
                if self.depth_or_array_size == 0 {
                    return Err(DeviceError::InvalidDesc("array size"));
                }
                Ok(())
            }
            None => Err(DeviceError::InvalidDesc("unknown dimension")),
        }
    }
}

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent {
    pub fn max_mip_levels(&self) -> u32 {
        32 - self.width.max(self.height).max(self.depth).leading_zeros()
    }
    pub fn at_mip_level(&self, level: u32) -> Self {
        Self {
            width: (self.width >> level).max(1),
            height: (self.height >> level).max(1),
            depth: (self.depth >> level).max(1),
        }
    }
}

/// Layout of one subresource in a linear copyable buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubresourceFootprint {
    pub offset: u64,
    pub row_pitch: u64,
    pub row_count: u32,
    /// Bytes of actual data in each row.
    pub row_size: u64,
    pub extent: Extent,
}

impl SubresourceFootprint {
    pub fn size(&self) -> u64 {
        self.row_pitch * self.row_count as u64
    }
}

/// Placement of a resource within a heap.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocationInfo {
    pub offset: u64,
    pub size: u64,
    pub alignment: u64,
}

#[derive(Debug)]
pub struct HeapDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub memory: Memory,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum DescriptorKind {
    /// Shader resource, constant buffer and storage views.
    Resource,
    Sampler,
}

/// A descriptor slot in a non shader-visible heap.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct CpuDescriptor {
    pub heap: DescriptorHeap,
    pub index: u32,
}

/// A contiguous run of slots in a shader-visible descriptor heap.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct DescriptorHandle {
    pub kind: DescriptorKind,
    pub start: u32,
    pub count: u32,
}

/// What a descriptor slot refers to.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Descriptor {
    #[default]
    Empty,
    TextureView {
        resource: Resource,
        mip_level_count: u32,
    },
    Sampler(SamplerDesc),
}

/// How edges should be handled in texture addressing.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
pub enum AddressMode {
    /// Clamp the value to the edge of the texture.
    #[default]
    ClampToEdge,
    /// Repeat the texture in a tiling fashion.
    Repeat,
    /// Repeat the texture, mirroring it every repeat.
    MirrorRepeat,
    /// Clamp the value to the border of the texture.
    ClampToBorder,
}

/// Texel mixing mode when sampling between texels.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
pub enum FilterMode {
    /// Nearest neighbor sampling.
    #[default]
    Nearest,
    /// Linear Interpolation
    Linear,
}

#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct SamplerDesc {
    pub address_modes: [AddressMode; 3],
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct BufferPiece {
    pub resource: Resource,
    pub offset: u64,
}

impl From<Resource> for BufferPiece {
    fn from(resource: Resource) -> Self {
        Self {
            resource,
            offset: 0,
        }
    }
}

impl Resource {
    pub fn at(self, offset: u64) -> BufferPiece {
        BufferPiece {
            resource: self,
            offset,
        }
    }
}

#[derive(Debug)]
pub struct CommandEncoderDesc<'a> {
    pub name: &'a str,
}
