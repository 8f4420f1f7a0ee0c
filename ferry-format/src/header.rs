use crate::{FormatError, Offset, MAGIC, VERSION};
use ferry_storage::CompressionFormat;
use std::{fmt, mem};

/// Payload type of the regions that go straight to the device.
#[derive(Clone, Copy, Debug)]
pub enum GpuData {}

/// A compressed span of the container file.
///
/// Unlike the pointers inside of regions, `data` is an absolute file offset.
#[repr(C)]
pub struct Region<T> {
    pub compression: u32,
    pub reserved: u32,
    pub data: Offset<T>,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

pub type GpuRegion = Region<GpuData>;

impl<T> Clone for Region<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Region<T> {}
impl<T> PartialEq for Region<T> {
    fn eq(&self, other: &Self) -> bool {
        self.compression == other.compression
            && self.data == other.data
            && self.compressed_size == other.compressed_size
            && self.uncompressed_size == other.uncompressed_size
    }
}
impl<T> fmt::Debug for Region<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("Region")
            .field("compression", &self.compression)
            .field("data", &self.data)
            .field("compressed_size", &self.compressed_size)
            .field("uncompressed_size", &self.uncompressed_size)
            .finish()
    }
}
unsafe impl<T> bytemuck::Zeroable for Region<T> {}
unsafe impl<T: 'static> bytemuck::Pod for Region<T> {}

impl<T> Region<T> {
    pub(crate) fn new(format: CompressionFormat, offset: u64, compressed_size: u32, uncompressed_size: u32) -> Self {
        Self {
            compression: match format {
                CompressionFormat::None => 0,
                CompressionFormat::Tiled => 1,
            },
            reserved: 0,
            data: Offset::new(offset),
            compressed_size,
            uncompressed_size,
        }
    }

    pub fn compression_format(&self) -> Result<CompressionFormat, FormatError> {
        match self.compression {
            0 => Ok(CompressionFormat::None),
            1 => Ok(CompressionFormat::Tiled),
            other => Err(FormatError::UnknownCompression(other)),
        }
    }

    /// Check that the region describes something readable.
    pub fn validate(&self) -> Result<CompressionFormat, FormatError> {
        let format = self.compression_format()?;
        if format == CompressionFormat::None && self.compressed_size != self.uncompressed_size {
            return Err(FormatError::SizeMismatch {
                stored: self.compressed_size,
                uncompressed: self.uncompressed_size,
            });
        }
        Ok(format)
    }
}

/// Fixed header at the start of every container.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Header {
    pub magic: [u8; 4],
    pub version: u16,
    pub reserved: u16,
    /// Geometry and material constants.
    pub unstructured_gpu_data: GpuRegion,
    pub cpu_metadata: Region<crate::CpuMetadataHeader>,
    pub cpu_data: Region<crate::CpuDataHeader>,
    pub aabb_min: [f32; 3],
    pub aabb_max: [f32; 3],
}

impl Header {
    pub const SIZE: usize = mem::size_of::<Self>();

    /// Parse and validate the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        let header: Self = bytes
            .get(..Self::SIZE)
            .map(bytemuck::pod_read_unaligned)
            .ok_or(FormatError::Truncated("header"))?;
        if header.magic != MAGIC {
            return Err(FormatError::InvalidMagic(header.magic));
        }
        if header.version != VERSION {
            return Err(FormatError::UnsupportedVersion {
                found: header.version,
                expected: VERSION,
            });
        }
        header.unstructured_gpu_data.validate()?;
        header.cpu_metadata.validate()?;
        header.cpu_data.validate()?;
        Ok(header)
    }
}
