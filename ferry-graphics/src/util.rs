use super::{limits, ResourceDesc, ResourceDimension, SubresourceFootprint, TexelBlockInfo};

impl super::TextureFormat {
    pub fn block_info(&self) -> TexelBlockInfo {
        fn uncompressed(size: u8) -> TexelBlockInfo {
            TexelBlockInfo {
                dimensions: (1, 1),
                size,
            }
        }
        fn cx_bc(size: u8) -> TexelBlockInfo {
            TexelBlockInfo {
                dimensions: (4, 4),
                size,
            }
        }
        match *self {
            Self::Rgba8Unorm => uncompressed(4),
            Self::Rgba8UnormSrgb => uncompressed(4),
            Self::Bc1Unorm => cx_bc(8),
            Self::Bc1UnormSrgb => cx_bc(8),
            Self::Bc3Unorm => cx_bc(16),
            Self::Bc3UnormSrgb => cx_bc(16),
            Self::Bc5Unorm => cx_bc(16),
            Self::Bc7Unorm => cx_bc(16),
            Self::Bc7UnormSrgb => cx_bc(16),
        }
    }
}

pub(crate) fn align_to(offset: u64, alignment: u64) -> u64 {
    offset.next_multiple_of(alignment)
}

/// Compute the linear layout of every subresource of a resource,
/// returning the footprints together with the total byte size.
///
/// Buffers have a single footprint covering the whole buffer.
/// Texture rows are padded to `TEXTURE_PITCH_ALIGNMENT`, and each
/// subresource starts at a multiple of `TEXTURE_PLACEMENT_ALIGNMENT`.
pub fn copyable_footprints(desc: &ResourceDesc) -> (Vec<SubresourceFootprint>, u64) {
    let format = match (desc.resource_dimension(), desc.texture_format()) {
        (Some(ResourceDimension::Texture2D), Some(format)) => format,
        _ => {
            let footprint = SubresourceFootprint {
                offset: 0,
                row_pitch: desc.width,
                row_count: 1,
                row_size: desc.width,
                extent: desc.extent(),
            };
            return (vec![footprint], desc.width);
        }
    };

    let block_info = format.block_info();
    let (block_width, block_height) = (
        block_info.dimensions.0 as u32,
        block_info.dimensions.1 as u32,
    );
    let base = desc.extent();
    let mut footprints = Vec::with_capacity(desc.subresource_count() as usize);
    let mut offset = 0;
    for _layer in 0..desc.depth_or_array_size {
        for level in 0..desc.mip_level_count as u32 {
            let extent = base.at_mip_level(level);
            let row_size = extent.width.div_ceil(block_width) as u64 * block_info.size as u64;
            let row_count = extent.height.div_ceil(block_height);
            offset = align_to(offset, limits::TEXTURE_PLACEMENT_ALIGNMENT);
            let footprint = SubresourceFootprint {
                offset,
                row_pitch: align_to(row_size, limits::TEXTURE_PITCH_ALIGNMENT),
                row_count,
                row_size,
                extent,
            };
            offset += footprint.size();
            footprints.push(footprint);
        }
    }
    (footprints, offset)
}

#[cfg(test)]
mod tests {
    use crate::{ResourceDesc, TextureFormat};

    #[test]
    fn footprints_of_mip_chain() {
        let desc = ResourceDesc::texture_2d(TextureFormat::Rgba8Unorm, 100, 10, 3);
        let (footprints, total) = super::copyable_footprints(&desc);
        assert_eq!(footprints.len(), 3);
        assert_eq!(footprints[0].row_size, 400);
        assert_eq!(footprints[0].row_pitch, 512);
        assert_eq!(footprints[0].row_count, 10);
        assert_eq!(footprints[1].offset, 5120);
        assert_eq!(footprints[1].extent.width, 50);
        assert_eq!(footprints[2].offset % 512, 0);
        assert_eq!(total, footprints[2].offset + footprints[2].size());
    }

    #[test]
    fn footprints_of_block_compressed() {
        let desc = ResourceDesc::texture_2d(TextureFormat::Bc1Unorm, 8, 8, 4);
        let (footprints, _) = super::copyable_footprints(&desc);
        // 2x2 blocks of 8 bytes, then 1x1 block for the rest
        assert_eq!(footprints[0].row_size, 16);
        assert_eq!(footprints[0].row_count, 2);
        assert_eq!(footprints[3].row_size, 8);
        assert_eq!(footprints[3].row_count, 1);
    }

    #[test]
    fn buffer_footprint() {
        let (footprints, total) = super::copyable_footprints(&ResourceDesc::buffer(1000));
        assert_eq!(footprints.len(), 1);
        assert_eq!(total, 1000);
    }
}
