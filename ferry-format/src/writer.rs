use crate::{
    CpuDataHeader, CpuMetadataHeader, FormatError, GpuRegion, GraphNode, Header,
    MaterialConstants, MaterialTextures, MeshRecord, Offset, Region, TextureRecord,
    ARRAY_ALIGNMENT, MAGIC, MATERIAL_CONSTANTS_STRIDE, VERSION,
};
use ferry_graphics as gpu;
use ferry_storage::{Codec, CompressionFormat};
use std::{
    io::{Seek, SeekFrom, Write},
    mem,
};

/// A texture with all of its mips in the copyable layout.
pub struct TextureData {
    pub name: String,
    pub desc: gpu::ResourceDesc,
    pub data: Vec<u8>,
}

impl TextureData {
    /// Lay out tightly packed mip levels, finest first.
    pub fn from_mips(
        name: &str,
        desc: gpu::ResourceDesc,
        mips: &[Vec<u8>],
    ) -> Result<Self, FormatError> {
        let invalid = |reason: String| FormatError::InvalidTexture {
            name: name.to_string(),
            reason,
        };
        desc.validate().map_err(|e| invalid(e.to_string()))?;
        let (footprints, total) = gpu::copyable_footprints(&desc);
        if mips.len() != footprints.len() {
            return Err(invalid(format!(
                "{} mips provided, {} expected",
                mips.len(),
                footprints.len()
            )));
        }
        let mut data = vec![0u8; total as usize];
        for (level, (mip, footprint)) in mips.iter().zip(footprints.iter()).enumerate() {
            let row_size = footprint.row_size as usize;
            if mip.len() != row_size * footprint.row_count as usize {
                return Err(invalid(format!(
                    "mip {} holds {} bytes instead of {} rows of {}",
                    level,
                    mip.len(),
                    footprint.row_count,
                    row_size
                )));
            }
            for (row, src) in mip.chunks(row_size).enumerate() {
                let start = (footprint.offset + row as u64 * footprint.row_pitch) as usize;
                data[start..start + row_size].copy_from_slice(src);
            }
        }
        Ok(Self {
            name: name.to_string(),
            desc,
            data,
        })
    }
}

/// Everything that goes into a container.
#[derive(Default)]
pub struct ModelData {
    pub textures: Vec<TextureData>,
    /// Vertices and 32-bit indices, referenced by the meshes.
    pub geometry: Vec<u8>,
    pub meshes: Vec<MeshRecord>,
    /// Pre-order nodes, the root first.
    pub scene_graph: Vec<GraphNode>,
    pub node_names: Vec<String>,
    pub material_textures: Vec<MaterialTextures>,
    /// Missing entries are filled with the defaults.
    pub material_constants: Vec<MaterialConstants>,
    pub aabb_min: [f32; 3],
    pub aabb_max: [f32; 3],
}

impl ModelData {
    /// Geometry followed by the material constants, at a constant buffer stride.
    fn unstructured_data(&self) -> (Vec<u8>, u32) {
        let stride = MATERIAL_CONSTANTS_STRIDE as usize;
        let mut bytes = self.geometry.clone();
        bytes.resize(bytes.len().next_multiple_of(stride), 0);
        let offset = bytes.len() as u32;
        for index in 0..self.material_textures.len() {
            let constants = self
                .material_constants
                .get(index)
                .copied()
                .unwrap_or_default();
            let start = bytes.len();
            bytes.extend_from_slice(bytemuck::bytes_of(&constants));
            bytes.resize(start + stride, 0);
        }
        (bytes, offset)
    }

    fn metadata_region(&self, texture_regions: &[GpuRegion]) -> Vec<u8> {
        let mut builder = RegionBuilder::new::<CpuMetadataHeader>();
        let mut records = texture_regions
            .iter()
            .map(|&mips| TextureRecord {
                name: Offset::default(),
                mips,
            })
            .collect::<Vec<_>>();
        let textures = builder.push_array(&records);
        let descs = self.textures.iter().map(|t| t.desc).collect::<Vec<_>>();
        let texture_descs = builder.push_array(&descs);
        for (record, texture) in records.iter_mut().zip(self.textures.iter()) {
            record.name = builder.push_str(&texture.name);
        }
        builder.patch(textures, &records);
        builder.patch(
            Offset::new(0),
            &[CpuMetadataHeader {
                texture_count: records.len() as u32,
                material_count: self.material_textures.len() as u32,
                textures,
                texture_descs,
            }],
        );
        builder.bytes
    }

    fn data_region(&self, material_constants_offset: u32) -> Vec<u8> {
        let mut builder = RegionBuilder::new::<CpuDataHeader>();
        let scene_graph = builder.push_array(&self.scene_graph);
        let meshes = builder.push_array(&self.meshes);
        let materials = builder.push_array(&self.material_textures);
        let mut names = vec![Offset::<u8>::default(); self.scene_graph.len()];
        let node_names = builder.push_array(&names);
        for (index, name) in names.iter_mut().enumerate() {
            let text = self.node_names.get(index).map_or("", String::as_str);
            *name = builder.push_str(text);
        }
        builder.patch(node_names, &names);
        builder.patch(
            Offset::new(0),
            &[CpuDataHeader {
                node_count: self.scene_graph.len() as u32,
                mesh_count: self.meshes.len() as u32,
                scene_graph,
                meshes,
                material_constants_offset,
                material_count: self.material_textures.len() as u32,
                materials,
                node_names,
            }],
        );
        builder.bytes
    }
}

/// Serializer of a CPU region, keeping arrays aligned.
struct RegionBuilder {
    bytes: Vec<u8>,
}

impl RegionBuilder {
    fn new<H: bytemuck::Pod>() -> Self {
        Self {
            bytes: vec![0; mem::size_of::<H>()],
        }
    }

    fn push_array<T: bytemuck::Pod>(&mut self, items: &[T]) -> Offset<T> {
        let start = self.bytes.len().next_multiple_of(ARRAY_ALIGNMENT);
        self.bytes.resize(start, 0);
        self.bytes.extend_from_slice(bytemuck::cast_slice(items));
        Offset::new(start as u64)
    }

    fn push_str(&mut self, text: &str) -> Offset<u8> {
        let start = self.bytes.len();
        self.bytes.extend_from_slice(text.as_bytes());
        self.bytes.push(0);
        Offset::new(start as u64)
    }

    fn patch<T: bytemuck::Pod>(&mut self, offset: Offset<T>, items: &[T]) {
        let src = bytemuck::cast_slice::<T, u8>(items);
        let start = offset.get() as usize;
        self.bytes[start..start + src.len()].copy_from_slice(src);
    }
}

/// Byte counts of a written container.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WriteSummary {
    pub region_count: usize,
    pub compressed_region_count: usize,
    pub uncompressed_size: u64,
    pub total_size: u64,
}

pub struct ContainerWriter<'a> {
    codec: &'a Codec,
    compression: CompressionFormat,
}

impl<'a> ContainerWriter<'a> {
    pub fn new(codec: &'a Codec, compression: CompressionFormat) -> Self {
        Self { codec, compression }
    }

    fn write_region<W: Write + Seek, T>(
        &self,
        out: &mut W,
        base: u64,
        bytes: &[u8],
        name: &str,
        summary: &mut WriteSummary,
    ) -> Result<Region<T>, FormatError> {
        let offset = out.stream_position()? - base;
        let uncompressed_size =
            u32::try_from(bytes.len()).map_err(|_| FormatError::RegionTooLarge(bytes.len()))?;
        let compressed;
        let (format, stored) = match self.compression {
            CompressionFormat::None => (CompressionFormat::None, bytes),
            CompressionFormat::Tiled => {
                compressed = self.codec.compress(bytes);
                if compressed.len() < bytes.len() {
                    (CompressionFormat::Tiled, &compressed[..])
                } else {
                    log::debug!("Region '{}' does not compress, storing it raw", name);
                    (CompressionFormat::None, bytes)
                }
            }
        };
        out.write_all(stored)?;
        log::info!(
            "{:#x} : {} {} --> {}",
            offset,
            name,
            bytes.len(),
            stored.len()
        );
        summary.region_count += 1;
        if format != CompressionFormat::None {
            summary.compressed_region_count += 1;
        }
        summary.uncompressed_size += bytes.len() as u64;
        Ok(Region::new(
            format,
            offset,
            stored.len() as u32,
            uncompressed_size,
        ))
    }

    /// Serialize the model at the current position of `out`.
    ///
    /// The header is written as a placeholder first, and filled in
    /// once the location of every region is known.
    #[profiling::function]
    pub fn write<W: Write + Seek>(
        &self,
        model: &ModelData,
        out: &mut W,
    ) -> Result<WriteSummary, FormatError> {
        let mut summary = WriteSummary::default();
        let base = out.stream_position()?;
        out.write_all(bytemuck::bytes_of(&<Header as bytemuck::Zeroable>::zeroed()))?;

        let mut texture_regions = Vec::with_capacity(model.textures.len());
        for texture in model.textures.iter() {
            let region = self.write_region(out, base, &texture.data, &texture.name, &mut summary)?;
            texture_regions.push(region);
        }
        let (unstructured, material_constants_offset) = model.unstructured_data();
        let unstructured_gpu_data =
            self.write_region(out, base, &unstructured, "unstructured GPU data", &mut summary)?;
        let cpu_metadata = self.write_region(
            out,
            base,
            &model.metadata_region(&texture_regions),
            "CPU metadata",
            &mut summary,
        )?;
        let cpu_data = self.write_region(
            out,
            base,
            &model.data_region(material_constants_offset),
            "CPU data",
            &mut summary,
        )?;

        let header = Header {
            magic: MAGIC,
            version: VERSION,
            reserved: 0,
            unstructured_gpu_data,
            cpu_metadata,
            cpu_data,
            aabb_min: model.aabb_min,
            aabb_max: model.aabb_max,
        };
        let end = out.stream_position()?;
        out.seek(SeekFrom::Start(base))?;
        out.write_all(bytemuck::bytes_of(&header))?;
        out.seek(SeekFrom::Start(end))?;
        summary.total_size = end - base;
        log::info!(
            "Container of {} regions: {} bytes, {} uncompressed",
            summary.region_count,
            summary.total_size,
            summary.uncompressed_size
        );
        Ok(summary)
    }
}
