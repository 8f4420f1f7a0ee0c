use crate::{FormatError, GpuRegion, MemoryRegion, Offset, Ptr, Resolved};
use ferry_graphics as gpu;

/// Start of the CPU metadata region.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CpuMetadataHeader {
    pub texture_count: u32,
    pub material_count: u32,
    pub textures: Offset<TextureRecord>,
    /// One description per texture, in the same order.
    pub texture_descs: Offset<gpu::ResourceDesc>,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TextureRecord {
    /// NUL-terminated name.
    pub name: Offset<u8>,
    /// All mip levels, in the copyable layout of the description.
    pub mips: GpuRegion,
}

/// The metadata region with every pointer resolved.
pub struct CpuMetadata {
    region: MemoryRegion,
    header: CpuMetadataHeader,
    textures: Resolved<TextureRecord>,
    texture_descs: Resolved<gpu::ResourceDesc>,
    names: Vec<Resolved<u8>>,
}

impl CpuMetadata {
    /// Resolve all the pointers of a freshly read metadata region.
    ///
    /// Takes the region by value, so it can only be done once.
    #[profiling::function]
    pub fn fixup(region: MemoryRegion) -> Result<Self, FormatError> {
        let header = region.header::<CpuMetadataHeader>("metadata header")?;
        let count = header.texture_count as usize;
        let textures = Ptr::from(header.textures).fixup(&region, count)?;
        let texture_descs = Ptr::from(header.texture_descs).fixup(&region, count)?;
        let names = region
            .slice(&textures)
            .iter()
            .map(|record| Ptr::from(record.name).fixup_str(&region))
            .collect::<Result<Vec<_>, _>>()?;
        for record in region.slice(&textures) {
            record.mips.validate()?;
        }
        Ok(Self {
            region,
            header,
            textures,
            texture_descs,
            names,
        })
    }

    pub fn texture_count(&self) -> usize {
        self.header.texture_count as usize
    }

    pub fn material_count(&self) -> usize {
        self.header.material_count as usize
    }

    pub fn textures(&self) -> &[TextureRecord] {
        self.region.slice(&self.textures)
    }

    pub fn texture_descs(&self) -> &[gpu::ResourceDesc] {
        self.region.slice(&self.texture_descs)
    }

    pub fn texture_name(&self, index: usize) -> &str {
        match self.names.get(index) {
            Some(name) => self.region.str(name),
            None => "",
        }
    }
}
