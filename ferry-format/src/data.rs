use crate::{FormatError, MemoryRegion, Offset, Ptr, Resolved, ROOT_PARENT, UNSET_TEXTURE};

/// Start of the CPU data region.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CpuDataHeader {
    pub node_count: u32,
    pub mesh_count: u32,
    pub scene_graph: Offset<GraphNode>,
    pub meshes: Offset<MeshRecord>,
    /// Byte offset of the material constants in the unstructured GPU data.
    pub material_constants_offset: u32,
    pub material_count: u32,
    pub materials: Offset<MaterialTextures>,
    /// One NUL-terminated name per node.
    pub node_names: Offset<Offset<u8>>,
}

/// Node of the scene graph, stored in pre-order so parents come first.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GraphNode {
    /// Column-major transform relative to the parent.
    pub local: [[f32; 4]; 4],
    /// Column-major transform relative to the model.
    pub world: [[f32; 4]; 4],
    pub matrix_index: u32,
    pub name_index: u32,
    /// `ROOT_PARENT` for the root.
    pub parent_index: u32,
    pub reserved: u32,
}

impl GraphNode {
    pub const IDENTITY: [[f32; 4]; 4] = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ];

    pub fn root() -> Self {
        Self {
            local: Self::IDENTITY,
            world: Self::IDENTITY,
            matrix_index: 0,
            name_index: 0,
            parent_index: ROOT_PARENT,
            reserved: 0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_index == ROOT_PARENT
    }
}

/// A draw call worth of geometry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshRecord {
    /// Byte range of the vertices in the unstructured GPU data.
    pub vb_offset: u32,
    pub vb_size: u32,
    /// Byte range of the 32-bit indices in the unstructured GPU data.
    pub ib_offset: u32,
    pub ib_size: u32,
    pub vb_stride: u32,
    /// Node whose world transform places this mesh.
    pub mesh_constant_index: u16,
    pub material_index: u16,
    pub draw_mode: u8,
    pub reserved: [u8; 3],
    pub primitive_count: u32,
    pub start_index: u32,
    pub base_vertex: i32,
    pub aabb_min: [f32; 3],
    pub aabb_max: [f32; 3],
}

/// Texture references of a material.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MaterialTextures {
    /// Indexed by texture slot, `UNSET_TEXTURE` when absent.
    pub texture_indices: [u16; 4],
    /// Wrapping of the material's textures, two bits per axis.
    pub address_modes: u32,
}

impl Default for MaterialTextures {
    fn default() -> Self {
        Self {
            texture_indices: [UNSET_TEXTURE; 4],
            address_modes: 0,
        }
    }
}

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
    pub struct MaterialFlags: u32 {
        /// Discard fragments below `alpha_cutoff`.
        const ALPHA_MASK = 1 << 0;
        const DOUBLE_SIDED = 1 << 1;
    }
}

/// Shader constants of a material, one per `MATERIAL_CONSTANTS_STRIDE`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MaterialConstants {
    pub base_color_factor: [f32; 4],
    pub normal_texture_scale: f32,
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub alpha_cutoff: f32,
    pub emissive_factor: [f32; 3],
    pub flags: u32,
}

impl Default for MaterialConstants {
    fn default() -> Self {
        Self {
            base_color_factor: [1.0; 4],
            normal_texture_scale: 1.0,
            metallic_factor: 1.0,
            roughness_factor: 1.0,
            alpha_cutoff: 0.5,
            emissive_factor: [0.0; 3],
            flags: 0,
        }
    }
}

impl MaterialConstants {
    pub fn material_flags(&self) -> MaterialFlags {
        MaterialFlags::from_bits_truncate(self.flags)
    }
}

/// The CPU data region with every pointer resolved.
pub struct CpuData {
    region: MemoryRegion,
    header: CpuDataHeader,
    scene_graph: Resolved<GraphNode>,
    meshes: Resolved<MeshRecord>,
    materials: Resolved<MaterialTextures>,
    node_names: Vec<Resolved<u8>>,
}

impl CpuData {
    /// Resolve all the pointers of a freshly read data region.
    #[profiling::function]
    pub fn fixup(region: MemoryRegion) -> Result<Self, FormatError> {
        let header = region.header::<CpuDataHeader>("data header")?;
        let scene_graph = Ptr::from(header.scene_graph).fixup(&region, header.node_count as usize)?;
        let meshes = Ptr::from(header.meshes).fixup(&region, header.mesh_count as usize)?;
        let materials =
            Ptr::from(header.materials).fixup(&region, header.material_count as usize)?;
        let name_offsets =
            Ptr::from(header.node_names).fixup(&region, header.node_count as usize)?;
        let node_names = region
            .slice(&name_offsets)
            .iter()
            .map(|&offset| Ptr::from(offset).fixup_str(&region))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            region,
            header,
            scene_graph,
            meshes,
            materials,
            node_names,
        })
    }

    pub fn scene_graph(&self) -> &[GraphNode] {
        self.region.slice(&self.scene_graph)
    }

    pub fn meshes(&self) -> &[MeshRecord] {
        self.region.slice(&self.meshes)
    }

    pub fn materials(&self) -> &[MaterialTextures] {
        self.region.slice(&self.materials)
    }

    pub fn material_constants_offset(&self) -> u32 {
        self.header.material_constants_offset
    }

    pub fn node_name(&self, index: usize) -> &str {
        match self.node_names.get(index) {
            Some(name) => self.region.str(name),
            None => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    #[test]
    fn record_sizes() {
        assert_eq!(size_of::<super::CpuDataHeader>(), 48);
        assert_eq!(size_of::<super::GraphNode>(), 144);
        assert_eq!(size_of::<super::MeshRecord>(), 64);
        assert_eq!(size_of::<super::MaterialTextures>(), 12);
        assert_eq!(size_of::<super::MaterialConstants>(), 48);
        assert_eq!(size_of::<crate::TextureRecord>(), 32);
    }
}
