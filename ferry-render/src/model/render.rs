use super::{LoadError, Model};
use crate::{placement, slots, DrawMode, SceneGraph, TextureSlot};
use ferry_format::{CpuData, MeshRecord, MATERIAL_CONSTANTS_STRIDE};
use ferry_graphics as gpu;
use std::{mem, sync::atomic::Ordering};
use strum::EnumCount as _;

const MESH_CONSTANTS_STRIDE: u64 = gpu::limits::CONSTANT_BUFFER_ALIGNMENT;
const INDEX_SIZE: u32 = mem::size_of::<u32>() as u32;

/// Everything needed to record the draw of one mesh.
struct MeshInstance {
    draw_mode: DrawMode,
    index_buffer: gpu::BufferPiece,
    index_size: u64,
    index_count: u32,
    start_index: u32,
    base_vertex: i32,
    vertex_buffer: gpu::BufferPiece,
    vertex_size: u64,
    vertex_stride: u32,
    mesh_constants: gpu::BufferPiece,
    material_constants: gpu::BufferPiece,
    material_table: gpu::DescriptorHandle,
}

pub(super) struct RenderData {
    material_tables: Vec<gpu::DescriptorHandle>,
    mesh_constants_upload: Option<gpu::Resource>,
    mesh_constants: Option<gpu::Resource>,
    meshes: Vec<MeshInstance>,
    scene: SceneGraph,
}

impl RenderData {
    fn new(scene: SceneGraph) -> Self {
        Self {
            material_tables: Vec::new(),
            mesh_constants_upload: None,
            mesh_constants: None,
            meshes: Vec::new(),
            scene,
        }
    }

    pub(super) fn destroy(self, gpu: &gpu::Context) {
        for table in self.material_tables {
            gpu.free_descriptors(table);
        }
        if let Some(buffer) = self.mesh_constants_upload {
            gpu.destroy_resource(buffer);
        }
        if let Some(buffer) = self.mesh_constants {
            gpu.destroy_resource(buffer);
        }
    }
}

fn check_mesh(
    index: usize,
    mesh: &MeshRecord,
    data: &CpuData,
    buffer_size: u64,
) -> Result<(), LoadError> {
    let invalid = |reason: String| LoadError::InvalidMesh {
        mesh: index,
        reason,
    };
    let vb_end = mesh.vb_offset as u64 + mesh.vb_size as u64;
    if vb_end > buffer_size {
        return Err(invalid(format!(
            "vertices end at {} past the buffer of {}",
            vb_end, buffer_size
        )));
    }
    let ib_end = mesh.ib_offset as u64 + mesh.ib_size as u64;
    if ib_end > buffer_size {
        return Err(invalid(format!(
            "indices end at {} past the buffer of {}",
            ib_end, buffer_size
        )));
    }
    if mesh.ib_size % INDEX_SIZE != 0 || mesh.vb_stride == 0 {
        return Err(invalid(format!(
            "index size {} or vertex stride {} is unaligned",
            mesh.ib_size, mesh.vb_stride
        )));
    }
    if mesh.mesh_constant_index as usize >= data.scene_graph().len() {
        return Err(invalid(format!(
            "node {} is out of range",
            mesh.mesh_constant_index
        )));
    }
    let material_count = data.materials().len();
    if mesh.material_index as usize >= material_count {
        return Err(invalid(format!(
            "material {} is out of {}",
            mesh.material_index, material_count
        )));
    }
    let constants_end = data.material_constants_offset() as u64
        + (mesh.material_index as u64 + 1) * MATERIAL_CONSTANTS_STRIDE as u64;
    if constants_end > buffer_size {
        return Err(invalid(format!(
            "material constants end at {} past the buffer of {}",
            constants_end, buffer_size
        )));
    }
    Ok(())
}

impl Model {
    /// Build texture views, material tables and mesh constants.
    #[profiling::function]
    pub(super) fn build_render_data(&self) -> Result<RenderData, LoadError> {
        let state = self.state.lock().unwrap();
        let metadata = state
            .metadata
            .as_ref()
            .ok_or(LoadError::Incomplete("metadata"))?;
        let data = state.data.as_ref().ok_or(LoadError::Incomplete("data"))?;
        let allocation = state
            .allocation
            .as_ref()
            .ok_or(LoadError::Incomplete("allocation"))?;
        let buffer = allocation
            .buffer
            .ok_or(LoadError::Incomplete("unstructured buffer"))?;
        let gpu = &self.context.gpu;

        let mut render = RenderData::new(SceneGraph::new(data.scene_graph()));
        let result = (|| -> Result<(), LoadError> {
            allocation.create_views(gpu)?;
            for material in data.materials() {
                let table =
                    gpu.allocate_descriptors(gpu::DescriptorKind::Resource, TextureSlot::COUNT as u32)?;
                render.material_tables.push(table);
                let sources = placement::material_sources(
                    material,
                    allocation.descriptor_heap,
                    metadata.texture_count(),
                    &self.context.defaults,
                );
                gpu.copy_descriptors(table, &sources)?;
            }

            let node_count = render.scene.len().max(1) as u64;
            let constants_desc = gpu::ResourceDesc::buffer(node_count * MESH_CONSTANTS_STRIDE);
            render.mesh_constants_upload = Some(gpu.create_committed_resource(
                &format!("{}/mesh-constants-upload", self.name),
                &constants_desc,
                gpu::Memory::Upload,
            )?);
            let mesh_constants = gpu.create_committed_resource(
                &format!("{}/mesh-constants", self.name),
                &constants_desc,
                gpu::Memory::Device,
            )?;
            render.mesh_constants = Some(mesh_constants);

            let buffer_size = allocation.plan.buffer_desc.width;
            for (index, mesh) in data.meshes().iter().enumerate() {
                check_mesh(index, mesh, data, buffer_size)?;
                render.meshes.push(MeshInstance {
                    draw_mode: DrawMode::from_raw(mesh.draw_mode),
                    index_buffer: buffer.at(mesh.ib_offset as u64),
                    index_size: mesh.ib_size as u64,
                    index_count: mesh.ib_size / INDEX_SIZE,
                    start_index: mesh.start_index,
                    base_vertex: mesh.base_vertex,
                    vertex_buffer: buffer.at(mesh.vb_offset as u64),
                    vertex_size: mesh.vb_size as u64,
                    vertex_stride: mesh.vb_stride,
                    mesh_constants: mesh_constants
                        .at(mesh.mesh_constant_index as u64 * MESH_CONSTANTS_STRIDE),
                    material_constants: buffer.at(
                        data.material_constants_offset() as u64
                            + mesh.material_index as u64 * MATERIAL_CONSTANTS_STRIDE as u64,
                    ),
                    material_table: render.material_tables[mesh.material_index as usize],
                });
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                render.scene.update(glam::Mat4::IDENTITY);
                log::debug!(
                    "Model '{}' has {} meshes, {} materials, {} nodes",
                    self.name,
                    render.meshes.len(),
                    render.material_tables.len(),
                    render.scene.len()
                );
                Ok(render)
            }
            Err(e) => {
                render.destroy(gpu);
                Err(e)
            }
        }
    }

    fn with_render_data<R>(&self, fun: impl FnOnce(&mut RenderData) -> R) -> Option<R> {
        if !self.prepared.load(Ordering::Acquire) {
            return None;
        }
        self.render.lock().unwrap().as_mut().map(fun)
    }

    /// Evaluate the scene graph under the given root transform.
    pub fn update_matrices(&self, root: mint::ColumnMatrix4<f32>) {
        self.with_render_data(|render| render.scene.update(root.into()));
    }

    /// Write the world matrices into the upload buffer and record
    /// the copy into the device buffer.
    #[profiling::function]
    pub fn submit_matrices(&self, transfer: &mut gpu::TransferCommandEncoder) {
        let gpu = &self.context.gpu;
        self.with_render_data(|render| {
            let (Some(upload), Some(device)) = (render.mesh_constants_upload, render.mesh_constants)
            else {
                return;
            };
            let stride = MESH_CONSTANTS_STRIDE as usize;
            let mut bytes = vec![0u8; render.scene.len().max(1) * stride];
            for (chunk, world) in bytes.chunks_exact_mut(stride).zip(render.scene.worlds()) {
                let rows = world.transpose().to_cols_array();
                let matrix: &[u8] = bytemuck::cast_slice(&rows);
                chunk[..matrix.len()].copy_from_slice(matrix);
            }
            if let Err(e) = gpu.write_buffer(upload, 0, &bytes) {
                log::error!("Failed to write the matrices of '{}': {}", self.name, e);
                return;
            }
            transfer.copy_buffer_to_buffer(upload.at(0), device.at(0), bytes.len() as u64);
        });
    }

    /// Record the draws of every mesh in the given mode.
    ///
    /// Returns the number of draws, zero while the model is not prepared.
    #[profiling::function]
    pub fn draw(&self, pass: &mut gpu::RenderCommandEncoder, mode: DrawMode) -> u32 {
        let sampler_table = self.context.defaults.sampler_table();
        self.with_render_data(|render| {
            let mut count = 0;
            for mesh in render.meshes.iter().filter(|mesh| mesh.draw_mode == mode) {
                if count == 0 {
                    pass.set_descriptor_table(slots::SAMPLERS, sampler_table);
                }
                pass.set_index_buffer(mesh.index_buffer, mesh.index_size);
                pass.set_vertex_buffer(
                    slots::VERTEX_BUFFER,
                    mesh.vertex_buffer,
                    mesh.vertex_size,
                    mesh.vertex_stride,
                );
                pass.set_constant_buffer(slots::MESH_CONSTANTS, mesh.mesh_constants);
                pass.set_constant_buffer(slots::MATERIAL_CONSTANTS, mesh.material_constants);
                pass.set_descriptor_table(slots::MATERIAL_TEXTURES, mesh.material_table);
                pass.draw_indexed(mesh.index_count, 1, mesh.start_index, mesh.base_vertex);
                count += 1;
            }
            count
        })
        .unwrap_or(0)
    }

    /// Shader-visible texture table of a material.
    pub fn material_table(&self, index: usize) -> Option<gpu::DescriptorHandle> {
        self.with_render_data(|render| render.material_tables.get(index).copied())
            .flatten()
    }

    /// Device buffer holding the world matrices, 256 bytes apart.
    pub fn mesh_constants(&self) -> Option<gpu::Resource> {
        self.with_render_data(|render| render.mesh_constants).flatten()
    }

    /// World transform of a scene graph node.
    pub fn node_world(&self, index: usize) -> Option<mint::ColumnMatrix4<f32>> {
        self.with_render_data(|render| {
            render.scene.worlds().get(index).map(|&world| world.into())
        })
        .flatten()
    }
}
