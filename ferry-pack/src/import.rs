use crate::texture::{self, Image};
use anyhow::{bail, Context as _, Result};
use ferry_format::{
    GraphNode, MaterialConstants, MaterialFlags, MaterialTextures, MeshRecord, ModelData,
};
use std::{mem, path::Path};

/// Position, normal and texture coordinates.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tex_coords: [f32; 2],
}

fn draw_mode(alpha_mode: gltf::material::AlphaMode) -> u8 {
    match alpha_mode {
        gltf::material::AlphaMode::Opaque => 1,
        gltf::material::AlphaMode::Mask => 2,
        gltf::material::AlphaMode::Blend => 3,
    }
}

/// Two bits per axis, matching the order of `gpu::AddressMode`.
fn address_modes(sampler: &gltf::texture::Sampler) -> u32 {
    let encode = |mode: gltf::texture::WrappingMode| -> u32 {
        match mode {
            gltf::texture::WrappingMode::ClampToEdge => 0,
            gltf::texture::WrappingMode::Repeat => 1,
            gltf::texture::WrappingMode::MirroredRepeat => 2,
        }
    };
    encode(sampler.wrap_s()) | encode(sampler.wrap_t()) << 2
}

struct Importer<'a> {
    buffers: &'a [gltf::buffer::Data],
    model: ModelData,
    /// Index of the material used by primitives without one.
    default_material: Option<u16>,
}

impl Importer<'_> {
    fn add_materials(&mut self, document: &gltf::Document) -> Result<()> {
        for g_material in document.materials() {
            let pbr = g_material.pbr_metallic_roughness();
            let slots = [
                pbr.base_color_texture().map(|info| info.texture()),
                pbr.metallic_roughness_texture().map(|info| info.texture()),
                g_material.normal_texture().map(|info| info.texture()),
                g_material.emissive_texture().map(|info| info.texture()),
            ];
            let mut textures = MaterialTextures::default();
            for (index, slot) in slots.iter().enumerate() {
                if let Some(texture) = slot {
                    textures.texture_indices[index] =
                        u16::try_from(texture.index()).context("Too many textures")?;
                    textures.address_modes = address_modes(&texture.sampler());
                }
            }

            let mut flags = MaterialFlags::empty();
            if g_material.alpha_mode() == gltf::material::AlphaMode::Mask {
                flags |= MaterialFlags::ALPHA_MASK;
            }
            if g_material.double_sided() {
                flags |= MaterialFlags::DOUBLE_SIDED;
            }
            self.model.material_textures.push(textures);
            self.model.material_constants.push(MaterialConstants {
                base_color_factor: pbr.base_color_factor(),
                normal_texture_scale: g_material.normal_texture().map_or(1.0, |info| info.scale()),
                metallic_factor: pbr.metallic_factor(),
                roughness_factor: pbr.roughness_factor(),
                alpha_cutoff: g_material.alpha_cutoff().unwrap_or(0.5),
                emissive_factor: g_material.emissive_factor(),
                flags: flags.bits(),
            });
        }
        Ok(())
    }

    fn material_of(&mut self, g_primitive: &gltf::Primitive) -> Result<u16> {
        if let Some(index) = g_primitive.material().index() {
            return u16::try_from(index).context("Too many materials");
        }
        if let Some(index) = self.default_material {
            return Ok(index);
        }
        log::warn!("Primitive without a material, adding the default one");
        let index = u16::try_from(self.model.material_textures.len()).context("Too many materials")?;
        self.model.material_textures.push(MaterialTextures::default());
        self.model.material_constants.push(MaterialConstants::default());
        self.default_material = Some(index);
        Ok(index)
    }

    fn add_primitive(
        &mut self,
        g_primitive: &gltf::Primitive,
        node_index: u16,
        world: glam::Mat4,
    ) -> Result<()> {
        let buffers = self.buffers;
        let reader = g_primitive.reader(|buffer| Some(&buffers[buffer.index()]));
        let positions = match reader.read_positions() {
            Some(iter) => iter,
            None => {
                log::warn!("Skipping primitive without positions");
                return Ok(());
            }
        };
        let mut vertices = positions
            .map(|position| Vertex {
                position,
                ..Default::default()
            })
            .collect::<Vec<_>>();
        if let Some(iter) = reader.read_normals() {
            for (v, normal) in vertices.iter_mut().zip(iter) {
                v.normal = normal;
            }
        }
        if let Some(iter) = reader.read_tex_coords(0) {
            for (v, tc) in vertices.iter_mut().zip(iter.into_f32()) {
                v.tex_coords = tc;
            }
        }
        let indices = match reader.read_indices() {
            Some(read) => read.into_u32().collect::<Vec<_>>(),
            None => (0..vertices.len() as u32).collect(),
        };
        let material_index = self.material_of(g_primitive)?;

        let geometry = &mut self.model.geometry;
        let vb_offset = geometry.len();
        geometry.extend_from_slice(bytemuck::cast_slice(&vertices));
        let ib_offset = geometry.len();
        geometry.extend_from_slice(bytemuck::cast_slice(&indices));
        if geometry.len() > u32::MAX as usize {
            bail!("Geometry exceeds 4 GiB");
        }

        let bounds = g_primitive.bounding_box();
        self.include_bounds(world, bounds.min, bounds.max);
        self.model.meshes.push(MeshRecord {
            vb_offset: vb_offset as u32,
            vb_size: (ib_offset - vb_offset) as u32,
            ib_offset: ib_offset as u32,
            ib_size: (indices.len() * mem::size_of::<u32>()) as u32,
            vb_stride: mem::size_of::<Vertex>() as u32,
            mesh_constant_index: node_index,
            material_index,
            draw_mode: draw_mode(g_primitive.material().alpha_mode()),
            reserved: [0; 3],
            primitive_count: indices.len() as u32 / 3,
            start_index: 0,
            base_vertex: 0,
            aabb_min: bounds.min,
            aabb_max: bounds.max,
        });
        Ok(())
    }

    fn include_bounds(&mut self, world: glam::Mat4, min: [f32; 3], max: [f32; 3]) {
        let first = self.model.meshes.is_empty();
        for corner in 0..8 {
            let point = glam::Vec3::new(
                if corner & 1 == 0 { min[0] } else { max[0] },
                if corner & 2 == 0 { min[1] } else { max[1] },
                if corner & 4 == 0 { min[2] } else { max[2] },
            );
            let point = world.transform_point3(point);
            let (aabb_min, aabb_max) = if first && corner == 0 {
                (point, point)
            } else {
                (
                    glam::Vec3::from(self.model.aabb_min).min(point),
                    glam::Vec3::from(self.model.aabb_max).max(point),
                )
            };
            self.model.aabb_min = aabb_min.into();
            self.model.aabb_max = aabb_max.into();
        }
    }

    /// Append the node and its subtree in pre-order.
    fn add_node(&mut self, g_node: gltf::Node, parent_index: u32) -> Result<()> {
        let index = self.model.scene_graph.len();
        let node_index = u16::try_from(index).context("Too many nodes")?;
        let local = glam::Mat4::from_cols_array_2d(&g_node.transform().matrix());
        let parent_world =
            glam::Mat4::from_cols_array_2d(&self.model.scene_graph[parent_index as usize].world);
        let world = parent_world * local;
        self.model.scene_graph.push(GraphNode {
            local: local.to_cols_array_2d(),
            world: world.to_cols_array_2d(),
            matrix_index: index as u32,
            name_index: index as u32,
            parent_index,
            reserved: 0,
        });
        self.model.node_names.push(match g_node.name() {
            Some(name) => name.to_string(),
            None => format!("node{}", g_node.index()),
        });

        if let Some(g_mesh) = g_node.mesh() {
            for g_primitive in g_mesh.primitives() {
                if g_primitive.mode() != gltf::mesh::Mode::Triangles {
                    log::warn!(
                        "Skipping primitive for having mesh mode {:?}",
                        g_primitive.mode()
                    );
                    continue;
                }
                self.add_primitive(&g_primitive, node_index, world)?;
            }
        }
        for child in g_node.children() {
            self.add_node(child, index as u32)?;
        }
        Ok(())
    }
}

/// Load a glTF model into the layout of a container.
#[profiling::function]
pub fn import(path: &Path, block_compress: bool) -> Result<ModelData> {
    let (document, buffers, images) =
        gltf::import(path).with_context(|| format!("Failed to load glTF: {:?}", path))?;

    let mut importer = Importer {
        buffers: &buffers,
        model: ModelData::default(),
        default_material: None,
    };
    for g_texture in document.textures() {
        let g_image = g_texture.source();
        let name = match (g_texture.name(), g_image.source()) {
            (Some(name), _) => name.to_string(),
            (None, gltf::image::Source::Uri { uri, .. }) => uri.to_string(),
            (None, gltf::image::Source::View { .. }) => format!("texture{}", g_texture.index()),
        };
        let data = images
            .get(g_image.index())
            .with_context(|| format!("Image of texture '{}' is missing", name))?;
        let image = Image::from_gltf(data).with_context(|| format!("Decoding '{}'", name))?;
        importer
            .model
            .textures
            .push(texture::build(&name, image, block_compress)?);
    }
    importer.add_materials(&document)?;

    importer.model.scene_graph.push(GraphNode::root());
    importer.model.node_names.push("root".to_string());
    match document.default_scene().or_else(|| document.scenes().next()) {
        Some(g_scene) => {
            for g_node in g_scene.nodes() {
                importer.add_node(g_node, 0)?;
            }
        }
        None => log::warn!("Model {:?} has no scenes", path),
    }

    let model = importer.model;
    log::info!(
        "Imported {} nodes, {} meshes, {} materials, {} textures",
        model.scene_graph.len(),
        model.meshes.len(),
        model.material_textures.len(),
        model.textures.len()
    );
    Ok(model)
}
