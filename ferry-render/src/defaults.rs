use crate::TextureSlot;
use ferry_graphics as gpu;

const WHITE: [u8; 4] = [!0, !0, !0, !0];
const FLAT_NORMAL: [u8; 4] = [0x80, 0x80, !0, !0];

/// Fallback textures for material slots without a texture of their own.
///
/// Created once, and has to outlive every model referring to it.
pub struct DefaultTextures {
    white_texture: gpu::Resource,
    flat_normal_texture: gpu::Resource,
    descriptor_heap: gpu::DescriptorHeap,
    sampler_table: gpu::DescriptorHandle,
}

impl DefaultTextures {
    pub fn new(gpu: &gpu::Context) -> Result<Self, gpu::DeviceError> {
        let desc = gpu::ResourceDesc::texture_2d(gpu::TextureFormat::Rgba8Unorm, 1, 1, 1);
        let (_, texture_size) = gpu::copyable_footprints(&desc);

        let white_texture = gpu.create_committed_resource("default/white", &desc, gpu::Memory::Device)?;
        let flat_normal_texture =
            gpu.create_committed_resource("default/flat-normal", &desc, gpu::Memory::Device)?;
        let staging_buf = gpu.create_committed_resource(
            "default/staging",
            &gpu::ResourceDesc::buffer(2 * texture_size),
            gpu::Memory::Upload,
        )?;
        gpu.write_buffer(staging_buf, 0, &WHITE)?;
        gpu.write_buffer(staging_buf, texture_size, &FLAT_NORMAL)?;

        let mut command_encoder = gpu.create_command_encoder(gpu::CommandEncoderDesc {
            name: "default textures",
        });
        command_encoder.start();
        {
            let mut transfers = command_encoder.transfer();
            transfers.copy_buffer_to_texture(staging_buf.at(0), white_texture, 0);
            transfers.copy_buffer_to_texture(staging_buf.at(texture_size), flat_normal_texture, 0);
        }
        let sync_point = gpu.submit(&mut command_encoder);
        let _ = gpu.wait_for(&sync_point, !0);
        gpu.destroy_command_encoder(&mut command_encoder);
        gpu.destroy_resource(staging_buf);

        let descriptor_heap = gpu.create_descriptor_heap("default", gpu::DescriptorKind::Resource, 2)?;
        gpu.create_texture_view(
            gpu::CpuDescriptor {
                heap: descriptor_heap,
                index: 0,
            },
            white_texture,
        )?;
        gpu.create_texture_view(
            gpu::CpuDescriptor {
                heap: descriptor_heap,
                index: 1,
            },
            flat_normal_texture,
        )?;

        let sampler_table = gpu.allocate_descriptors(gpu::DescriptorKind::Sampler, 1)?;
        gpu.write_sampler(
            sampler_table,
            0,
            gpu::SamplerDesc {
                address_modes: [gpu::AddressMode::Repeat; 3],
                mag_filter: gpu::FilterMode::Linear,
                min_filter: gpu::FilterMode::Linear,
                mipmap_filter: gpu::FilterMode::Linear,
            },
        )?;
        log::info!("Created default textures");

        Ok(Self {
            white_texture,
            flat_normal_texture,
            descriptor_heap,
            sampler_table,
        })
    }

    /// Texture view standing in for a missing texture of the given kind.
    pub fn descriptor(&self, slot: TextureSlot) -> gpu::CpuDescriptor {
        let index = match slot {
            TextureSlot::Normal => 1,
            TextureSlot::BaseColor | TextureSlot::MetallicRoughness | TextureSlot::Emissive => 0,
        };
        gpu::CpuDescriptor {
            heap: self.descriptor_heap,
            index,
        }
    }

    pub fn white_texture(&self) -> gpu::Resource {
        self.white_texture
    }

    pub fn flat_normal_texture(&self) -> gpu::Resource {
        self.flat_normal_texture
    }

    /// Shader-visible table with the single default sampler.
    pub fn sampler_table(&self) -> gpu::DescriptorHandle {
        self.sampler_table
    }

    pub fn destroy(&mut self, gpu: &gpu::Context) {
        gpu.free_descriptors(self.sampler_table);
        gpu.destroy_descriptor_heap(self.descriptor_heap);
        gpu.destroy_resource(self.white_texture);
        gpu.destroy_resource(self.flat_normal_texture);
    }
}
