use crate::{DefaultTextures, TextureSlot};
use ferry_format::{MaterialTextures, UNSET_TEXTURE};
use ferry_graphics as gpu;
use strum::IntoEnumIterator as _;

/// Placement of every resource of a model within its single heap.
///
/// Both the asynchronous load and the header-only prefetch size the
/// heap through `AllocationPlan::new`, so the two always agree for
/// the same container.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationPlan {
    pub total: gpu::AllocationInfo,
    pub textures: Vec<gpu::AllocationInfo>,
    /// The unstructured buffer, following the last texture.
    pub buffer: gpu::AllocationInfo,
    pub buffer_desc: gpu::ResourceDesc,
}

impl AllocationPlan {
    pub fn new(
        gpu: &gpu::Context,
        texture_descs: &[gpu::ResourceDesc],
        unstructured_size: u64,
    ) -> Result<Self, gpu::DeviceError> {
        let buffer_desc = gpu::ResourceDesc::buffer(unstructured_size);
        let mut descs = texture_descs.to_vec();
        descs.push(buffer_desc);
        let (total, mut textures) = gpu.resource_allocation_info(&descs)?;
        let buffer = textures
            .pop()
            .ok_or(gpu::DeviceError::InvalidDesc("allocation info count"))?;
        Ok(Self {
            total,
            textures,
            buffer,
            buffer_desc,
        })
    }

    /// Slots of the private descriptor heap, one per texture.
    pub fn descriptor_count(&self) -> u32 {
        (self.textures.len() as u32).max(1)
    }
}

/// The heap and descriptor heap of a model, with the resources placed in them.
pub struct GpuAllocation {
    pub plan: AllocationPlan,
    pub heap: gpu::Heap,
    pub descriptor_heap: gpu::DescriptorHeap,
    pub textures: Vec<gpu::Resource>,
    pub buffer: Option<gpu::Resource>,
}

impl GpuAllocation {
    #[profiling::function]
    pub fn create(
        gpu: &gpu::Context,
        name: &str,
        plan: AllocationPlan,
    ) -> Result<Self, gpu::DeviceError> {
        let heap = gpu.create_heap(gpu::HeapDesc {
            name,
            size: plan.total.size,
            memory: gpu::Memory::Device,
        })?;
        let descriptor_heap = match gpu.create_descriptor_heap(
            name,
            gpu::DescriptorKind::Resource,
            plan.descriptor_count(),
        ) {
            Ok(descriptor_heap) => descriptor_heap,
            Err(e) => {
                gpu.destroy_heap(heap);
                return Err(e);
            }
        };
        log::debug!(
            "Allocated heap '{}' of {} bytes for {} textures",
            name,
            plan.total.size,
            plan.textures.len()
        );
        Ok(Self {
            plan,
            heap,
            descriptor_heap,
            textures: Vec::new(),
            buffer: None,
        })
    }

    pub fn is_placed(&self) -> bool {
        self.buffer.is_some()
    }

    /// Place the textures at their planned offsets, then the unstructured buffer.
    pub fn place(
        &mut self,
        gpu: &gpu::Context,
        name: &str,
        texture_descs: &[gpu::ResourceDesc],
    ) -> Result<(), gpu::DeviceError> {
        for (index, (desc, info)) in texture_descs
            .iter()
            .zip(self.plan.textures.iter())
            .enumerate()
        {
            let texture = gpu.create_placed_resource(
                &format!("{}/texture{}", name, index),
                self.heap,
                info.offset,
                desc,
            )?;
            self.textures.push(texture);
        }
        let buffer = gpu.create_placed_resource(
            &format!("{}/unstructured", name),
            self.heap,
            self.plan.buffer.offset,
            &self.plan.buffer_desc,
        )?;
        self.buffer = Some(buffer);
        Ok(())
    }

    /// Write a view of every texture into the private descriptor heap.
    pub fn create_views(&self, gpu: &gpu::Context) -> Result<(), gpu::DeviceError> {
        for (index, &texture) in self.textures.iter().enumerate() {
            gpu.create_texture_view(
                gpu::CpuDescriptor {
                    heap: self.descriptor_heap,
                    index: index as u32,
                },
                texture,
            )?;
        }
        Ok(())
    }

    pub fn destroy(self, gpu: &gpu::Context) {
        for texture in self.textures {
            gpu.destroy_resource(texture);
        }
        if let Some(buffer) = self.buffer {
            gpu.destroy_resource(buffer);
        }
        gpu.destroy_descriptor_heap(self.descriptor_heap);
        gpu.destroy_heap(self.heap);
    }
}

/// Pick the source view of each slot in a material table.
///
/// Unset and out-of-range texture indices get the default of the slot.
pub(crate) fn material_sources(
    material: &MaterialTextures,
    texture_views: gpu::DescriptorHeap,
    texture_count: usize,
    defaults: &DefaultTextures,
) -> Vec<gpu::CpuDescriptor> {
    TextureSlot::iter()
        .map(|slot| match material.texture_indices[slot as usize] {
            UNSET_TEXTURE => defaults.descriptor(slot),
            index if (index as usize) < texture_count => gpu::CpuDescriptor {
                heap: texture_views,
                index: index as u32,
            },
            index => {
                log::warn!(
                    "Material refers to texture {} out of {}, using the default",
                    index,
                    texture_count
                );
                defaults.descriptor(slot)
            }
        })
        .collect()
}
