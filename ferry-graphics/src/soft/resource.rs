use crate::{limits, util::align_to, AllocationInfo, DeviceError, ResourceDesc, ResourceDimension};

impl super::Context {
    fn reserve_memory(&self, size: u64) -> Result<(), DeviceError> {
        let mut memory = self.memory.lock().unwrap();
        if let Some(budget) = memory.budget {
            let available = budget.saturating_sub(memory.allocated);
            if size > available {
                return Err(DeviceError::OutOfMemory {
                    requested: size,
                    available,
                });
            }
        }
        memory.allocated += size;
        Ok(())
    }

    fn release_memory(&self, size: u64) {
        let mut memory = self.memory.lock().unwrap();
        memory.allocated -= size;
    }

    /// Size and placement alignment of a single resource.
    fn resource_requirements(&self, desc: &ResourceDesc) -> Result<(u64, u64), DeviceError> {
        desc.validate()?;
        let (_, size) = crate::copyable_footprints(desc);
        let alignment = limits::RESOURCE_PLACEMENT_ALIGNMENT;
        Ok((align_to(size.max(1), alignment), alignment))
    }

    /// Compute the placement of every resource in a single heap.
    ///
    /// Resources are packed in the given order, each aligned to its
    /// own requirement. The returned aggregate covers all of them.
    #[profiling::function]
    pub fn resource_allocation_info(
        &self,
        descs: &[ResourceDesc],
    ) -> Result<(AllocationInfo, Vec<AllocationInfo>), DeviceError> {
        let mut infos = Vec::with_capacity(descs.len());
        let mut total = AllocationInfo {
            offset: 0,
            size: 0,
            alignment: limits::RESOURCE_PLACEMENT_ALIGNMENT,
        };
        for desc in descs {
            let (size, alignment) = self.resource_requirements(desc)?;
            let offset = align_to(total.size, alignment);
            infos.push(AllocationInfo {
                offset,
                size,
                alignment,
            });
            total.size = offset + size;
            total.alignment = total.alignment.max(alignment);
        }
        Ok((total, infos))
    }

    pub fn create_heap(&self, desc: crate::HeapDesc) -> Result<super::Heap, DeviceError> {
        self.reserve_memory(desc.size)?;
        let index = self.heaps.write().unwrap().insert(super::HeapData {
            name: desc.name.to_string(),
            memory: desc.memory,
            data: std::sync::Mutex::new(vec![0; desc.size as usize].into_boxed_slice()),
            live_resources: 0,
        });
        log::debug!("Created heap '{}' of {} bytes", desc.name, desc.size);
        Ok(super::Heap { index })
    }

    pub fn destroy_heap(&self, heap: super::Heap) {
        let data = self.heaps.write().unwrap().remove(heap.index);
        if data.live_resources != 0 {
            log::warn!(
                "Heap '{}' destroyed with {} live resources",
                data.name,
                data.live_resources
            );
        }
        let size = data.data.lock().unwrap().len() as u64;
        self.release_memory(size);
    }

    pub fn create_placed_resource(
        &self,
        name: &str,
        heap: super::Heap,
        offset: u64,
        desc: &ResourceDesc,
    ) -> Result<super::Resource, DeviceError> {
        let (size, alignment) = self.resource_requirements(desc)?;
        if offset % alignment != 0 {
            return Err(DeviceError::Misaligned { offset, alignment });
        }
        {
            let mut heaps = self.heaps.write().unwrap();
            let heap_data = heaps
                .get_mut(heap.index)
                .ok_or(DeviceError::InvalidHandle("heap"))?;
            let heap_size = heap_data.data.lock().unwrap().len() as u64;
            if offset + size > heap_size {
                return Err(DeviceError::PlacementOutOfBounds {
                    heap: heap_data.name.clone(),
                    offset,
                    size,
                    heap_size,
                });
            }
            heap_data.live_resources += 1;
        }
        let index = self.resources.write().unwrap().insert(super::ResourceData {
            name: name.to_string(),
            desc: *desc,
            heap,
            offset,
            size,
            committed: false,
        });
        Ok(super::Resource { index })
    }

    /// Create a resource with its own dedicated heap.
    pub fn create_committed_resource(
        &self,
        name: &str,
        desc: &ResourceDesc,
        memory: crate::Memory,
    ) -> Result<super::Resource, DeviceError> {
        let (size, _) = self.resource_requirements(desc)?;
        let heap = self.create_heap(crate::HeapDesc { name, size, memory })?;
        let resource = match self.create_placed_resource(name, heap, 0, desc) {
            Ok(resource) => resource,
            Err(e) => {
                self.destroy_heap(heap);
                return Err(e);
            }
        };
        self.resources.write().unwrap()[resource.index].committed = true;
        Ok(resource)
    }

    pub fn destroy_resource(&self, resource: super::Resource) {
        let data = self.resources.write().unwrap().remove(resource.index);
        if let Some(heap_data) = self.heaps.write().unwrap().get_mut(data.heap.index) {
            heap_data.live_resources -= 1;
        }
        if data.committed {
            self.destroy_heap(data.heap);
        }
    }

    pub fn resource_desc(&self, resource: super::Resource) -> Option<ResourceDesc> {
        let resources = self.resources.read().unwrap();
        resources.get(resource.index).map(|data| data.desc)
    }

    pub fn resource_name(&self, resource: super::Resource) -> Option<String> {
        let resources = self.resources.read().unwrap();
        resources.get(resource.index).map(|data| data.name.clone())
    }

    fn with_resource_memory<R>(
        &self,
        resource: super::Resource,
        offset: u64,
        size: u64,
        fun: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, DeviceError> {
        let resources = self.resources.read().unwrap();
        let data = resources
            .get(resource.index)
            .ok_or(DeviceError::InvalidHandle("resource"))?;
        if offset + size > data.size {
            return Err(DeviceError::OutOfRange {
                offset,
                size,
                resource_size: data.size,
            });
        }
        let heaps = self.heaps.read().unwrap();
        let heap = heaps
            .get(data.heap.index)
            .ok_or(DeviceError::InvalidHandle("heap"))?;
        let mut memory = heap.data.lock().unwrap();
        let start = (data.offset + offset) as usize;
        Ok(fun(&mut memory[start..start + size as usize]))
    }

    pub fn write_buffer(
        &self,
        resource: super::Resource,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        self.with_resource_memory(resource, offset, bytes.len() as u64, |dst| {
            dst.copy_from_slice(bytes)
        })
    }

    pub fn read_buffer(
        &self,
        resource: super::Resource,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, DeviceError> {
        self.with_resource_memory(resource, offset, size, |src| src.to_vec())
    }

    /// Write linearly laid out subresources, starting at `first_subresource`.
    ///
    /// The data is expected in the layout of `copyable_footprints`, relative
    /// to the first written subresource.
    #[profiling::function]
    pub fn write_subresources(
        &self,
        resource: super::Resource,
        first_subresource: u32,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        let desc = self
            .resource_desc(resource)
            .ok_or(DeviceError::InvalidHandle("resource"))?;
        if desc.resource_dimension() == Some(ResourceDimension::Buffer) {
            if first_subresource != 0 {
                return Err(DeviceError::InvalidDesc("buffer subresource"));
            }
            return self.write_buffer(resource, 0, bytes);
        }
        let (footprints, total) = crate::copyable_footprints(&desc);
        let base = footprints
            .get(first_subresource as usize)
            .ok_or(DeviceError::InvalidDesc("subresource index"))?
            .offset;
        if base + bytes.len() as u64 > total {
            return Err(DeviceError::OutOfRange {
                offset: base,
                size: bytes.len() as u64,
                resource_size: total,
            });
        }
        self.write_buffer(resource, base, bytes)
    }

    /// Read the rows of a single subresource, without the pitch padding.
    pub fn read_subresource(
        &self,
        resource: super::Resource,
        subresource: u32,
    ) -> Result<Vec<u8>, DeviceError> {
        let desc = self
            .resource_desc(resource)
            .ok_or(DeviceError::InvalidHandle("resource"))?;
        let (footprints, _) = crate::copyable_footprints(&desc);
        let footprint = footprints
            .get(subresource as usize)
            .ok_or(DeviceError::InvalidDesc("subresource index"))?;
        let raw = self.read_buffer(resource, footprint.offset, footprint.size())?;
        let mut rows = Vec::with_capacity((footprint.row_size * footprint.row_count as u64) as usize);
        for row in raw.chunks(footprint.row_pitch as usize) {
            rows.extend_from_slice(&row[..footprint.row_size as usize]);
        }
        Ok(rows)
    }

    pub(super) fn heap_memory(&self, heap: super::Heap) -> Option<crate::Memory> {
        self.heaps.read().unwrap().get(heap.index).map(|h| h.memory)
    }

    /// Memory class of the heap that backs a resource.
    pub fn resource_memory(&self, resource: super::Resource) -> Option<crate::Memory> {
        let heap = self.resources.read().unwrap().get(resource.index)?.heap;
        self.heap_memory(heap)
    }
}
