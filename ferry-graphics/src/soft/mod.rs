//! Software device backend.
//!
//! Heaps are plain host allocations and command buffers are executed
//! on submission, so every operation completes synchronously.

mod command;
mod resource;

use crate::descriptor::DescriptorAllocator;
use std::{
    sync::{Condvar, Mutex, RwLock},
    time::Duration,
};

pub use command::{Command, CommandEncoder, RenderCommandEncoder, TransferCommandEncoder};

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Heap {
    index: usize,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Resource {
    index: usize,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct DescriptorHeap {
    index: usize,
}

#[derive(Clone, Debug)]
pub struct SyncPoint {
    progress: u64,
}

struct HeapData {
    name: String,
    memory: crate::Memory,
    data: Mutex<Box<[u8]>>,
    live_resources: usize,
}

struct ResourceData {
    name: String,
    desc: crate::ResourceDesc,
    heap: Heap,
    offset: u64,
    size: u64,
    /// The heap was created for this resource alone.
    committed: bool,
}

struct DescriptorHeapData {
    name: String,
    kind: crate::DescriptorKind,
    slots: Box<[crate::Descriptor]>,
}

struct MemoryUsage {
    allocated: u64,
    budget: Option<u64>,
}

pub struct Context {
    heaps: RwLock<slab::Slab<HeapData>>,
    resources: RwLock<slab::Slab<ResourceData>>,
    descriptor_heaps: RwLock<slab::Slab<DescriptorHeapData>>,
    resource_descriptors: DescriptorAllocator,
    sampler_descriptors: DescriptorAllocator,
    memory: Mutex<MemoryUsage>,
    progress: Mutex<u64>,
    progressed: Condvar,
    validation: bool,
}

impl Context {
    pub fn new(desc: crate::ContextDesc) -> Self {
        log::info!(
            "Creating software device with {} resource and {} sampler descriptors",
            desc.resource_descriptors,
            desc.sampler_descriptors
        );
        Self {
            heaps: RwLock::new(slab::Slab::new()),
            resources: RwLock::new(slab::Slab::new()),
            descriptor_heaps: RwLock::new(slab::Slab::new()),
            resource_descriptors: DescriptorAllocator::new(
                crate::DescriptorKind::Resource,
                desc.resource_descriptors,
            ),
            sampler_descriptors: DescriptorAllocator::new(
                crate::DescriptorKind::Sampler,
                desc.sampler_descriptors,
            ),
            memory: Mutex::new(MemoryUsage {
                allocated: 0,
                budget: desc.memory_budget,
            }),
            progress: Mutex::new(0),
            progressed: Condvar::new(),
            validation: desc.validation,
        }
    }

    /// Bytes of device memory currently held by heaps.
    pub fn allocated_memory(&self) -> u64 {
        self.memory.lock().unwrap().allocated
    }

    fn descriptor_allocator(&self, kind: crate::DescriptorKind) -> &DescriptorAllocator {
        match kind {
            crate::DescriptorKind::Resource => &self.resource_descriptors,
            crate::DescriptorKind::Sampler => &self.sampler_descriptors,
        }
    }

    /// Allocate `count` contiguous slots from the shared shader-visible heap.
    pub fn allocate_descriptors(
        &self,
        kind: crate::DescriptorKind,
        count: u32,
    ) -> Result<crate::DescriptorHandle, crate::DeviceError> {
        self.descriptor_allocator(kind).allocate(count)
    }

    /// Release slots previously returned by `allocate_descriptors`.
    pub fn free_descriptors(&self, handle: crate::DescriptorHandle) {
        self.descriptor_allocator(handle.kind).free(handle);
    }

    /// Number of shader-visible slots that can still be handed out.
    pub fn available_descriptors(&self, kind: crate::DescriptorKind) -> u32 {
        self.descriptor_allocator(kind).available()
    }

    pub fn descriptor(&self, handle: crate::DescriptorHandle, index: u32) -> Option<crate::Descriptor> {
        self.descriptor_allocator(handle.kind).read(handle, index)
    }

    pub fn write_sampler(
        &self,
        handle: crate::DescriptorHandle,
        index: u32,
        desc: crate::SamplerDesc,
    ) -> Result<(), crate::DeviceError> {
        if handle.kind != crate::DescriptorKind::Sampler {
            return Err(crate::DeviceError::InvalidHandle("sampler descriptor"));
        }
        self.sampler_descriptors
            .write(handle, index, crate::Descriptor::Sampler(desc))
    }

    pub fn create_descriptor_heap(
        &self,
        name: &str,
        kind: crate::DescriptorKind,
        count: u32,
    ) -> Result<DescriptorHeap, crate::DeviceError> {
        if count == 0 {
            return Err(crate::DeviceError::InvalidDesc("empty descriptor heap"));
        }
        let index = self.descriptor_heaps.write().unwrap().insert(DescriptorHeapData {
            name: name.to_string(),
            kind,
            slots: vec![crate::Descriptor::Empty; count as usize].into_boxed_slice(),
        });
        Ok(DescriptorHeap { index })
    }

    pub fn destroy_descriptor_heap(&self, heap: DescriptorHeap) {
        let data = self.descriptor_heaps.write().unwrap().remove(heap.index);
        log::debug!("Destroyed descriptor heap '{}'", data.name);
    }

    pub fn create_texture_view(
        &self,
        dst: crate::CpuDescriptor,
        resource: Resource,
    ) -> Result<(), crate::DeviceError> {
        let mip_level_count = {
            let resources = self.resources.read().unwrap();
            let data = resources
                .get(resource.index)
                .ok_or(crate::DeviceError::InvalidHandle("resource"))?;
            if data.desc.resource_dimension() != Some(crate::ResourceDimension::Texture2D) {
                return Err(crate::DeviceError::InvalidDesc("view of a non-texture"));
            }
            data.desc.mip_level_count as u32
        };
        let mut heaps = self.descriptor_heaps.write().unwrap();
        let heap = heaps
            .get_mut(dst.heap.index)
            .ok_or(crate::DeviceError::InvalidHandle("descriptor heap"))?;
        if heap.kind != crate::DescriptorKind::Resource {
            return Err(crate::DeviceError::InvalidHandle("descriptor heap kind"));
        }
        let slot = heap
            .slots
            .get_mut(dst.index as usize)
            .ok_or(crate::DeviceError::InvalidHandle("descriptor"))?;
        *slot = crate::Descriptor::TextureView {
            resource,
            mip_level_count,
        };
        Ok(())
    }

    pub fn cpu_descriptor(&self, src: crate::CpuDescriptor) -> Option<crate::Descriptor> {
        let heaps = self.descriptor_heaps.read().unwrap();
        heaps.get(src.heap.index)?.slots.get(src.index as usize).copied()
    }

    /// Copy descriptors from private heaps into consecutive shader-visible slots.
    pub fn copy_descriptors(
        &self,
        dst: crate::DescriptorHandle,
        sources: &[crate::CpuDescriptor],
    ) -> Result<(), crate::DeviceError> {
        if sources.len() > dst.count as usize {
            return Err(crate::DeviceError::InvalidDesc("descriptor copy overflow"));
        }
        let allocator = self.descriptor_allocator(dst.kind);
        for (index, &src) in sources.iter().enumerate() {
            let descriptor = self
                .cpu_descriptor(src)
                .ok_or(crate::DeviceError::InvalidHandle("descriptor"))?;
            if self.validation && descriptor == crate::Descriptor::Empty {
                log::warn!("Copying an empty descriptor from {:?}", src);
            }
            allocator.write(dst, index as u32, descriptor)?;
        }
        Ok(())
    }

    pub fn submit(&self, encoder: &mut CommandEncoder) -> SyncPoint {
        for command in encoder.take_commands() {
            if let Err(e) = self.execute(&command) {
                log::error!("Command {:?} failed: {}", command, e);
            }
        }
        let progress = {
            let mut progress = self.progress.lock().unwrap();
            *progress += 1;
            *progress
        };
        self.progressed.notify_all();
        SyncPoint { progress }
    }

    /// Wait until the submission of `sp` is executed. `!0` waits forever.
    pub fn wait_for(&self, sp: &SyncPoint, timeout_ms: u32) -> bool {
        let progress = self.progress.lock().unwrap();
        let pending = |progress: &mut u64| *progress < sp.progress;
        if timeout_ms == !0 {
            let _progress = self.progressed.wait_while(progress, pending).unwrap();
            true
        } else {
            let timeout = Duration::from_millis(u64::from(timeout_ms));
            let (_progress, result) = self
                .progressed
                .wait_timeout_while(progress, timeout, pending)
                .unwrap();
            !result.timed_out()
        }
    }

    pub fn create_command_encoder(&self, desc: crate::CommandEncoderDesc) -> CommandEncoder {
        CommandEncoder::new(desc.name)
    }

    pub fn destroy_command_encoder(&self, encoder: &mut CommandEncoder) {
        encoder.start();
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandEncoder, Context, SyncPoint};
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    #[test]
    fn wait_for_honors_the_timeout() {
        let context = Arc::new(Context::new(crate::ContextDesc::default()));
        let mut encoder = CommandEncoder::new("wait");
        let done = context.submit(&mut encoder);
        assert!(context.wait_for(&done, 0));

        let next = SyncPoint { progress: 2 };
        let start = Instant::now();
        assert!(!context.wait_for(&next, 20));
        assert!(start.elapsed() >= Duration::from_millis(20));

        let submitter = Arc::clone(&context);
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            submitter.submit(&mut CommandEncoder::new("late"));
        });
        assert!(context.wait_for(&next, !0));
        thread.join().unwrap();
    }
}
