use super::{LoadError, LoadPhase, Model, Slot};
use crate::{AllocationPlan, DataSize, GpuAllocation};
use ferry_format::{CpuData, CpuMetadata, FormatError, Header, MemoryRegion, Region};
use ferry_storage::{
    CompressionFormat, Destination, File, HostBuffer, Request, SharedHostBuffer, Source,
};
use std::{
    path::Path,
    sync::{atomic::Ordering, Arc, Mutex, PoisonError},
};

fn shared_buffer(size: usize) -> SharedHostBuffer {
    Arc::new(Mutex::new(HostBuffer::new(size)))
}

/// Take the buffer back from the requests that filled it.
fn take_buffer(shared: SharedHostBuffer) -> HostBuffer {
    match Arc::try_unwrap(shared) {
        Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
        Err(shared) => {
            let source = shared.lock().unwrap();
            let mut buffer = HostBuffer::new(source.len());
            buffer.as_bytes_mut().copy_from_slice(source.as_bytes());
            buffer
        }
    }
}

impl Model {
    fn region_request<T>(
        &self,
        what: &str,
        file: &File,
        region: &Region<T>,
        destination: Destination,
    ) -> Result<Request, LoadError> {
        Ok(Request {
            name: format!("{}/{}", self.name, what),
            source: Source {
                file: file.clone(),
                offset: region.data.get(),
                size: region.compressed_size,
            },
            compression: region.compression_format()?,
            uncompressed_size: region.uncompressed_size,
            destination,
            tag: self.tag,
        })
    }

    /// Wrap a phase so that it only runs while the model is alive.
    fn continuation(
        &self,
        phase: impl FnOnce(&Model) + Send + 'static,
    ) -> impl FnOnce() + Send + 'static {
        let weak = self.weak_self.clone();
        move || {
            if let Some(model) = weak.upgrade() {
                phase(&model);
            }
        }
    }

    /// Start loading asynchronously.
    ///
    /// Only opening the file happens here, everything else
    /// is reported through the phase and readiness flags.
    #[profiling::function]
    pub fn request_load(&self, path: &Path) -> Result<(), LoadError> {
        if self.phase() != LoadPhase::Unstarted {
            return Err(LoadError::AlreadyStarted);
        }
        let storage = &self.context.storage;
        let file = storage.open_file(path)?;
        if self
            .phase
            .compare_exchange(
                LoadPhase::Unstarted as u8,
                LoadPhase::HeaderPending as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(LoadError::AlreadyStarted);
        }
        log::info!("Loading model '{}' from {}", self.name, path.display());

        let buffer = shared_buffer(Header::SIZE);
        let request = Request {
            name: format!("{}/header", self.name),
            source: Source {
                file: file.clone(),
                offset: 0,
                size: Header::SIZE as u32,
            },
            compression: CompressionFormat::None,
            uncompressed_size: Header::SIZE as u32,
            destination: Destination::Memory {
                buffer: Arc::clone(&buffer),
                offset: 0,
            },
            tag: self.tag,
        };
        self.state.lock().unwrap().file = Some(file);

        self.events
            .header
            .arm(self.continuation(move |model| model.on_header_loaded(buffer)));
        let queue = &storage.system;
        queue.enqueue_read(request);
        queue.enqueue_tagged_status(&self.status, Slot::Header as usize, self.tag);
        queue.enqueue_signal(&self.events.header);
        queue.submit();
        Ok(())
    }

    /// Synchronously read the metadata, and create the heap and descriptor
    /// heap ahead of the actual load.
    #[profiling::function]
    pub fn request_load_header_only(&self, path: &Path) -> Result<(), LoadError> {
        if self.phase() != LoadPhase::Unstarted {
            return Err(LoadError::AlreadyStarted);
        }
        let mut file = std::fs::File::open(path).map_err(FormatError::from)?;
        let header = ferry_format::read_header(&mut file)?;
        let region =
            ferry_format::read_region(&mut file, &header.cpu_metadata, self.context.storage.codec())?;
        let metadata = CpuMetadata::fixup(region)?;

        let gpu = &self.context.gpu;
        let plan = AllocationPlan::new(
            gpu,
            metadata.texture_descs(),
            header.unstructured_gpu_data.uncompressed_size as u64,
        )?;
        let allocation = GpuAllocation::create(gpu, &self.name, plan)?;
        let previous = self.state.lock().unwrap().allocation.replace(allocation);
        if let Some(previous) = previous {
            previous.destroy(gpu);
        }
        log::info!("Prefetched the allocation of model '{}'", self.name);
        Ok(())
    }

    fn on_header_loaded(&self, buffer: SharedHostBuffer) {
        profiling::scope!("on_header_loaded");
        if let Err(e) = self.load_metadata(buffer) {
            self.fail("the header", e);
        }
    }

    fn load_metadata(&self, buffer: SharedHostBuffer) -> Result<(), LoadError> {
        self.status.check(Slot::Header as usize)?;
        let header = Header::parse(buffer.lock().unwrap().as_bytes())?;

        let file = {
            let mut state = self.state.lock().unwrap();
            state.header = Some(header);
            state.file.clone().ok_or(LoadError::Incomplete("file"))?
        };
        let region = header.cpu_metadata;
        let buffer = shared_buffer(region.uncompressed_size as usize);
        let destination = Destination::Memory {
            buffer: Arc::clone(&buffer),
            offset: 0,
        };
        let request = self.region_request("metadata", &file, &region, destination)?;

        self.set_phase(LoadPhase::MetadataPending);
        self.events
            .metadata
            .arm(self.continuation(move |model| model.on_metadata_loaded(buffer)));
        let queue = &self.context.storage.system;
        queue.enqueue_read(request);
        queue.enqueue_tagged_status(&self.status, Slot::Metadata as usize, self.tag);
        queue.enqueue_signal(&self.events.metadata);
        queue.submit();
        Ok(())
    }

    fn on_metadata_loaded(&self, buffer: SharedHostBuffer) {
        profiling::scope!("on_metadata_loaded");
        if let Err(e) = self.load_data(buffer) {
            self.fail("the metadata", e);
        }
    }

    fn load_data(&self, buffer: SharedHostBuffer) -> Result<(), LoadError> {
        self.status.check(Slot::Metadata as usize)?;
        let metadata = CpuMetadata::fixup(MemoryRegion::new(take_buffer(buffer)))?;
        let gpu = &self.context.gpu;

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let header = state.header.ok_or(LoadError::Incomplete("header"))?;
        let file = state.file.clone().ok_or(LoadError::Incomplete("file"))?;
        let unstructured = header.unstructured_gpu_data;

        let plan = AllocationPlan::new(
            gpu,
            metadata.texture_descs(),
            unstructured.uncompressed_size as u64,
        )?;
        let allocation = match state.allocation.take() {
            Some(prefetched) if prefetched.plan == plan && !prefetched.is_placed() => {
                log::debug!("Model '{}' uses the prefetched allocation", self.name);
                prefetched
            }
            Some(prefetched) => {
                log::warn!(
                    "Prefetched allocation of model '{}' does not match, reallocating",
                    self.name
                );
                prefetched.destroy(gpu);
                GpuAllocation::create(gpu, &self.name, plan)?
            }
            None => GpuAllocation::create(gpu, &self.name, plan)?,
        };
        // stored right away, so that a partial placement is released on drop
        let allocation = state.allocation.insert(allocation);
        allocation.place(gpu, &self.name, metadata.texture_descs())?;

        let cpu_region = header.cpu_data;
        let data_buffer = shared_buffer(cpu_region.uncompressed_size as usize);
        let data_request = self.region_request(
            "data",
            &file,
            &cpu_region,
            Destination::Memory {
                buffer: Arc::clone(&data_buffer),
                offset: 0,
            },
        )?;

        let mut gpu_requests = Vec::with_capacity(metadata.texture_count() + 1);
        for (index, (record, &texture)) in metadata
            .textures()
            .iter()
            .zip(allocation.textures.iter())
            .enumerate()
        {
            let what = format!("texture '{}'", metadata.texture_name(index));
            let destination = Destination::MultipleSubresources {
                resource: texture,
                first_subresource: 0,
            };
            gpu_requests.push(self.region_request(&what, &file, &record.mips, destination)?);
        }
        match allocation.buffer {
            Some(buffer) if unstructured.uncompressed_size != 0 => {
                let destination = Destination::Buffer {
                    resource: buffer,
                    offset: 0,
                    size: unstructured.uncompressed_size as u64,
                };
                gpu_requests.push(self.region_request(
                    "unstructured",
                    &file,
                    &unstructured,
                    destination,
                )?);
            }
            _ => {}
        }

        let mut data_size = DataSize {
            texture: allocation.plan.textures.iter().map(|info| info.size).sum(),
            buffer: allocation.plan.buffer.size,
            cpu: header.cpu_metadata.uncompressed_size as u64 + cpu_region.uncompressed_size as u64,
            compressed: 0,
            uncompressed: 0,
        };
        let regions = [
            (header.cpu_metadata.compressed_size, header.cpu_metadata.uncompressed_size),
            (cpu_region.compressed_size, cpu_region.uncompressed_size),
            (unstructured.compressed_size, unstructured.uncompressed_size),
        ];
        let texture_regions = metadata
            .textures()
            .iter()
            .map(|record| (record.mips.compressed_size, record.mips.uncompressed_size));
        for (compressed, uncompressed) in regions.into_iter().chain(texture_regions) {
            data_size.compressed += compressed as u64;
            data_size.uncompressed += uncompressed as u64;
        }
        log::info!(
            "Model '{}' streams {} textures, {} bytes from the file",
            self.name,
            gpu_requests.len(),
            data_size.compressed
        );
        state.data_size = data_size;
        state.metadata = Some(metadata);
        drop(guard);

        self.set_phase(LoadPhase::DataPending);
        self.events
            .cpu_data
            .arm(self.continuation(move |model| model.on_cpu_data_loaded(data_buffer)));
        self.events
            .gpu_data
            .arm(self.continuation(|model| model.on_gpu_data_loaded()));

        let system = &self.context.storage.system;
        system.enqueue_read(data_request);
        system.enqueue_tagged_status(&self.status, Slot::CpuData as usize, self.tag);
        system.enqueue_signal(&self.events.cpu_data);
        system.submit();

        let gpu_queue = &self.context.storage.gpu;
        for request in gpu_requests {
            gpu_queue.enqueue_read(request);
        }
        gpu_queue.enqueue_tagged_status(&self.status, Slot::GpuData as usize, self.tag);
        gpu_queue.enqueue_signal(&self.events.gpu_data);
        gpu_queue.submit();
        Ok(())
    }

    fn on_cpu_data_loaded(&self, buffer: SharedHostBuffer) {
        profiling::scope!("on_cpu_data_loaded");
        let result = match self.status.check(Slot::CpuData as usize) {
            Ok(()) => CpuData::fixup(MemoryRegion::new(take_buffer(buffer))).map_err(LoadError::from),
            Err(e) => Err(e.into()),
        };
        {
            let mut state = self.state.lock().unwrap();
            match result {
                Ok(data) => state.data = Some(data),
                Err(e) => state.data_error = Some(e),
            }
        }
        if self.join.arrive() {
            self.on_all_data_loaded();
        }
    }

    fn on_gpu_data_loaded(&self) {
        profiling::scope!("on_gpu_data_loaded");
        if self.join.arrive() {
            self.on_all_data_loaded();
        }
    }

    fn check_all_data(&self) -> Result<(), LoadError> {
        self.status.check(Slot::CpuData as usize)?;
        self.status.check(Slot::GpuData as usize)?;
        match self.state.lock().unwrap().data_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn on_all_data_loaded(&self) {
        profiling::scope!("on_all_data_loaded");
        if let Err(e) = self.check_all_data() {
            self.fail("the data", e);
            return;
        }
        self.finished.store(true, Ordering::Release);
        let callback = self.callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(self);
        }

        match self.build_render_data() {
            Ok(render) => {
                *self.render.lock().unwrap() = Some(render);
                self.set_phase(LoadPhase::Ready);
                self.prepared.store(true, Ordering::Release);
                log::info!("Model '{}' is ready", self.name);
            }
            Err(e) => self.fail("the render data", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{shared_buffer, take_buffer};
    use crate::{DefaultTextures, DrawMode, LoadPhase, Model, ModelContext};
    use ferry_format::{
        ContainerWriter, GraphNode, Header, MaterialTextures, MeshRecord, ModelData, TextureData,
        UNSET_TEXTURE,
    };
    use ferry_graphics as gpu;
    use ferry_storage::{Codec, CompressionFormat, SharedHostBuffer, Storage, StorageDesc};
    use std::{
        io::Write as _,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    struct Harness {
        _worker: choir::WorkerHandle,
        gpu: Arc<gpu::Context>,
        context: ModelContext,
        container: tempfile::NamedTempFile,
    }

    fn harness() -> Harness {
        let _ = env_logger::try_init();
        let choir = choir::Choir::new();
        let worker = choir.add_worker("load");
        let gpu = Arc::new(gpu::Context::new(gpu::ContextDesc::default()));
        let storage = Storage::new(
            &StorageDesc {
                queue_capacity: 64,
                codec_threads: 1,
            },
            &gpu,
            &choir,
        )
        .unwrap();
        let defaults = DefaultTextures::new(&gpu).unwrap();

        let desc = gpu::ResourceDesc::texture_2d(gpu::TextureFormat::Rgba8Unorm, 16, 16, 1);
        let textures = (0..2u8)
            .map(|i| TextureData::from_mips("texture", desc, &[vec![i; 16 * 16 * 4]]).unwrap())
            .collect();
        let mut geometry = vec![0u8; 64];
        geometry[48..60].copy_from_slice(bytemuck::cast_slice(&[0u32, 1, 2]));
        let data = ModelData {
            textures,
            geometry,
            meshes: vec![MeshRecord {
                vb_size: 36,
                ib_offset: 48,
                ib_size: 12,
                vb_stride: 12,
                draw_mode: DrawMode::Opaque.into_raw(),
                primitive_count: 1,
                ..Default::default()
            }],
            scene_graph: vec![GraphNode::root()],
            node_names: vec!["root".to_string()],
            material_textures: vec![MaterialTextures {
                texture_indices: [0, 1, UNSET_TEXTURE, UNSET_TEXTURE],
                address_modes: 0,
            }],
            ..Default::default()
        };
        let mut container = tempfile::NamedTempFile::new().unwrap();
        ContainerWriter::new(&Codec::new(1).unwrap(), CompressionFormat::Tiled)
            .write(&data, container.as_file_mut())
            .unwrap();
        container.flush().unwrap();

        Harness {
            _worker: worker,
            context: ModelContext {
                gpu: Arc::clone(&gpu),
                storage: Arc::new(storage),
                defaults: Arc::new(defaults),
            },
            gpu,
            container,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while !condition() {
            if start.elapsed() > Duration::from_secs(10) {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn counting_model(h: &Harness, name: &str) -> (Arc<Model>, Arc<AtomicUsize>) {
        let model = Model::new(&h.context, name);
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completions);
        model.set_loading_complete_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (model, completions)
    }

    /// Put the model where the header read would have left it.
    fn stage_header(h: &Harness, model: &Model) -> SharedHostBuffer {
        let file = h.context.storage.open_file(h.container.path()).unwrap();
        model.state.lock().unwrap().file = Some(file);
        let bytes = std::fs::read(h.container.path()).unwrap();
        let buffer = shared_buffer(Header::SIZE);
        buffer
            .lock()
            .unwrap()
            .as_bytes_mut()
            .copy_from_slice(&bytes[..Header::SIZE]);
        buffer
    }

    /// Put the model where the metadata read would have left it.
    fn stage_metadata(h: &Harness, model: &Model) -> SharedHostBuffer {
        let header_buffer = stage_header(h, model);
        let header = Header::parse(take_buffer(header_buffer).as_bytes()).unwrap();
        model.state.lock().unwrap().header = Some(header);
        let mut raw = std::fs::File::open(h.container.path()).unwrap();
        let region =
            ferry_format::read_region(&mut raw, &header.cpu_metadata, h.context.storage.codec())
                .unwrap();
        let buffer = shared_buffer(region.len());
        buffer
            .lock()
            .unwrap()
            .as_bytes_mut()
            .copy_from_slice(region.as_bytes());
        buffer
    }

    fn data_ordering(held_back: &ferry_storage::Queue, h: &Harness) -> Arc<Model> {
        let (model, completions) = counting_model(h, "ordered");
        held_back.pause();
        let buffer = stage_metadata(h, &model);
        model.load_data(buffer).unwrap();
        assert_eq!(model.phase(), LoadPhase::DataPending);

        assert!(wait_until(|| model.join.arrived() == 1));
        assert!(!model.is_finish_loading());
        assert_eq!(completions.load(Ordering::SeqCst), 0);
        held_back.resume();

        assert!(wait_until(|| model.is_rendering_prepared()));
        h.context.storage.wait_idle();
        assert!(model.join.is_done());
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(model.phase(), LoadPhase::Ready);
        model
    }

    #[test]
    fn cpu_data_arrives_first() {
        let h = harness();
        let model = data_ordering(&h.context.storage.gpu, &h);
        assert!(model.state.lock().unwrap().data.is_some());
    }

    #[test]
    fn gpu_data_arrives_first() {
        let h = harness();
        let model = data_ordering(&h.context.storage.system, &h);
        assert!(model.state.lock().unwrap().data.is_some());
    }

    /// Drop a model stopped in `phase` while another one loads next to it.
    fn teardown_in(phase: LoadPhase) {
        let h = harness();
        let storage = &h.context.storage;
        let baseline = h.gpu.allocated_memory();
        let (victim, completions) = counting_model(&h, "victim");
        match phase {
            LoadPhase::HeaderPending => {
                storage.system.pause();
                victim.request_load(h.container.path()).unwrap();
            }
            LoadPhase::MetadataPending => {
                storage.system.pause();
                let buffer = stage_header(&h, &victim);
                victim.load_metadata(buffer).unwrap();
            }
            LoadPhase::DataPending => {
                storage.system.pause();
                storage.gpu.pause();
                let buffer = stage_metadata(&h, &victim);
                victim.load_data(buffer).unwrap();
            }
            LoadPhase::Ready => {
                victim.request_load(h.container.path()).unwrap();
                assert!(wait_until(|| victim.is_rendering_prepared()));
                storage.system.pause();
            }
            other => panic!("no teardown in {:?}", other),
        }
        assert_eq!(victim.phase(), phase);

        let survivor = Model::new(&h.context, "survivor");
        survivor.request_load(h.container.path()).unwrap();
        let events = [
            victim.events.header.clone(),
            victim.events.metadata.clone(),
            victim.events.cpu_data.clone(),
            victim.events.gpu_data.clone(),
        ];
        let weak = Arc::downgrade(&victim);
        drop(victim);
        // a finishing continuation may still hold it for a moment
        assert!(wait_until(|| weak.upgrade().is_none()));

        storage.system.resume();
        storage.gpu.resume();
        assert!(wait_until(|| survivor.is_rendering_prepared()));
        assert_eq!(survivor.failure(), None);
        storage.wait_idle();

        let cancelled = storage.system.cancelled_count() + storage.gpu.cancelled_count();
        match phase {
            LoadPhase::Ready => assert_eq!(cancelled, 0),
            LoadPhase::DataPending => {
                assert_eq!(storage.system.cancelled_count(), 1);
                assert!(storage.gpu.cancelled_count() >= 2);
            }
            _ => assert_eq!(cancelled, 1),
        }
        let expected = match phase {
            LoadPhase::Ready => 1,
            _ => 0,
        };
        assert_eq!(completions.load(Ordering::SeqCst), expected);
        for event in events.iter() {
            assert!(!event.disarm(), "'{}' is still armed", event.name());
        }

        drop(survivor);
        assert!(wait_until(|| h.gpu.allocated_memory() == baseline));
    }

    #[test]
    fn teardown_header_pending() {
        teardown_in(LoadPhase::HeaderPending);
    }

    #[test]
    fn teardown_metadata_pending() {
        teardown_in(LoadPhase::MetadataPending);
    }

    #[test]
    fn teardown_data_pending() {
        teardown_in(LoadPhase::DataPending);
    }

    #[test]
    fn teardown_ready() {
        teardown_in(LoadPhase::Ready);
    }
}
