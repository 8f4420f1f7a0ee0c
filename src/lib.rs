#![allow(
    irrefutable_let_patterns,
    clippy::new_without_default,
    // Conflicts with `pattern_type_mismatch`
    clippy::needless_borrowed_reference,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

use ferry_graphics as gpu;
use std::{path::Path, sync::Arc};

pub mod config;

pub use ferry_render::{DataSize, DrawMode, LoadError, LoadPhase, Model};

const DRAW_ORDER: [DrawMode; 3] = [DrawMode::Opaque, DrawMode::Mask, DrawMode::Blend];

/// Ferry Engine encapsulates the GPU context, the worker pool,
/// the storage queues and every streamed model.
pub struct Engine {
    hub: ferry_render::ModelHub,
    gpu_context: Arc<gpu::Context>,
    last_sync_point: Option<gpu::SyncPoint>,
    workers: Vec<choir::WorkerHandle>,
    choir: Arc<choir::Choir>,
}

impl Engine {
    #[profiling::function]
    pub fn new(config: &config::Engine) -> Result<Self, LoadError> {
        log::info!("Initializing the engine");
        let gpu_context = Arc::new(gpu::Context::new(gpu::ContextDesc {
            validation: config.device.validation,
            resource_descriptors: config.device.resource_descriptors,
            sampler_descriptors: config.device.sampler_descriptors,
            memory_budget: config.device.memory_budget,
        }));

        let num_workers = match config.worker_count {
            0 => num_cpus::get_physical().max((num_cpus::get() * 3 + 2) / 4),
            count => count,
        };
        log::info!("Initializing Choir with {} workers", num_workers);
        let choir = choir::Choir::new();
        let workers = (0..num_workers)
            .map(|i| choir.add_worker(&format!("Worker-{}", i)))
            .collect();

        let hub = ferry_render::ModelHub::new(
            &ferry_render::HubDesc {
                storage: ferry_storage::StorageDesc {
                    queue_capacity: config.storage.queue_capacity,
                    codec_threads: config.storage.codec_threads,
                },
                prefetch: config.prefetch_allocations,
            },
            &gpu_context,
            &choir,
        )?;

        let mut engine = Self {
            hub,
            gpu_context,
            last_sync_point: None,
            workers,
            choir,
        };
        let accepted = engine.load_models(&config.models);
        if accepted != 0 {
            log::info!("Started loading {} configured models", accepted);
        }
        Ok(engine)
    }

    pub fn gpu_context(&self) -> &Arc<gpu::Context> {
        &self.gpu_context
    }

    pub fn models(&self) -> &[Arc<Model>] {
        self.hub.models()
    }

    /// Start streaming every file, returning how many loads were accepted.
    ///
    /// Files that can't be opened are logged and skipped.
    pub fn load_models<P: AsRef<Path>>(&mut self, paths: impl IntoIterator<Item = P>) -> usize {
        let mut count = 0;
        for path in paths {
            let path = path.as_ref();
            match self.hub.load(path) {
                Ok(_) => count += 1,
                Err(e) => log::error!("Unable to load {}: {}", path.display(), e),
            }
        }
        count
    }

    /// Release every model, cancelling whatever is still in flight.
    pub fn unload_models(&mut self) {
        self.hub.clear();
    }

    /// Number of models ready to be drawn.
    pub fn loaded_count(&self) -> usize {
        self.hub.prepared_count()
    }

    pub fn is_load_finished(&self) -> bool {
        self.hub.is_load_finished()
    }

    pub fn data_size(&self) -> DataSize {
        self.hub.data_size()
    }

    /// Record the frame of every prepared model: the matrix copies first,
    /// then the draws in opaque, mask and blend order.
    ///
    /// Returns the number of draws.
    #[profiling::function]
    pub fn render_frame(
        &mut self,
        command_encoder: &mut gpu::CommandEncoder,
        root: mint::ColumnMatrix4<f32>,
    ) -> u32 {
        self.choir.check_panic();
        self.hub.update_matrices(root);
        self.hub.submit_matrices(&mut command_encoder.transfer());
        let mut pass = command_encoder.render();
        DRAW_ORDER
            .iter()
            .map(|&mode| self.hub.draw(&mut pass, mode))
            .sum()
    }

    /// Execute the recorded frame on the device.
    pub fn submit_frame(&mut self, command_encoder: &mut gpu::CommandEncoder) {
        let sync_point = self.gpu_context.submit(command_encoder);
        self.last_sync_point = Some(sync_point);
    }

    pub fn destroy(&mut self) {
        if let Some(sp) = self.last_sync_point.take() {
            self.gpu_context.wait_for(&sp, !0);
        }
        self.hub.destroy();
        self.workers.clear();
        log::info!(
            "Engine is destroyed with {} bytes of device memory left",
            self.gpu_context.allocated_memory()
        );
    }
}
