use crate::{DataSize, DefaultTextures, DrawMode, LoadError, LoadPhase, Model, ModelContext};
use ferry_graphics as gpu;
use ferry_storage::{Storage, StorageDesc};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

#[derive(Debug, Default)]
pub struct HubDesc {
    pub storage: StorageDesc,
    /// Create the heaps of every model synchronously before its load starts.
    pub prefetch: bool,
}

/// A single hub to manage all models.
pub struct ModelHub {
    context: ModelContext,
    prefetch: bool,
    models: Vec<Arc<Model>>,
    completed: Arc<AtomicUsize>,
}

impl ModelHub {
    /// Create a new hub, together with the storage queues and the default textures.
    pub fn new(
        desc: &HubDesc,
        gpu_context: &Arc<gpu::Context>,
        choir: &Arc<choir::Choir>,
    ) -> Result<Self, LoadError> {
        let storage = Storage::new(&desc.storage, gpu_context, choir)?;
        let defaults = DefaultTextures::new(gpu_context)?;
        Ok(Self {
            context: ModelContext {
                gpu: Arc::clone(gpu_context),
                storage: Arc::new(storage),
                defaults: Arc::new(defaults),
            },
            prefetch: desc.prefetch,
            models: Vec::new(),
            completed: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn context(&self) -> &ModelContext {
        &self.context
    }

    /// Start loading a model file. The model is named after the file stem.
    pub fn load(&mut self, path: &Path) -> Result<Arc<Model>, LoadError> {
        let name = path
            .file_stem()
            .map_or_else(|| path.display().to_string(), |stem| stem.to_string_lossy().into_owned());
        let model = Model::new(&self.context, &name);
        if self.prefetch {
            if let Err(e) = model.request_load_header_only(path) {
                log::warn!("Unable to prefetch '{}': {}", name, e);
            }
        }
        let completed = Arc::clone(&self.completed);
        model.set_loading_complete_callback(move |model| {
            let count = completed.fetch_add(1, Ordering::AcqRel) + 1;
            log::debug!("Model '{}' finished loading, {} in total", model.name(), count);
        });
        model.request_load(path)?;
        self.models.push(Arc::clone(&model));
        Ok(model)
    }

    pub fn models(&self) -> &[Arc<Model>] {
        &self.models
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    /// Number of models whose data finished loading.
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn prepared_count(&self) -> usize {
        self.models
            .iter()
            .filter(|model| model.is_rendering_prepared())
            .count()
    }

    /// Every model reached a terminal state, whether it is ready or failed.
    pub fn is_load_finished(&self) -> bool {
        self.models.iter().all(|model| match model.phase() {
            LoadPhase::Ready | LoadPhase::Failed => true,
            _ => false,
        })
    }

    pub fn data_size(&self) -> DataSize {
        let mut total = DataSize::default();
        for model in self.models.iter() {
            total += model.data_size();
        }
        total
    }

    pub fn update_matrices(&self, root: mint::ColumnMatrix4<f32>) {
        for model in self.models.iter() {
            model.update_matrices(root);
        }
    }

    /// Record the matrix copies of every prepared model.
    pub fn submit_matrices(&self, transfer: &mut gpu::TransferCommandEncoder) {
        for model in self.models.iter() {
            model.submit_matrices(transfer);
        }
    }

    /// Record the draws of every prepared model, returning the draw count.
    pub fn draw(&self, pass: &mut gpu::RenderCommandEncoder, mode: DrawMode) -> u32 {
        self.models.iter().map(|model| model.draw(pass, mode)).sum()
    }

    /// Release all the models, cancelling whatever they still have in flight.
    pub fn clear(&mut self) {
        let count = self.models.len();
        self.models.clear();
        self.completed.store(0, Ordering::Release);
        log::info!("Released {} models", count);
    }

    /// Destroy the hub contents.
    pub fn destroy(&mut self) {
        self.clear();
        self.context.storage.wait_idle();
        match Arc::get_mut(&mut self.context.defaults) {
            Some(defaults) => defaults.destroy(&self.context.gpu),
            None => log::warn!("Default textures are still referenced, leaking them"),
        }
    }
}
