//! Streaming model.
//!
//! Loading walks through the following phases, each started by the
//! completion of the previous one on a worker thread:
//!   1. the header is read through the system queue
//!   2. the CPU metadata region is read
//!   3. the heap is allocated and the resources are placed, then the
//!      CPU data region and all the GPU regions are read at the same time
//!   4. CPU data and GPU data join, and the second one to arrive
//!      builds the render data
//!
//! A failure at any phase leaves the model permanently not ready.

mod load;
mod render;

use crate::{DataSize, GpuAllocation, Join, ModelContext};
use ferry_format::{CpuData, CpuMetadata, FormatError, Header};
use ferry_graphics as gpu;
use ferry_storage::{Event, File, RequestError, StatusArray, StorageError};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    Arc, Mutex, PoisonError, Weak,
};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("loading was already requested")]
    AlreadyStarted,
    #[error("loading state is missing {0}")]
    Incomplete(&'static str),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Device(#[from] gpu::DeviceError),
    #[error("mesh {mesh}: {reason}")]
    InvalidMesh { mesh: usize, reason: String },
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum LoadPhase {
    Unstarted = 0,
    HeaderPending = 1,
    MetadataPending = 2,
    /// CPU data and GPU data are in flight together.
    DataPending = 3,
    Ready = 4,
    Failed = 5,
}

impl LoadPhase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::HeaderPending,
            2 => Self::MetadataPending,
            3 => Self::DataPending,
            4 => Self::Ready,
            5 => Self::Failed,
            _ => Self::Unstarted,
        }
    }
}

/// Status slots, one per read phase.
#[derive(Clone, Copy, Debug)]
enum Slot {
    Header = 0,
    Metadata = 1,
    CpuData = 2,
    GpuData = 3,
}

const SLOT_COUNT: usize = 4;

struct Events {
    header: Event,
    metadata: Event,
    cpu_data: Event,
    gpu_data: Event,
}

impl Events {
    fn new(name: &str) -> Self {
        Self {
            header: Event::new(&format!("{}/header", name)),
            metadata: Event::new(&format!("{}/metadata", name)),
            cpu_data: Event::new(&format!("{}/cpu-data", name)),
            gpu_data: Event::new(&format!("{}/gpu-data", name)),
        }
    }

    fn disarm(&self) {
        for event in [&self.header, &self.metadata, &self.cpu_data, &self.gpu_data] {
            if event.disarm() {
                log::debug!("Disarmed '{}'", event.name());
            }
        }
    }
}

#[derive(Default)]
struct LoadState {
    file: Option<File>,
    header: Option<Header>,
    metadata: Option<CpuMetadata>,
    data: Option<CpuData>,
    allocation: Option<GpuAllocation>,
    /// Failure of the CPU data, observed by the join.
    data_error: Option<LoadError>,
    data_size: DataSize,
}

type LoadingCompleteCallback = Box<dyn FnOnce(&Model) + Send>;

pub struct Model {
    name: String,
    /// Identity of all the storage requests issued by this model.
    tag: u64,
    context: ModelContext,
    weak_self: Weak<Model>,
    status: StatusArray,
    events: Events,
    join: Join,
    phase: AtomicU8,
    finished: AtomicBool,
    prepared: AtomicBool,
    state: Mutex<LoadState>,
    render: Mutex<Option<render::RenderData>>,
    callback: Mutex<Option<LoadingCompleteCallback>>,
    failure: Mutex<Option<String>>,
}

impl Model {
    pub fn new(context: &ModelContext, name: &str) -> Arc<Self> {
        static NEXT_TAG: AtomicU64 = AtomicU64::new(1);
        let tag = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|weak_self| Self {
            name: name.to_string(),
            tag,
            context: context.clone(),
            weak_self: weak_self.clone(),
            status: StatusArray::new(SLOT_COUNT),
            events: Events::new(name),
            join: Join::new(2),
            phase: AtomicU8::new(LoadPhase::Unstarted as u8),
            finished: AtomicBool::new(false),
            prepared: AtomicBool::new(false),
            state: Mutex::new(LoadState::default()),
            render: Mutex::new(None),
            callback: Mutex::new(None),
            failure: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn phase(&self) -> LoadPhase {
        LoadPhase::from_raw(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: LoadPhase) {
        log::debug!("Model '{}' enters {:?}", self.name, phase);
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn fail(&self, what: &str, error: LoadError) {
        log::error!("Model '{}' failed to load {}: {}", self.name, what, error);
        *self.failure.lock().unwrap() = Some(error.to_string());
        self.set_phase(LoadPhase::Failed);
    }

    /// All the data is resident, even if the render data is not built yet.
    pub fn is_finish_loading(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Ready to be drawn. Set after everything else.
    pub fn is_rendering_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.phase() == LoadPhase::Failed
    }

    /// Description of the failure that stopped the load.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().unwrap().clone()
    }

    /// Register a function to run once all the data is loaded,
    /// right before the render data is built.
    pub fn set_loading_complete_callback(&self, callback: impl FnOnce(&Model) + Send + 'static) {
        *self.callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Bounds of the model, available once the header is read.
    pub fn aabb(&self) -> Option<(mint::Vector3<f32>, mint::Vector3<f32>)> {
        let state = self.state.lock().unwrap();
        state
            .header
            .as_ref()
            .map(|header| (header.aabb_min.into(), header.aabb_max.into()))
    }

    pub fn data_size(&self) -> DataSize {
        self.state.lock().unwrap().data_size
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        // nothing of ours may be written to once the memory is released
        self.context
            .storage
            .cancel_requests_with_tag(ferry_storage::TAG_MASK_ALL, self.tag);
        self.events.disarm();

        let gpu = &self.context.gpu;
        let render = self
            .render
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(render) = render {
            render.destroy(gpu);
        }
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(allocation) = state.allocation.take() {
            allocation.destroy(gpu);
        }
        log::debug!("Model '{}' is released", self.name);
    }
}
