#![allow(irrefutable_let_patterns, clippy::new_without_default)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

mod codec;
mod event;
mod queue;
mod status;

pub use codec::{Codec, CodecError, TILE_SIZE};
pub use event::Event;
pub use queue::{Queue, QueueKind};
pub use status::{Status, StatusArray};

use ferry_graphics as gpu;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Mask selecting every bit of a request tag.
pub const TAG_MASK_ALL: u64 = !0;

#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub enum CompressionFormat {
    #[default]
    None,
    /// Tile-parallel block codec, see `Codec`.
    Tiled,
}

/// Owned byte buffer with 8-byte alignment.
#[derive(Default)]
pub struct HostBuffer {
    words: Vec<u64>,
    len: usize,
}

impl HostBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }
}

/// Host buffer shared between its owner and the requests filling it.
pub type SharedHostBuffer = Arc<Mutex<HostBuffer>>;

struct FileInner {
    path: PathBuf,
    raw: Mutex<fs::File>,
    len: u64,
}

/// A file opened for reading through the queues.
#[derive(Clone)]
pub struct File {
    inner: Arc<FileInner>,
}

impl File {
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use io::{Read as _, Seek as _};
        let mut raw = self.inner.raw.lock().unwrap();
        raw.seek(io::SeekFrom::Start(offset))?;
        raw.read_exact(buf)
    }
}

#[derive(Clone)]
pub struct Source {
    pub file: File,
    pub offset: u64,
    pub size: u32,
}

#[derive(Clone)]
pub enum Destination {
    /// Host memory, at a byte offset into the buffer.
    Memory {
        buffer: SharedHostBuffer,
        offset: usize,
    },
    /// A region of a buffer resource.
    Buffer {
        resource: gpu::Resource,
        offset: u64,
        size: u64,
    },
    /// Consecutive subresources of a texture, in the copyable layout.
    MultipleSubresources {
        resource: gpu::Resource,
        first_subresource: u32,
    },
}

impl Destination {
    pub fn queue_kind(&self) -> QueueKind {
        match *self {
            Self::Memory { .. } => QueueKind::System,
            Self::Buffer { .. } | Self::MultipleSubresources { .. } => QueueKind::Gpu,
        }
    }
}

pub struct Request {
    pub name: String,
    pub source: Source,
    pub compression: CompressionFormat,
    pub uncompressed_size: u32,
    pub destination: Destination,
    /// Opaque identity used for cancellation.
    pub tag: u64,
}

#[derive(Debug)]
pub struct StorageDesc {
    /// Number of entries buffered before an implicit submission.
    pub queue_capacity: usize,
    /// Threads of the decompression codec. Zero picks the number of cores.
    pub codec_threads: usize,
}

impl Default for StorageDesc {
    fn default() -> Self {
        Self {
            queue_capacity: 0x2000,
            codec_threads: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open '{path}': {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to create the codec: {0}")]
    Codec(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to spawn a queue worker: {0}")]
    Worker(io::Error),
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        kind: io::ErrorKind,
        message: String,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("payload holds {actual} bytes, {expected} expected")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error(transparent)]
    Device(#[from] gpu::DeviceError),
    #[error("destination does not belong to the {0:?} queue")]
    DestinationMismatch(QueueKind),
    #[error("destination is too small")]
    DestinationOutOfBounds,
    #[error("request was cancelled")]
    Cancelled,
}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        Self::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// The pair of storage queues together with their codec.
pub struct Storage {
    pub system: Queue,
    pub gpu: Queue,
    codec: Arc<Codec>,
}

impl Storage {
    pub fn new(
        desc: &StorageDesc,
        gpu_context: &Arc<gpu::Context>,
        choir: &Arc<choir::Choir>,
    ) -> Result<Self, StorageError> {
        let codec = Arc::new(Codec::new(desc.codec_threads)?);
        let system = Queue::new(
            "system",
            QueueKind::System,
            desc.queue_capacity,
            gpu_context,
            &codec,
            choir,
        )
        .map_err(StorageError::Worker)?;
        let gpu = Queue::new(
            "gpu",
            QueueKind::Gpu,
            desc.queue_capacity,
            gpu_context,
            &codec,
            choir,
        )
        .map_err(StorageError::Worker)?;
        log::info!("Storage queues created with capacity {}", desc.queue_capacity);
        Ok(Self { system, gpu, codec })
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn open_file(&self, path: &Path) -> Result<File, StorageError> {
        let open = |path: &Path| -> io::Result<File> {
            let raw = fs::File::open(path)?;
            let len = raw.metadata()?.len();
            Ok(File {
                inner: Arc::new(FileInner {
                    path: path.to_path_buf(),
                    raw: Mutex::new(raw),
                    len,
                }),
            })
        };
        open(path).map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn submit(&self) {
        self.system.submit();
        self.gpu.submit();
    }

    pub fn cancel_requests_with_tag(&self, mask: u64, tag: u64) {
        self.system.cancel_requests_with_tag(mask, tag);
        self.gpu.cancel_requests_with_tag(mask, tag);
    }

    /// Block until both queues are drained.
    pub fn wait_idle(&self) {
        self.system.wait_idle();
        self.gpu.wait_idle();
    }
}
