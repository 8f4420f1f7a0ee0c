use crate::{
    Codec, CompressionFormat, Destination, Event, Request, RequestError, Status, StatusArray,
};
use crossbeam_channel::{Receiver, Sender};
use ferry_graphics as gpu;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
};

/// Class of destinations a queue is able to write into.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum QueueKind {
    /// Host memory destinations.
    System,
    /// Buffer regions and texture subresources.
    Gpu,
}

enum Entry {
    Read(Request),
    Status {
        array: StatusArray,
        index: usize,
        tag: Option<u64>,
    },
    Signal(Event),
}

struct Sequenced {
    seq: u64,
    entry: Entry,
}

/// Requests enqueued before `before` with a matching tag are dropped.
#[derive(Clone, Copy)]
struct CancelRecord {
    mask: u64,
    tag: u64,
    before: u64,
}

impl CancelRecord {
    fn matches(&self, seq: u64, tag: u64) -> bool {
        seq < self.before && (tag & self.mask) == (self.tag & self.mask)
    }
}

/// Failures of the reads that are not reported yet.
#[derive(Default)]
struct BatchErrors {
    any: Option<RequestError>,
    tagged: HashMap<u64, RequestError>,
}

impl BatchErrors {
    fn record(&mut self, tag: u64, error: RequestError) {
        self.tagged.entry(tag).or_insert_with(|| error.clone());
        self.any.get_or_insert(error);
    }

    fn take(&mut self, tag: Option<u64>) -> Option<RequestError> {
        match tag {
            Some(tag) => self.tagged.remove(&tag),
            None => {
                self.tagged.clear();
                self.any.take()
            }
        }
    }
}

struct Pending {
    entries: Vec<Sequenced>,
    next_seq: u64,
}

struct Shared {
    name: String,
    kind: QueueKind,
    gpu: Arc<gpu::Context>,
    codec: Arc<Codec>,
    choir: Arc<choir::Choir>,
    cancels: Mutex<Vec<CancelRecord>>,
    /// Sequence number and tag of the read being executed.
    active: Mutex<Option<(u64, u64)>>,
    active_done: Condvar,
    paused: Mutex<bool>,
    resumed: Condvar,
    cancelled: AtomicU64,
    outstanding: Mutex<usize>,
    idle: Condvar,
}

// Thread that takes batches out of the request channel and ends when the finish channel is signalled
struct Worker {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

/// A storage queue with a dedicated worker thread.
///
/// Entries are buffered until `submit` and processed strictly in order.
pub struct Queue {
    shared: Arc<Shared>,
    capacity: usize,
    pending: Mutex<Pending>,
    request_tx: Sender<Vec<Sequenced>>,
    worker: Option<Worker>,
}

impl Queue {
    pub(crate) fn new(
        name: &str,
        kind: QueueKind,
        capacity: usize,
        gpu: &Arc<gpu::Context>,
        codec: &Arc<Codec>,
        choir: &Arc<choir::Choir>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            kind,
            gpu: Arc::clone(gpu),
            codec: Arc::clone(codec),
            choir: Arc::clone(choir),
            cancels: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            active_done: Condvar::new(),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
            cancelled: AtomicU64::new(0),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
        });
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let worker_shared = Arc::clone(&shared);
        let join_handle = std::thread::Builder::new()
            .name(format!("{} queue", name))
            .spawn(move || worker_shared.run(request_rx, finish_rx))?;
        Ok(Self {
            shared,
            capacity: capacity.max(1),
            pending: Mutex::new(Pending {
                entries: Vec::new(),
                next_seq: 0,
            }),
            request_tx,
            worker: Some(Worker {
                finish_tx,
                join_handle,
            }),
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.shared.kind
    }

    fn push(&self, entry: Entry) {
        let mut pending = self.pending.lock().unwrap();
        let seq = pending.next_seq;
        pending.next_seq += 1;
        pending.entries.push(Sequenced { seq, entry });
        if pending.entries.len() >= self.capacity {
            log::debug!("Queue '{}' is full, submitting", self.shared.name);
            self.flush(&mut pending);
        }
    }

    fn flush(&self, pending: &mut Pending) {
        if pending.entries.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut pending.entries);
        *self.shared.outstanding.lock().unwrap() += batch.len();
        if self.request_tx.send(batch).is_err() {
            log::error!("Queue '{}' worker is gone", self.shared.name);
        }
    }

    pub fn enqueue_read(&self, request: Request) {
        self.push(Entry::Read(request));
    }

    /// Report the combined result of the reads enqueued since the previous status.
    pub fn enqueue_status(&self, array: &StatusArray, index: usize) {
        self.push(Entry::Status {
            array: array.clone(),
            index,
            tag: None,
        });
    }

    /// Report the combined result of the reads with exactly this tag,
    /// enqueued since the previous status of the same tag.
    ///
    /// Failures of other tags don't show up here.
    pub fn enqueue_tagged_status(&self, array: &StatusArray, index: usize, tag: u64) {
        self.push(Entry::Status {
            array: array.clone(),
            index,
            tag: Some(tag),
        });
    }

    /// Signal the event once all previously enqueued work is done.
    pub fn enqueue_signal(&self, event: &Event) {
        self.push(Entry::Signal(event.clone()));
    }

    /// Hand the buffered entries over to the worker, without waiting.
    pub fn submit(&self) {
        let mut pending = self.pending.lock().unwrap();
        self.flush(&mut pending);
    }

    /// Cancel all the requests enqueued so far with a tag matching under `mask`.
    ///
    /// When this returns, no matching request is being executed,
    /// and none is going to be.
    pub fn cancel_requests_with_tag(&self, mask: u64, tag: u64) {
        let record = {
            let pending = self.pending.lock().unwrap();
            let record = CancelRecord {
                mask,
                tag,
                before: pending.next_seq,
            };
            let mut cancels = self.shared.cancels.lock().unwrap();
            cancels.push(record);
            record
        };
        log::debug!(
            "Queue '{}' cancels tag {:#x} under mask {:#x}",
            self.shared.name,
            tag,
            mask
        );
        // a matching read may have started before the record was visible
        let active = self.shared.active.lock().unwrap();
        let _active = self
            .shared
            .active_done
            .wait_while(active, |active| match *active {
                Some((seq, active_tag)) => record.matches(seq, active_tag),
                None => false,
            })
            .unwrap();
    }

    /// Stop the worker before the next entry, until `resume`.
    ///
    /// Entries keep being accepted and submitted in the meantime.
    pub fn pause(&self) {
        *self.shared.paused.lock().unwrap() = true;
        log::debug!("Queue '{}' is paused", self.shared.name);
    }

    pub fn resume(&self) {
        *self.shared.paused.lock().unwrap() = false;
        self.shared.resumed.notify_all();
        log::debug!("Queue '{}' is resumed", self.shared.name);
    }

    /// Number of reads dropped because of a cancellation.
    pub fn cancelled_count(&self) -> u64 {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Submit and block until every entry has been processed.
    ///
    /// Never returns while the queue is paused with work left.
    pub fn wait_idle(&self) {
        self.submit();
        let mut outstanding = self.shared.outstanding.lock().unwrap();
        while *outstanding != 0 {
            outstanding = self.shared.idle.wait(outstanding).unwrap();
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.resume();
            let _ = worker.finish_tx.send(());
            if worker.join_handle.join().is_err() {
                log::error!("Queue '{}' worker panicked", self.shared.name);
            }
        }
    }
}

impl Shared {
    fn run(&self, request_rx: Receiver<Vec<Sequenced>>, finish_rx: Receiver<()>) {
        profiling::register_thread!(&format!("{} queue", self.name));
        // result of the reads since the last status entry
        let mut batch_errors = BatchErrors::default();
        loop {
            crossbeam_channel::select! {
                recv(request_rx) -> msg => match msg {
                    Ok(batch) => {
                        for item in batch {
                            self.wait_resumed();
                            self.process(item, &mut batch_errors);
                        }
                    }
                    Err(_) => return,
                },
                recv(finish_rx) -> _msg => {
                    return;
                }
            }
        }
    }

    fn wait_resumed(&self) {
        let paused = self.paused.lock().unwrap();
        let _paused = self.resumed.wait_while(paused, |paused| *paused).unwrap();
    }

    /// Mark the read as active, unless it's cancelled already.
    fn begin_read(&self, seq: u64, tag: u64) -> bool {
        let cancels = self.cancels.lock().unwrap();
        if cancels.iter().any(|c| c.matches(seq, tag)) {
            return false;
        }
        *self.active.lock().unwrap() = Some((seq, tag));
        true
    }

    fn end_read(&self) {
        *self.active.lock().unwrap() = None;
        self.active_done.notify_all();
    }

    fn process(&self, item: Sequenced, batch_errors: &mut BatchErrors) {
        let seq = item.seq;
        match item.entry {
            Entry::Read(request) => {
                profiling::scope!("Read");
                let result = if self.begin_read(seq, request.tag) {
                    let result = self.execute(&request);
                    self.end_read();
                    result
                } else {
                    self.cancelled.fetch_add(1, Ordering::AcqRel);
                    Err(RequestError::Cancelled)
                };
                match result {
                    Ok(()) => {
                        log::trace!("Read '{}' done", request.name);
                    }
                    Err(RequestError::Cancelled) => {
                        log::debug!("Read '{}' cancelled", request.name);
                        batch_errors.record(request.tag, RequestError::Cancelled);
                    }
                    Err(e) => {
                        log::error!("Read '{}' failed: {}", request.name, e);
                        batch_errors.record(request.tag, e);
                    }
                }
            }
            Entry::Status { array, index, tag } => {
                let status = match batch_errors.take(tag) {
                    Some(e) => Status::Failed(e),
                    None => Status::Complete,
                };
                array.set(index, status);
            }
            Entry::Signal(event) => {
                event.signal(&self.choir);
            }
        }

        self.cancels
            .lock()
            .unwrap()
            .retain(|c| c.before > seq + 1);
        let mut outstanding = self.outstanding.lock().unwrap();
        *outstanding -= 1;
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn execute(&self, request: &Request) -> Result<(), RequestError> {
        if request.destination.queue_kind() != self.kind {
            return Err(RequestError::DestinationMismatch(self.kind));
        }

        let mut raw = vec![0u8; request.source.size as usize];
        {
            profiling::scope!("file read");
            request.source.file.read_at(request.source.offset, &mut raw)?;
        }
        let data = match request.compression {
            CompressionFormat::None => {
                if raw.len() != request.uncompressed_size as usize {
                    return Err(RequestError::SizeMismatch {
                        expected: request.uncompressed_size as u64,
                        actual: raw.len() as u64,
                    });
                }
                raw
            }
            CompressionFormat::Tiled => {
                let mut data = vec![0u8; request.uncompressed_size as usize];
                self.codec.decompress(&raw, &mut data)?;
                data
            }
        };

        match request.destination {
            Destination::Memory { ref buffer, offset } => {
                let mut buffer = buffer.lock().unwrap();
                let dst = buffer
                    .as_bytes_mut()
                    .get_mut(offset..offset + data.len())
                    .ok_or(RequestError::DestinationOutOfBounds)?;
                dst.copy_from_slice(&data);
            }
            Destination::Buffer {
                resource,
                offset,
                size,
            } => {
                if data.len() as u64 > size {
                    return Err(RequestError::DestinationOutOfBounds);
                }
                self.gpu.write_buffer(resource, offset, &data)?;
            }
            Destination::MultipleSubresources {
                resource,
                first_subresource,
            } => {
                self.gpu
                    .write_subresources(resource, first_subresource, &data)?;
            }
        }
        Ok(())
    }
}
