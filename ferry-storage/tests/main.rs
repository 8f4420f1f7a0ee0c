use ferry_graphics as gpu;
use ferry_storage::{
    CompressionFormat, Destination, Event, HostBuffer, Request, RequestError, Source, Status,
    StatusArray, Storage, StorageDesc,
};
use std::{
    io::Write as _,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    _worker: choir::WorkerHandle,
    gpu: Arc<gpu::Context>,
    storage: Storage,
}

fn harness() -> Harness {
    let _ = env_logger::try_init();
    let choir = choir::Choir::new();
    let worker = choir.add_worker("main");
    let gpu = Arc::new(gpu::Context::new(gpu::ContextDesc::default()));
    let storage = Storage::new(
        &StorageDesc {
            queue_capacity: 64,
            codec_threads: 2,
        },
        &gpu,
        &choir,
    )
    .unwrap();
    Harness {
        _worker: worker,
        gpu,
        storage,
    }
}

fn write_temp(chunks: &[&[u8]]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for chunk in chunks {
        file.write_all(chunk).unwrap();
    }
    file.flush().unwrap();
    file
}

fn read_request(
    source: Source,
    compression: CompressionFormat,
    uncompressed_size: u32,
    destination: Destination,
    tag: u64,
) -> Request {
    Request {
        name: "test".to_string(),
        source,
        compression,
        uncompressed_size,
        destination,
        tag,
    }
}

#[test]
fn read_into_memory() {
    let h = harness();
    let raw = b"plain bytes".to_vec();
    let payload = (0..100_000u32).map(|i| (i % 7) as u8).collect::<Vec<_>>();
    let compressed = h.storage.codec().compress(&payload);
    let temp = write_temp(&[&raw, &compressed]);
    let file = h.storage.open_file(temp.path()).unwrap();

    let plain = Arc::new(Mutex::new(HostBuffer::new(raw.len())));
    let unpacked = Arc::new(Mutex::new(HostBuffer::new(payload.len())));
    h.storage.system.enqueue_read(read_request(
        Source {
            file: file.clone(),
            offset: 0,
            size: raw.len() as u32,
        },
        CompressionFormat::None,
        raw.len() as u32,
        Destination::Memory {
            buffer: Arc::clone(&plain),
            offset: 0,
        },
        1,
    ));
    h.storage.system.enqueue_read(read_request(
        Source {
            file,
            offset: raw.len() as u64,
            size: compressed.len() as u32,
        },
        CompressionFormat::Tiled,
        payload.len() as u32,
        Destination::Memory {
            buffer: Arc::clone(&unpacked),
            offset: 0,
        },
        1,
    ));
    let status = StatusArray::new(1);
    let event = Event::new("read");
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    event.arm(move || {
        fired2.fetch_add(1, Ordering::SeqCst);
    });
    h.storage.system.enqueue_status(&status, 0);
    h.storage.system.enqueue_signal(&event);
    h.storage.system.submit();

    assert!(event.wait(TIMEOUT));
    assert_eq!(status.get(0), Status::Complete);
    assert_eq!(plain.lock().unwrap().as_bytes(), &raw[..]);
    assert_eq!(unpacked.lock().unwrap().as_bytes(), &payload[..]);
    h.storage.wait_idle();
    // the continuation runs on a worker shortly after the signal
    for _ in 0..1000 {
        if fired.load(Ordering::SeqCst) != 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn read_into_buffer() {
    let h = harness();
    let payload = vec![7u8; 300];
    let temp = write_temp(&[&payload]);
    let file = h.storage.open_file(temp.path()).unwrap();
    let buffer = h
        .gpu
        .create_committed_resource("dst", &gpu::ResourceDesc::buffer(1024), gpu::Memory::Device)
        .unwrap();
    h.storage.gpu.enqueue_read(read_request(
        Source {
            file,
            offset: 0,
            size: 300,
        },
        CompressionFormat::None,
        300,
        Destination::Buffer {
            resource: buffer,
            offset: 100,
            size: 300,
        },
        2,
    ));
    let status = StatusArray::new(1);
    h.storage.gpu.enqueue_status(&status, 0);
    h.storage.gpu.wait_idle();
    assert_eq!(status.get(0), Status::Complete);
    assert_eq!(h.gpu.read_buffer(buffer, 100, 300).unwrap(), payload);
    assert_eq!(h.gpu.read_buffer(buffer, 99, 1).unwrap(), vec![0]);
}

#[test]
fn wrong_destination_class() {
    let h = harness();
    let temp = write_temp(&[b"data"]);
    let file = h.storage.open_file(temp.path()).unwrap();
    h.storage.gpu.enqueue_read(read_request(
        Source {
            file,
            offset: 0,
            size: 4,
        },
        CompressionFormat::None,
        4,
        Destination::Memory {
            buffer: Arc::new(Mutex::new(HostBuffer::new(4))),
            offset: 0,
        },
        3,
    ));
    let status = StatusArray::new(1);
    h.storage.gpu.enqueue_status(&status, 0);
    h.storage.gpu.wait_idle();
    assert!(matches!(
        status.get(0),
        Status::Failed(RequestError::DestinationMismatch(_))
    ));
}

#[test]
fn read_past_the_end() {
    let h = harness();
    let temp = write_temp(&[b"short"]);
    let file = h.storage.open_file(temp.path()).unwrap();
    h.storage.system.enqueue_read(read_request(
        Source {
            file,
            offset: 2,
            size: 10,
        },
        CompressionFormat::None,
        10,
        Destination::Memory {
            buffer: Arc::new(Mutex::new(HostBuffer::new(10))),
            offset: 0,
        },
        4,
    ));
    let status = StatusArray::new(2);
    h.storage.system.enqueue_status(&status, 0);
    // the failure does not leak into the next status
    h.storage.system.enqueue_status(&status, 1);
    h.storage.system.wait_idle();
    assert!(matches!(status.get(0), Status::Failed(RequestError::Io { .. })));
    assert_eq!(status.get(1), Status::Complete);
}

#[test]
fn cancel_by_tag() {
    let h = harness();
    let temp = write_temp(&[b"0123456789"]);
    let file = h.storage.open_file(temp.path()).unwrap();
    let buffers = [
        Arc::new(Mutex::new(HostBuffer::new(10))),
        Arc::new(Mutex::new(HostBuffer::new(10))),
    ];
    let status = StatusArray::new(2);
    for (index, (buffer, tag)) in buffers.iter().zip([0x10u64, 0x20]).enumerate() {
        h.storage.system.enqueue_read(read_request(
            Source {
                file: file.clone(),
                offset: 0,
                size: 10,
            },
            CompressionFormat::None,
            10,
            Destination::Memory {
                buffer: Arc::clone(buffer),
                offset: 0,
            },
            tag,
        ));
        h.storage.system.enqueue_status(&status, index);
    }
    h.storage.cancel_requests_with_tag(ferry_storage::TAG_MASK_ALL, 0x10);
    h.storage.system.wait_idle();

    assert_eq!(status.get(0), Status::Failed(RequestError::Cancelled));
    assert_eq!(buffers[0].lock().unwrap().as_bytes(), &[0u8; 10]);
    assert_eq!(status.get(1), Status::Complete);
    assert_eq!(buffers[1].lock().unwrap().as_bytes(), b"0123456789");
}

#[test]
fn disarmed_event_does_not_fire() {
    let h = harness();
    let event = Event::new("disarmed");
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    event.arm(move || {
        fired2.fetch_add(1, Ordering::SeqCst);
    });
    assert!(event.disarm());
    h.storage.system.enqueue_signal(&event);
    h.storage.system.wait_idle();
    assert!(event.is_set());
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn tagged_status_ignores_other_tags() {
    let h = harness();
    let temp = write_temp(&[b"0123456789"]);
    let file = h.storage.open_file(temp.path()).unwrap();
    // someone else's read fails, and is never reported by its owner
    h.storage.system.enqueue_read(read_request(
        Source {
            file: file.clone(),
            offset: 4,
            size: 10,
        },
        CompressionFormat::None,
        10,
        Destination::Memory {
            buffer: Arc::new(Mutex::new(HostBuffer::new(10))),
            offset: 0,
        },
        999,
    ));
    let buffer = Arc::new(Mutex::new(HostBuffer::new(10)));
    h.storage.system.enqueue_read(read_request(
        Source {
            file,
            offset: 0,
            size: 10,
        },
        CompressionFormat::None,
        10,
        Destination::Memory {
            buffer: Arc::clone(&buffer),
            offset: 0,
        },
        5,
    ));
    let status = StatusArray::new(3);
    h.storage.system.enqueue_tagged_status(&status, 0, 5);
    h.storage.system.enqueue_tagged_status(&status, 1, 999);
    h.storage.system.enqueue_tagged_status(&status, 2, 999);
    h.storage.system.wait_idle();

    assert_eq!(status.get(0), Status::Complete);
    assert_eq!(buffer.lock().unwrap().as_bytes(), b"0123456789");
    assert!(matches!(status.get(1), Status::Failed(RequestError::Io { .. })));
    assert_eq!(status.get(2), Status::Complete);
}

#[test]
fn paused_queue_holds_back_work() {
    let h = harness();
    let temp = write_temp(&[b"0123456789"]);
    let file = h.storage.open_file(temp.path()).unwrap();
    let buffer = Arc::new(Mutex::new(HostBuffer::new(10)));
    let status = StatusArray::new(2);
    let event = Event::new("paused");

    h.storage.system.pause();
    for (index, tag) in [7u64, 8].into_iter().enumerate() {
        h.storage.system.enqueue_read(read_request(
            Source {
                file: file.clone(),
                offset: 0,
                size: 10,
            },
            CompressionFormat::None,
            10,
            Destination::Memory {
                buffer: Arc::clone(&buffer),
                offset: 0,
            },
            tag,
        ));
        h.storage.system.enqueue_tagged_status(&status, index, tag);
    }
    h.storage.system.enqueue_signal(&event);
    h.storage.system.submit();
    assert!(!event.wait(Duration::from_millis(20)));
    assert_eq!(status.get(0), Status::Pending);

    // cancellation doesn't wait for a paused worker
    h.storage.cancel_requests_with_tag(ferry_storage::TAG_MASK_ALL, 7);
    h.storage.system.resume();
    assert!(event.wait(TIMEOUT));
    assert_eq!(status.get(0), Status::Failed(RequestError::Cancelled));
    assert_eq!(status.get(1), Status::Complete);
    assert_eq!(h.storage.system.cancelled_count(), 1);
    assert_eq!(h.storage.gpu.cancelled_count(), 0);
}
