use ferry_format::{
    ContainerWriter, CpuMetadata, GraphNode, MaterialTextures, MeshRecord, ModelData, TextureData,
    UNSET_TEXTURE,
};
use ferry_graphics as gpu;
use ferry_render::{
    DefaultTextures, DrawMode, HubDesc, LoadError, LoadPhase, Model, ModelContext, ModelHub,
};
use ferry_storage::{
    Codec, CompressionFormat, Destination, HostBuffer, Request, Source, Storage, StorageDesc,
};
use rand::{Rng as _, RngCore as _, SeedableRng as _};
use std::{
    io::{Seek as _, SeekFrom, Write as _},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    _worker: choir::WorkerHandle,
    gpu: Arc<gpu::Context>,
    context: ModelContext,
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
    let defaults = DefaultTextures::new(&gpu).unwrap();
    let context = ModelContext {
        gpu: Arc::clone(&gpu),
        storage: Arc::new(storage),
        defaults: Arc::new(defaults),
    };
    Harness {
        _worker: worker,
        gpu,
        context,
    }
}

fn translation(x: f32, y: f32, z: f32) -> [[f32; 4]; 4] {
    let mut matrix = GraphNode::IDENTITY;
    matrix[3] = [x, y, z, 1.0];
    matrix
}

/// Two textures, one of them noise that can't be compressed,
/// a material using both, and a single opaque triangle.
fn sample_model() -> ModelData {
    let smooth_desc = gpu::ResourceDesc::texture_2d(gpu::TextureFormat::Rgba8Unorm, 64, 64, 1);
    let smooth = TextureData::from_mips("smooth", smooth_desc, &[vec![0x7Fu8; 64 * 64 * 4]]).unwrap();
    // rows fill the whole pitch, so there is no padding to compress
    let mut noise = vec![0u8; 64 * 64 * 4];
    rand::rngs::StdRng::seed_from_u64(7).fill_bytes(&mut noise);
    let noise = TextureData::from_mips("noise", smooth_desc, &[noise]).unwrap();

    let mut geometry = vec![0u8; 64];
    geometry[48..60].copy_from_slice(bytemuck::cast_slice(&[0u32, 1, 2]));

    ModelData {
        textures: vec![smooth, noise],
        geometry,
        meshes: vec![MeshRecord {
            vb_offset: 0,
            vb_size: 36,
            ib_offset: 48,
            ib_size: 12,
            vb_stride: 12,
            mesh_constant_index: 0,
            material_index: 0,
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
        material_constants: Vec::new(),
        aabb_min: [-1.0; 3],
        aabb_max: [1.0; 3],
    }
}

fn write_container(model: &ModelData, compression: CompressionFormat) -> tempfile::NamedTempFile {
    let codec = Codec::new(1).unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    ContainerWriter::new(&codec, compression)
        .write(model, file.as_file_mut())
        .unwrap();
    file.flush().unwrap();
    file
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > TIMEOUT {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

fn load(harness: &Harness, name: &str, file: &tempfile::NamedTempFile) -> Arc<Model> {
    let model = Model::new(&harness.context, name);
    model.request_load(file.path()).unwrap();
    assert!(
        wait_until(|| model.is_rendering_prepared() || model.is_failed()),
        "model '{}' is stuck in {:?}",
        name,
        model.phase()
    );
    assert_eq!(model.failure(), None);
    model
}

fn count_draws(commands: &[gpu::Command]) -> usize {
    commands
        .iter()
        .filter(|command| matches!(command, gpu::Command::DrawIndexed { .. }))
        .count()
}

fn texture_view(gpu: &gpu::Context, table: gpu::DescriptorHandle, index: u32) -> gpu::Resource {
    match gpu.descriptor(table, index) {
        Some(gpu::Descriptor::TextureView { resource, .. }) => resource,
        other => panic!("slot {} holds {:?}", index, other),
    }
}

#[test]
fn load_and_draw() {
    let harness = harness();
    let container = write_container(&sample_model(), CompressionFormat::Tiled);
    let model = load(&harness, "sample", &container);
    assert!(model.is_finish_loading());
    assert_eq!(model.phase(), LoadPhase::Ready);

    let size = model.data_size();
    assert!(size.texture > 0 && size.buffer > 0);
    assert!(size.compressed < size.uncompressed);

    let mut encoder = harness.gpu.create_command_encoder(gpu::CommandEncoderDesc { name: "draw" });
    for (mode, expected) in [
        (DrawMode::Opaque, 1),
        (DrawMode::Mask, 0),
        (DrawMode::Blend, 0),
    ] {
        encoder.start();
        let count = model.draw(&mut encoder.render(), mode);
        assert_eq!(count, expected);
        assert_eq!(count_draws(encoder.commands()), expected as usize);
    }

    encoder.start();
    model.draw(&mut encoder.render(), DrawMode::Opaque);
    assert!(encoder.commands().contains(&gpu::Command::DrawIndexed {
        index_count: 3,
        instance_count: 1,
        first_index: 0,
        base_vertex: 0,
    }));

    let table = model.material_table(0).unwrap();
    let defaults = &harness.context.defaults;
    let base_color = texture_view(&harness.gpu, table, 0);
    let metallic_roughness = texture_view(&harness.gpu, table, 1);
    assert_ne!(base_color, defaults.white_texture());
    assert_ne!(base_color, metallic_roughness);
    assert_eq!(texture_view(&harness.gpu, table, 2), defaults.flat_normal_texture());
    assert_eq!(texture_view(&harness.gpu, table, 3), defaults.white_texture());

    // the noise texture landed intact, although it was stored raw
    let noise = sample_model().textures.remove(1);
    let streamed = harness.gpu.read_subresource(metallic_roughness, 0).unwrap();
    assert_eq!(streamed, noise.data);
    harness.gpu.destroy_command_encoder(&mut encoder);
}

#[test]
fn unset_slots_use_defaults() {
    let harness = harness();
    let mut data = sample_model();
    data.material_textures[0].texture_indices = [UNSET_TEXTURE; 4];
    // refers past the textures of the model
    data.material_textures.push(MaterialTextures {
        texture_indices: [5, UNSET_TEXTURE, UNSET_TEXTURE, UNSET_TEXTURE],
        address_modes: 0,
    });
    let container = write_container(&data, CompressionFormat::None);
    let model = load(&harness, "fallback", &container);

    let defaults = &harness.context.defaults;
    for material in 0..2 {
        let table = model.material_table(material).unwrap();
        for (slot, expected) in [
            defaults.white_texture(),
            defaults.white_texture(),
            defaults.flat_normal_texture(),
            defaults.white_texture(),
        ]
        .into_iter()
        .enumerate()
        {
            assert_eq!(texture_view(&harness.gpu, table, slot as u32), expected);
        }
    }
}

#[test]
fn scene_chain() {
    let harness = harness();
    let mut data = sample_model();
    let a = GraphNode {
        local: translation(0.0, 1.0, 0.0),
        parent_index: 0,
        matrix_index: 1,
        name_index: 1,
        ..GraphNode::root()
    };
    let b = GraphNode {
        local: translation(0.0, 0.0, 1.0),
        parent_index: 1,
        matrix_index: 2,
        name_index: 2,
        ..GraphNode::root()
    };
    data.scene_graph = vec![
        GraphNode {
            local: translation(1.0, 0.0, 0.0),
            ..GraphNode::root()
        },
        a,
        b,
    ];
    data.node_names = vec!["root".to_string(), "a".to_string(), "b".to_string()];
    data.meshes[0].mesh_constant_index = 2;
    let container = write_container(&data, CompressionFormat::Tiled);
    let model = load(&harness, "chain", &container);

    model.update_matrices(glam::Mat4::IDENTITY.into());
    let world = glam::Mat4::from(model.node_world(2).unwrap());
    assert_eq!(world.transform_point3(glam::Vec3::ZERO), glam::Vec3::ONE);

    let mut encoder = harness.gpu.create_command_encoder(gpu::CommandEncoderDesc { name: "matrices" });
    encoder.start();
    model.submit_matrices(&mut encoder.transfer());
    let _ = harness.gpu.submit(&mut encoder);
    let constants = model.mesh_constants().unwrap();
    let bytes = harness.gpu.read_buffer(constants, 2 * 256, 64).unwrap();
    let rows: &[f32] = bytemuck::cast_slice(&bytes);
    assert_eq!([rows[3], rows[7], rows[11]], [1.0, 1.0, 1.0]);
}

#[test]
fn callback_fires_once() {
    let harness = harness();
    let container = write_container(&sample_model(), CompressionFormat::Tiled);
    let counter = Arc::new(AtomicUsize::new(0));
    let models = (0..8)
        .map(|index| {
            let model = Model::new(&harness.context, &format!("model{}", index));
            let counter = Arc::clone(&counter);
            model.set_loading_complete_callback(move |model| {
                assert!(model.is_finish_loading());
                assert!(!model.is_rendering_prepared());
                counter.fetch_add(1, Ordering::SeqCst);
            });
            model.request_load(container.path()).unwrap();
            model
        })
        .collect::<Vec<_>>();
    assert!(wait_until(|| models.iter().all(|model| model.is_rendering_prepared())));
    harness.context.storage.wait_idle();
    assert_eq!(counter.load(Ordering::SeqCst), models.len());
}

#[test]
fn load_requests_are_checked() {
    let harness = harness();
    let model = Model::new(&harness.context, "missing");
    assert!(matches!(
        model.request_load(std::path::Path::new("does/not/exist.pak")),
        Err(LoadError::Storage(_))
    ));
    assert_eq!(model.phase(), LoadPhase::Unstarted);

    let container = write_container(&sample_model(), CompressionFormat::None);
    let model = load(&harness, "twice", &container);
    assert!(matches!(
        model.request_load(container.path()),
        Err(LoadError::AlreadyStarted)
    ));
    assert!(matches!(
        model.request_load_header_only(container.path()),
        Err(LoadError::AlreadyStarted)
    ));
    let (min, max) = model.aabb().unwrap();
    assert_eq!((min.x, max.z), (-1.0, 1.0));
}

#[test]
fn bad_version_fails() {
    let harness = harness();
    let mut container = write_container(&sample_model(), CompressionFormat::Tiled);
    let file = container.as_file_mut();
    file.seek(SeekFrom::Start(4)).unwrap();
    file.write_all(&0xFFFFu16.to_le_bytes()).unwrap();
    file.flush().unwrap();

    let model = Model::new(&harness.context, "bad");
    model.request_load(container.path()).unwrap();
    assert!(wait_until(|| model.is_failed()));
    harness.context.storage.wait_idle();
    assert!(!model.is_finish_loading());
    assert!(!model.is_rendering_prepared());
    assert!(model.failure().unwrap().contains("version"));

    let mut encoder = harness.gpu.create_command_encoder(gpu::CommandEncoderDesc { name: "skip" });
    encoder.start();
    assert_eq!(model.draw(&mut encoder.render(), DrawMode::Opaque), 0);
    assert!(encoder.commands().is_empty());
}

#[test]
fn corrupt_texture_fails_the_load() {
    let harness = harness();
    let mut container = write_container(&sample_model(), CompressionFormat::Tiled);
    let file = container.as_file_mut();
    let header = ferry_format::read_header(file).unwrap();
    let region =
        ferry_format::read_region(file, &header.cpu_metadata, harness.context.storage.codec())
            .unwrap();
    let mips = CpuMetadata::fixup(region).unwrap().textures()[0].mips;
    assert_eq!(mips.compression_format().unwrap(), CompressionFormat::Tiled);
    // total size declared by the tiled stream
    file.seek(SeekFrom::Start(mips.data.get() + 8)).unwrap();
    file.write_all(&u64::MAX.to_le_bytes()).unwrap();
    file.flush().unwrap();
    let healthy = write_container(&sample_model(), CompressionFormat::None);

    let model = Model::new(&harness.context, "corrupt");
    let neighbor = Model::new(&harness.context, "neighbor");
    model.request_load(container.path()).unwrap();
    neighbor.request_load(healthy.path()).unwrap();
    assert!(wait_until(|| model.is_failed()));
    assert!(wait_until(|| neighbor.is_rendering_prepared()));
    harness.context.storage.wait_idle();

    assert!(!model.is_finish_loading());
    assert!(!model.is_rendering_prepared());
    assert!(model.failure().unwrap().contains("declared"));
    assert_eq!(neighbor.failure(), None);
    let mut encoder = harness.gpu.create_command_encoder(gpu::CommandEncoderDesc { name: "corrupt" });
    encoder.start();
    assert_eq!(model.draw(&mut encoder.render(), DrawMode::Opaque), 0);
    assert_eq!(neighbor.draw(&mut encoder.render(), DrawMode::Opaque), 1);
}

#[test]
fn failures_of_other_requests_stay_theirs() {
    let harness = harness();
    let container = write_container(&sample_model(), CompressionFormat::Tiled);
    let storage = &harness.context.storage;
    let file = storage.open_file(container.path()).unwrap();
    // submitted in the same batch as the header read of the model
    storage.system.enqueue_read(Request {
        name: "unrelated".to_string(),
        source: Source {
            file: file.clone(),
            offset: file.len() - 4,
            size: 16,
        },
        compression: CompressionFormat::None,
        uncompressed_size: 16,
        destination: Destination::Memory {
            buffer: Arc::new(Mutex::new(HostBuffer::new(16))),
            offset: 0,
        },
        tag: 999,
    });
    let model = load(&harness, "bystander", &container);
    assert_eq!(model.phase(), LoadPhase::Ready);
}

#[test]
fn prefetch_matches_async_allocation() {
    let harness = harness();
    let container = write_container(&sample_model(), CompressionFormat::Tiled);
    let baseline = harness.gpu.allocated_memory();

    let plain = load(&harness, "plain", &container);
    let plain_memory = harness.gpu.allocated_memory() - baseline;
    let plain_size = plain.data_size();
    drop(plain);
    assert!(wait_until(|| harness.gpu.allocated_memory() == baseline));

    let model = Model::new(&harness.context, "prefetched");
    model.request_load_header_only(container.path()).unwrap();
    assert_eq!(model.phase(), LoadPhase::Unstarted);
    assert!(harness.gpu.allocated_memory() > baseline);
    model.request_load(container.path()).unwrap();
    assert!(wait_until(|| model.is_rendering_prepared()));
    assert_eq!(harness.gpu.allocated_memory() - baseline, plain_memory);
    assert_eq!(model.data_size(), plain_size);
}

#[test]
fn random_teardown() {
    let harness = harness();
    let container = write_container(&sample_model(), CompressionFormat::Tiled);
    let baseline = harness.gpu.allocated_memory();
    let mut rng = rand::rngs::StdRng::seed_from_u64(1);
    for iteration in 0..100 {
        let model = Model::new(&harness.context, &format!("teardown{}", iteration));
        model.request_load(container.path()).unwrap();
        let delay = rng.gen_range(0..400);
        thread::sleep(Duration::from_micros(delay));
        drop(model);
    }
    harness.context.storage.wait_idle();
    assert!(wait_until(|| harness.gpu.allocated_memory() == baseline));
}

#[test]
fn hub() {
    let _ = env_logger::try_init();
    let choir = choir::Choir::new();
    let _worker = choir.add_worker("hub");
    let gpu = Arc::new(gpu::Context::new(gpu::ContextDesc::default()));
    let mut hub = ModelHub::new(
        &HubDesc {
            prefetch: true,
            ..Default::default()
        },
        &gpu,
        &choir,
    )
    .unwrap();
    let containers = [
        write_container(&sample_model(), CompressionFormat::Tiled),
        write_container(&sample_model(), CompressionFormat::None),
    ];
    for container in containers.iter() {
        hub.load(container.path()).unwrap();
    }
    assert_eq!(hub.model_count(), 2);
    assert!(wait_until(|| hub.is_load_finished()));
    assert!(wait_until(|| hub.completed_count() == 2));
    assert_eq!(hub.prepared_count(), 2);

    let total = hub.data_size();
    assert_eq!(total.texture, 2 * hub.models()[0].data_size().texture);

    let mut encoder = gpu.create_command_encoder(gpu::CommandEncoderDesc { name: "hub" });
    encoder.start();
    assert_eq!(hub.draw(&mut encoder.render(), DrawMode::Opaque), 2);
    hub.destroy();
    assert_eq!(hub.model_count(), 0);
}
