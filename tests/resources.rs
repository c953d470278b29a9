mod common;

use ash::vk;
use common::{harness, init_logging};
use hf_gpu::backend::HeadlessBackend;
use hf_gpu::pipeline::{ShaderDesc, VertexInput};
use hf_gpu::{
    Backend, BufferDesc, CommandListLevel, DescriptorSetLayout, Device, DeviceSettings, Format, GpuError,
    GraphicsPipelineDesc, PresentStatus, QueueKind, SamplerState, ShaderStage, TextureDesc,
};
use std::sync::Arc;

fn device_with(settings: DeviceSettings) -> (Arc<HeadlessBackend>, Device) {
    init_logging();
    let backend = Arc::new(HeadlessBackend::new());
    let device = Device::new(backend.clone(), settings).unwrap();
    (backend, device)
}

fn submit_empty(device: &Device, count: u32) -> Vec<hf_gpu::CommandList> {
    let mut lists = device
        .allocate_command_lists(QueueKind::Graphics, CommandListLevel::Primary, count)
        .unwrap();
    for list in lists.iter_mut() {
        list.begin().unwrap();
        list.end().unwrap();
        device
            .queue_submit(QueueKind::Graphics, &mut [list], &[], None)
            .unwrap();
    }
    lists
}

// --- Fence pool ---

#[test]
fn fence_pool_grows_by_its_batch_size() {
    let (backend, device) = device_with(DeviceSettings {
        fence_pool_size: 2,
        ..DeviceSettings::default()
    });
    assert_eq!(backend.counters().fences_created, 2);

    let lists = submit_empty(&device, 3);
    assert_eq!(backend.counters().fences_created, 4);
    assert_eq!(device.fence_pool_usage(), (1, 3));

    device.free_command_lists(lists).unwrap();
    backend.complete_all();
    device.wait_idle().unwrap();
    assert_eq!(device.fence_pool_usage(), (4, 0));
    assert!(backend.validation_errors().is_empty());
}

#[test]
fn reclaim_is_idempotent() {
    let (backend, device) = device_with(DeviceSettings::default());
    let lists = submit_empty(&device, 2);
    assert_eq!(device.fence_pool_usage(), (10, 2));

    device.wait_idle().unwrap();
    assert_eq!(device.fence_pool_usage(), (12, 0));
    device.wait_idle().unwrap();
    assert_eq!(device.fence_pool_usage(), (12, 0));
    assert_eq!(backend.counters().fences_created, 12);

    device.free_command_lists(lists).unwrap();
}

#[test]
fn rerecording_waits_for_the_previous_submission() {
    let (backend, device) = device_with(DeviceSettings::default());
    let mut lists = submit_empty(&device, 1);
    assert!(lists[0].finished_fence().is_some());

    lists[0].begin().unwrap();
    assert!(lists[0].finished_fence().is_none());
    lists[0].end().unwrap();
    device
        .queue_submit(QueueKind::Graphics, &mut [&mut lists[0]], &[], None)
        .unwrap();
    assert_eq!(backend.counters().fence_waits, 1);

    device.free_command_lists(lists).unwrap();
    assert!(backend.validation_errors().is_empty());
}

#[test]
fn failed_submit_on_a_reused_fence_leaves_the_earlier_list_usable() {
    let (backend, device) = device_with(DeviceSettings {
        fence_pool_size: 1,
        ..DeviceSettings::default()
    });
    let mut lists = submit_empty(&device, 1);
    backend.complete_all();

    let mut later = device
        .allocate_command_lists(QueueKind::Graphics, CommandListLevel::Primary, 1)
        .unwrap();
    later[0].begin().unwrap();
    later[0].end().unwrap();
    backend.fail_next_submit(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
    assert!(device
        .queue_submit(QueueKind::Graphics, &mut [&mut later[0]], &[], None)
        .is_err());

    lists[0].begin().unwrap();
    lists[0].end().unwrap();
    device
        .queue_submit(QueueKind::Graphics, &mut [&mut lists[0]], &[], None)
        .unwrap();

    device.wait_idle().unwrap();
    device.free_command_lists(lists).unwrap();
    device.free_command_lists(later).unwrap();
    assert!(backend.validation_errors().is_empty());
}

// --- Secondary lists ---

#[test]
fn secondaries_share_the_primary_fence_until_waited() {
    let (backend, device) = device_with(DeviceSettings::default());
    let mut secondaries = device
        .allocate_command_lists(QueueKind::Graphics, CommandListLevel::Secondary, 2)
        .unwrap();
    for secondary in secondaries.iter_mut() {
        secondary.begin().unwrap();
        secondary.end().unwrap();
    }

    let mut primary = device
        .allocate_command_list(QueueKind::Graphics, CommandListLevel::Primary)
        .unwrap();
    primary.begin().unwrap();
    for secondary in &secondaries {
        primary.execute_secondary(secondary).unwrap();
    }
    primary.end().unwrap();
    device
        .queue_submit(QueueKind::Graphics, &mut [&mut primary], &[], None)
        .unwrap();

    let fence = primary.finished_fence().unwrap();
    for secondary in &secondaries {
        assert_eq!(secondary.finished_fence(), Some(fence));
    }

    // Re-recording a secondary waits on the shared fence
    secondaries[0].begin().unwrap();
    assert!(secondaries[0].finished_fence().is_none());
    assert!(backend.fence_signaled(fence.raw()).unwrap());
    secondaries[0].end().unwrap();
    assert!(backend.validation_errors().is_empty());
}

#[test]
fn secondary_cannot_be_submitted_directly() {
    let (_backend, device) = device_with(DeviceSettings::default());
    let mut secondary = device
        .allocate_command_list(QueueKind::Graphics, CommandListLevel::Secondary)
        .unwrap();
    secondary.begin().unwrap();
    secondary.end().unwrap();
    assert!(matches!(
        device.queue_submit(QueueKind::Graphics, &mut [&mut secondary], &[], None),
        Err(GpuError::InvalidUsage(_))
    ));
}

// --- Descriptors ---

#[test]
fn descriptor_pools_roll_over_when_full() {
    let (backend, device) = device_with(DeviceSettings::default());
    backend.set_descriptor_pool_capacity(Some(2));
    let layout = DescriptorSetLayout::new().uniform_buffer(ShaderStage::Vertex, 0, 1);

    let sets: Vec<_> = (0..5)
        .map(|_| device.allocate_descriptor_set(&layout).unwrap())
        .collect();
    assert_eq!(backend.counters().descriptor_pools_created, 3);
    assert_eq!(backend.counters().descriptor_set_layouts_created, 1);
    drop(sets);

    // Reset recycles the pools instead of creating more
    device.reset_descriptor_pools().unwrap();
    for _ in 0..4 {
        device.allocate_descriptor_set(&layout).unwrap();
    }
    assert_eq!(backend.counters().descriptor_pools_created, 3);
}

#[test]
fn empty_fresh_pool_reports_exhaustion() {
    let (backend, device) = device_with(DeviceSettings::default());
    backend.set_descriptor_pool_capacity(Some(0));
    let layout = DescriptorSetLayout::new().texture_sampler(ShaderStage::Fragment, 0, 1);

    let err = device.allocate_descriptor_set(&layout).unwrap_err();
    assert!(matches!(err, GpuError::PoolExhausted));
    assert!(!err.is_fatal());
}

#[test]
fn descriptor_writes_reach_the_driver() {
    let (backend, device) = device_with(DeviceSettings::default());
    let layout = DescriptorSetLayout::new()
        .uniform_buffer(ShaderStage::Vertex, 0, 1)
        .texture_sampler(ShaderStage::Fragment, 1, 1);
    let mut set = device.allocate_descriptor_set(&layout).unwrap();

    let uniforms = device.create_buffer(&BufferDesc::uniform(256)).unwrap();
    let texture = device
        .create_texture(&TextureDesc::new_2d(Format::RGBA8Srgb, 16, 16))
        .unwrap();
    let sampler = device.get_sampler(&SamplerState::linear()).unwrap();

    set.bind_uniform_buffer(&uniforms, 0, 0, 0, None);
    set.bind_texture_sampler(&texture, sampler, 1, 0);
    assert_eq!(set.pending_writes().len(), 2);
    device.write_descriptor_set(&mut set);

    assert!(set.pending_writes().is_empty());
    assert_eq!(backend.descriptor_writes(set.raw()).len(), 2);

    device.destroy_buffer(uniforms);
    device.destroy_texture(texture);
}

// --- Caches ---

#[test]
fn pipelines_resolve_set_layouts_through_the_cache() {
    let (backend, device) = device_with(DeviceSettings::default());
    let layout = DescriptorSetLayout::new().uniform_buffer(ShaderStage::Vertex, 0, 1);
    let desc = GraphicsPipelineDesc {
        shaders: vec![
            ShaderDesc::new(ShaderStage::Vertex, vec![0; 4]),
            ShaderDesc::new(ShaderStage::Fragment, vec![0; 4]),
        ],
        vertex_layout: vec![VertexInput::new(0, 12).attribute(0, Format::RGB32F, 0)],
        set_layouts: vec![layout.clone()],
        colour_formats: vec![Format::BGRA8Srgb],
        ..GraphicsPipelineDesc::default()
    };

    let first = device.retrieve_graphics_pipeline(&desc).unwrap();
    let second = device.retrieve_graphics_pipeline(&desc).unwrap();
    device.allocate_descriptor_set(&layout).unwrap();

    let counters = backend.counters();
    assert_eq!(counters.pipelines_created, 2);
    assert_eq!(counters.descriptor_set_layouts_created, 1);

    device.destroy_graphics_pipeline(first);
    device.destroy_graphics_pipeline(second);
}

#[test]
fn sampler_anisotropy_is_clamped_and_cached() {
    let (backend, device) = device_with(DeviceSettings::default());
    let features = device.supported_features();
    assert!(features.sampler_anisotropy);
    assert_eq!(features.max_sampler_anisotropy, 16.0);

    let wild = SamplerState::linear().with_anisotropy(64.0);
    let a = device.get_sampler(&wild).unwrap();
    let b = device.get_sampler(&wild).unwrap();
    assert_eq!(a, b);
    assert_eq!(backend.counters().samplers_created, 1);
}

// --- Single-use submission ---

#[test]
fn signaled_single_use_list_is_freed_after_completion() {
    let (backend, device) = device_with(DeviceSettings::default());
    let semaphore = device.create_semaphore().unwrap();
    let texture = device
        .create_texture(&TextureDesc::new_2d(Format::RGBA8U, 8, 8))
        .unwrap();

    let slot = device
        .execute_single_usage_command_list(
            QueueKind::Graphics,
            |cmd| cmd.resource_barrier(&texture, hf_gpu::ImageLayout::TransferDst),
            Some(&semaphore),
        )
        .unwrap();
    assert_eq!(backend.counters().queue_wait_idle, 0);
    assert!(backend.semaphore_signaled(semaphore.raw()));

    let live_before = backend.live_objects();
    device.wait_for(&slot).unwrap();
    device.wait_idle().unwrap();
    assert_eq!(backend.live_objects(), live_before - 1);

    device.destroy_semaphore(semaphore);
    device.destroy_texture(texture);
}

// --- Staging uploads through the renderer ---

#[test]
fn device_local_upload_lands_after_end_frame() {
    let mut h = harness();
    let id = h.renderer.create_buffer(&BufferDesc::vertex(64)).unwrap();
    let data: Vec<u8> = (0..64).collect();

    h.renderer.upload_buffer(id, 0, &data).unwrap();
    let uploader = h.renderer.uploader();
    assert_eq!(uploader.pending_copies(), 1);
    assert_eq!(uploader.pending_bytes(), 64);

    assert_eq!(h.run_frame(), Some(PresentStatus::Presented));
    assert_eq!(uploader.pending_copies(), 0);
    // Staging flush plus the frame itself
    assert_eq!(h.backend.counters().submits, 2);

    h.renderer.wait_idle().unwrap();
    let raw = h.renderer.buffer(id).unwrap().raw();
    assert_eq!(h.backend.buffer_contents(raw).unwrap(), data);
    h.assert_clean();
}

#[test]
fn uploads_in_consecutive_frames_reuse_the_staging_buffer() {
    let mut h = harness();
    let id = h.renderer.create_buffer(&BufferDesc::index(16)).unwrap();

    for round in 0u8..4 {
        h.renderer.upload_buffer(id, 0, &[round; 16]).unwrap();
        h.run_frame().unwrap();
    }
    h.renderer.wait_idle().unwrap();
    let raw = h.renderer.buffer(id).unwrap().raw();
    assert_eq!(h.backend.buffer_contents(raw).unwrap(), vec![3u8; 16]);
    h.assert_clean();
}

#[test]
fn host_visible_buffers_are_written_in_place() {
    let mut h = harness();
    let id = h.renderer.create_buffer(&BufferDesc::uniform(8)).unwrap();
    h.renderer.upload_buffer(id, 4, &[9, 9, 9, 9]).unwrap();

    assert_eq!(h.renderer.uploader().pending_copies(), 0);
    let raw = h.renderer.buffer(id).unwrap().raw();
    assert_eq!(h.backend.buffer_contents(raw).unwrap(), vec![0, 0, 0, 0, 9, 9, 9, 9]);
}

#[test]
fn out_of_range_uploads_are_rejected() {
    let mut h = harness();
    let id = h.renderer.create_buffer(&BufferDesc::vertex(16)).unwrap();
    assert!(matches!(
        h.renderer.upload_buffer(id, 8, &[0; 16]),
        Err(GpuError::InvalidUsage(_))
    ));
}

#[test]
fn destroyed_buffer_handle_goes_stale() {
    let mut h = harness();
    let id = h.renderer.create_buffer(&BufferDesc::vertex(32)).unwrap();
    h.renderer.upload_buffer(id, 0, &[1; 32]).unwrap();
    h.renderer.destroy_buffer(id).unwrap();

    assert!(h.renderer.buffer(id).is_none());
    assert!(h.renderer.upload_buffer(id, 0, &[1; 4]).is_err());
    assert!(h.renderer.destroy_buffer(id).is_err());

    // Slot is reused under a new generation
    let fresh = h.renderer.create_buffer(&BufferDesc::vertex(32)).unwrap();
    assert_ne!(fresh, id);
    assert!(h.renderer.buffer(id).is_none());

    // The discarded copy never reaches the queue
    h.run_frame().unwrap();
    h.renderer.wait_idle().unwrap();
    h.assert_clean();
}

#[test]
fn uploads_from_several_threads_all_land() {
    let mut h = harness();
    let ids: Vec<_> = (0..4)
        .map(|_| h.renderer.create_buffer(&BufferDesc::vertex(128)).unwrap())
        .collect();
    let buffers: Vec<_> = ids
        .iter()
        .map(|id| h.renderer.buffer(*id).unwrap().clone())
        .collect();
    let uploader = h.renderer.uploader();

    let workers: Vec<_> = buffers
        .into_iter()
        .enumerate()
        .map(|(i, buffer)| {
            let uploader = uploader.clone();
            std::thread::spawn(move || uploader.upload(&buffer, 0, &[i as u8 + 1; 128]).unwrap())
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(uploader.pending_copies(), 4);

    h.run_frame().unwrap();
    h.renderer.wait_idle().unwrap();
    for (i, id) in ids.iter().enumerate() {
        let raw = h.renderer.buffer(*id).unwrap().raw();
        assert_eq!(h.backend.buffer_contents(raw).unwrap(), vec![i as u8 + 1; 128]);
    }
    h.assert_clean();
}

// --- Teardown ---

#[test]
fn renderer_destroy_releases_every_driver_object() {
    let mut h = harness();
    let id = h.renderer.create_buffer(&BufferDesc::vertex(64)).unwrap();
    h.renderer.upload_buffer(id, 0, &[7; 64]).unwrap();
    h.renderer.create_buffer(&BufferDesc::uniform(64)).unwrap();
    for _ in 0..5 {
        h.run_frame().unwrap();
    }
    h.window.resize(1024, 768);
    h.run_frame().unwrap();

    h.renderer.destroy().unwrap();
    assert_eq!(h.backend.live_objects(), 0);
    // Second destroy is a no-op
    h.renderer.destroy().unwrap();
    h.assert_clean();
}
