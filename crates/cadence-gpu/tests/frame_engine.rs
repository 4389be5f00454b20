//! End-to-end behaviour of the frame engine against the simulated device.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use cadence_core::{
    AntiAliasingSettings, ConfigError, DisplaySettings, EngineConfig, ManualClock,
    SettingsSnapshot, ShadowQuality, ShadowSettings, TextureSettings,
};
use cadence_gpu::{
    CoordinatorState, DeviceEvent, FenceValue, FrameEngine, GpuCommand, GpuError,
    HeadlessDevice,
};

fn start(config: EngineConfig) -> (Arc<HeadlessDevice>, FrameEngine<HeadlessDevice>) {
    start_on(Arc::new(HeadlessDevice::new().unwrap()), config)
}

fn start_on(
    device: Arc<HeadlessDevice>,
    config: EngineConfig,
) -> (Arc<HeadlessDevice>, FrameEngine<HeadlessDevice>) {
    let engine = FrameEngine::initialize(
        Arc::clone(&device),
        (),
        Arc::new(ManualClock::new()),
        config,
    )
    .unwrap();
    (device, engine)
}

fn frame(engine: &mut FrameEngine<HeadlessDevice>) {
    engine.render_frame().unwrap();
    engine.present_frame().unwrap();
}

fn textures_created(device: &HeadlessDevice) -> usize {
    device
        .events()
        .iter()
        .filter(|e| matches!(e, DeviceEvent::TextureCreated { .. }))
        .count()
}

#[test]
fn completed_fence_is_monotonic() {
    let (_device, mut engine) = start(EngineConfig::default().with_frames_in_flight(2));
    let mut previous = engine.completed_fence().unwrap();
    for _ in 0..10 {
        frame(&mut engine);
        let completed = engine.completed_fence().unwrap();
        assert!(completed >= previous);
        assert!(completed <= engine.last_signalled_fence());
        previous = completed;
    }
    engine.shutdown().unwrap();
    assert_eq!(
        engine.completed_fence().unwrap(),
        engine.last_signalled_fence()
    );
}

#[test]
fn slots_alternate_under_double_buffering() {
    let (device, mut engine) = start(EngineConfig::default());
    let mut indices = Vec::new();
    for _ in 0..6 {
        indices.push(engine.current_slot_index());
        frame(&mut engine);
    }
    assert_eq!(indices, vec![0, 1, 0, 1, 0, 1]);
    assert!(device.violations().is_empty());
}

#[test]
fn five_frames_at_1080p() {
    let config = EngineConfig::default()
        .with_size(1920, 1080)
        .with_buffer_count(2);
    let (device, mut engine) = start(config);
    let start_value = engine.last_signalled_fence();
    assert_eq!(engine.current_slot_index(), 0);

    for _ in 0..5 {
        frame(&mut engine);
    }

    assert_eq!(
        engine.last_signalled_fence(),
        FenceValue(start_value.get() + 5)
    );
    assert_eq!(engine.current_slot_index(), 1);
    assert_eq!(engine.viewport().width as u32, 1920);
    assert_eq!(engine.scissor().bottom, 1080);
    engine.shutdown().unwrap();
    assert_eq!(device.present_count(), 5);
    assert!(device.violations().is_empty());
}

#[test]
fn unchanged_settings_cause_no_gpu_work() {
    let (device, mut engine) = start(EngineConfig::default());
    frame(&mut engine);
    let fence = engine.last_signalled_fence();
    let created = textures_created(&device);

    let snapshot = *engine.settings();
    engine.apply_settings(snapshot).unwrap();
    engine.set_display_settings(snapshot.display).unwrap();
    engine.set_shadow_settings(snapshot.shadows).unwrap();

    assert_eq!(engine.last_signalled_fence(), fence);
    assert_eq!(textures_created(&device), created);
    assert_eq!(engine.state(), CoordinatorState::Steady);
}

#[test]
fn shadow_tier_change_rebuilds_only_the_shadow_map() {
    let config = EngineConfig::default().with_settings(SettingsSnapshot {
        shadows: ShadowSettings {
            quality: ShadowQuality::Low,
            ..Default::default()
        },
        ..Default::default()
    });
    let (device, mut engine) = start(config);
    assert_relative_eq!(engine.shadow_params().bias, 0.005);
    assert_eq!(engine.shadow_params().sample_count, 4);

    let depth = engine.resources().depth.resource().texture();
    let back_buffer = engine.current_back_buffer_view().unwrap();
    let shadow_generation = engine.resources().shadow_map.resource().generation();

    engine
        .set_shadow_settings(ShadowSettings {
            quality: ShadowQuality::Ultra,
            ..Default::default()
        })
        .unwrap();

    assert_relative_eq!(engine.shadow_params().bias, 0.0005);
    assert_eq!(engine.shadow_params().sample_count, 32);
    assert_eq!(engine.resources().depth.resource().texture(), depth);
    assert_eq!(engine.current_back_buffer_view().unwrap(), back_buffer);
    assert_eq!(
        engine.resources().shadow_map.resource().generation(),
        shadow_generation + 1
    );
    assert!(!device
        .events()
        .iter()
        .any(|e| matches!(e, DeviceEvent::SwapchainResized { .. })));
}

#[test]
fn resize_waits_for_slow_gpu_before_freeing() {
    let config = EngineConfig::default().with_frames_in_flight(2);
    let device = Arc::new(
        HeadlessDevice::builder()
            .gpu_latency(Duration::from_millis(5))
            .build()
            .unwrap(),
    );
    let (device, mut engine) = start_on(device, config);

    device.pause();
    frame(&mut engine);
    let in_flight = engine.last_signalled_fence();
    assert!(engine.completed_fence().unwrap() < in_flight);
    let mark = device.events().len();

    let resumer = {
        let device = Arc::clone(&device);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            device.resume();
        })
    };
    let started = Instant::now();
    engine
        .set_display_settings(DisplaySettings::with_size(1920, 1080))
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(40));
    resumer.join().unwrap();

    let events = device.events();
    let drain_value = in_flight.get() + 1;
    let drained_at = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::FenceCompleted { value, .. } if *value == drain_value))
        .unwrap();
    let destroyed: Vec<_> = events
        .iter()
        .enumerate()
        .skip(mark)
        .filter(|(_, e)| matches!(e, DeviceEvent::TextureDestroyed { .. }))
        .map(|(i, _)| i)
        .collect();
    assert!(!destroyed.is_empty());
    assert!(destroyed.iter().all(|&i| i > drained_at));
    assert!(device.violations().is_empty(), "{:?}", device.violations());
    assert_eq!(engine.current_slot_index(), 0);
    assert_eq!(engine.viewport().width as u32, 1920);
}

#[test]
fn device_loss_is_terminal() {
    let (device, mut engine) = start(EngineConfig::default());
    frame(&mut engine);
    device.lose_device();

    assert_eq!(engine.render_frame(), Err(GpuError::DeviceLost));
    assert_eq!(engine.state(), CoordinatorState::Failed);
    assert_eq!(engine.present_frame(), Err(GpuError::EngineFailed));
    assert_eq!(
        engine.set_display_settings(DisplaySettings::with_size(800, 600)),
        Err(GpuError::EngineFailed)
    );
    assert_eq!(engine.depth_stencil_view(), Err(GpuError::EngineFailed));
    assert!(engine.shutdown().is_ok());
}

#[test]
fn device_loss_during_settings_drain_is_terminal() {
    let (device, mut engine) = start(EngineConfig::default());
    device.pause();
    frame(&mut engine);

    let remover = {
        let device = Arc::clone(&device);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            device.lose_device();
        })
    };
    let result = engine.set_display_settings(DisplaySettings::with_size(1920, 1080));
    remover.join().unwrap();

    assert_eq!(result, Err(GpuError::DeviceLost));
    assert_eq!(engine.state(), CoordinatorState::Failed);
    assert_eq!(engine.render_frame(), Err(GpuError::EngineFailed));

    let mark = device.events().len();
    assert!(engine.shutdown().is_ok());
    assert_eq!(device.events().len(), mark);
    assert!(!device
        .events()
        .iter()
        .any(|e| matches!(e, DeviceEvent::TextureDestroyed { .. })));
}

#[test]
fn failed_rebuild_leaves_engine_failed() {
    let (device, mut engine) = start(EngineConfig::default());
    device.fail_next_texture_creation();

    let result = engine.set_shadow_settings(ShadowSettings {
        map_resolution: 4096,
        ..Default::default()
    });
    assert!(matches!(result, Err(GpuError::Device(_))));
    assert_eq!(engine.state(), CoordinatorState::Failed);
    assert_eq!(engine.render_frame(), Err(GpuError::EngineFailed));
}

#[test]
fn single_buffer_is_a_configuration_error() {
    let device = Arc::new(HeadlessDevice::new().unwrap());
    let result = FrameEngine::initialize(
        Arc::clone(&device),
        (),
        Arc::new(ManualClock::new()),
        EngineConfig::default().with_buffer_count(1),
    );
    assert!(matches!(result, Err(GpuError::Configuration(_))));
    assert!(device.events().is_empty());
}

#[test]
fn undersized_recording_capacity_is_a_configuration_error() {
    let device = Arc::new(HeadlessDevice::new().unwrap());
    let result = FrameEngine::initialize(
        Arc::clone(&device),
        (),
        Arc::new(ManualClock::new()),
        EngineConfig::default()
            .with_buffer_count(16)
            .with_max_commands_per_frame(16),
    );
    assert!(matches!(
        result,
        Err(GpuError::Configuration(ConfigError::RecordingCapacity {
            capacity: 16,
            min: 19
        }))
    ));
    assert!(device.events().is_empty());
}

#[test]
fn smallest_accepted_capacity_fits_msaa_frames() {
    let config = EngineConfig::default();
    let min = config.min_commands_per_frame();
    let (_device, mut engine) = start(config.with_max_commands_per_frame(min));
    engine
        .set_anti_aliasing_settings(AntiAliasingSettings::msaa(4))
        .unwrap();
    assert!(engine.sample_desc().is_multisampled());
    for _ in 0..3 {
        frame(&mut engine);
    }
    engine.shutdown().unwrap();
}

#[test]
fn resize_resets_slot_and_resources() {
    let (device, mut engine) = start(EngineConfig::default());
    frame(&mut engine);
    assert_eq!(engine.current_slot_index(), 1);
    let depth_generation = engine.resources().depth.resource().generation();

    engine
        .set_display_settings(DisplaySettings::with_size(800, 600))
        .unwrap();
    assert_eq!(engine.current_slot_index(), 0);
    assert_eq!(
        engine.resources().depth.resource().generation(),
        depth_generation + 1
    );
    let depth = device
        .texture_desc(engine.resources().depth.resource().texture().unwrap())
        .unwrap();
    assert_eq!((depth.width, depth.height), (800, 600));

    frame(&mut engine);
    engine.shutdown().unwrap();
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn vsync_changes_present_interval_only() {
    let (device, mut engine) = start(EngineConfig::default());
    let fence = engine.last_signalled_fence();
    let display = DisplaySettings {
        vsync: true,
        ..engine.settings().display
    };
    engine.set_display_settings(display).unwrap();
    assert_eq!(engine.last_signalled_fence(), fence);

    frame(&mut engine);
    engine.shutdown().unwrap();
    assert!(device.events().iter().any(|e| matches!(
        e,
        DeviceEvent::Presented {
            sync_interval: 1,
            ..
        }
    )));
}

#[test]
fn toggling_msaa_rebuilds_depth_and_target() {
    let (device, mut engine) = start(EngineConfig::default());
    engine
        .set_anti_aliasing_settings(AntiAliasingSettings::msaa(4))
        .unwrap();
    assert!(engine.resources().multisample.is_enabled());
    assert_eq!(engine.sample_desc().count, 4);
    let depth = device
        .texture_desc(engine.resources().depth.resource().texture().unwrap())
        .unwrap();
    assert_eq!(depth.samples.count, 4);

    frame(&mut engine);
    engine.shutdown().unwrap();
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn unsupported_msaa_keeps_single_sampling() {
    let device = Arc::new(
        HeadlessDevice::builder()
            .msaa_quality_levels(cadence_core::Format::Rgba8Unorm, 8, 0)
            .build()
            .unwrap(),
    );
    let (_device, mut engine) = start_on(device, EngineConfig::default());
    let fence = engine.last_signalled_fence();
    engine
        .set_anti_aliasing_settings(AntiAliasingSettings::msaa(8))
        .unwrap();
    assert!(!engine.resources().multisample.is_enabled());
    assert_eq!(engine.last_signalled_fence(), fence);
    assert_eq!(engine.settings().anti_aliasing.sample_count, 8);
}

#[test]
fn collaborator_draws_land_between_bind_and_present_transition() {
    let (device, mut engine) = start(EngineConfig::default());
    engine
        .render_frame_with(|recorder| {
            let targets = *recorder.targets();
            recorder.set_viewport(targets.viewport)?;
            recorder.draw(36, 4)
        })
        .unwrap();
    engine.present_frame().unwrap();
    engine.shutdown().unwrap();

    let commands = device.executed_commands().last().cloned().unwrap();
    let bind = commands
        .iter()
        .position(|c| matches!(c, GpuCommand::SetRenderTargets { .. }))
        .unwrap();
    let draw = commands
        .iter()
        .position(|c| matches!(c, GpuCommand::Draw { vertex_count: 36, instance_count: 4, .. }))
        .unwrap();
    assert!(bind < draw);
    assert!(matches!(
        commands.last(),
        Some(GpuCommand::Transition { .. })
    ));
}

#[test]
fn recording_overflow_abandons_only_the_frame() {
    let config = EngineConfig::default().with_max_commands_per_frame(12);
    let (_device, mut engine) = start(config);
    let result = engine.render_frame_with(|recorder| {
        for _ in 0..16 {
            recorder.draw(3, 1)?;
        }
        Ok(())
    });
    assert_eq!(result, Err(GpuError::RecordingFull { capacity: 12 }));
    assert_eq!(engine.state(), CoordinatorState::Steady);
    frame(&mut engine);
}

#[test]
fn filtering_level_selects_sampler() {
    let (device, mut engine) = start(EngineConfig::default());
    let before = engine.sampler().unwrap();
    engine
        .set_texture_settings(TextureSettings {
            filtering_level: 16,
            ..Default::default()
        })
        .unwrap();
    let after = engine.sampler().unwrap();
    assert_ne!(before, after);
    assert_eq!(
        device.sampler_desc(after).unwrap().filter,
        cadence_gpu::Filter::Anisotropic
    );
    assert!(device.sampler_desc(before).is_none());
}
