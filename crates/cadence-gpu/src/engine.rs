//! The frame engine.
//!
//! [`FrameEngine`] owns every component and drives them through the
//! render/present loop and through settings changes. All methods are called
//! from the one submission thread.

use std::sync::Arc;

use cadence_core::{
    AntiAliasingSettings, ClockSource, DisplaySettings, EngineConfig, FrameStats,
    FrameStatsAccumulator, SampleDesc, SettingsSnapshot, ShadowParams, ShadowSettings,
    TextureSettings,
};
use tracing::{debug, info, trace, warn};

use crate::command::CommandChannel;
use crate::coordinator::{
    CoordinatorState, PlanContext, RebuildPlan, SettingsCoordinator, SettingsDelta,
};
use crate::device::{
    AdapterInfo, GpuDevice, ResourceState, SamplerId, ScissorRect, SwapchainDesc, TextureId,
    ViewId, Viewport,
};
use crate::error::{GpuError, Result};
use crate::resources::{
    probe_sample_desc, DepthBuffer, DependentResourceSet, MultisampleTarget,
};
use crate::swapchain::PresentationSurface;
use crate::sync::{FenceSynchronizer, FenceValue};

/// Views and state a frame is recorded against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTargets {
    /// Where the frame renders: the multisample target with MSAA, else the
    /// back buffer.
    pub render_target: ViewId,
    pub back_buffer: ViewId,
    pub depth_stencil: ViewId,
    pub shadow_map: Option<ViewId>,
    pub sampler: Option<SamplerId>,
    pub viewport: Viewport,
    pub scissor: ScissorRect,
}

/// Recording access handed to collaborators during
/// [`FrameEngine::render_frame_with`].
///
/// Targets are already cleared and bound when the callback runs.
pub struct FrameRecorder<'a, D: GpuDevice> {
    channel: &'a mut CommandChannel<D>,
    targets: FrameTargets,
}

impl<D: GpuDevice> FrameRecorder<'_, D> {
    pub const fn targets(&self) -> &FrameTargets {
        &self.targets
    }

    pub fn transition(
        &mut self,
        texture: TextureId,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()> {
        self.channel.transition(texture, before, after)
    }

    pub fn clear_render_target(&mut self, view: ViewId, color: [f32; 4]) -> Result<()> {
        self.channel.clear_render_target(view, color)
    }

    pub fn clear_depth_stencil(&mut self, view: ViewId, depth: f32, stencil: u8) -> Result<()> {
        self.channel.clear_depth_stencil(view, depth, stencil)
    }

    pub fn set_render_targets(&mut self, color: Option<ViewId>, depth: Option<ViewId>) -> Result<()> {
        self.channel.set_render_targets(color, depth)
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        self.channel.set_viewport(viewport)
    }

    pub fn set_scissor(&mut self, scissor: ScissorRect) -> Result<()> {
        self.channel.set_scissor(scissor)
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> Result<()> {
        self.channel.draw(vertex_count, instance_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramePhase {
    Ready,
    Rendered,
}

/// Frame synchronization and resource lifecycle engine.
pub struct FrameEngine<D: GpuDevice> {
    // Field order is drop order: most dependent first.
    resources: DependentResourceSet<D>,
    surface: PresentationSurface<D>,
    channel: CommandChannel<D>,
    fence: FenceSynchronizer<D>,
    coordinator: SettingsCoordinator,
    device: Arc<D>,
    output: D::Output,
    clock: Arc<dyn ClockSource>,
    config: EngineConfig,
    adapter: AdapterInfo,
    sample_desc: SampleDesc,
    viewport: Viewport,
    scissor: ScissorRect,
    stats: FrameStatsAccumulator,
    phase: FramePhase,
    shut_down: bool,
}

impl<D: GpuDevice> FrameEngine<D> {
    /// Build every component and apply `config.settings`.
    ///
    /// Configuration is validated before any device call.
    pub fn initialize(
        device: Arc<D>,
        output: D::Output,
        clock: Arc<dyn ClockSource>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        PresentationSurface::<D>::validate_desc(&swapchain_desc(&config, &config.settings))?;

        let adapter = device.info();
        info!(
            adapter = %adapter.name,
            backend = adapter.backend,
            buffers = config.buffer_count,
            frames_in_flight = config.frames_in_flight,
            "Initializing frame engine"
        );

        let fence = FenceSynchronizer::new(Arc::clone(&device), config.fence_stall_warning())?;
        let channel = CommandChannel::new(
            Arc::clone(&device),
            config.frames_in_flight,
            config.max_commands_per_frame,
        )?;
        let surface = PresentationSurface::new(Arc::clone(&device));
        let resources = DependentResourceSet::new(&device);
        let settings = config.settings;
        let initial = settings.display;

        let mut engine = Self {
            resources,
            surface,
            channel,
            fence,
            coordinator: SettingsCoordinator::new(settings),
            device,
            output,
            clock,
            config,
            adapter,
            sample_desc: SampleDesc::SINGLE,
            viewport: Viewport::full(initial.width, initial.height),
            scissor: ScissorRect::full(initial.width, initial.height),
            stats: FrameStatsAccumulator::new(),
            phase: FramePhase::Ready,
            shut_down: false,
        };

        let sample_desc = engine.probe(&settings)?;
        engine.run_change(settings, RebuildPlan::ALL, sample_desc)?;
        info!(
            width = initial.width,
            height = initial.height,
            samples = engine.sample_desc.count,
            "Frame engine ready"
        );
        Ok(engine)
    }

    pub fn set_display_settings(&mut self, display: DisplaySettings) -> Result<()> {
        let mut request = *self.coordinator.snapshot();
        request.display = display;
        self.apply_settings(request)
    }

    pub fn set_anti_aliasing_settings(&mut self, anti_aliasing: AntiAliasingSettings) -> Result<()> {
        let mut request = *self.coordinator.snapshot();
        request.anti_aliasing = anti_aliasing;
        self.apply_settings(request)
    }

    pub fn set_shadow_settings(&mut self, shadows: ShadowSettings) -> Result<()> {
        let mut request = *self.coordinator.snapshot();
        request.shadows = shadows;
        self.apply_settings(request)
    }

    pub fn set_texture_settings(&mut self, textures: TextureSettings) -> Result<()> {
        let mut request = *self.coordinator.snapshot();
        request.textures = textures;
        self.apply_settings(request)
    }

    /// Apply a full settings snapshot.
    ///
    /// Only components whose inputs changed are rebuilt. A request that
    /// rebuilds nothing does not touch the GPU.
    pub fn apply_settings(&mut self, request: SettingsSnapshot) -> Result<()> {
        self.coordinator.ensure_usable()?;
        if self.phase == FramePhase::Rendered {
            return Err(GpuError::invalid_state(
                "settings changed between render_frame and present_frame",
            ));
        }
        request.validate()?;
        PresentationSurface::<D>::validate_desc(&swapchain_desc(&self.config, &request))?;

        let delta = SettingsDelta::between(self.coordinator.snapshot(), &request);
        if delta.is_empty() {
            trace!("Settings unchanged");
            return Ok(());
        }

        let sample_desc = self.probe(&request)?;
        let plan = delta.plan(PlanContext {
            multisample_enabled: sample_desc.is_multisampled(),
            sample_desc_changed: sample_desc != self.sample_desc,
            vsync_requires_swapchain_rebuild: self.adapter.vsync_requires_swapchain_rebuild,
        });
        self.run_change(request, plan, sample_desc)
    }

    /// Record and submit the frame with no collaborator draws.
    pub fn render_frame(&mut self) -> Result<FenceValue> {
        self.render_frame_with(|_| Ok(()))
    }

    /// Record and submit a frame.
    ///
    /// `record` runs after the targets are cleared and bound, and before the
    /// back buffer is returned to the presentation state.
    pub fn render_frame_with<F>(&mut self, record: F) -> Result<FenceValue>
    where
        F: FnOnce(&mut FrameRecorder<'_, D>) -> Result<()>,
    {
        self.coordinator.ensure_usable()?;
        if self.phase == FramePhase::Rendered {
            return Err(GpuError::invalid_state(
                "render_frame called twice without present_frame",
            ));
        }
        let result = self.record_frame(record);
        if result.is_err() {
            self.channel.abandon();
        }
        let value = self.observe(result)?;
        self.phase = FramePhase::Rendered;
        Ok(value)
    }

    /// Present the rendered frame, advance the slot and bound the CPU to
    /// the configured number of frames in flight.
    pub fn present_frame(&mut self) -> Result<()> {
        self.coordinator.ensure_usable()?;
        if self.phase != FramePhase::Rendered {
            return Err(GpuError::invalid_state(
                "present_frame called without a rendered frame",
            ));
        }
        self.phase = FramePhase::Ready;

        let sync_interval = self.coordinator.snapshot().display.sync_interval();
        let result = self.surface.present_current(sync_interval);
        self.observe(result)?;

        if let Some(guard) = self.channel.reuse_guard() {
            let result = self.fence.wait_for_value(guard);
            self.observe(result)?;
        }

        if let Some(stats) = self.stats.record_frame(self.clock.total_time()) {
            debug!(
                fps = stats.fps,
                ms_per_frame = stats.ms_per_frame,
                "Frame statistics"
            );
        }
        Ok(())
    }

    /// Averages from the last closed one-second window.
    pub const fn frame_stats(&self) -> FrameStats {
        self.stats.latest()
    }

    /// Render target for the current frame: the multisample target with
    /// MSAA, else the current back buffer.
    pub fn current_render_target_view(&self) -> Result<ViewId> {
        self.coordinator.ensure_usable()?;
        if self.resources.multisample.is_enabled() {
            self.resources.multisample.view()
        } else {
            self.current_back_buffer_view()
        }
    }

    pub fn current_back_buffer_view(&self) -> Result<ViewId> {
        self.coordinator.ensure_usable()?;
        Ok(self.surface.current_slot()?.view)
    }

    pub fn depth_stencil_view(&self) -> Result<ViewId> {
        self.coordinator.ensure_usable()?;
        self.resources.depth.view()
    }

    pub fn shadow_map_view(&self) -> Result<ViewId> {
        self.coordinator.ensure_usable()?;
        self.resources.shadow_map.view()
    }

    pub fn sampler(&self) -> Result<SamplerId> {
        self.coordinator.ensure_usable()?;
        self.resources.sampler.sampler()
    }

    pub const fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub const fn scissor(&self) -> ScissorRect {
        self.scissor
    }

    /// Last applied settings.
    pub const fn settings(&self) -> &SettingsSnapshot {
        self.coordinator.snapshot()
    }

    pub const fn state(&self) -> CoordinatorState {
        self.coordinator.state()
    }

    pub const fn shadow_params(&self) -> ShadowParams {
        self.resources.shadow_map.params()
    }

    pub const fn soft_shadows(&self) -> bool {
        self.resources.shadow_map.soft_shadows()
    }

    /// Scale applied to texture resolution at load time.
    pub const fn texture_resolution_scale(&self) -> f32 {
        self.resources.sampler.resolution_scale()
    }

    pub const fn mipmapping(&self) -> bool {
        self.resources.sampler.mipmapping()
    }

    /// Effective multisampling, after probing.
    pub const fn sample_desc(&self) -> SampleDesc {
        self.sample_desc
    }

    pub const fn current_slot_index(&self) -> u32 {
        self.surface.current_index()
    }

    pub const fn last_signalled_fence(&self) -> FenceValue {
        self.fence.last_signalled()
    }

    pub fn completed_fence(&self) -> Result<FenceValue> {
        self.fence.completed_value()
    }

    pub const fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub const fn resources(&self) -> &DependentResourceSet<D> {
        &self.resources
    }

    /// Drain the GPU and release every resource. Idempotent.
    ///
    /// The drain is skipped once the device is lost.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.channel.abandon();
        self.phase = FramePhase::Ready;

        if self.fence.is_lost() || self.device.status() == Err(GpuError::DeviceLost) {
            debug!("Skipping final drain, device lost");
            return Ok(());
        }
        self.fence.flush()?;
        self.resources.release_all(&self.fence)?;
        self.surface.destroy(&self.fence)?;
        info!(
            fence = self.fence.last_signalled().get(),
            "Frame engine shut down"
        );
        Ok(())
    }

    fn probe(&self, request: &SettingsSnapshot) -> Result<SampleDesc> {
        probe_sample_desc(
            &*self.device,
            self.config.back_buffer_format,
            self.config.depth_stencil_format,
            request.anti_aliasing.requested_samples(),
        )
    }

    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(GpuError::DeviceLost)) {
            self.coordinator.fail();
        }
        result
    }

    fn run_change(
        &mut self,
        request: SettingsSnapshot,
        plan: RebuildPlan,
        sample_desc: SampleDesc,
    ) -> Result<()> {
        if !self.coordinator.begin(request, plan)? {
            self.resources
                .shadow_map
                .set_soft_shadows(request.shadows.soft_shadows);
            self.resources
                .sampler
                .apply_texture_settings(&request.textures);
            debug!("Settings applied without rebuild");
            return Ok(());
        }

        debug!(?plan, "Applying settings change");
        match self.execute_change(&request, plan, sample_desc) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.channel.abandon();
                self.coordinator.fail();
                warn!(error = %e, "Settings change failed, engine must be reinitialized");
                Err(e)
            }
        }
    }

    fn execute_change(
        &mut self,
        request: &SettingsSnapshot,
        plan: RebuildPlan,
        sample_desc: SampleDesc,
    ) -> Result<()> {
        // Draining
        let drained = self.fence.flush()?;
        trace!(fence = drained.get(), "Drained for settings change");
        self.coordinator.drained()?;

        // Rebuilding
        let target = request.display;
        self.channel.begin_frame(&self.fence)?;
        if plan.surface {
            self.surface.create_or_resize(
                &self.output,
                swapchain_desc(&self.config, request),
                &self.fence,
            )?;
            for slot in self.surface.slots() {
                self.channel
                    .transition(slot.texture, ResourceState::Common, ResourceState::Present)?;
            }
        }
        self.sample_desc = sample_desc;
        if plan.depth {
            let spec = DepthBuffer::<D>::spec(
                target.width,
                target.height,
                self.config.depth_stencil_format,
                sample_desc,
            );
            self.resources
                .depth
                .rebuild(spec, &self.fence, &mut self.channel)?;
        }
        if plan.multisample {
            let spec = MultisampleTarget::<D>::spec(
                target.width,
                target.height,
                self.config.back_buffer_format,
                sample_desc,
                self.config.clear_color,
            );
            self.resources.multisample.rebuild(spec, &self.fence)?;
        }
        if plan.shadow_map {
            self.resources
                .shadow_map
                .rebuild(&request.shadows, &self.fence)?;
        } else {
            self.resources
                .shadow_map
                .set_soft_shadows(request.shadows.soft_shadows);
        }
        if plan.sampler {
            self.resources.sampler.rebuild(&request.textures, &self.fence)?;
        } else {
            self.resources
                .sampler
                .apply_texture_settings(&request.textures);
        }
        self.coordinator.rebuilt()?;

        // Reinitializing
        self.viewport = Viewport::full(target.width, target.height);
        self.scissor = ScissorRect::full(target.width, target.height);
        self.channel.set_viewport(self.viewport)?;
        self.channel.set_scissor(self.scissor)?;
        self.channel.end_frame()?;
        let value = self.channel.submit(&mut self.fence)?;
        self.fence.wait_for_value(value)?;
        self.coordinator.reinitialized()?;

        info!(
            width = target.width,
            height = target.height,
            surface = plan.surface,
            depth = plan.depth,
            multisample = plan.multisample,
            shadow_map = plan.shadow_map,
            sampler = plan.sampler,
            "Settings applied"
        );
        Ok(())
    }

    fn record_frame<F>(&mut self, record: F) -> Result<FenceValue>
    where
        F: FnOnce(&mut FrameRecorder<'_, D>) -> Result<()>,
    {
        let slot = self.surface.acquire_current()?;
        self.channel.begin_frame(&self.fence)?;

        let depth_view = self.resources.depth.view()?;
        let multisample = self
            .resources
            .multisample
            .resource()
            .texture()
            .zip(self.resources.multisample.view().ok());
        let render_target = multisample.map_or(slot.view, |(_, view)| view);

        if multisample.is_none() {
            self.channel
                .transition(slot.texture, ResourceState::Present, ResourceState::RenderTarget)?;
        }
        self.channel.set_viewport(self.viewport)?;
        self.channel.set_scissor(self.scissor)?;
        self.channel
            .clear_render_target(render_target, self.config.clear_color)?;
        self.channel.clear_depth_stencil(depth_view, 1.0, 0)?;
        self.channel
            .set_render_targets(Some(render_target), Some(depth_view))?;

        let targets = FrameTargets {
            render_target,
            back_buffer: slot.view,
            depth_stencil: depth_view,
            shadow_map: self.resources.shadow_map.view().ok(),
            sampler: self.resources.sampler.sampler().ok(),
            viewport: self.viewport,
            scissor: self.scissor,
        };
        record(&mut FrameRecorder {
            channel: &mut self.channel,
            targets,
        })?;

        match multisample {
            Some((texture, _)) => {
                self.channel.transition(
                    texture,
                    ResourceState::RenderTarget,
                    ResourceState::ResolveSource,
                )?;
                self.channel.transition(
                    slot.texture,
                    ResourceState::Present,
                    ResourceState::ResolveDest,
                )?;
                self.channel
                    .resolve(texture, slot.texture, self.config.back_buffer_format)?;
                self.channel.transition(
                    slot.texture,
                    ResourceState::ResolveDest,
                    ResourceState::Present,
                )?;
                self.channel.transition(
                    texture,
                    ResourceState::ResolveSource,
                    ResourceState::RenderTarget,
                )?;
            }
            None => {
                self.channel.transition(
                    slot.texture,
                    ResourceState::RenderTarget,
                    ResourceState::Present,
                )?;
            }
        }

        self.channel.end_frame()?;
        let value = self.channel.submit(&mut self.fence)?;
        trace!(fence = value.get(), slot = slot.index, "Frame submitted");
        Ok(value)
    }
}

impl<D: GpuDevice> Drop for FrameEngine<D> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Frame engine shutdown failed");
        }
    }
}

fn swapchain_desc(config: &EngineConfig, settings: &SettingsSnapshot) -> SwapchainDesc {
    SwapchainDesc {
        width: settings.display.width,
        height: settings.display.height,
        format: config.back_buffer_format,
        buffer_count: config.buffer_count,
        refresh_rate: settings.display.refresh_rate,
        mode: settings.display.mode,
        vsync: settings.display.vsync,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;
    use cadence_core::ManualClock;

    fn engine(config: EngineConfig) -> (Arc<HeadlessDevice>, FrameEngine<HeadlessDevice>) {
        let device = Arc::new(HeadlessDevice::new().unwrap());
        let engine =
            FrameEngine::initialize(device.clone(), (), Arc::new(ManualClock::new()), config)
                .unwrap();
        (device, engine)
    }

    #[test]
    fn initialize_builds_everything() {
        let (device, engine) = engine(EngineConfig::default());
        assert_eq!(engine.state(), CoordinatorState::Steady);
        assert!(engine.depth_stencil_view().is_ok());
        assert!(engine.shadow_map_view().is_ok());
        assert!(engine.sampler().is_ok());
        assert_eq!(engine.current_slot_index(), 0);
        assert_eq!(
            engine.current_render_target_view().unwrap(),
            engine.current_back_buffer_view().unwrap()
        );
        assert_eq!(engine.viewport(), Viewport::full(1280, 720));
        assert!(!engine.resources().multisample.is_enabled());
        assert!(device.violations().is_empty());
    }

    #[test]
    fn present_requires_render() {
        let (_device, mut engine) = engine(EngineConfig::default());
        assert!(matches!(
            engine.present_frame(),
            Err(GpuError::InvalidState(_))
        ));
        engine.render_frame().unwrap();
        assert!(matches!(
            engine.render_frame(),
            Err(GpuError::InvalidState(_))
        ));
        engine.present_frame().unwrap();
    }

    #[test]
    fn frame_records_clear_and_transitions() {
        let (device, mut engine) = engine(EngineConfig::default());
        let back_buffer = engine.current_back_buffer_view().unwrap();
        engine
            .render_frame_with(|recorder| {
                assert_eq!(recorder.targets().render_target, back_buffer);
                recorder.draw(3, 1)
            })
            .unwrap();
        engine.present_frame().unwrap();
        engine.shutdown().unwrap();

        let frame = device.executed_commands().last().cloned().unwrap();
        assert!(frame.contains(&crate::GpuCommand::ClearRenderTarget {
            view: back_buffer,
            color: cadence_core::config::DEFAULT_CLEAR_COLOR,
        }));
        assert!(frame
            .iter()
            .any(|c| matches!(c, crate::GpuCommand::Draw { vertex_count: 3, .. })));
        assert!(device.violations().is_empty());
    }

    #[test]
    fn msaa_renders_into_target_and_resolves() {
        let config = EngineConfig::default().with_settings(SettingsSnapshot {
            anti_aliasing: AntiAliasingSettings::msaa(4),
            ..Default::default()
        });
        let (device, mut engine) = engine(config);
        assert_eq!(engine.sample_desc(), SampleDesc::new(4, 0));
        let target = engine.current_render_target_view().unwrap();
        assert_ne!(target, engine.current_back_buffer_view().unwrap());

        engine.render_frame().unwrap();
        engine.present_frame().unwrap();
        engine.shutdown().unwrap();

        let frame = device.executed_commands().last().cloned().unwrap();
        assert!(frame
            .iter()
            .any(|c| matches!(c, crate::GpuCommand::Resolve { .. })));
        assert!(device.violations().is_empty());
    }

    #[test]
    fn disabling_msaa_releases_target() {
        let config = EngineConfig::default().with_settings(SettingsSnapshot {
            anti_aliasing: AntiAliasingSettings::msaa(4),
            ..Default::default()
        });
        let (device, mut engine) = engine(config);
        let depth_before = engine.resources().depth.resource().generation();
        engine
            .set_anti_aliasing_settings(AntiAliasingSettings::default())
            .unwrap();
        assert!(!engine.resources().multisample.is_enabled());
        assert_eq!(
            engine.resources().depth.resource().generation(),
            depth_before + 1
        );
        assert_eq!(
            device
                .texture_desc(engine.resources().depth.resource().texture().unwrap())
                .unwrap()
                .samples,
            SampleDesc::SINGLE
        );
    }

    #[test]
    fn texture_quality_changes_without_rebuild() {
        let (_device, mut engine) = engine(EngineConfig::default());
        let before = engine.last_signalled_fence();
        engine
            .set_texture_settings(TextureSettings {
                quality: cadence_core::TextureQuality::Low,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(engine.last_signalled_fence(), before);
        assert!((engine.texture_resolution_scale() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn invalid_settings_are_rejected_without_gpu_work() {
        let (_device, mut engine) = engine(EngineConfig::default());
        let before = engine.last_signalled_fence();
        assert!(matches!(
            engine.set_display_settings(DisplaySettings::with_size(0, 600)),
            Err(GpuError::Configuration(_))
        ));
        assert_eq!(engine.last_signalled_fence(), before);
        assert_eq!(engine.state(), CoordinatorState::Steady);
    }

    #[test]
    fn shutdown_releases_all_textures() {
        let (device, mut engine) = engine(EngineConfig::default());
        engine.render_frame().unwrap();
        engine.present_frame().unwrap();
        engine.shutdown().unwrap();
        assert!(device.live_textures().is_empty());
        assert_eq!(device.live_view_count(), 0);
        engine.shutdown().unwrap();
    }
}
