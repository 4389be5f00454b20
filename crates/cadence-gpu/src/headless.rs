//! Simulated GPU.
//!
//! [`HeadlessDevice`] executes submissions on a worker thread in queue order,
//! so fence completion is genuinely asynchronous with respect to the caller.
//! It records every object lifecycle event in one global order and flags
//! hazards (freeing memory the queue still references, resetting a busy
//! allocator, illegal state transitions) as violations instead of crashing.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cadence_core::{Format, SampleDesc};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::device::{
    AdapterInfo, CommandAllocatorId, CommandListId, FenceId, Filter, GpuCommand, GpuDevice,
    ResourceState, SamplerDesc, SamplerId, SwapchainDesc, SwapchainId, TextureDesc, TextureId,
    TextureUsage, ViewId, ViewKind,
};
use crate::error::{GpuError, Result};

/// One entry of the device event log.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    TextureCreated {
        texture: TextureId,
        label: String,
    },
    TextureDestroyed {
        texture: TextureId,
        label: String,
    },
    SamplerCreated {
        sampler: SamplerId,
        filter: Filter,
    },
    SwapchainCreated {
        swapchain: SwapchainId,
        width: u32,
        height: u32,
        buffer_count: u32,
    },
    SwapchainResized {
        swapchain: SwapchainId,
        width: u32,
        height: u32,
        buffer_count: u32,
    },
    AllocatorReset {
        allocator: CommandAllocatorId,
    },
    CommandListExecuted {
        list: CommandListId,
        command_count: usize,
    },
    FenceCompleted {
        fence: FenceId,
        value: u64,
    },
    Presented {
        swapchain: SwapchainId,
        buffer_index: u32,
        sync_interval: u32,
    },
}

#[derive(Debug)]
struct TextureRecord {
    desc: TextureDesc,
    state: ResourceState,
    pending: usize,
    owner: Option<SwapchainId>,
}

#[derive(Debug)]
struct ViewRecord {
    texture: TextureId,
    pending: usize,
}

#[derive(Debug, Default)]
struct ListRecord {
    allocator: Option<CommandAllocatorId>,
    commands: Option<Vec<GpuCommand>>,
}

#[derive(Debug)]
struct SwapchainRecord {
    desc: SwapchainDesc,
    buffers: Vec<TextureId>,
    next_present: u32,
    acquired: Option<u32>,
}

enum QueueOp {
    Execute {
        list: CommandListId,
        allocator: CommandAllocatorId,
        commands: Vec<GpuCommand>,
        textures: Vec<TextureId>,
        views: Vec<ViewId>,
    },
    Signal {
        fence: FenceId,
        value: u64,
    },
    Present {
        swapchain: SwapchainId,
        buffer_index: u32,
        sync_interval: u32,
    },
    Shutdown,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    fences: HashMap<FenceId, u64>,
    allocators: HashMap<CommandAllocatorId, usize>,
    lists: HashMap<CommandListId, ListRecord>,
    textures: HashMap<TextureId, TextureRecord>,
    views: HashMap<ViewId, ViewRecord>,
    samplers: HashMap<SamplerId, SamplerDesc>,
    swapchains: HashMap<SwapchainId, SwapchainRecord>,
    paused: bool,
    shutting_down: bool,
    lost: bool,
    fail_next_texture: bool,
    events: Vec<DeviceEvent>,
    violations: Vec<String>,
    executed: Vec<Vec<GpuCommand>>,
}

impl State {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_alive(&self) -> Result<()> {
        if self.lost {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn violation(&mut self, message: String) {
        debug!(%message, "Headless device violation");
        self.violations.push(message);
    }

    fn insert_texture(&mut self, desc: TextureDesc, owner: Option<SwapchainId>) -> TextureId {
        let texture = TextureId(self.allocate_id());
        self.events.push(DeviceEvent::TextureCreated {
            texture,
            label: desc.label.clone(),
        });
        self.textures.insert(
            texture,
            TextureRecord {
                state: desc.initial_state,
                desc,
                pending: 0,
                owner,
            },
        );
        texture
    }

    fn remove_texture(&mut self, texture: TextureId) {
        if let Some(record) = self.textures.remove(&texture) {
            if record.pending > 0 {
                self.violation(format!(
                    "{texture} ({}) destroyed while referenced by {} unexecuted submission(s)",
                    record.desc.label, record.pending
                ));
            }
            self.events.push(DeviceEvent::TextureDestroyed {
                texture,
                label: record.desc.label,
            });
        }
    }

    /// Release every buffer of a swap chain, flagging live references.
    fn release_swapchain_buffers(&mut self, swapchain: SwapchainId) {
        let buffers = self
            .swapchains
            .get_mut(&swapchain)
            .map(|record| std::mem::take(&mut record.buffers))
            .unwrap_or_default();
        for texture in buffers {
            let live_views = self.views.values().filter(|v| v.texture == texture).count();
            if live_views > 0 {
                self.violation(format!(
                    "{swapchain} buffer {texture} released with {live_views} live view(s)"
                ));
            }
            self.remove_texture(texture);
        }
    }

    fn create_swapchain_buffers(&mut self, swapchain: SwapchainId, desc: &SwapchainDesc) {
        let buffers = (0..desc.buffer_count)
            .map(|index| {
                self.insert_texture(
                    TextureDesc {
                        label: format!("{swapchain} buffer {index}"),
                        width: desc.width,
                        height: desc.height,
                        format: desc.format,
                        samples: SampleDesc::SINGLE,
                        usage: TextureUsage::RENDER_TARGET,
                        initial_state: ResourceState::Common,
                        clear_value: None,
                    },
                    Some(swapchain),
                )
            })
            .collect();
        if let Some(record) = self.swapchains.get_mut(&swapchain) {
            record.buffers = buffers;
            record.desc = *desc;
            record.next_present = 0;
            record.acquired = None;
        }
    }

    fn view_texture(&self, view: ViewId) -> Option<TextureId> {
        self.views.get(&view).map(|v| v.texture)
    }

    fn expect_state(&mut self, texture: TextureId, expected: ResourceState, what: &str) {
        let actual = self.textures.get(&texture).map(|t| t.state);
        if let Some(actual) = actual {
            if actual != expected {
                self.violation(format!(
                    "{what} on {texture} in state {actual:?}, expected {expected:?}"
                ));
            }
        }
    }

    fn execute(&mut self, commands: &[GpuCommand]) {
        for command in commands {
            for texture in command.textures() {
                if !self.textures.contains_key(&texture) {
                    self.violation(format!("executed command references destroyed {texture}"));
                }
            }
            for view in command.views() {
                if !self.views.contains_key(&view) {
                    self.violation(format!("executed command references destroyed {view}"));
                }
            }

            match *command {
                GpuCommand::Transition {
                    texture,
                    before,
                    after,
                } => {
                    self.expect_state(texture, before, "transition");
                    if let Some(record) = self.textures.get_mut(&texture) {
                        record.state = after;
                    }
                }
                GpuCommand::ClearRenderTarget { view, .. } => {
                    if let Some(texture) = self.view_texture(view) {
                        self.expect_state(texture, ResourceState::RenderTarget, "colour clear");
                    }
                }
                GpuCommand::ClearDepthStencil { view, .. } => {
                    if let Some(texture) = self.view_texture(view) {
                        self.expect_state(texture, ResourceState::DepthWrite, "depth clear");
                    }
                }
                GpuCommand::SetRenderTargets { color, depth } => {
                    if let Some(texture) = color.and_then(|v| self.view_texture(v)) {
                        self.expect_state(texture, ResourceState::RenderTarget, "colour bind");
                    }
                    if let Some(texture) = depth.and_then(|v| self.view_texture(v)) {
                        self.expect_state(texture, ResourceState::DepthWrite, "depth bind");
                    }
                }
                GpuCommand::Resolve {
                    source,
                    destination,
                    ..
                } => {
                    self.expect_state(source, ResourceState::ResolveSource, "resolve source");
                    self.expect_state(destination, ResourceState::ResolveDest, "resolve dest");
                }
                GpuCommand::SetViewport(_) | GpuCommand::SetScissor(_) | GpuCommand::Draw { .. } => {}
            }
        }
    }

    fn process(&mut self, op: QueueOp) {
        match op {
            QueueOp::Execute {
                list,
                allocator,
                commands,
                textures,
                views,
            } => {
                self.execute(&commands);
                for texture in textures {
                    if let Some(record) = self.textures.get_mut(&texture) {
                        record.pending = record.pending.saturating_sub(1);
                    }
                }
                for view in views {
                    if let Some(record) = self.views.get_mut(&view) {
                        record.pending = record.pending.saturating_sub(1);
                    }
                }
                if let Some(pending) = self.allocators.get_mut(&allocator) {
                    *pending = pending.saturating_sub(1);
                }
                self.events.push(DeviceEvent::CommandListExecuted {
                    list,
                    command_count: commands.len(),
                });
                self.executed.push(commands);
            }
            QueueOp::Signal { fence, value } => {
                if let Some(completed) = self.fences.get_mut(&fence) {
                    *completed = (*completed).max(value);
                    self.events.push(DeviceEvent::FenceCompleted { fence, value });
                }
            }
            QueueOp::Present {
                swapchain,
                buffer_index,
                sync_interval,
            } => {
                let texture = self
                    .swapchains
                    .get(&swapchain)
                    .and_then(|s| s.buffers.get(buffer_index as usize).copied());
                match texture {
                    Some(texture) => {
                        self.expect_state(texture, ResourceState::Present, "present");
                        self.events.push(DeviceEvent::Presented {
                            swapchain,
                            buffer_index,
                            sync_interval,
                        });
                    }
                    None => self.violation(format!(
                        "present of {swapchain} buffer {buffer_index} after it was released"
                    )),
                }
            }
            QueueOp::Shutdown => {}
        }
    }
}

struct Shared {
    state: Mutex<State>,
    progress: Condvar,
}

fn run_queue(shared: &Shared, ops: &Receiver<QueueOp>, latency: Duration) {
    while let Ok(op) = ops.recv() {
        if matches!(op, QueueOp::Shutdown) {
            break;
        }
        {
            let mut state = shared.state.lock();
            while state.paused && !state.shutting_down {
                shared.progress.wait(&mut state);
            }
        }
        if matches!(op, QueueOp::Execute { .. }) && !latency.is_zero() {
            thread::sleep(latency);
        }
        let mut state = shared.state.lock();
        if !state.lost {
            state.process(op);
        }
        shared.progress.notify_all();
    }
}

/// Builder for [`HeadlessDevice`].
pub struct HeadlessDeviceBuilder {
    name: String,
    gpu_latency: Duration,
    msaa_levels: HashMap<(Format, u32), u32>,
}

impl Default for HeadlessDeviceBuilder {
    fn default() -> Self {
        Self {
            name: "Headless Device".to_string(),
            gpu_latency: Duration::ZERO,
            msaa_levels: HashMap::new(),
        }
    }
}

impl HeadlessDeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the adapter name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Simulated execution time of each command list.
    pub fn gpu_latency(mut self, latency: Duration) -> Self {
        self.gpu_latency = latency;
        self
    }

    /// Override the quality level count reported for a format and sample count.
    pub fn msaa_quality_levels(mut self, format: Format, sample_count: u32, levels: u32) -> Self {
        self.msaa_levels.insert((format, sample_count), levels);
        self
    }

    /// Start the queue worker.
    pub fn build(self) -> Result<HeadlessDevice> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            progress: Condvar::new(),
        });
        let (queue, ops) = channel::unbounded();
        let worker = {
            let shared = Arc::clone(&shared);
            let latency = self.gpu_latency;
            thread::Builder::new()
                .name("headless-gpu-queue".to_string())
                .spawn(move || run_queue(&shared, &ops, latency))
                .map_err(GpuError::device)?
        };
        debug!(name = %self.name, "Headless device started");
        Ok(HeadlessDevice {
            shared,
            queue,
            worker: Mutex::new(Some(worker)),
            name: self.name,
            msaa_levels: self.msaa_levels,
        })
    }
}

/// A simulated GPU with an asynchronous in-order queue.
pub struct HeadlessDevice {
    shared: Arc<Shared>,
    queue: Sender<QueueOp>,
    worker: Mutex<Option<JoinHandle<()>>>,
    name: String,
    msaa_levels: HashMap<(Format, u32), u32>,
}

impl HeadlessDevice {
    /// Device with default behaviour and no simulated latency.
    pub fn new() -> Result<Self> {
        HeadlessDeviceBuilder::new().build()
    }

    pub fn builder() -> HeadlessDeviceBuilder {
        HeadlessDeviceBuilder::new()
    }

    /// Stop the queue before it processes its next operation.
    pub fn pause(&self) {
        self.shared.state.lock().paused = true;
    }

    /// Let the queue continue.
    pub fn resume(&self) {
        self.shared.state.lock().paused = false;
        self.shared.progress.notify_all();
    }

    /// Simulate adapter removal. Every later call fails with `DeviceLost`.
    pub fn lose_device(&self) {
        self.shared.state.lock().lost = true;
        self.shared.progress.notify_all();
    }

    /// Make the next texture creation fail with a device error.
    pub fn fail_next_texture_creation(&self) {
        self.shared.state.lock().fail_next_texture = true;
    }

    /// Event log in global order.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.shared.state.lock().events.clone()
    }

    /// Hazards detected so far.
    pub fn violations(&self) -> Vec<String> {
        self.shared.state.lock().violations.clone()
    }

    /// Command lists executed by the queue, in order.
    pub fn executed_commands(&self) -> Vec<Vec<GpuCommand>> {
        self.shared.state.lock().executed.clone()
    }

    /// Drop the event log, recorded violations and executed command lists.
    ///
    /// Live objects are kept. Long-running drivers call this between checks
    /// so the logs stay bounded.
    pub fn clear_log(&self) {
        let mut state = self.shared.state.lock();
        state.events.clear();
        state.violations.clear();
        state.executed.clear();
    }

    /// Descriptions of every live texture, swap chain buffers included.
    pub fn live_textures(&self) -> Vec<TextureDesc> {
        let state = self.shared.state.lock();
        let mut textures: Vec<_> = state.textures.iter().collect();
        textures.sort_by_key(|(id, _)| **id);
        textures.into_iter().map(|(_, t)| t.desc.clone()).collect()
    }

    pub fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc> {
        self.shared
            .state
            .lock()
            .textures
            .get(&texture)
            .map(|t| t.desc.clone())
    }

    /// State of a texture as of the last executed command.
    pub fn texture_state(&self, texture: TextureId) -> Option<ResourceState> {
        self.shared.state.lock().textures.get(&texture).map(|t| t.state)
    }

    /// Texture a view points at.
    pub fn view_texture(&self, view: ViewId) -> Option<TextureId> {
        self.shared.state.lock().view_texture(view)
    }

    pub fn sampler_desc(&self, sampler: SamplerId) -> Option<SamplerDesc> {
        self.shared.state.lock().samplers.get(&sampler).copied()
    }

    pub fn live_view_count(&self) -> usize {
        self.shared.state.lock().views.len()
    }

    /// Number of presents the queue has processed.
    pub fn present_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::Presented { .. }))
            .count()
    }

    fn enqueue(&self, op: QueueOp) -> Result<()> {
        self.queue
            .send(op)
            .map_err(|_| GpuError::device("headless queue worker has stopped"))
    }
}

impl GpuDevice for HeadlessDevice {
    type Output = ();

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.name.clone(),
            backend: "headless",
            vsync_requires_swapchain_rebuild: false,
        }
    }

    fn msaa_quality_levels(&self, format: Format, sample_count: u32) -> Result<u32> {
        self.shared.state.lock().check_alive()?;
        if let Some(levels) = self.msaa_levels.get(&(format, sample_count)) {
            return Ok(*levels);
        }
        Ok(match sample_count {
            1 | 2 | 4 | 8 => 1,
            _ => 0,
        })
    }

    fn status(&self) -> Result<()> {
        self.shared.state.lock().check_alive()
    }

    fn create_fence(&self, initial_value: u64) -> Result<FenceId> {
        let mut state = self.shared.state.lock();
        state.check_alive()?;
        let fence = FenceId(state.allocate_id());
        state.fences.insert(fence, initial_value);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.shared.state.lock().fences.remove(&fence);
    }

    fn fence_completed_value(&self, fence: FenceId) -> Result<u64> {
        let state = self.shared.state.lock();
        state.check_alive()?;
        state
            .fences
            .get(&fence)
            .copied()
            .ok_or_else(|| GpuError::device(format!("unknown {fence}")))
    }

    fn wait_fence(&self, fence: FenceId, value: u64, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            state.check_alive()?;
            let completed = state
                .fences
                .get(&fence)
                .copied()
                .ok_or_else(|| GpuError::device(format!("unknown {fence}")))?;
            if completed >= value {
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    self.shared.progress.wait_until(&mut state, deadline);
                }
                None => self.shared.progress.wait(&mut state),
            }
        }
    }

    fn queue_signal(&self, fence: FenceId, value: u64) -> Result<()> {
        {
            let state = self.shared.state.lock();
            state.check_alive()?;
            if !state.fences.contains_key(&fence) {
                return Err(GpuError::device(format!("unknown {fence}")));
            }
        }
        self.enqueue(QueueOp::Signal { fence, value })
    }

    fn create_command_allocator(&self) -> Result<CommandAllocatorId> {
        let mut state = self.shared.state.lock();
        state.check_alive()?;
        let allocator = CommandAllocatorId(state.allocate_id());
        state.allocators.insert(allocator, 0);
        Ok(allocator)
    }

    fn reset_command_allocator(&self, allocator: CommandAllocatorId) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.check_alive()?;
        let pending = *state
            .allocators
            .get(&allocator)
            .ok_or_else(|| GpuError::device(format!("unknown {allocator}")))?;
        if pending > 0 {
            state.violation(format!(
                "{allocator} reset while {pending} submission(s) using it are unexecuted"
            ));
        }
        state.events.push(DeviceEvent::AllocatorReset { allocator });
        Ok(())
    }

    fn destroy_command_allocator(&self, allocator: CommandAllocatorId) {
        let mut state = self.shared.state.lock();
        if let Some(pending) = state.allocators.remove(&allocator) {
            if pending > 0 {
                state.violation(format!("{allocator} destroyed while in use"));
            }
        }
    }

    fn create_command_list(&self) -> Result<CommandListId> {
        let mut state = self.shared.state.lock();
        state.check_alive()?;
        let list = CommandListId(state.allocate_id());
        state.lists.insert(list, ListRecord::default());
        Ok(list)
    }

    fn destroy_command_list(&self, list: CommandListId) {
        self.shared.state.lock().lists.remove(&list);
    }

    fn encode_command_list(
        &self,
        list: CommandListId,
        allocator: CommandAllocatorId,
        commands: &[GpuCommand],
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.check_alive()?;
        if !state.allocators.contains_key(&allocator) {
            return Err(GpuError::device(format!("unknown {allocator}")));
        }
        for command in commands {
            if let Some(texture) = command.textures().find(|t| !state.textures.contains_key(t)) {
                return Err(GpuError::device(format!("command references unknown {texture}")));
            }
            if let Some(view) = command.views().find(|v| !state.views.contains_key(v)) {
                return Err(GpuError::device(format!("command references unknown {view}")));
            }
        }
        let record = state
            .lists
            .get_mut(&list)
            .ok_or_else(|| GpuError::device(format!("unknown {list}")))?;
        record.allocator = Some(allocator);
        record.commands = Some(commands.to_vec());
        Ok(())
    }

    fn execute_command_list(&self, list: CommandListId) -> Result<()> {
        let op = {
            let mut state = self.shared.state.lock();
            state.check_alive()?;
            let record = state
                .lists
                .get_mut(&list)
                .ok_or_else(|| GpuError::device(format!("unknown {list}")))?;
            let (Some(allocator), Some(commands)) = (record.allocator, record.commands.take())
            else {
                return Err(GpuError::device(format!("{list} executed without encoding")));
            };

            let views: Vec<ViewId> = commands.iter().flat_map(GpuCommand::views).collect();
            let mut textures: Vec<TextureId> =
                commands.iter().flat_map(GpuCommand::textures).collect();
            textures.extend(views.iter().filter_map(|v| state.view_texture(*v)));

            for texture in &textures {
                if let Some(record) = state.textures.get_mut(texture) {
                    record.pending += 1;
                }
            }
            for view in &views {
                if let Some(record) = state.views.get_mut(view) {
                    record.pending += 1;
                }
            }
            if let Some(pending) = state.allocators.get_mut(&allocator) {
                *pending += 1;
            }
            QueueOp::Execute {
                list,
                allocator,
                commands,
                textures,
                views,
            }
        };
        self.enqueue(op)
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId> {
        let mut state = self.shared.state.lock();
        state.check_alive()?;
        if std::mem::take(&mut state.fail_next_texture) {
            return Err(GpuError::device(format!(
                "injected failure creating {}",
                desc.label
            )));
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::device(format!(
                "{} has zero extent {}x{}",
                desc.label, desc.width, desc.height
            )));
        }
        Ok(state.insert_texture(desc.clone(), None))
    }

    fn destroy_texture(&self, texture: TextureId) {
        let mut state = self.shared.state.lock();
        if let Some(owner) = state.textures.get(&texture).and_then(|t| t.owner) {
            state.violation(format!("{texture} is owned by {owner}"));
            return;
        }
        state.remove_texture(texture);
    }

    fn create_view(&self, texture: TextureId, kind: ViewKind) -> Result<ViewId> {
        let mut state = self.shared.state.lock();
        state.check_alive()?;
        let usage = state
            .textures
            .get(&texture)
            .map(|t| t.desc.usage)
            .ok_or_else(|| GpuError::device(format!("view of unknown {texture}")))?;
        let required = match kind {
            ViewKind::RenderTarget => TextureUsage::RENDER_TARGET,
            ViewKind::DepthStencil => TextureUsage::DEPTH_STENCIL,
            ViewKind::ShaderResource => TextureUsage::SHADER_RESOURCE,
        };
        if !usage.contains(required) {
            return Err(GpuError::device(format!(
                "{kind:?} view of {texture} without {required:?} usage"
            )));
        }
        let view = ViewId(state.allocate_id());
        state.views.insert(view, ViewRecord { texture, pending: 0 });
        Ok(view)
    }

    fn destroy_view(&self, view: ViewId) {
        let mut state = self.shared.state.lock();
        if let Some(record) = state.views.remove(&view) {
            if record.pending > 0 {
                state.violation(format!("{view} destroyed while referenced by queued work"));
            }
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerId> {
        let mut state = self.shared.state.lock();
        state.check_alive()?;
        let sampler = SamplerId(state.allocate_id());
        state.samplers.insert(sampler, *desc);
        state.events.push(DeviceEvent::SamplerCreated {
            sampler,
            filter: desc.filter,
        });
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: SamplerId) {
        self.shared.state.lock().samplers.remove(&sampler);
    }

    fn create_swapchain(&self, _output: &(), desc: &SwapchainDesc) -> Result<SwapchainId> {
        let mut state = self.shared.state.lock();
        state.check_alive()?;
        let swapchain = SwapchainId(state.allocate_id());
        state.swapchains.insert(
            swapchain,
            SwapchainRecord {
                desc: *desc,
                buffers: Vec::new(),
                next_present: 0,
                acquired: None,
            },
        );
        state.create_swapchain_buffers(swapchain, desc);
        state.events.push(DeviceEvent::SwapchainCreated {
            swapchain,
            width: desc.width,
            height: desc.height,
            buffer_count: desc.buffer_count,
        });
        Ok(swapchain)
    }

    fn resize_swapchain(&self, swapchain: SwapchainId, desc: &SwapchainDesc) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.check_alive()?;
        if !state.swapchains.contains_key(&swapchain) {
            return Err(GpuError::device(format!("unknown {swapchain}")));
        }
        state.release_swapchain_buffers(swapchain);
        state.create_swapchain_buffers(swapchain, desc);
        state.events.push(DeviceEvent::SwapchainResized {
            swapchain,
            width: desc.width,
            height: desc.height,
            buffer_count: desc.buffer_count,
        });
        Ok(())
    }

    fn destroy_swapchain(&self, swapchain: SwapchainId) {
        let mut state = self.shared.state.lock();
        state.release_swapchain_buffers(swapchain);
        state.swapchains.remove(&swapchain);
    }

    fn swapchain_buffer(&self, swapchain: SwapchainId, index: u32) -> Result<TextureId> {
        let state = self.shared.state.lock();
        state.check_alive()?;
        state
            .swapchains
            .get(&swapchain)
            .and_then(|s| s.buffers.get(index as usize).copied())
            .ok_or_else(|| GpuError::device(format!("{swapchain} has no buffer {index}")))
    }

    fn acquire_swapchain_buffer(&self, swapchain: SwapchainId, index: u32) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.check_alive()?;
        let next = state
            .swapchains
            .get(&swapchain)
            .map(|s| s.next_present)
            .ok_or_else(|| GpuError::device(format!("unknown {swapchain}")))?;
        if index != next {
            state.violation(format!(
                "{swapchain} acquired buffer {index} but will present buffer {next}"
            ));
        }
        if let Some(record) = state.swapchains.get_mut(&swapchain) {
            record.acquired = Some(index);
        }
        Ok(())
    }

    fn present(&self, swapchain: SwapchainId, sync_interval: u32) -> Result<()> {
        let op = {
            let mut state = self.shared.state.lock();
            state.check_alive()?;
            let record = state
                .swapchains
                .get_mut(&swapchain)
                .ok_or_else(|| GpuError::device(format!("unknown {swapchain}")))?;
            let buffer_index = record.next_present;
            let acquired = record.acquired.take();
            record.next_present = (record.next_present + 1) % record.desc.buffer_count.max(1);
            if acquired != Some(buffer_index) {
                state.violation(format!(
                    "{swapchain} presented buffer {buffer_index} without acquiring it"
                ));
            }
            QueueOp::Present {
                swapchain,
                buffer_index,
                sync_interval,
            }
        };
        self.enqueue(op)
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
            state.paused = false;
        }
        self.shared.progress.notify_all();
        let _ = self.queue.send(QueueOp::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth_desc() -> TextureDesc {
        TextureDesc {
            label: "depth".to_string(),
            width: 64,
            height: 64,
            format: Format::D32Float,
            samples: SampleDesc::SINGLE,
            usage: TextureUsage::DEPTH_STENCIL,
            initial_state: ResourceState::Common,
            clear_value: None,
        }
    }

    #[test]
    fn signals_complete_in_order() {
        let device = HeadlessDevice::new().unwrap();
        let fence = device.create_fence(0).unwrap();
        for value in 1..=3 {
            device.queue_signal(fence, value).unwrap();
        }
        assert!(device.wait_fence(fence, 3, None).unwrap());
        let completed: Vec<_> = device
            .events()
            .into_iter()
            .filter_map(|e| match e {
                DeviceEvent::FenceCompleted { value, .. } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec![1, 2, 3]);
    }

    #[test]
    fn paused_queue_times_out() {
        let device = HeadlessDevice::new().unwrap();
        let fence = device.create_fence(0).unwrap();
        device.pause();
        device.queue_signal(fence, 1).unwrap();
        assert!(!device
            .wait_fence(fence, 1, Some(Duration::from_millis(10)))
            .unwrap());
        device.resume();
        assert!(device.wait_fence(fence, 1, None).unwrap());
    }

    #[test]
    fn freeing_referenced_texture_is_a_violation() {
        let device = HeadlessDevice::new().unwrap();
        let texture = device.create_texture(&depth_desc()).unwrap();
        let allocator = device.create_command_allocator().unwrap();
        let list = device.create_command_list().unwrap();
        let commands = [GpuCommand::Transition {
            texture,
            before: ResourceState::Common,
            after: ResourceState::DepthWrite,
        }];

        device.pause();
        device.encode_command_list(list, allocator, &commands).unwrap();
        device.execute_command_list(list).unwrap();
        device.destroy_texture(texture);
        device.resume();

        let violations = device.violations();
        assert!(violations.iter().any(|v| v.contains("destroyed while referenced")));
    }

    #[test]
    fn clearing_the_log_keeps_live_objects() {
        let device = HeadlessDevice::new().unwrap();
        let fence = device.create_fence(0).unwrap();
        let texture = device.create_texture(&depth_desc()).unwrap();
        let allocator = device.create_command_allocator().unwrap();
        let list = device.create_command_list().unwrap();
        let commands = [GpuCommand::Transition {
            texture,
            before: ResourceState::RenderTarget,
            after: ResourceState::DepthWrite,
        }];
        device.encode_command_list(list, allocator, &commands).unwrap();
        device.execute_command_list(list).unwrap();
        device.queue_signal(fence, 1).unwrap();
        device.wait_fence(fence, 1, None).unwrap();
        assert!(!device.events().is_empty());
        assert_eq!(device.violations().len(), 1);
        assert_eq!(device.executed_commands().len(), 1);

        device.clear_log();
        assert!(device.events().is_empty());
        assert!(device.violations().is_empty());
        assert!(device.executed_commands().is_empty());
        assert_eq!(device.texture_state(texture), Some(ResourceState::DepthWrite));

        device.destroy_texture(texture);
        assert!(matches!(
            device.events().as_slice(),
            [DeviceEvent::TextureDestroyed { .. }]
        ));
    }

    #[test]
    fn wrong_transition_source_is_a_violation() {
        let device = HeadlessDevice::new().unwrap();
        let fence = device.create_fence(0).unwrap();
        let texture = device.create_texture(&depth_desc()).unwrap();
        let allocator = device.create_command_allocator().unwrap();
        let list = device.create_command_list().unwrap();
        let commands = [GpuCommand::Transition {
            texture,
            before: ResourceState::RenderTarget,
            after: ResourceState::DepthWrite,
        }];
        device.encode_command_list(list, allocator, &commands).unwrap();
        device.execute_command_list(list).unwrap();
        device.queue_signal(fence, 1).unwrap();
        device.wait_fence(fence, 1, None).unwrap();
        assert_eq!(device.violations().len(), 1);
        assert_eq!(device.texture_state(texture), Some(ResourceState::DepthWrite));
    }

    #[test]
    fn injected_texture_failure_fires_once() {
        let device = HeadlessDevice::new().unwrap();
        device.fail_next_texture_creation();
        assert!(matches!(
            device.create_texture(&depth_desc()),
            Err(GpuError::Device(_))
        ));
        assert!(device.create_texture(&depth_desc()).is_ok());
    }

    #[test]
    fn lost_device_fails_everything() {
        let device = HeadlessDevice::new().unwrap();
        let fence = device.create_fence(0).unwrap();
        device.lose_device();
        assert_eq!(device.status(), Err(GpuError::DeviceLost));
        assert_eq!(device.queue_signal(fence, 1), Err(GpuError::DeviceLost));
        assert_eq!(device.wait_fence(fence, 1, None), Err(GpuError::DeviceLost));
    }

    #[test]
    fn msaa_probe_defaults_and_overrides() {
        let device = HeadlessDevice::builder()
            .msaa_quality_levels(Format::Rgba8Unorm, 4, 0)
            .build()
            .unwrap();
        assert_eq!(device.msaa_quality_levels(Format::Rgba8Unorm, 4).unwrap(), 0);
        assert_eq!(device.msaa_quality_levels(Format::Rgba8Unorm, 8).unwrap(), 1);
        assert_eq!(device.msaa_quality_levels(Format::Rgba8Unorm, 16).unwrap(), 0);
    }
}
