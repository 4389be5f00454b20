//! Command recording and submission.

use std::sync::Arc;

use cadence_core::Format;
use tracing::trace;

use crate::device::{
    CommandAllocatorId, CommandListId, GpuCommand, GpuDevice, ResourceState, ScissorRect,
    TextureId, ViewId, Viewport,
};
use crate::error::{GpuError, Result};
use crate::sync::{FenceSynchronizer, FenceValue};

/// Ordered, bounded list of GPU operations for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecording {
    commands: Vec<GpuCommand>,
    capacity: usize,
}

impl CommandRecording {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append a command, failing once the capacity is reached.
    pub fn push(&mut self, command: GpuCommand) -> Result<()> {
        if self.commands.len() >= self.capacity {
            return Err(GpuError::RecordingFull {
                capacity: self.capacity,
            });
        }
        self.commands.push(command);
        Ok(())
    }

    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

struct AllocatorSlot {
    id: CommandAllocatorId,
    /// Fence value of the last submission that used this allocator.
    guard: Option<FenceValue>,
}

enum ChannelState {
    Idle,
    Recording(CommandRecording),
    Closed { commands: usize },
}

/// One ordered submission queue with a reusable command list.
///
/// The list is backed by a ring of allocators, one per frame in flight.
/// An allocator is only reset once the fence value of its previous
/// submission has retired.
pub struct CommandChannel<D: GpuDevice> {
    device: Arc<D>,
    allocators: Vec<AllocatorSlot>,
    current: usize,
    list: CommandListId,
    capacity: usize,
    state: ChannelState,
}

impl<D: GpuDevice> CommandChannel<D> {
    /// Create a channel with `frames_in_flight` allocators and a per-frame
    /// capacity of `capacity` commands.
    pub fn new(device: Arc<D>, frames_in_flight: u32, capacity: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(cadence_core::ConfigError::FramesInFlight.into());
        }
        if capacity == 0 {
            let error = cadence_core::ConfigError::RecordingCapacity { capacity, min: 1 };
            return Err(error.into());
        }

        let mut allocators = Vec::with_capacity(frames_in_flight as usize);
        for _ in 0..frames_in_flight {
            match device.create_command_allocator() {
                Ok(id) => allocators.push(AllocatorSlot { id, guard: None }),
                Err(e) => {
                    for slot in &allocators {
                        device.destroy_command_allocator(slot.id);
                    }
                    return Err(e);
                }
            }
        }
        let list = match device.create_command_list() {
            Ok(list) => list,
            Err(e) => {
                for slot in &allocators {
                    device.destroy_command_allocator(slot.id);
                }
                return Err(e);
            }
        };

        Ok(Self {
            device,
            allocators,
            current: 0,
            list,
            capacity,
            state: ChannelState::Idle,
        })
    }

    /// Reset the current allocator and open a new recording.
    ///
    /// Fails with [`GpuError::AllocatorInUse`] if the allocator's previous
    /// submission has not retired; the caller waits on
    /// [`reuse_guard`](Self::reuse_guard) first.
    pub fn begin_frame(&mut self, fence: &FenceSynchronizer<D>) -> Result<()> {
        match self.state {
            ChannelState::Idle => {}
            ChannelState::Recording(_) => {
                return Err(GpuError::invalid_state(
                    "begin_frame called while a recording is open",
                ))
            }
            ChannelState::Closed { .. } => {
                return Err(GpuError::invalid_state(
                    "begin_frame called before the closed recording was submitted",
                ))
            }
        }

        let slot = &self.allocators[self.current];
        if let Some(guard) = slot.guard {
            if !fence.is_retired(guard)? {
                return Err(GpuError::AllocatorInUse { guard });
            }
        }
        self.device.reset_command_allocator(slot.id)?;
        self.state = ChannelState::Recording(CommandRecording::with_capacity(self.capacity));
        Ok(())
    }

    /// Append a command to the open recording.
    ///
    /// Overflowing the recording abandons it.
    pub fn record(&mut self, command: GpuCommand) -> Result<()> {
        let ChannelState::Recording(recording) = &mut self.state else {
            return Err(GpuError::invalid_state("no open recording"));
        };
        if let Err(e) = recording.push(command) {
            self.state = ChannelState::Idle;
            return Err(e);
        }
        Ok(())
    }

    pub fn transition(
        &mut self,
        texture: TextureId,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()> {
        self.record(GpuCommand::Transition {
            texture,
            before,
            after,
        })
    }

    pub fn clear_render_target(&mut self, view: ViewId, color: [f32; 4]) -> Result<()> {
        self.record(GpuCommand::ClearRenderTarget { view, color })
    }

    pub fn clear_depth_stencil(&mut self, view: ViewId, depth: f32, stencil: u8) -> Result<()> {
        self.record(GpuCommand::ClearDepthStencil {
            view,
            depth,
            stencil,
        })
    }

    pub fn set_render_targets(&mut self, color: Option<ViewId>, depth: Option<ViewId>) -> Result<()> {
        self.record(GpuCommand::SetRenderTargets { color, depth })
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        self.record(GpuCommand::SetViewport(viewport))
    }

    pub fn set_scissor(&mut self, scissor: ScissorRect) -> Result<()> {
        self.record(GpuCommand::SetScissor(scissor))
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> Result<()> {
        self.record(GpuCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        })
    }

    pub fn resolve(
        &mut self,
        source: TextureId,
        destination: TextureId,
        format: Format,
    ) -> Result<()> {
        self.record(GpuCommand::Resolve {
            source,
            destination,
            format,
        })
    }

    /// Close the recording and encode it into the command list.
    pub fn end_frame(&mut self) -> Result<()> {
        let recording = match std::mem::replace(&mut self.state, ChannelState::Idle) {
            ChannelState::Recording(recording) => recording,
            other => {
                self.state = other;
                return Err(GpuError::invalid_state("end_frame without an open recording"));
            }
        };
        self.device.encode_command_list(
            self.list,
            self.allocators[self.current].id,
            recording.commands(),
        )?;
        self.state = ChannelState::Closed {
            commands: recording.len(),
        };
        Ok(())
    }

    /// Execute the closed recording and signal the fence behind it.
    ///
    /// Returns the fence value that retires this submission.
    pub fn submit(&mut self, fence: &mut FenceSynchronizer<D>) -> Result<FenceValue> {
        let ChannelState::Closed { commands } = self.state else {
            return Err(GpuError::invalid_state("submit without a closed recording"));
        };
        self.state = ChannelState::Idle;

        self.device.execute_command_list(self.list)?;
        let value = fence.signal()?;
        self.allocators[self.current].guard = Some(value);
        self.current = (self.current + 1) % self.allocators.len();
        trace!(fence = value.get(), commands, "Command list submitted");
        Ok(value)
    }

    /// Drop any open or closed recording without submitting it.
    pub fn abandon(&mut self) {
        if !matches!(self.state, ChannelState::Idle) {
            trace!("Recording abandoned");
        }
        self.state = ChannelState::Idle;
    }

    /// Fence value that must retire before the next [`begin_frame`](Self::begin_frame).
    pub fn reuse_guard(&self) -> Option<FenceValue> {
        self.allocators[self.current].guard
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, ChannelState::Recording(_))
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ChannelState::Idle)
    }

    /// Commands in the open recording.
    pub fn recorded(&self) -> &[GpuCommand] {
        match &self.state {
            ChannelState::Recording(recording) => recording.commands(),
            _ => &[],
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.allocators.len()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<D: GpuDevice> Drop for CommandChannel<D> {
    fn drop(&mut self) {
        self.device.destroy_command_list(self.list);
        for slot in &self.allocators {
            self.device.destroy_command_allocator(slot.id);
        }
    }
}
