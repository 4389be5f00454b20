//! CPU/GPU synchronization.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::device::{FenceId, GpuDevice};
use crate::error::{GpuError, Result};

/// A point on the fence timeline.
///
/// Value `V` is retired once the GPU-visible completed value is at least `V`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FenceValue(pub u64);

impl FenceValue {
    pub const ZERO: Self = Self(0);

    pub const fn get(self) -> u64 {
        self.0
    }

    const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Monotonic fence counter plus the GPU primitive it signals.
///
/// This is the only way the engine learns what the GPU has finished. The
/// counter is advanced only by [`signal`](Self::signal), which must be called
/// on the submission thread after the work it guards has been queued.
pub struct FenceSynchronizer<D: GpuDevice> {
    device: Arc<D>,
    fence: FenceId,
    last_signalled: FenceValue,
    stall_warning: Option<Duration>,
    lost: Cell<bool>,
}

impl<D: GpuDevice> FenceSynchronizer<D> {
    /// Create a fence starting at zero.
    ///
    /// With `stall_warning` set, waits are split into chunks of that length
    /// and a warning is logged for every chunk that elapses without
    /// completion. Waits still only return on completion.
    pub fn new(device: Arc<D>, stall_warning: Option<Duration>) -> Result<Self> {
        let fence = device.create_fence(0)?;
        Ok(Self {
            device,
            fence,
            last_signalled: FenceValue::ZERO,
            stall_warning,
            lost: Cell::new(false),
        })
    }

    /// Advance the counter and enqueue a GPU signal of the new value.
    pub fn signal(&mut self) -> Result<FenceValue> {
        self.ensure_alive()?;
        let value = self.last_signalled.next();
        self.observe(self.device.queue_signal(self.fence, value.0))?;
        self.last_signalled = value;
        trace!(fence = value.0, "Fence signalled");
        Ok(value)
    }

    /// Block until `value` is retired.
    pub fn wait_for_value(&self, value: FenceValue) -> Result<()> {
        if self.is_retired(value)? {
            return Ok(());
        }
        if value > self.last_signalled {
            return Err(GpuError::invalid_state(format!(
                "waiting on fence value {value} which was never signalled (last {})",
                self.last_signalled
            )));
        }

        let start = Instant::now();
        match self.stall_warning {
            None => {
                while !self.observe(self.device.wait_fence(self.fence, value.0, None))? {}
            }
            Some(chunk) => loop {
                if self.observe(self.device.wait_fence(self.fence, value.0, Some(chunk)))? {
                    break;
                }
                warn!(
                    fence = value.0,
                    completed = self.completed_value()?.0,
                    waited_ms = start.elapsed().as_millis(),
                    "GPU has not reached fence value"
                );
                self.observe(self.device.status())?;
            },
        }
        trace!(
            fence = value.0,
            waited_us = start.elapsed().as_micros(),
            "Fence wait complete"
        );
        Ok(())
    }

    /// Whether the GPU has finished everything up to `value`.
    pub fn is_retired(&self, value: FenceValue) -> Result<bool> {
        Ok(self.completed_value()? >= value)
    }

    /// GPU-visible completed value.
    pub fn completed_value(&self) -> Result<FenceValue> {
        self.ensure_alive()?;
        self.observe(self.device.fence_completed_value(self.fence))
            .map(FenceValue)
    }

    /// Most recently signalled value.
    pub const fn last_signalled(&self) -> FenceValue {
        self.last_signalled
    }

    /// Whether every signalled value has been retired.
    pub fn is_drained(&self) -> Result<bool> {
        self.is_retired(self.last_signalled)
    }

    /// Signal and wait for the new value: a full pipeline drain.
    pub fn flush(&mut self) -> Result<FenceValue> {
        let value = self.signal()?;
        self.wait_for_value(value)?;
        Ok(value)
    }

    /// Whether a device loss has been observed.
    pub fn is_lost(&self) -> bool {
        self.lost.get()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.lost.get() {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(GpuError::DeviceLost)) {
            self.lost.set(true);
        }
        result
    }
}

impl<D: GpuDevice> Drop for FenceSynchronizer<D> {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    #[test]
    fn signal_increments_by_one() {
        let device = Arc::new(HeadlessDevice::new().unwrap());
        let mut fence = FenceSynchronizer::new(device, None).unwrap();
        assert_eq!(fence.last_signalled(), FenceValue::ZERO);
        assert_eq!(fence.signal().unwrap(), FenceValue(1));
        assert_eq!(fence.signal().unwrap(), FenceValue(2));
        fence.wait_for_value(FenceValue(2)).unwrap();
        assert!(fence.is_retired(FenceValue(2)).unwrap());
        assert!(fence.is_drained().unwrap());
    }

    #[test]
    fn zero_is_always_retired() {
        let device = Arc::new(HeadlessDevice::new().unwrap());
        let fence = FenceSynchronizer::new(device, None).unwrap();
        assert!(fence.is_retired(FenceValue::ZERO).unwrap());
        fence.wait_for_value(FenceValue::ZERO).unwrap();
    }

    #[test]
    fn waiting_on_unsignalled_value_is_rejected() {
        let device = Arc::new(HeadlessDevice::new().unwrap());
        let fence = FenceSynchronizer::new(device, None).unwrap();
        assert!(matches!(
            fence.wait_for_value(FenceValue(3)),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn pending_value_is_not_retired_until_resumed() {
        let device = Arc::new(HeadlessDevice::new().unwrap());
        let mut fence = FenceSynchronizer::new(device.clone(), None).unwrap();
        device.pause();
        let value = fence.signal().unwrap();
        assert!(!fence.is_retired(value).unwrap());
        device.resume();
        fence.wait_for_value(value).unwrap();
        assert!(fence.is_retired(value).unwrap());
    }

    #[test]
    fn stall_warning_wait_still_completes() {
        let device = Arc::new(HeadlessDevice::new().unwrap());
        let mut fence =
            FenceSynchronizer::new(device.clone(), Some(Duration::from_millis(5))).unwrap();
        device.pause();
        let value = fence.signal().unwrap();
        let resumer = {
            let device = device.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                device.resume();
            })
        };
        fence.wait_for_value(value).unwrap();
        resumer.join().unwrap();
        assert!(fence.is_drained().unwrap());
    }

    #[test]
    fn device_loss_is_sticky() {
        let device = Arc::new(HeadlessDevice::new().unwrap());
        let mut fence = FenceSynchronizer::new(device.clone(), None).unwrap();
        fence.flush().unwrap();
        device.lose_device();
        assert_eq!(fence.signal(), Err(GpuError::DeviceLost));
        assert!(fence.is_lost());
        assert_eq!(fence.completed_value(), Err(GpuError::DeviceLost));
        assert_eq!(fence.last_signalled(), FenceValue(1));
    }
}
