//! Frame rate statistics.

/// Averages over the most recent one-second window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameStats {
    pub fps: f32,
    pub ms_per_frame: f32,
}

/// Counts presented frames and publishes [`FrameStats`] once per second of
/// clock time.
#[derive(Debug, Clone, Default)]
pub struct FrameStatsAccumulator {
    frame_count: u32,
    window_start: f32,
    latest: FrameStats,
}

impl FrameStatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one frame at `total_time` seconds.
    ///
    /// Returns the new averages when a window closed on this frame.
    pub fn record_frame(&mut self, total_time: f32) -> Option<FrameStats> {
        self.frame_count += 1;

        let elapsed = total_time - self.window_start;
        if elapsed < 1.0 {
            return None;
        }

        #[allow(clippy::cast_precision_loss)]
        let fps = self.frame_count as f32 / elapsed;
        self.latest = FrameStats {
            fps,
            ms_per_frame: 1000.0 / fps,
        };
        self.frame_count = 0;
        // A stall longer than a window closes it once instead of catching up.
        if elapsed >= 2.0 {
            self.window_start = total_time;
        } else {
            self.window_start += 1.0;
        }
        Some(self.latest)
    }

    /// Averages from the last closed window.
    pub const fn latest(&self) -> FrameStats {
        self.latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn publishes_once_per_second() {
        let mut stats = FrameStatsAccumulator::new();
        let mut published = Vec::new();
        // 120 frames at 1/60 s over two seconds.
        for frame in 1..=120 {
            #[allow(clippy::cast_precision_loss)]
            let t = frame as f32 / 60.0;
            if let Some(s) = stats.record_frame(t) {
                published.push(s);
            }
        }
        assert_eq!(published.len(), 2);
        assert_relative_eq!(published[0].fps, 60.0, epsilon = 1.0);
        assert_relative_eq!(published[0].ms_per_frame, 1000.0 / published[0].fps);
        assert_eq!(stats.latest(), published[1]);
    }

    #[test]
    fn long_gap_closes_a_single_window() {
        let mut stats = FrameStatsAccumulator::new();
        let mut published = Vec::new();
        let mut times: Vec<f32> = (1..=60u8).map(|f| f32::from(f) / 60.0).collect();
        times.extend((0..=10u8).map(|f| 6.0 + f32::from(f) / 60.0));
        for t in times {
            if let Some(s) = stats.record_frame(t) {
                published.push(s);
            }
        }

        assert_eq!(published.len(), 2);
        assert_relative_eq!(published[0].fps, 60.0, epsilon = 1.0);
        // One frame over the five second stall.
        assert_relative_eq!(published[1].fps, 0.2, epsilon = 0.01);
        assert_relative_eq!(published[1].ms_per_frame, 5000.0, epsilon = 50.0);
    }

    #[test]
    fn nothing_before_first_window() {
        let mut stats = FrameStatsAccumulator::new();
        assert!(stats.record_frame(0.1).is_none());
        assert_eq!(stats.latest(), FrameStats::default());
    }
}
