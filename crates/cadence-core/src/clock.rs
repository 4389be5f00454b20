//! Clock sources for frame timing.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Supplies elapsed and total time to the engine.
///
/// The engine only reads from the clock; whoever owns the application loop
/// advances it.
pub trait ClockSource: Send + Sync {
    /// Seconds since the clock started.
    fn total_time(&self) -> f32;

    /// Seconds between the two most recent ticks.
    fn delta_time(&self) -> f32;
}

#[derive(Debug)]
struct TimerState {
    start: Instant,
    last_tick: Instant,
    delta: Duration,
}

/// Wall-clock timer ticked once per frame.
#[derive(Debug)]
pub struct GameTimer {
    state: Mutex<TimerState>,
}

impl GameTimer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(TimerState {
                start: now,
                last_tick: now,
                delta: Duration::ZERO,
            }),
        }
    }

    /// Record a frame boundary and return the time since the previous one.
    pub fn tick(&self) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.delta = now - state.last_tick;
        state.last_tick = now;
        state.delta
    }

    /// Total time since the timer was created or reset.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().start.elapsed()
    }

    /// Reset the timer to the current time.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.start = now;
        state.last_tick = now;
        state.delta = Duration::ZERO;
    }
}

impl Default for GameTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for GameTimer {
    fn total_time(&self) -> f32 {
        self.elapsed().as_secs_f32()
    }

    fn delta_time(&self) -> f32 {
        self.state.lock().delta.as_secs_f32()
    }
}

/// Clock advanced explicitly, for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    // (total, delta)
    time: Mutex<(f32, f32)>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `seconds`.
    pub fn advance(&self, seconds: f32) {
        let mut time = self.time.lock();
        time.0 += seconds;
        time.1 = seconds;
    }
}

impl ClockSource for ManualClock {
    fn total_time(&self) -> f32 {
        self.time.lock().0
    }

    fn delta_time(&self) -> f32 {
        self.time.lock().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn manual_clock_accumulates() {
        let clock = ManualClock::new();
        clock.advance(0.25);
        clock.advance(0.5);
        assert_relative_eq!(clock.total_time(), 0.75);
        assert_relative_eq!(clock.delta_time(), 0.5);
    }

    #[test]
    fn game_timer_is_monotonic() {
        let timer = GameTimer::new();
        let first = timer.total_time();
        timer.tick();
        assert!(timer.total_time() >= first);
        assert!(timer.delta_time() >= 0.0);
    }
}
