//! Frame timing

use std::time::{Duration, Instant};

/// Longest delta reported to the application, so a stall does not turn into a
/// single huge simulation step.
const MAX_DELTA: Duration = Duration::from_millis(250);

/// Delta-time clock ticked once per frame
#[derive(Debug)]
pub struct FrameClock {
    last_tick: Instant,
    delta: Duration,
    total: Duration,
    frame_count: u64,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClock {
    /// Create a clock starting now
    pub fn new() -> Self {
        Self {
            last_tick: Instant::now(),
            delta: Duration::ZERO,
            total: Duration::ZERO,
            frame_count: 0,
        }
    }

    /// Advance to `now` and return the clamped delta in seconds
    pub fn tick_at(&mut self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.delta = elapsed.min(MAX_DELTA);
        self.total += elapsed;
        self.last_tick = now;
        self.frame_count += 1;
        self.delta.as_secs_f32()
    }

    /// Advance to the current instant
    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    /// Seconds covered by the last tick
    pub fn delta_seconds(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    /// Total unclamped time since creation
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Number of ticks so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Average frames per second since creation
    #[allow(clippy::cast_precision_loss)]
    pub fn average_fps(&self) -> f32 {
        let total = self.total.as_secs_f32();
        if total > 0.0 {
            self.frame_count as f32 / total
        } else {
            0.0
        }
    }
}
