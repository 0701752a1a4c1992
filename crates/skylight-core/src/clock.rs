// SPDX-License-Identifier: CEPL-1.0
use std::time::{Duration, Instant};

/// One tick of the frame clock.
#[derive(Debug, Clone, Copy)]
pub struct FrameTime {
    /// Seconds since the previous tick, clamped.
    pub dt: f32,
    /// Seconds since the clock was created (or last reset).
    pub elapsed: f32,
    pub frame_index: u64,
}

/// Per-run clock handed to `update` explicitly, so nothing in the engine keeps
/// timing state in statics.
#[derive(Debug, Clone)]
pub struct FrameClock {
    start: Instant,
    last: Instant,
    frame_index: u64,
    dt_max: Duration,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClock {
    pub fn new() -> Self {
        Self::with_max_dt(Duration::from_millis(250))
    }

    /// Long stalls (debugger, minimized window) report at most `dt_max`.
    pub fn with_max_dt(dt_max: Duration) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last: now,
            frame_index: 0,
            dt_max,
        }
    }

    pub fn reset(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last = now;
        self.frame_index = 0;
    }

    pub fn tick(&mut self) -> FrameTime {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> FrameTime {
        let dt = now.saturating_duration_since(self.last).min(self.dt_max);
        self.last = now;

        let t = FrameTime {
            dt: dt.as_secs_f32(),
            elapsed: now.saturating_duration_since(self.start).as_secs_f32(),
            frame_index: self.frame_index,
        };
        self.frame_index += 1;
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_counts_ticks() {
        let mut clock = FrameClock::new();
        assert_eq!(clock.tick().frame_index, 0);
        assert_eq!(clock.tick().frame_index, 1);
        assert_eq!(clock.tick().frame_index, 2);
    }

    #[test]
    fn dt_is_clamped_after_a_stall() {
        let mut clock = FrameClock::with_max_dt(Duration::from_millis(10));
        let later = clock.last + Duration::from_secs(5);
        let t = clock.tick_at(later);
        assert!((t.dt - 0.010).abs() < 1e-6);
        // elapsed is not clamped
        assert!((t.elapsed - 5.0).abs() < 1e-3);
    }

    #[test]
    fn reset_restarts_elapsed_and_index() {
        let mut clock = FrameClock::new();
        let later = clock.last + Duration::from_secs(3);
        clock.tick_at(later);
        clock.reset();
        let t = clock.tick();
        assert_eq!(t.frame_index, 0);
        assert!(t.elapsed < 1.0);
    }
}
