//! Rolling frames-per-second estimate, sampled every 10 frames over a
//! 10-sample ring, matching the telemetry `FrameBoundary` sends the
//! controller each frame (`Fps` message: rendered fps, logical fps).

use std::time::Instant;

const RING_LEN: usize = 10;
const SAMPLE_CADENCE: u64 = 10;

pub struct FpsCounter {
    samples: [f32; RING_LEN],
    logical_samples: [f32; RING_LEN],
    next: usize,
    filled: usize,
    last_sample_at: Instant,
    last_sample_frame: u64,
    last_logical_count: u64,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            samples: [0.0; RING_LEN],
            logical_samples: [0.0; RING_LEN],
            next: 0,
            filled: 0,
            last_sample_at: now,
            last_sample_frame: 0,
            last_logical_count: 0,
        }
    }

    /// Called once per frame. `framecount` is the harness's own frame
    /// counter; `logical_advances` counts virtual-clock advances
    /// (distinct from rendered frames when fastforward skips draws).
    /// Returns `Some((fps, logical_fps))` every `SAMPLE_CADENCE` frames.
    pub fn tick(&mut self, now: Instant, framecount: u64, logical_advances: u64) -> Option<(f32, f32)> {
        if framecount == 0 || framecount % SAMPLE_CADENCE != 0 || framecount == self.last_sample_frame {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last_sample_at).as_secs_f32();
        let frames = (framecount - self.last_sample_frame) as f32;
        let logical = (logical_advances - self.last_logical_count) as f32;

        self.last_sample_at = now;
        self.last_sample_frame = framecount;
        self.last_logical_count = logical_advances;

        if elapsed <= 0.0 {
            return None;
        }

        self.samples[self.next] = frames / elapsed;
        self.logical_samples[self.next] = logical / elapsed;
        self.next = (self.next + 1) % RING_LEN;
        self.filled = (self.filled + 1).min(RING_LEN);

        let fps = self.samples[..self.filled].iter().sum::<f32>() / self.filled as f32;
        let lfps = self.logical_samples[..self.filled].iter().sum::<f32>() / self.filled as f32;
        Some((fps, lfps))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::time::Duration;

    #[test]
    fn samples_only_at_cadence_boundaries() {
        let start = Instant::now();
        let mut counter = FpsCounter::new(start);
        for frame in 1..10 {
            assert!(counter.tick(start + Duration::from_millis(frame * 16), frame, frame).is_none());
        }
        assert!(counter.tick(start + Duration::from_millis(160), 10, 10).is_some());
    }
}
