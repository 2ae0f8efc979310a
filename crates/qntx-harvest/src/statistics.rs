//! Frame counters and rates for one acquisition session

use std::time::{Duration, Instant};

use serde::Serialize;

/// Running statistics, mutated only under the session mutex.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    first_image_at: Option<Instant>,
    elapsed: Duration,
    timestamp_base: Option<u64>,
    fps: f64,
    fps_max: f64,
    num_images: u64,
    num_dropped: u64,
    num_incomplete: u64,
}

/// Read-only copy handed to callers
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub num_images: u64,
    pub elapsed_secs: f64,
    pub fps: f64,
    pub fps_max: f64,
    /// Buffers discarded by the backpressure policy
    pub num_dropped: u64,
    /// Deliveries the producer flagged incomplete
    pub num_incomplete: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero everything. Called once per session start.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Count one image and refresh elapsed time since the first image.
    pub fn increment(&mut self) {
        self.increment_at(Instant::now());
    }

    pub(crate) fn increment_at(&mut self, now: Instant) {
        let first = *self.first_image_at.get_or_insert(now);
        self.elapsed = now.saturating_duration_since(first);
        self.num_images += 1;
    }

    pub fn record_dropped(&mut self) {
        self.num_dropped += 1;
    }

    pub fn record_incomplete(&mut self) {
        self.num_incomplete += 1;
    }

    /// Refresh the frame rate from a producer timestamp in ticks of `freq` Hz.
    ///
    /// The first timestamp only sets the base. Without a timestamp or a
    /// frequency the rate is derived from wall-clock time instead.
    pub fn update_timestamp(&mut self, timestamp: Option<u64>, freq: Option<u64>) {
        match (timestamp, freq) {
            (Some(ts), Some(freq)) if freq > 0 => {
                let Some(base) = self.timestamp_base.replace(ts) else {
                    return;
                };
                // Equal or wrapped timestamps carry no rate
                if ts > base {
                    self.fps = freq as f64 / (ts - base) as f64;
                    self.fps_max = self.fps_max.max(self.fps);
                }
            }
            _ => {
                let secs = self.elapsed.as_secs_f64();
                if secs > 0.0 {
                    self.fps = self.num_images as f64 / secs;
                    self.fps_max = self.fps_max.max(self.fps);
                }
            }
        }
    }

    pub fn num_images(&self) -> u64 {
        self.num_images
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn fps_max(&self) -> f64 {
        self.fps_max
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            num_images: self.num_images,
            elapsed_secs: self.elapsed.as_secs_f64(),
            fps: self.fps,
            fps_max: self.fps_max,
            num_dropped: self.num_dropped,
            num_incomplete: self.num_incomplete,
        }
    }
}
