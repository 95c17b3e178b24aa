//! Download rate estimation
//!
//! Exponentially weighted moving average over a fixed time window. Sampled
//! on the progress tick; the smoothing factor adapts to the actual elapsed
//! time between samples (α = 1 − e^(−dt/window)), so an uneven tick cadence
//! does not skew the estimate.

use std::time::{Duration, Instant};

/// EWMA rate meter.
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    rate: f64,
    pending_bytes: u64,
    last_sample: Instant,
}

impl SpeedMeter {
    /// Standard 3-second window used for the published job speed.
    pub const WINDOW: Duration = Duration::from_secs(3);

    pub fn new(window: Duration) -> Self {
        Self {
            window,
            rate: 0.0,
            pending_bytes: 0,
            last_sample: Instant::now(),
        }
    }

    /// Record bytes written since the last sample.
    pub fn record(&mut self, bytes: u64) {
        self.pending_bytes += bytes;
    }

    /// Fold the pending bytes into the average and return the current rate.
    pub fn sample(&mut self) -> u64 {
        let now = Instant::now();
        let dt = now.duration_since(self.last_sample).as_secs_f64();
        if dt <= 0.0 {
            return self.rate as u64;
        }

        let instantaneous = self.pending_bytes as f64 / dt;
        let alpha = 1.0 - (-dt / self.window.as_secs_f64()).exp();
        self.rate = alpha * instantaneous + (1.0 - alpha) * self.rate;

        self.pending_bytes = 0;
        self.last_sample = now;
        self.rate as u64
    }

    /// Current rate without folding in new data.
    pub fn rate(&self) -> u64 {
        self.rate as u64
    }
}
