//! Timers
//!
//! Scoped and rolling timers used to report streaming costs (per-frame
//! update time, import stages, load latency).

use std::time::{Duration, Instant};

/// Monotonic stopwatch
#[derive(Debug, Clone, Copy)]
pub struct HighResTimer {
    start: Instant,
}

impl HighResTimer {
    /// Create and start a new timer
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    /// Restart the timer
    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    /// Elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed time in milliseconds
    pub fn elapsed_millis(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for HighResTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped timer that reports its duration on drop
pub struct ScopedTimer<'a> {
    name: &'a str,
    start: Instant,
    callback: Option<Box<dyn FnMut(&str, Duration) + 'a>>,
}

impl<'a> ScopedTimer<'a> {
    /// Create a scoped timer that hands its duration to `callback`
    pub fn new<F>(name: &'a str, callback: F) -> Self
    where
        F: FnMut(&str, Duration) + 'a,
    {
        Self {
            name,
            start: Instant::now(),
            callback: Some(Box::new(callback)),
        }
    }

    /// Create a scoped timer that logs to tracing
    pub fn traced(name: &'a str) -> Self {
        Self {
            name,
            start: Instant::now(),
            callback: None,
        }
    }

    /// Elapsed time so far
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        match self.callback.take() {
            Some(mut callback) => callback(self.name, duration),
            None => tracing::debug!(
                target: "timing",
                name = self.name,
                duration_us = duration.as_micros() as u64,
                "Timer completed"
            ),
        }
    }
}

/// Fixed-window rolling average over duration samples
#[derive(Debug, Clone)]
pub struct RollingTimer {
    samples: Vec<f64>,
    index: usize,
    count: usize,
}

impl RollingTimer {
    /// Create a rolling timer keeping `sample_count` samples
    pub fn new(sample_count: usize) -> Self {
        Self {
            samples: vec![0.0; sample_count.max(1)],
            index: 0,
            count: 0,
        }
    }

    /// Record a sample in seconds
    pub fn record(&mut self, sample: f64) {
        self.samples[self.index] = sample;
        self.index = (self.index + 1) % self.samples.len();
        self.count = (self.count + 1).min(self.samples.len());
    }

    /// Record a sample from a duration
    pub fn record_duration(&mut self, duration: Duration) {
        self.record(duration.as_secs_f64());
    }

    /// Average of the recorded samples, 0 when empty
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.samples.iter().take(self.count).sum::<f64>() / self.count as f64
    }

    /// Average in milliseconds
    pub fn average_millis(&self) -> f64 {
        self.average() * 1000.0
    }

    /// Largest recorded sample
    pub fn max(&self) -> f64 {
        self.samples
            .iter()
            .take(self.count)
            .copied()
            .fold(0.0, f64::max)
    }

    /// Number of samples currently held
    pub fn count(&self) -> usize {
        self.count
    }
}
