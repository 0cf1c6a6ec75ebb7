// src/throughput.rs

//! Byte counter that periodically logs its rate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;

const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Throughput {
    label: String,
    total: Arc<AtomicU64>,
    started: Instant,
    window_start: Instant,
    window_bytes: u64,
    interval: Duration,
}

impl Throughput {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_interval(label, DEFAULT_REPORT_INTERVAL)
    }

    pub fn with_interval(label: impl Into<String>, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            total: Arc::new(AtomicU64::new(0)),
            started: now,
            window_start: now,
            window_bytes: 0,
            interval,
        }
    }

    /// Counter other threads can read while the meter is in use.
    #[must_use]
    pub fn total_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.total)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn record(&mut self, bytes: usize) {
        self.total.fetch_add(bytes as u64, Ordering::Relaxed);
        self.window_bytes += bytes as u64;

        let elapsed = self.window_start.elapsed();
        if elapsed >= self.interval {
            info!(
                "{}: {:.2} MB/s ({} bytes total)",
                self.label,
                mb_per_sec(self.window_bytes, elapsed),
                self.total()
            );
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }

    /// Average rate since creation, in MB/s.
    #[must_use]
    pub fn average(&self) -> f64 {
        mb_per_sec(self.total(), self.started.elapsed())
    }
}

fn mb_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 / 1_000_000.0 / secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_shared() {
        let mut meter = Throughput::with_interval("test", Duration::ZERO);
        let handle = meter.total_handle();
        meter.record(100);
        meter.record(23);
        assert_eq!(meter.total(), 123);
        assert_eq!(handle.load(Ordering::Relaxed), 123);
    }

    #[test]
    fn zero_elapsed_rate_is_zero() {
        assert_eq!(mb_per_sec(1_000, Duration::ZERO), 0.0);
        assert_eq!(mb_per_sec(2_000_000, Duration::from_secs(2)), 1.0);
    }
}
