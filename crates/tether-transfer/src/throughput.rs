use std::time::{Duration, Instant};

/// How often the throughput figure is refreshed.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(1000);

/// Byte counts for an in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
    pub bytes_per_sec: f64,
}

impl TransferProgress {
    /// Completion fraction in `0.0..=1.0`. An empty file counts as complete.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.transferred as f64 / self.total as f64).min(1.0)
    }

    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }
}

/// Windowed bytes-per-second meter.
///
/// Bytes accumulate until at least one interval has elapsed, then the rate
/// is recomputed from that window and the window restarts.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    interval: Duration,
    window_start: Option<Instant>,
    window_bytes: u64,
    rate: f64,
}

impl ThroughputMeter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: None,
            window_bytes: 0,
            rate: 0.0,
        }
    }

    /// Add `bytes` to the current window. Returns the new rate when a sample
    /// was taken.
    pub fn record(&mut self, bytes: u64, now: Instant) -> Option<f64> {
        let start = *self.window_start.get_or_insert(now);
        self.window_bytes += bytes;

        let elapsed = now.saturating_duration_since(start);
        if elapsed < self.interval {
            return None;
        }
        self.rate = self.window_bytes as f64 / elapsed.as_secs_f64();
        self.window_start = Some(now);
        self.window_bytes = 0;
        Some(self.rate)
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.rate
    }

    pub fn reset(&mut self) {
        self.window_start = None;
        self.window_bytes = 0;
        self.rate = 0.0;
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new(SAMPLE_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_sampled_per_interval() {
        let t0 = Instant::now();
        let mut meter = ThroughputMeter::default();

        assert_eq!(meter.record(1000, t0), None);
        assert_eq!(meter.record(1000, t0 + Duration::from_millis(500)), None);
        assert_eq!(meter.bytes_per_sec(), 0.0);

        let rate = meter.record(2000, t0 + Duration::from_millis(2000)).unwrap();
        assert!((rate - 2000.0).abs() < 1e-9);

        // Next window starts from the sample point.
        assert_eq!(meter.record(500, t0 + Duration::from_millis(2500)), None);
        let rate = meter.record(500, t0 + Duration::from_millis(3000)).unwrap();
        assert!((rate - 1000.0).abs() < 1e-9);

        meter.reset();
        assert_eq!(meter.bytes_per_sec(), 0.0);
    }

    #[test]
    fn test_progress_fraction() {
        let p = TransferProgress { transferred: 65_536, total: 150_000, bytes_per_sec: 0.0 };
        assert!((p.fraction() - 0.436_906_666).abs() < 1e-6);

        let empty = TransferProgress { transferred: 0, total: 0, bytes_per_sec: 0.0 };
        assert_eq!(empty.percent(), 100.0);

        let over = TransferProgress { transferred: 20, total: 10, bytes_per_sec: 0.0 };
        assert_eq!(over.fraction(), 1.0);
    }
}
