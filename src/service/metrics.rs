//! Per-service rolling metrics: invocation counts, pending-wait time
//! distribution, last-invoked timestamp, remote-invocation count.
//!
//! Grounded on the teacher crate's `metrics::LatencyMetrics`
//! (`src/metrics.rs`), which wraps an `hdrhistogram::Histogram` for
//! latency percentiles; generalized here from a one-shot benchmark
//! summary into a standing per-`ServiceEntry` counter that accumulates
//! across the service's lifetime and is emitted in batches via
//! `domain::event::ServiceEvent::Call` per §4.4.

use hdrhistogram::Histogram;
use std::time::{Duration, SystemTime};

/// Rolling metrics for one service entry. Cheap to construct; the
/// histogram tracks pending-wait microseconds up to one minute with
/// three significant figures, matching the precision the teacher's
/// `MetricsCollector` uses for latency.
pub struct ServiceMetrics {
    invocation_count: u64,
    remote_invocation_count: u64,
    last_invoked: Option<SystemTime>,
    pending_wait: Histogram<u64>,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            invocation_count: 0,
            remote_invocation_count: 0,
            last_invoked: None,
            pending_wait: Histogram::new_with_bounds(1, 60_000_000, 3)
                .expect("static histogram bounds are valid"),
        }
    }

    /// Record one completed call. `remote` distinguishes a concurrent
    /// (gateway-backed) instance invocation from a local sequential one.
    pub fn record_call(&mut self, pending_wait: Duration, remote: bool) {
        self.invocation_count += 1;
        if remote {
            self.remote_invocation_count += 1;
        }
        self.last_invoked = Some(SystemTime::now());
        let micros = pending_wait.as_micros().clamp(1, 60_000_000) as u64;
        let _ = self.pending_wait.record(micros);
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocation_count
    }

    pub fn remote_invocation_count(&self) -> u64 {
        self.remote_invocation_count
    }

    pub fn last_invoked(&self) -> Option<SystemTime> {
        self.last_invoked
    }

    pub fn pending_wait_percentile(&self, percentile: f64) -> Duration {
        Duration::from_micros(self.pending_wait.value_at_percentile(percentile))
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_invocation_and_remote_counts_separately() {
        let mut metrics = ServiceMetrics::new();
        metrics.record_call(Duration::from_micros(100), false);
        metrics.record_call(Duration::from_micros(200), true);

        assert_eq!(metrics.invocation_count(), 2);
        assert_eq!(metrics.remote_invocation_count(), 1);
        assert!(metrics.last_invoked().is_some());
    }

    #[test]
    fn pending_wait_percentile_reflects_recorded_samples() {
        let mut metrics = ServiceMetrics::new();
        for _ in 0..100 {
            metrics.record_call(Duration::from_micros(50), false);
        }
        let p99 = metrics.pending_wait_percentile(99.0);
        assert!(p99.as_micros() >= 50);
    }
}
