//! Metrics collection and reporting
//!
//! Counters go to the `metrics` facade, which is a no-op unless an exporter is
//! installed, and are mirrored locally for `get_stats`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use kwatch_system::DispatchStats;
use metrics::{counter, gauge};

use crate::report::EventReport;

/// Metrics collector for daemon statistics
pub struct MetricsCollector {
    start_time: Instant,
    events_reported: AtomicU64,
    queue_overflows: AtomicU64,
    unresolved_events: AtomicU64,
    watched_paths: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            events_reported: AtomicU64::new(0),
            queue_overflows: AtomicU64::new(0),
            unresolved_events: AtomicU64::new(0),
            watched_paths: AtomicU64::new(0),
        }
    }

    /// Record a reported event
    pub fn record_event(&self, report: &EventReport) {
        counter!("kwatch_events_total").increment(1);
        self.events_reported.fetch_add(1, Ordering::Relaxed);

        for kind in &report.kinds {
            counter!("kwatch_events_by_kind_total", "kind" => kind.as_str()).increment(1);
        }
    }

    /// Mirror the dispatcher's running totals and live watch count
    pub fn record_dispatch(&self, stats: &DispatchStats, watched_paths: usize) {
        counter!("kwatch_queue_overflows_total").absolute(stats.overflows);
        counter!("kwatch_unresolved_events_total").absolute(stats.unresolved_dropped);
        self.queue_overflows.store(stats.overflows, Ordering::Relaxed);
        self.unresolved_events
            .store(stats.unresolved_dropped, Ordering::Relaxed);
        self.set_watched_paths(watched_paths);
    }

    pub fn set_watched_paths(&self, count: usize) {
        gauge!("kwatch_watched_paths").set(count as f64);
        self.watched_paths.store(count as u64, Ordering::Relaxed);
    }

    /// Get current statistics
    pub fn get_stats(&self) -> MetricsStats {
        MetricsStats {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            events_reported: self.events_reported.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            unresolved_events: self.unresolved_events.load(Ordering::Relaxed),
            watched_paths: self.watched_paths.load(Ordering::Relaxed),
        }
    }

    pub fn events_per_second(&self) -> f64 {
        let events = self.events_reported.load(Ordering::Relaxed);
        let uptime = self.start_time.elapsed().as_secs_f64();

        if uptime > 0.0 {
            events as f64 / uptime
        } else {
            0.0
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsStats {
    pub uptime_seconds: u64,
    pub events_reported: u64,
    pub queue_overflows: u64,
    pub unresolved_events: u64,
    pub watched_paths: u64,
}
