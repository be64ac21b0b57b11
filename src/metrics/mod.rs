//! Prometheus-style metrics for one cache node.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       CacheMetrics                         │
//! │  ┌───────────────┐  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  Counters     │  │   Gauges     │  │   Histograms    │  │
//! │  │ - hits/misses │  │ - entries    │  │ - load latency  │  │
//! │  │ - loads       │  │ - in flight  │  │                 │  │
//! │  │ - bypasses    │  │              │  │                 │  │
//! │  │ - invalidation│  │              │  │                 │  │
//! │  └───────────────┘  └──────────────┘  └─────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use gauges::{Gauge, GaugeGuard};
pub use histograms::{Histogram, HistogramSnapshot, HistogramTimer, LOAD_LATENCY_BUCKETS};

use std::fmt::Write as _;

/// Counters and timings of the read and invalidation paths.
#[derive(Debug)]
pub struct CacheMetrics {
    // Read path
    /// Calls to `get`.
    pub gets: Counter,
    /// Reads served from a fresh, initialized entry.
    pub hits: Counter,
    /// Reads that had to populate an entry.
    pub misses: Counter,
    /// Reads answered as absent without loading.
    pub negative_hits: Counter,
    /// Entries found older than the current revision and replaced.
    pub stale_reloads: Counter,
    /// Loader calls made while holding the init lock.
    pub loads: Counter,
    /// Loader calls that failed.
    pub load_failures: Counter,
    /// Loader calls that reported the entity absent.
    pub not_found: Counter,
    /// Reads served by a direct, uncached loader call.
    pub bypasses: Counter,
    /// Waits on another caller's initialization that timed out.
    pub wait_timeouts: Counter,
    /// Loader latency.
    pub load_latency: Histogram,
    /// Loads currently running under an init lock.
    pub loads_in_flight: Gauge,

    // Invalidation path
    /// Local and cluster invalidations issued by this node.
    pub invalidations_issued: Counter,
    /// Peer messages that changed local state.
    pub invalidations_applied: Counter,
    /// Peer messages that were duplicates or out of date.
    pub invalidations_ignored: Counter,
    /// Times the node dropped its state after losing messages.
    pub resyncs: Counter,

    /// Errors surfaced to callers, by kind.
    pub errors: LabeledCounter,
}

impl CacheMetrics {
    /// Create a zeroed metrics set.
    pub fn new() -> Self {
        Self {
            gets: Counter::new("cortado_gets_total", "Cache reads"),
            hits: Counter::new("cortado_hits_total", "Reads served from a fresh entry"),
            misses: Counter::new("cortado_misses_total", "Reads that populated an entry"),
            negative_hits: Counter::new(
                "cortado_negative_hits_total",
                "Reads answered as absent without loading",
            ),
            stale_reloads: Counter::new(
                "cortado_stale_reloads_total",
                "Stale entries replaced by a new generation",
            ),
            loads: Counter::new("cortado_loads_total", "Loader calls under the init lock"),
            load_failures: Counter::new("cortado_load_failures_total", "Failed loader calls"),
            not_found: Counter::new("cortado_not_found_total", "Loader calls that found nothing"),
            bypasses: Counter::new("cortado_bypasses_total", "Uncached direct loads"),
            wait_timeouts: Counter::new(
                "cortado_wait_timeouts_total",
                "Timed out waits on another initializer",
            ),
            load_latency: Histogram::with_buckets(
                "cortado_load_latency_seconds",
                "Loader latency",
                LOAD_LATENCY_BUCKETS.to_vec(),
            ),
            loads_in_flight: Gauge::new("cortado_loads_in_flight", "Loads holding an init lock"),
            invalidations_issued: Counter::new(
                "cortado_invalidations_issued_total",
                "Invalidations issued by this node",
            ),
            invalidations_applied: Counter::new(
                "cortado_invalidations_applied_total",
                "Peer invalidations that changed local state",
            ),
            invalidations_ignored: Counter::new(
                "cortado_invalidations_ignored_total",
                "Duplicate or outdated peer invalidations",
            ),
            resyncs: Counter::new("cortado_resyncs_total", "Local state drops after message loss"),
            errors: LabeledCounter::new("cortado_errors_total", "Errors by kind", "kind"),
        }
    }

    /// Record an error returned to a caller.
    pub fn record_error(&self, kind: &str) {
        self.errors.inc(kind);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            gets: self.gets.get(),
            hits: self.hits.get(),
            misses: self.misses.get(),
            negative_hits: self.negative_hits.get(),
            stale_reloads: self.stale_reloads.get(),
            loads: self.loads.get(),
            load_failures: self.load_failures.get(),
            not_found: self.not_found.get(),
            bypasses: self.bypasses.get(),
            wait_timeouts: self.wait_timeouts.get(),
            invalidations_applied: self.invalidations_applied.get(),
            invalidations_ignored: self.invalidations_ignored.get(),
            resyncs: self.resyncs.get(),
            load_latency: self.load_latency.snapshot(),
        }
    }

    /// Render in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        for counter in [
            &self.gets,
            &self.hits,
            &self.misses,
            &self.negative_hits,
            &self.stale_reloads,
            &self.loads,
            &self.load_failures,
            &self.not_found,
            &self.bypasses,
            &self.wait_timeouts,
            &self.invalidations_issued,
            &self.invalidations_applied,
            &self.invalidations_ignored,
            &self.resyncs,
        ] {
            let _ = write!(
                out,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n",
                name = counter.name(),
                help = counter.help(),
                value = counter.get()
            );
        }

        let gauge = &self.loads_in_flight;
        let _ = write!(
            out,
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n",
            name = gauge.name(),
            help = gauge.help(),
            value = gauge.get()
        );

        let _ = write!(
            out,
            "# HELP {name} {help}\n# TYPE {name} counter\n",
            name = self.errors.name(),
            help = self.errors.help()
        );
        for (value, count) in self.errors.get_all() {
            let _ = writeln!(
                out,
                "{name}{{{label}=\"{value}\"}} {count}",
                name = self.errors.name(),
                label = self.errors.label()
            );
        }

        let latency = self.load_latency.snapshot();
        let name = self.load_latency.name();
        let _ = write!(
            out,
            "# HELP {name} {help}\n# TYPE {name} histogram\n",
            help = self.load_latency.help()
        );
        for (upper, count) in latency.buckets.iter().zip(&latency.bucket_counts) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{upper}\"}} {count}");
        }
        let _ = write!(
            out,
            "{name}_bucket{{le=\"+Inf\"}} {count}\n{name}_sum {sum}\n{name}_count {count}\n",
            count = latency.count,
            sum = latency.sum
        );

        out
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A copy of the cache metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub negative_hits: u64,
    pub stale_reloads: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub not_found: u64,
    pub bypasses: u64,
    pub wait_timeouts: u64,
    pub invalidations_applied: u64,
    pub invalidations_ignored: u64,
    pub resyncs: u64,
    pub load_latency: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Fraction of reads served from a fresh entry.
    pub fn hit_rate(&self) -> f64 {
        if self.gets == 0 {
            0.0
        } else {
            self.hits as f64 / self.gets as f64
        }
    }

    /// Mean loader latency in milliseconds.
    pub fn avg_load_latency_ms(&self) -> f64 {
        self.load_latency.mean() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_snapshot() {
        let metrics = CacheMetrics::new();

        for _ in 0..3 {
            metrics.gets.inc();
        }
        metrics.hits.inc();
        metrics.hits.inc();
        metrics.misses.inc();
        metrics.load_latency.observe_duration(Duration::from_millis(4));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gets, 3);
        assert!((snapshot.hit_rate() - 0.666).abs() < 0.01);
        assert!((snapshot.avg_load_latency_ms() - 4.0).abs() < 0.01);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = CacheMetrics::new();
        metrics.gets.inc();
        metrics.record_error("initialization_failure");
        metrics.load_latency.observe(0.003);

        let output = metrics.to_prometheus();

        assert!(output.contains("# TYPE cortado_gets_total counter\ncortado_gets_total 1\n"));
        assert!(output.contains("cortado_errors_total{kind=\"initialization_failure\"} 1"));
        assert!(output.contains("cortado_load_latency_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(output.contains("cortado_load_latency_seconds_count 1"));
    }
}
