//! Prometheus metrics for job masters
//!
//! Each master owns a `MasterMetrics` set registered under its ID; the
//! registry renders all of them in Prometheus text format with a
//! `master_id` label.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

/// Counter metric (monotonically increasing)
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram for latency measurements
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::with_buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    }
}

impl Histogram {
    pub fn with_buckets(bounds: Vec<f64>) -> Self {
        Self {
            buckets: bounds.into_iter().map(|b| (b, AtomicU64::new(0))).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Observe a value in seconds
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn write_prometheus(&self, out: &mut String, name: &str, label: &str) {
        for (bound, count) in &self.buckets {
            out.push_str(&format!(
                "{}_bucket{{{},le=\"{}\"}} {}\n",
                name,
                label,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "{}_bucket{{{},le=\"+Inf\"}} {}\n",
            name,
            label,
            self.count()
        ));
        let sum_secs = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        out.push_str(&format!("{}_sum{{{}}} {}\n", name, label, sum_secs));
        out.push_str(&format!("{}_count{{{}}} {}\n", name, label, self.count()));
    }
}

/// Metrics of a single master
#[derive(Default)]
pub struct MasterMetrics {
    pub workers_created: Counter,
    pub worker_create_failures: Counter,
    pub worker_offline: Counter,
    pub online_workers: Gauge,
    pub dispatch_duration: Histogram,
}

const WORKERS_CREATED: (&str, &str) = (
    "flowmaster_workers_created_total",
    "Workers successfully dispatched",
);
const CREATE_FAILURES: (&str, &str) = (
    "flowmaster_worker_create_failures_total",
    "Worker creations that failed",
);
const WORKER_OFFLINE: (&str, &str) = (
    "flowmaster_worker_offline_total",
    "Workers that went offline",
);
const ONLINE_WORKERS: (&str, &str) = ("flowmaster_online_workers", "Workers currently online");
const DISPATCH_DURATION: (&str, &str) = (
    "flowmaster_worker_dispatch_duration_seconds",
    "Latency of the schedule and dispatch sequence",
);

fn header(out: &mut String, (name, help): (&str, &str), kind: &str) {
    out.push_str(&format!("# HELP {} {}\n# TYPE {} {}\n", name, help, name, kind));
}

/// Per-master metric sets keyed by master ID
#[derive(Default)]
pub struct MetricsRegistry {
    masters: RwLock<BTreeMap<String, Arc<MasterMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics for `master_id`, created on first use
    pub fn master(&self, master_id: &str) -> Arc<MasterMetrics> {
        if let Some(metrics) = self.masters.read().get(master_id) {
            return metrics.clone();
        }
        self.masters
            .write()
            .entry(master_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the metrics of a closed master
    pub fn unregister(&self, master_id: &str) {
        self.masters.write().remove(master_id);
    }

    pub fn is_registered(&self, master_id: &str) -> bool {
        self.masters.read().contains_key(master_id)
    }

    /// Export all metrics in Prometheus format
    pub fn export(&self) -> String {
        let masters = self.masters.read();
        let mut out = String::new();
        let label = |id: &str| format!("master_id=\"{}\"", id);

        let counters: [(_, fn(&MasterMetrics) -> &Counter); 3] = [
            (WORKERS_CREATED, |m| &m.workers_created),
            (CREATE_FAILURES, |m| &m.worker_create_failures),
            (WORKER_OFFLINE, |m| &m.worker_offline),
        ];
        for (meta, get) in counters {
            header(&mut out, meta, "counter");
            for (id, metrics) in masters.iter() {
                out.push_str(&format!("{}{{{}}} {}\n", meta.0, label(id), get(metrics).get()));
            }
        }

        header(&mut out, ONLINE_WORKERS, "gauge");
        for (id, metrics) in masters.iter() {
            out.push_str(&format!(
                "{}{{{}}} {}\n",
                ONLINE_WORKERS.0,
                label(id),
                metrics.online_workers.get()
            ));
        }

        header(&mut out, DISPATCH_DURATION, "histogram");
        for (id, metrics) in masters.iter() {
            metrics
                .dispatch_duration
                .write_prometheus(&mut out, DISPATCH_DURATION.0, &label(id));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::default();
        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);

        let gauge = Gauge::default();
        gauge.set(10);
        gauge.dec();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 9);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::default();
        histogram.observe(0.001);
        histogram.observe(0.02);
        histogram.observe_duration(Duration::from_millis(300));
        assert_eq!(histogram.count(), 3);

        let mut out = String::new();
        histogram.write_prometheus(&mut out, "h", "master_id=\"m\"");
        assert!(out.contains("h_count{master_id=\"m\"} 3"));
        assert!(out.contains("h_bucket{master_id=\"m\",le=\"0.005\"} 1"));
        assert!(out.contains("h_bucket{master_id=\"m\",le=\"+Inf\"} 3"));
    }

    #[test]
    fn test_registry_per_master() {
        let registry = MetricsRegistry::new();
        registry.master("job-a").workers_created.inc();
        registry.master("job-a").workers_created.inc();
        registry.master("job-b").online_workers.set(4);

        let text = registry.export();
        assert!(text.contains("flowmaster_workers_created_total{master_id=\"job-a\"} 2"));
        assert!(text.contains("flowmaster_online_workers{master_id=\"job-b\"} 4"));

        registry.unregister("job-a");
        assert!(!registry.is_registered("job-a"));
        assert!(!registry.export().contains("job-a"));
    }
}
