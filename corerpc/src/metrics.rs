//! Metrics: per-service/per-method counters, latency percentiles, and a
//! periodic reporter (spec.md §4.15).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use log::info;
use tokio::task::JoinHandle;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Bounded ring of recent response times used for percentile estimates;
/// halves in place on overflow (spec.md §4.15).
const SAMPLE_CAP: usize = 10_000;

struct MethodMetrics {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    sum_response_ms: AtomicU64,
    min_response_ms: AtomicI64,
    max_response_ms: AtomicI64,
    first_request_ms: AtomicI64,
    last_request_ms: AtomicI64,
    samples: Mutex<Vec<u64>>,
}

impl MethodMetrics {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            sum_response_ms: AtomicU64::new(0),
            min_response_ms: AtomicI64::new(i64::MAX),
            max_response_ms: AtomicI64::new(0),
            first_request_ms: AtomicI64::new(0),
            last_request_ms: AtomicI64::new(0),
            samples: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, response_ms: u64, success: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.sum_response_ms.fetch_add(response_ms, Ordering::Relaxed);
        self.min_response_ms.fetch_min(response_ms as i64, Ordering::Relaxed);
        self.max_response_ms.fetch_max(response_ms as i64, Ordering::Relaxed);

        let now = now_ms();
        self.first_request_ms.compare_exchange(0, now, Ordering::Relaxed, Ordering::Relaxed).ok();
        self.last_request_ms.store(now, Ordering::Relaxed);

        let mut samples = self.samples.lock().unwrap();
        samples.push(response_ms);
        if samples.len() > SAMPLE_CAP {
            // Halve the ring, keeping every other sample, rather than
            // dropping the oldest half outright (spec.md §4.15).
            let halved: Vec<u64> = samples.iter().step_by(2).copied().collect();
            *samples = halved;
        }
    }

    fn snapshot(&self, service: &str, method: &str) -> MethodSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let success = self.success.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let sum = self.sum_response_ms.load(Ordering::Relaxed);
        let min = self.min_response_ms.load(Ordering::Relaxed);
        let max = self.max_response_ms.load(Ordering::Relaxed);
        let first = self.first_request_ms.load(Ordering::Relaxed);
        let last = self.last_request_ms.load(Ordering::Relaxed);

        let mut samples = self.samples.lock().unwrap().clone();
        samples.sort_unstable();
        let p95 = percentile(&samples, 0.95);
        let p99 = percentile(&samples, 0.99);

        let elapsed_secs = ((last - first).max(0) as f64 / 1000.0).max(1.0);
        let qps = if total == 0 { 0.0 } else { total as f64 / elapsed_secs };

        MethodSnapshot {
            service: service.to_string(),
            method: method.to_string(),
            total,
            success,
            failed,
            avg_response_ms: if total == 0 { 0.0 } else { sum as f64 / total as f64 },
            min_response_ms: if total == 0 { 0 } else { min },
            max_response_ms: max,
            p95_response_ms: p95,
            p99_response_ms: p99,
            qps,
        }
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Immutable value object returned by [`MetricsManager::snapshot`]
/// (spec.md §4.15).
#[derive(Debug, Clone)]
pub struct MethodSnapshot {
    pub service: String,
    pub method: String,
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub avg_response_ms: f64,
    pub min_response_ms: i64,
    pub max_response_ms: i64,
    pub p95_response_ms: u64,
    pub p99_response_ms: u64,
    pub qps: f64,
}

/// Process-wide metrics manager, keyed by `service#method` (spec.md §4.15,
/// §6).
pub struct MetricsManager {
    methods: DashMap<(String, String), MethodMetrics>,
}

impl MetricsManager {
    pub fn new() -> Self {
        Self {
            methods: DashMap::new(),
        }
    }

    pub fn record(&self, service: &str, method: &str, response_ms: u64, success: bool) {
        self.methods
            .entry((service.to_string(), method.to_string()))
            .or_insert_with(MethodMetrics::new)
            .record(response_ms, success);
    }

    pub fn snapshot(&self, service: &str, method: &str) -> Option<MethodSnapshot> {
        self.methods
            .get(&(service.to_string(), method.to_string()))
            .map(|m| m.snapshot(service, method))
    }

    pub fn snapshot_all(&self) -> Vec<MethodSnapshot> {
        self.methods
            .iter()
            .map(|entry| {
                let (service, method) = entry.key();
                entry.snapshot(service, method)
            })
            .collect()
    }

    /// Spawns a task that logs snapshots every `interval`, returning its
    /// handle so the caller can abort it on shutdown (spec.md §4.15, §4.16).
    pub fn spawn_periodic_reporter(
        self: std::sync::Arc<Self>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for snapshot in self.snapshot_all() {
                    info!(
                        "metrics {}::{} total={} success={} failed={} p95={}ms p99={}ms qps={:.2}",
                        snapshot.service,
                        snapshot.method,
                        snapshot.total,
                        snapshot.success,
                        snapshot.failed,
                        snapshot.p95_response_ms,
                        snapshot.p99_response_ms,
                        snapshot.qps
                    );
                }
            }
        })
    }
}

impl Default for MetricsManager {
    fn default() -> Self {
        Self::new()
    }
}

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(30);
