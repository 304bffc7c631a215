//! Rate limiters: token bucket and sliding window, multi-level keying
//! (spec.md §4.11).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::{Result, RpcError};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: i64,
    pub rate_per_sec: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            rate_per_sec: 100.0,
        }
    }
}

/// `(tokens, last_refill)` packed as two atomics; refill and deduction race
/// via compare-and-swap retry loops rather than a lock (spec.md §4.11).
struct TokenBucket {
    tokens_millitoken: AtomicI64,
    last_refill_ms: AtomicU64,
    config: TokenBucketConfig,
}

impl TokenBucket {
    fn new(config: TokenBucketConfig) -> Self {
        Self {
            tokens_millitoken: AtomicI64::new(config.capacity * 1000),
            last_refill_ms: AtomicU64::new(now_ms()),
            config,
        }
    }

    fn try_acquire(&self, permits: i64) -> bool {
        loop {
            let now = now_ms();
            let last = self.last_refill_ms.load(Ordering::Acquire);
            let elapsed_ms = now.saturating_sub(last);
            let current = self.tokens_millitoken.load(Ordering::Acquire);
            let refill_millitoken = (elapsed_ms as f64 * self.config.rate_per_sec) as i64;
            let capped = (current + refill_millitoken).min(self.config.capacity * 1000);

            let requested_millitoken = permits * 1000;
            if capped >= requested_millitoken {
                let remaining = capped - requested_millitoken;
                if self
                    .tokens_millitoken
                    .compare_exchange(current, remaining, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.last_refill_ms.store(now, Ordering::Release);
                    return true;
                }
            } else if self
                .tokens_millitoken
                .compare_exchange(current, capped, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.last_refill_ms.store(now, Ordering::Release);
                return false;
            }
            // CAS lost the race; retry with fresh state.
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SlidingWindowConfig {
    pub rate: u64,
    pub window_slices: usize,
    pub window_size_ms: u64,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            rate: 100,
            window_slices: 10,
            window_size_ms: 1000,
        }
    }
}

/// A ring of per-slice counters covering the trailing window (spec.md §4.11,
/// GLOSSARY "sliding-window ring").
struct SlidingWindow {
    slices: Vec<AtomicU64>,
    slice_stamp_ms: Vec<AtomicU64>,
    config: SlidingWindowConfig,
    lock: std::sync::Mutex<()>,
}

impl SlidingWindow {
    fn new(config: SlidingWindowConfig) -> Self {
        let mut slices = Vec::with_capacity(config.window_slices);
        let mut stamps = Vec::with_capacity(config.window_slices);
        for _ in 0..config.window_slices {
            slices.push(AtomicU64::new(0));
            stamps.push(AtomicU64::new(0));
        }
        Self {
            slices,
            slice_stamp_ms: stamps,
            config,
            lock: std::sync::Mutex::new(()),
        }
    }

    fn slice_duration_ms(&self) -> u64 {
        (self.config.window_size_ms / self.config.window_slices as u64).max(1)
    }

    fn try_acquire(&self, permits: u64) -> bool {
        let _guard = self.lock.lock().unwrap();
        let now = now_ms();
        let slice_ms = self.slice_duration_ms();
        let current_slot = (now / slice_ms) as usize % self.config.window_slices;

        // Clear slots whose recorded slice has aged out of the trailing window.
        for i in 0..self.config.window_slices {
            let stamp = self.slice_stamp_ms[i].load(Ordering::Acquire);
            if now.saturating_sub(stamp) >= self.config.window_size_ms {
                self.slices[i].store(0, Ordering::Release);
            }
        }

        let sum: u64 = self.slices.iter().map(|c| c.load(Ordering::Acquire)).sum();
        if sum + permits > self.config.rate {
            return false;
        }

        self.slice_stamp_ms[current_slot].store(now, Ordering::Release);
        self.slices[current_slot].fetch_add(permits, Ordering::AcqRel);
        true
    }
}

enum Limiter {
    TokenBucket(TokenBucket),
    SlidingWindow(SlidingWindow),
}

impl Limiter {
    fn try_acquire(&self, permits: u64) -> bool {
        match self {
            Limiter::TokenBucket(b) => b.try_acquire(permits as i64),
            Limiter::SlidingWindow(w) => w.try_acquire(permits),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LimiterKind {
    TokenBucket(TokenBucketConfig),
    SlidingWindow(SlidingWindowConfig),
}

impl Default for LimiterKind {
    fn default() -> Self {
        LimiterKind::TokenBucket(TokenBucketConfig::default())
    }
}

struct KeyStats {
    total: AtomicU64,
    limited: AtomicU64,
}

impl KeyStats {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            limited: AtomicU64::new(0),
        }
    }
}

/// Named, per-key limiter manager with `ip:`/`user:`/`service:`/`method:`
/// prefixes (spec.md §4.11, GLOSSARY). Process-global in the default
/// deployment, but constructed explicitly by the caller.
pub struct RateLimitManager {
    default_kind: LimiterKind,
    limiters: DashMap<String, Limiter>,
    stats: DashMap<String, KeyStats>,
}

impl RateLimitManager {
    pub fn new(default_kind: LimiterKind) -> Self {
        Self {
            default_kind,
            limiters: DashMap::new(),
            stats: DashMap::new(),
        }
    }

    fn limiter_for(&self, key: &str) -> dashmap::mapref::one::Ref<'_, String, Limiter> {
        if !self.limiters.contains_key(key) {
            let limiter = match self.default_kind {
                LimiterKind::TokenBucket(cfg) => Limiter::TokenBucket(TokenBucket::new(cfg)),
                LimiterKind::SlidingWindow(cfg) => Limiter::SlidingWindow(SlidingWindow::new(cfg)),
            };
            self.limiters.entry(key.to_string()).or_insert(limiter);
        }
        self.limiters.get(key).unwrap()
    }

    fn record(&self, key: &str, admitted: bool) -> bool {
        let stats = self
            .stats
            .entry(key.to_string())
            .or_insert_with(KeyStats::new);
        stats.total.fetch_add(1, Ordering::Relaxed);
        if !admitted {
            stats.limited.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    fn check(&self, key: String, permits: u64) -> Result<()> {
        let admitted = self.limiter_for(&key).try_acquire(permits);
        self.record(&key, admitted);
        if admitted {
            Ok(())
        } else {
            Err(RpcError::RateLimited {
                retry_after_ms: 1000,
            })
        }
    }

    pub fn check_ip(&self, ip: &str) -> Result<()> {
        self.check(format!("ip:{ip}"), 1)
    }

    pub fn check_user(&self, user: &str) -> Result<()> {
        self.check(format!("user:{user}"), 1)
    }

    pub fn check_service(&self, service: &str) -> Result<()> {
        self.check(format!("service:{service}"), 1)
    }

    pub fn check_method(&self, service: &str, method: &str) -> Result<()> {
        self.check(format!("method:{service}#{method}"), 1)
    }

    /// Server-side admission policy: IP, then user (if authenticated), then
    /// service, then method; any deny short-circuits (spec.md §4.11).
    pub fn admit(&self, ip: &str, user: Option<&str>, service: &str, method: &str) -> Result<()> {
        self.check_ip(ip)?;
        if let Some(user) = user {
            self.check_user(user)?;
        }
        self.check_service(service)?;
        self.check_method(service, method)?;
        Ok(())
    }

    /// One row per key: total requests, limited requests, and limit rate
    /// (spec.md §4.11). Keys whose limit rate exceeds 10% are flagged.
    pub fn report(&self) -> Vec<LimiterReport> {
        self.stats
            .iter()
            .map(|entry| {
                let total = entry.total.load(Ordering::Relaxed);
                let limited = entry.limited.load(Ordering::Relaxed);
                let limit_rate = if total == 0 {
                    0.0
                } else {
                    limited as f64 / total as f64
                };
                LimiterReport {
                    key: entry.key().clone(),
                    total,
                    limited,
                    limit_rate,
                    alert: limit_rate > 0.10,
                }
            })
            .collect()
    }
}

impl Default for RateLimitManager {
    fn default() -> Self {
        Self::new(LimiterKind::default())
    }
}

#[derive(Debug, Clone)]
pub struct LimiterReport {
    pub key: String,
    pub total: u64,
    pub limited: u64,
    pub limit_rate: f64,
    pub alert: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_burst_admits_capacity_then_denies() {
        let manager = RateLimitManager::new(LimiterKind::TokenBucket(TokenBucketConfig {
            capacity: 20,
            rate_per_sec: 10.0,
        }));
        let mut admitted = 0;
        let mut denied = 0;
        for _ in 0..25 {
            match manager.check_ip("1.2.3.4") {
                Ok(()) => admitted += 1,
                Err(RpcError::RateLimited { .. }) => denied += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(admitted, 20);
        assert_eq!(denied, 5);
    }

    #[test]
    fn sliding_window_denies_once_rate_reached() {
        let manager = RateLimitManager::new(LimiterKind::SlidingWindow(SlidingWindowConfig {
            rate: 5,
            window_slices: 10,
            window_size_ms: 1000,
        }));
        let mut admitted = 0;
        for _ in 0..10 {
            if manager.check_service("svc").is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[test]
    fn admission_policy_checks_ip_then_user_then_service_then_method() {
        let manager = RateLimitManager::new(LimiterKind::TokenBucket(TokenBucketConfig {
            capacity: 1000,
            rate_per_sec: 1000.0,
        }));
        assert!(manager.admit("1.2.3.4", Some("alice"), "svc", "getUser").is_ok());
    }

    #[test]
    fn report_flags_keys_above_ten_percent_limit_rate() {
        let manager = RateLimitManager::new(LimiterKind::TokenBucket(TokenBucketConfig {
            capacity: 1,
            rate_per_sec: 0.0,
        }));
        manager.check_ip("1.2.3.4").ok();
        for _ in 0..9 {
            manager.check_ip("1.2.3.4").ok();
        }
        let report = manager.report();
        let entry = report.iter().find(|r| r.key == "ip:1.2.3.4").unwrap();
        assert!(entry.alert, "expected alert for limit_rate {}", entry.limit_rate);
    }

    #[test]
    fn keys_are_independent() {
        let manager = RateLimitManager::new(LimiterKind::TokenBucket(TokenBucketConfig {
            capacity: 1,
            rate_per_sec: 0.0,
        }));
        assert!(manager.check_ip("a").is_ok());
        assert!(manager.check_ip("a").is_err());
        assert!(manager.check_ip("b").is_ok());
    }
}
