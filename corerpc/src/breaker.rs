//! Circuit breaker: per-service Closed/Open/HalfOpen state machine
//! (spec.md §4.9).
//!
//! Breakers are keyed by service name and are process-global per spec.md
//! §6; `CircuitBreakerManager` is the explicit, caller-constructed
//! singleton (Design Note in spec.md §9: avoid hidden process-wide state).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::{Result, RpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

impl From<CircuitState> for u8 {
    fn from(s: CircuitState) -> Self {
        match s {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-service breaker state (spec.md §3 "Circuit breaker state").
struct Breaker {
    state: AtomicU32,
    failure_count: AtomicU32,
    half_open_count: AtomicU32,
    last_failure_ms: AtomicU64,
    config: BreakerConfig,
}

impl Breaker {
    fn new(config: BreakerConfig) -> Self {
        Self {
            state: AtomicU32::new(u8::from(CircuitState::Closed) as u32),
            failure_count: AtomicU32::new(0),
            half_open_count: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            config,
        }
    }

    fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire) as u8)
    }

    /// Returns `true` if the call should be admitted (spec.md §4.9).
    fn try_admit(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed_ms = now_ms().saturating_sub(self.last_failure_ms.load(Ordering::Acquire));
                if elapsed_ms as u128 > self.config.recovery_timeout.as_millis() {
                    let prior = self.state.compare_exchange(
                        u8::from(CircuitState::Open) as u32,
                        u8::from(CircuitState::HalfOpen) as u32,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    if prior.is_ok() {
                        self.half_open_count.store(0, Ordering::Release);
                    }
                    // Whichever caller wins the CAS (or loses to another
                    // caller already in HalfOpen) is admitted.
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                self.half_open_count.load(Ordering::Acquire) < self.config.half_open_max_calls
            }
        }
    }

    fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let count = self.half_open_count.fetch_add(1, Ordering::AcqRel) + 1;
                if count >= self.config.half_open_max_calls {
                    self.state.store(u8::from(CircuitState::Closed) as u32, Ordering::Release);
                    self.failure_count.store(0, Ordering::Release);
                    self.half_open_count.store(0, Ordering::Release);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        self.last_failure_ms.store(now_ms(), Ordering::Release);
        match self.state() {
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if count >= self.config.failure_threshold {
                    self.state.store(u8::from(CircuitState::Open) as u32, Ordering::Release);
                }
            }
            CircuitState::HalfOpen => {
                self.state.store(u8::from(CircuitState::Open) as u32, Ordering::Release);
                self.half_open_count.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }
}

/// Process-global (or caller-scoped) breaker registry, keyed by service
/// name (spec.md §4.9, §6).
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Breaker>,
    config: BreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    fn entry(&self, service: &str) -> dashmap::mapref::one::Ref<'_, String, Breaker> {
        if !self.breakers.contains_key(service) {
            self.breakers
                .entry(service.to_string())
                .or_insert_with(|| Breaker::new(self.config));
        }
        self.breakers.get(service).unwrap()
    }

    /// Returns `Ok(())` if admitted, `Err(RpcError::CircuitOpen)` otherwise
    /// (spec.md §4.9).
    pub fn admit(&self, service: &str) -> Result<()> {
        if self.entry(service).try_admit() {
            Ok(())
        } else {
            Err(RpcError::CircuitOpen(service.to_string()))
        }
    }

    pub fn record_success(&self, service: &str) {
        self.entry(service).record_success();
    }

    pub fn record_failure(&self, service: &str) {
        self.entry(service).record_failure();
    }

    pub fn state_of(&self, service: &str) -> CircuitState {
        self.entry(service).state()
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
