use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{Result, ServiceError};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Sleep window elapsed, a single probe is allowed through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Default)]
pub struct CircuitStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub successful_requests: u64,
    pub rejected_requests: u64,
    /// Requests currently held in the rolling window
    pub window_requests: u64,
    pub window_failures: u64,
    pub last_failure_time: Option<Instant>,
    pub state_changes: u64,
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Calls taking longer than this fail with `Timeout`
    pub timeout: Duration,
    /// Calls beyond this many in flight are rejected
    pub max_concurrent_requests: usize,
    /// Minimum requests in the rolling window before the error rate is considered
    pub request_volume_threshold: u64,
    /// How long the circuit stays open before a probe is allowed
    pub sleep_window: Duration,
    /// Error percentage (1..=100) that opens the circuit
    pub error_percent_threshold: u32,
    /// Width of the window requests are counted over
    pub rolling_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_concurrent_requests: 10,
            request_volume_threshold: 20,
            sleep_window: Duration::from_secs(5),
            error_percent_threshold: 50,
            rolling_window: Duration::from_secs(10),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    stats: CircuitStats,
    window: VecDeque<(Instant, bool)>,
    last_state_change: Instant,
    probe_started: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            stats: CircuitStats::default(),
            window: VecDeque::new(),
            last_state_change: Instant::now(),
            probe_started: None,
        }
    }
}

/// Individual circuit breaker instance
struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    semaphore: Arc<Semaphore>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.to_string(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            config,
            inner: Mutex::new(BreakerState::new()),
        };
        crate::metrics::set_circuit_breaker_state(name, CircuitState::Closed.gauge_value());
        breaker
    }

    fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner.last_state_change.elapsed() >= self.config.sleep_window {
                    self.transition_to(&mut inner, CircuitState::HalfOpen);
                    inner.probe_started = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match inner.probe_started {
                // A probe that never reported back does not block the circuit forever
                Some(started) if started.elapsed() < self.config.sleep_window => false,
                _ => {
                    inner.probe_started = Some(Instant::now());
                    true
                }
            },
        }
    }

    fn record(&self, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        inner.stats.total_requests += 1;
        if success {
            inner.stats.successful_requests += 1;
        } else {
            inner.stats.failed_requests += 1;
            inner.stats.last_failure_time = Some(now);
        }

        inner.window.push_back((now, success));
        self.prune(&mut inner, now);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_started = None;
                if success {
                    inner.window.clear();
                    self.transition_to(&mut inner, CircuitState::Closed);
                } else {
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Closed if !success => {
                let total = inner.window.len() as u64;
                let failures = inner.window.iter().filter(|(_, ok)| !ok).count() as u64;
                if total >= self.config.request_volume_threshold
                    && failures * 100 >= total * u64::from(self.config.error_percent_threshold)
                {
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn prune(&self, inner: &mut BreakerState, now: Instant) {
        while let Some((at, _)) = inner.window.front() {
            if now.duration_since(*at) > self.config.rolling_window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition_to(&self, inner: &mut BreakerState, new_state: CircuitState) {
        if inner.state != new_state {
            info!(
                "Circuit breaker {} state transition: {:?} -> {:?}",
                self.name, inner.state, new_state
            );
            inner.state = new_state;
            inner.stats.state_changes += 1;
            inner.last_state_change = Instant::now();
            crate::metrics::set_circuit_breaker_state(&self.name, new_state.gauge_value());
        }
    }

    fn reject(&self) {
        self.inner.lock().stats.rejected_requests += 1;
    }

    fn snapshot(&self) -> CircuitStats {
        let mut inner = self.inner.lock();
        self.prune(&mut inner, Instant::now());
        let mut stats = inner.stats.clone();
        stats.window_requests = inner.window.len() as u64;
        stats.window_failures = inner.window.iter().filter(|(_, ok)| !ok).count() as u64;
        stats
    }
}

/// Admission to a breaker. Report the outcome with [`BreakerGuard::record`];
/// the concurrency slot is released when the guard is dropped.
pub struct BreakerGuard {
    breaker: Arc<CircuitBreaker>,
    _permit: OwnedSemaphorePermit,
    started: Instant,
}

impl BreakerGuard {
    pub fn timeout(&self) -> Duration {
        self.breaker.config.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record(self, success: bool) {
        self.breaker.record(success);
    }
}

/// Manages named circuit breakers
pub struct CircuitBreakerManager {
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self::with_default_config(CircuitBreakerConfig::default())
    }

    pub fn with_default_config(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            default_config,
        }
    }

    /// Configure a breaker with custom settings, replacing any existing state
    pub fn configure(&self, name: &str, config: CircuitBreakerConfig) {
        let mut breakers = self.breakers.write();
        breakers.insert(name.to_string(), Arc::new(CircuitBreaker::new(name, config)));
        info!("Configured circuit breaker: {}", name);
    }

    fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config.clone())))
            .clone()
    }

    /// Admit a call. Fails with `CircuitOpen` or `MaxConcurrency`; the latter
    /// counts as a failure.
    pub fn acquire(&self, name: &str) -> Result<BreakerGuard> {
        let breaker = self.breaker(name);

        if !breaker.allow_request() {
            warn!("Circuit breaker OPEN for: {}", name);
            breaker.reject();
            return Err(ServiceError::CircuitOpen(name.to_string()));
        }

        let permit = match breaker.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Circuit breaker {} rejected call: max concurrency", name);
                breaker.record(false);
                return Err(ServiceError::MaxConcurrency(name.to_string()));
            }
        };

        Ok(BreakerGuard {
            breaker,
            _permit: permit,
            started: Instant::now(),
        })
    }

    /// Run `operation` under the named breaker with its timeout applied.
    /// Client errors (validation, not found) do not count against the circuit.
    pub async fn call<T, F, Fut>(&self, name: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(name)?;

        let result = match tokio::time::timeout(guard.timeout(), operation()).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(name.to_string())),
        };

        let success = match &result {
            Ok(_) => true,
            Err(e) => !counts_as_failure(e),
        };
        if !success {
            debug!("Recorded failure for breaker: {}", name);
        }
        guard.record(success);

        result
    }

    pub fn state(&self, name: &str) -> Option<CircuitState> {
        let breakers = self.breakers.read();
        breakers.get(name).map(|b| b.inner.lock().state)
    }

    pub fn stats(&self, name: &str) -> Option<CircuitStats> {
        let breakers = self.breakers.read();
        breakers.get(name).map(|b| b.snapshot())
    }

    pub fn all_states(&self) -> HashMap<String, CircuitState> {
        let breakers = self.breakers.read();
        breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.inner.lock().state))
            .collect()
    }

    /// Close the breaker and forget its rolling window
    pub fn reset(&self, name: &str) {
        let breakers = self.breakers.read();
        if let Some(breaker) = breakers.get(name) {
            let mut inner = breaker.inner.lock();
            inner.window.clear();
            inner.probe_started = None;
            breaker.transition_to(&mut inner, CircuitState::Closed);
            info!("Reset circuit breaker: {}", name);
        }
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

fn counts_as_failure(error: &ServiceError) -> bool {
    !matches!(
        error,
        ServiceError::Validation(_) | ServiceError::NotFound { .. }
    )
}
