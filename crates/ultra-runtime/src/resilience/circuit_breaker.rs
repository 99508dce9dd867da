//! Circuit breaker to prevent cascade failures.
//!
//! When calls to a provider fail repeatedly, its circuit opens and further
//! calls fail fast with [`CallError::CircuitOpen`] until the reset timeout
//! elapses. A limited number of probe calls then decide whether it closes
//! again.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::CallError;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time an open circuit waits before allowing probes
    #[serde(with = "crate::config::humantime_duration")]
    pub reset_timeout: Duration,

    /// Concurrent probe calls allowed while half-open
    pub half_open_probe_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_probe_limit: 1,
        }
    }
}

/// State of one provider's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Calls fail fast
    Open,

    /// Probing whether the provider recovered
    HalfOpen,
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    pub probes_in_flight: u32,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probes_in_flight: u32,
    /// Bumped on every entry into half-open, so stale probes are ignored
    generation: u64,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            probes_in_flight: 0,
            generation: 0,
        }
    }
}

/// Per-provider circuit breaker.
///
/// Every provider has its own circuit so one failing vendor never blocks
/// another. State is shared by all concurrent pipeline runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, Circuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask permission for one call to `key`.
    ///
    /// The returned permit must be settled with [`CircuitPermit::success`] or
    /// [`CircuitPermit::failure`]. Dropping it unsettled releases a probe slot
    /// without affecting the circuit.
    pub fn acquire(&self, key: &str) -> Result<CircuitPermit<'_>, CallError> {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(key.to_string()).or_default();

        if circuit.state == CircuitState::Open {
            let elapsed = circuit
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or(self.config.reset_timeout);
            if elapsed < self.config.reset_timeout {
                return Err(CallError::CircuitOpen {
                    provider: key.to_string(),
                });
            }
            circuit.state = CircuitState::HalfOpen;
            circuit.probes_in_flight = 0;
            circuit.generation += 1;
            info!(provider = %key, "Circuit half-open, allowing probe calls");
        }

        let probe = match circuit.state {
            CircuitState::HalfOpen => {
                if circuit.probes_in_flight >= self.config.half_open_probe_limit {
                    return Err(CallError::CircuitOpen {
                        provider: key.to_string(),
                    });
                }
                circuit.probes_in_flight += 1;
                Some(circuit.generation)
            }
            _ => None,
        };

        Ok(CircuitPermit {
            breaker: self,
            key: key.to_string(),
            probe,
            settled: false,
        })
    }

    /// Run `call` under the breaker. Any error counts as a failure.
    pub async fn execute<T, F, Fut>(&self, key: &str, call: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let permit = self.acquire(key)?;
        match call().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    /// Current state of a circuit; unknown keys are closed.
    pub fn state(&self, key: &str) -> CircuitState {
        self.snapshot(key).state
    }

    pub fn snapshot(&self, key: &str) -> CircuitSnapshot {
        let circuits = self.circuits.lock();
        match circuits.get(key) {
            Some(c) => CircuitSnapshot {
                state: c.state,
                consecutive_failures: c.consecutive_failures,
                last_failure: c.last_failure,
                probes_in_flight: c.probes_in_flight,
            },
            None => CircuitSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                probes_in_flight: 0,
            },
        }
    }

    /// Reset all circuits to closed.
    pub fn reset(&self) {
        self.circuits.lock().clear();
    }

    fn record_success(&self, key: &str, probe: Option<u64>) {
        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(key) else {
            return;
        };

        match (circuit.state, probe) {
            (CircuitState::HalfOpen, Some(generation)) if generation == circuit.generation => {
                circuit.state = CircuitState::Closed;
                circuit.consecutive_failures = 0;
                circuit.probes_in_flight = 0;
                info!(provider = %key, "Circuit closed after successful probe");
            }
            (CircuitState::Closed, _) => {
                circuit.consecutive_failures = 0;
            }
            _ => {}
        }
    }

    fn record_failure(&self, key: &str, probe: Option<u64>) {
        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(key) else {
            return;
        };

        match (circuit.state, probe) {
            (CircuitState::Closed, _) => {
                circuit.consecutive_failures += 1;
                circuit.last_failure = Some(Instant::now());
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    warn!(
                        provider = %key,
                        failures = circuit.consecutive_failures,
                        "Circuit opened after repeated failures"
                    );
                }
            }
            (CircuitState::HalfOpen, Some(generation)) if generation == circuit.generation => {
                circuit.state = CircuitState::Open;
                circuit.last_failure = Some(Instant::now());
                circuit.probes_in_flight = 0;
                warn!(provider = %key, "Circuit reopened after failed probe");
            }
            _ => {}
        }
    }

    fn release_probe(&self, key: &str, generation: u64) {
        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.get_mut(key) {
            if circuit.state == CircuitState::HalfOpen && circuit.generation == generation {
                circuit.probes_in_flight = circuit.probes_in_flight.saturating_sub(1);
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Permission for one call. Settle it with the call's outcome.
#[must_use = "an unsettled permit does not record the call outcome"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    key: String,
    probe: Option<u64>,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// Whether this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(&self.key, self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(&self.key, self.probe);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if let (false, Some(generation)) = (self.settled, self.probe) {
            self.breaker.release_probe(&self.key, generation);
        }
    }
}
