//! Circuit Breaker Registry
//!
//! One breaker per named dependency:
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open --(recovery_timeout elapsed AND a call arrives)--> HalfOpen
//! HalfOpen --(any success)--> Closed
//! HalfOpen --(any failure)--> Open
//! ```
//!
//! There is no background timer: Open -> HalfOpen is evaluated lazily when
//! the next call asks for admission.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Blocking all calls
    Open,
    /// Admitting a limited number of trial calls
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time after the last failure before a trial is allowed
    pub recovery_timeout: Duration,
    /// Trial calls admitted while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_requests: 1,
        }
    }
}

/// Why a call was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Open and still cooling down
    Open { retry_after: Duration },
    /// Half-open and every trial slot is taken
    TrialsExhausted,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_trials: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_trials: 0,
            last_failure: None,
            last_failure_at: None,
            last_success_at: None,
        }
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub component: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_trials: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Breakers for every dependency, behind one lock
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Use a dedicated config for one component
    pub fn with_override(mut self, component: &str, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(component.to_string(), config);
        self
    }

    fn config_for(&self, component: &str) -> &CircuitBreakerConfig {
        self.overrides.get(component).unwrap_or(&self.default_config)
    }

    /// Ask to make a call. Takes a half-open trial slot when admitted.
    pub fn try_acquire(&self, component: &str) -> Result<(), Rejection> {
        let config = self.config_for(component);
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(component.to_string())
            .or_insert_with(Breaker::new);

        if breaker.state == CircuitState::Open {
            let elapsed = breaker
                .last_failure
                .map(|at| Instant::now().saturating_duration_since(at))
                .unwrap_or(config.recovery_timeout);

            if elapsed < config.recovery_timeout {
                return Err(Rejection::Open {
                    retry_after: config.recovery_timeout - elapsed,
                });
            }

            breaker.state = CircuitState::HalfOpen;
            breaker.half_open_trials = 0;
            info!("Circuit breaker '{}' transitioning to half-open", component);
        }

        if breaker.state == CircuitState::HalfOpen {
            if breaker.half_open_trials >= config.half_open_max_requests {
                debug!("Circuit breaker '{}' rejecting call, trial slots taken", component);
                return Err(Rejection::TrialsExhausted);
            }
            breaker.half_open_trials += 1;
        }

        Ok(())
    }

    /// Record a successful call
    pub fn record_success(&self, component: &str) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(component.to_string())
            .or_insert_with(Breaker::new);

        breaker.last_success_at = Some(Utc::now());
        breaker.consecutive_failures = 0;

        if breaker.state != CircuitState::Closed {
            breaker.state = CircuitState::Closed;
            breaker.half_open_trials = 0;
            info!("Circuit breaker '{}' closed after recovery", component);
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, component: &str) {
        let threshold = self.config_for(component).failure_threshold;
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(component.to_string())
            .or_insert_with(Breaker::new);

        breaker.consecutive_failures += 1;
        breaker.last_failure = Some(Instant::now());
        breaker.last_failure_at = Some(Utc::now());

        match breaker.state {
            CircuitState::Closed => {
                if breaker.consecutive_failures >= threshold {
                    breaker.state = CircuitState::Open;
                    warn!(
                        "Circuit breaker '{}' opened after {} failures",
                        component, breaker.consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Open;
                breaker.half_open_trials = 0;
                warn!("Circuit breaker '{}' reopened after half-open failure", component);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state without evaluating recovery
    pub fn state(&self, component: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(component)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Force a breaker back to Closed
    pub fn reset(&self, component: &str) {
        self.breakers.lock().insert(component.to_string(), Breaker::new());
        info!("Circuit breaker '{}' reset", component);
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock();
        let mut snapshots: Vec<BreakerSnapshot> = breakers
            .iter()
            .map(|(name, b)| BreakerSnapshot {
                component: name.clone(),
                state: b.state,
                consecutive_failures: b.consecutive_failures,
                half_open_trials: b.half_open_trials,
                last_failure_at: b.last_failure_at,
                last_success_at: b.last_success_at,
            })
            .collect();
        snapshots.sort_by(|a, b| a.component.cmp(&b.component));
        snapshots
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
