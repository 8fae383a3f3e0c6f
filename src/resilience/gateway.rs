//! Resilient Call Gateway
//!
//! Wraps every call to an external dependency:
//! - Bounded attempt loop with a per-component deadline
//! - Backoff between attempts (exponential / linear / constant)
//! - Circuit breaker admission and bookkeeping
//! - Rate limiter admission when a limiter is registered
//! - Exactly one fallback action once attempts run out or the breaker is open

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::backoff::RetryPolicy;
use super::circuit_breaker::{CircuitBreakerRegistry, Rejection};
use super::error::{CallError, ErrorKind};
use super::stats::ErrorStats;
use crate::rate_limit::RateLimiterRegistry;

/// Receives High and Critical failures
pub trait AlertSink: Send + Sync {
    fn alert(&self, component: &str, error: &CallError);
}

/// Alerts go to the log on the `alert` target
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, component: &str, err: &CallError) {
        error!(
            target: "alert",
            component,
            kind = %err.kind,
            severity = ?err.severity(),
            "{}",
            err.message
        );
    }
}

/// Work parked for later
#[derive(Debug, Clone, Serialize)]
pub struct DeferredCall {
    pub component: String,
    pub reason: String,
    pub payload: serde_json::Value,
    pub deferred_at: DateTime<Utc>,
}

/// Holding area for deferred work; an operator or a later job drains it
#[derive(Debug, Default)]
pub struct DeferQueue {
    items: Mutex<Vec<DeferredCall>>,
}

impl DeferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, call: DeferredCall) {
        self.items.lock().push(call);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Take everything deferred so far
    pub fn drain(&self) -> Vec<DeferredCall> {
        std::mem::take(&mut *self.items.lock())
    }
}

type AlternateHandler<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, CallError>> + Send>;

/// What to do when the primary path gives up
pub enum Fallback<T> {
    /// Run a different handler
    Alternate(AlternateHandler<T>),
    /// Return a canned, degraded value
    Degraded(T),
    /// Return nothing, silently
    Skip,
    /// Park the request on a queue for later
    Defer {
        queue: Arc<DeferQueue>,
        payload: serde_json::Value,
    },
}

impl<T> Fallback<T> {
    pub fn alternate<F, Fut>(handler: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        Fallback::Alternate(Box::new(move || Box::pin(handler())))
    }

    pub fn defer(queue: Arc<DeferQueue>, payload: serde_json::Value) -> Self {
        Fallback::Defer { queue, payload }
    }

    fn name(&self) -> &'static str {
        match self {
            Fallback::Alternate(_) => "alternate",
            Fallback::Degraded(_) => "degraded",
            Fallback::Skip => "skip",
            Fallback::Defer { .. } => "defer",
        }
    }
}

/// Which path produced the result
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Primary(T),
    Alternate(T),
    Degraded(T),
    Skipped,
    Deferred,
}

impl<T> CallOutcome<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            CallOutcome::Primary(v) | CallOutcome::Alternate(v) | CallOutcome::Degraded(v) => Some(v),
            CallOutcome::Skipped | CallOutcome::Deferred => None,
        }
    }
}

/// Per-call settings
pub struct CallOptions<T> {
    /// Overrides the policy's attempt count
    pub max_attempts: Option<usize>,
    /// Checked against the component's rate limiter, if any
    pub estimated_tokens: u64,
    pub fallback: Option<Fallback<T>>,
}

impl<T> Default for CallOptions<T> {
    fn default() -> Self {
        Self {
            max_attempts: None,
            estimated_tokens: 1,
            fallback: None,
        }
    }
}

impl<T> CallOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(mut self, n: usize) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn tokens(mut self, n: u64) -> Self {
        self.estimated_tokens = n;
        self
    }

    pub fn fallback(mut self, fallback: Fallback<T>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// Gateway failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("Circuit breaker open for {component}")]
    CircuitOpen { component: String },

    #[error("{component} failed after {attempts} attempt(s): {last}")]
    OperationFailed {
        component: String,
        attempts: usize,
        last: CallError,
    },

    #[error("{component} fallback failed: {error} (primary: {primary})")]
    FallbackFailed {
        component: String,
        primary: String,
        error: CallError,
    },
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::CircuitOpen { .. } => ErrorKind::Unavailable,
            GatewayError::OperationFailed { last, .. } => last.kind,
            GatewayError::FallbackFailed { error, .. } => error.kind,
        }
    }
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub retry: RetryPolicy,
    /// Deadline for components without an entry in `timeouts`
    pub default_timeout: Duration,
    pub timeouts: HashMap<String, Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_timeout: Duration::from_secs(120),
            timeouts: HashMap::new(),
        }
    }
}

/// Why the primary path stopped
enum Exhaustion {
    CircuitOpen,
    Failed { attempts: usize, last: CallError },
}

/// Retry, breaker, limiter and fallback around any external call
pub struct ResilientGateway {
    config: GatewayConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    limiters: Arc<RateLimiterRegistry>,
    stats: Arc<ErrorStats>,
    alerts: Arc<dyn AlertSink>,
}

impl ResilientGateway {
    pub fn new(
        config: GatewayConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        limiters: Arc<RateLimiterRegistry>,
        stats: Arc<ErrorStats>,
    ) -> Self {
        Self {
            config,
            breakers,
            limiters,
            stats,
            alerts: Arc::new(LogAlertSink),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiters
    }

    pub fn stats(&self) -> &Arc<ErrorStats> {
        &self.stats
    }

    pub fn timeout_for(&self, component: &str) -> Duration {
        self.config
            .timeouts
            .get(component)
            .copied()
            .unwrap_or(self.config.default_timeout)
    }

    fn record_failure(&self, component: &str, err: &CallError, touches_breaker: bool) {
        self.stats.record_error(component, err.kind);
        if touches_breaker {
            self.breakers.record_failure(component);
        }
        if err.severity().should_alert() {
            self.alerts.alert(component, err);
        }
    }

    /// Call `operation` under the full resilience policy for `component`
    pub async fn call<T, F, Fut>(
        &self,
        component: &str,
        mut options: CallOptions<T>,
        operation: F,
    ) -> Result<CallOutcome<T>, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let attempts = options.max_attempts;
        let tokens = options.estimated_tokens;
        match self.attempt_loop(component, attempts, tokens, operation).await {
            Ok(value) => Ok(CallOutcome::Primary(value)),
            Err(exhaustion) => match options.fallback.take() {
                Some(fallback) => self.run_fallback(component, fallback, exhaustion).await,
                None => Err(match exhaustion {
                    Exhaustion::CircuitOpen => GatewayError::CircuitOpen {
                        component: component.to_string(),
                    },
                    Exhaustion::Failed { attempts, last } => GatewayError::OperationFailed {
                        component: component.to_string(),
                        attempts,
                        last,
                    },
                }),
            },
        }
    }

    async fn attempt_loop<T, F, Fut>(
        &self,
        component: &str,
        max_attempts: Option<usize>,
        estimated_tokens: u64,
        mut operation: F,
    ) -> Result<T, Exhaustion>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let policy = &self.config.retry;
        let max_attempts = max_attempts.unwrap_or(policy.max_attempts).max(1);
        let deadline = self.timeout_for(component);
        let limiter = self.limiters.get(component);

        let mut failures = 0usize;
        let mut last_error: Option<CallError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = policy.delay_for_retry((attempt - 1) as u32);
                debug!(
                    "Retry {} for '{}' after {:?} (error: {})",
                    attempt - 1,
                    component,
                    delay,
                    last_error.as_ref().map(|e| e.to_string()).unwrap_or_default()
                );
                tokio::time::sleep(delay).await;
            }

            // Local quota check: no external call happens, breaker untouched
            if let Some(ref limiter) = limiter {
                if !limiter.can_make_request(estimated_tokens) {
                    let err = CallError::rate_limited(format!("local quota exhausted for {}", component));
                    self.record_failure(component, &err, false);
                    failures += 1;
                    last_error = Some(err);
                    continue;
                }
            }

            if let Err(rejection) = self.breakers.try_acquire(component) {
                match rejection {
                    Rejection::Open { retry_after } => {
                        warn!("Circuit open for '{}', retry after {:?}", component, retry_after)
                    }
                    Rejection::TrialsExhausted => {
                        warn!("Circuit half-open for '{}', no trial slots left", component)
                    }
                }
                // Report the failure that tripped the breaker, not the breaker itself
                return Err(match last_error {
                    Some(last) => Exhaustion::Failed { attempts: failures, last },
                    None => Exhaustion::CircuitOpen,
                });
            }

            if let Some(ref limiter) = limiter {
                limiter.track_request(estimated_tokens);
            }

            let result = match tokio::time::timeout(deadline, operation()).await {
                Ok(result) => result,
                Err(_) => Err(CallError::timeout(format!(
                    "{} exceeded deadline of {:?}",
                    component, deadline
                ))),
            };

            match result {
                Ok(value) => {
                    self.breakers.record_success(component);
                    if failures > 0 {
                        self.stats.record_recovery();
                        info!("'{}' recovered after {} failed attempt(s)", component, failures);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    warn!(
                        "'{}' attempt {}/{} failed: {}",
                        component, attempt, max_attempts, err
                    );
                    self.record_failure(component, &err, true);
                    failures += 1;
                    let retryable = err.is_retryable();
                    last_error = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(Exhaustion::Failed {
            attempts: failures,
            last: last_error
                .unwrap_or_else(|| CallError::new(ErrorKind::Unknown, "no attempts made")),
        })
    }

    async fn run_fallback<T>(
        &self,
        component: &str,
        fallback: Fallback<T>,
        exhaustion: Exhaustion,
    ) -> Result<CallOutcome<T>, GatewayError> {
        let reason = match &exhaustion {
            Exhaustion::CircuitOpen => "circuit open".to_string(),
            Exhaustion::Failed { last, .. } => last.to_string(),
        };

        self.stats.record_fallback();
        info!(
            "'{}' activating {} fallback ({})",
            component,
            fallback.name(),
            reason
        );

        match fallback {
            Fallback::Alternate(handler) => match handler().await {
                Ok(value) => Ok(CallOutcome::Alternate(value)),
                Err(error) => Err(GatewayError::FallbackFailed {
                    component: component.to_string(),
                    primary: reason,
                    error,
                }),
            },
            Fallback::Degraded(value) => Ok(CallOutcome::Degraded(value)),
            Fallback::Skip => Ok(CallOutcome::Skipped),
            Fallback::Defer { queue, payload } => {
                queue.push(DeferredCall {
                    component: component.to_string(),
                    reason,
                    payload,
                    deferred_at: Utc::now(),
                });
                Ok(CallOutcome::Deferred)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitConfig;
    use crate::resilience::backoff::BackoffStrategy;
    use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingAlerts {
        alerts: Mutex<Vec<(String, ErrorKind)>>,
    }

    impl AlertSink for RecordingAlerts {
        fn alert(&self, component: &str, error: &CallError) {
            self.alerts.lock().push((component.to_string(), error.kind));
        }
    }

    fn gateway(threshold: u32) -> ResilientGateway {
        let config = GatewayConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                strategy: BackoffStrategy::Exponential,
                jitter: false,
            },
            default_timeout: Duration::from_secs(5),
            timeouts: HashMap::from([("slow".to_string(), Duration::from_millis(50))]),
        };
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        });
        ResilientGateway::new(
            config,
            Arc::new(breakers),
            Arc::new(RateLimiterRegistry::new()),
            Arc::new(ErrorStats::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let gw = gateway(5);
        let outcome = gw
            .call("api", CallOptions::new(), || async { Ok::<_, CallError>(42) })
            .await
            .unwrap();
        assert_eq!(outcome, CallOutcome::Primary(42));
        assert_eq!(gw.stats().snapshot().total_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_recovers() {
        let gw = gateway(5);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let outcome = gw
            .call("api", CallOptions::new(), move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(CallError::connectivity("connection reset"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome, CallOutcome::Primary("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = gw.stats().snapshot();
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.recoveries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_without_fallback() {
        let gw = gateway(10);
        let err = gw
            .call("api", CallOptions::<()>::new(), || async {
                Err(CallError::connectivity("refused"))
            })
            .await
            .unwrap_err();

        match err {
            GatewayError::OperationFailed { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.kind, ErrorKind::Connectivity);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_fails_fast_and_alerts() {
        let alerts = Arc::new(RecordingAlerts::default());
        let gw = gateway(10).with_alerts(alerts.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let err = gw
            .call("api", CallOptions::<()>::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError::new(ErrorKind::Authentication, "bad key")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(alerts.alerts.lock().as_slice(), &[("api".to_string(), ErrorKind::Authentication)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_medium_severity_does_not_alert() {
        let alerts = Arc::new(RecordingAlerts::default());
        let gw = gateway(10).with_alerts(alerts.clone());
        let _ = gw
            .call("api", CallOptions::<()>::new(), || async {
                Err(CallError::new(ErrorKind::Validation, "bad request"))
            })
            .await;
        assert!(alerts.alerts.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_counts_as_timeout_attempt() {
        let gw = gateway(10);
        let err = gw
            .call("slow", CallOptions::<()>::new().attempts(2), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        match err {
            GatewayError::OperationFailed { attempts, last, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(last.kind, ErrorKind::Timeout);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_rejects_without_calling() {
        let gw = gateway(3);
        let _ = gw
            .call("api", CallOptions::<()>::new(), || async {
                Err(CallError::connectivity("down"))
            })
            .await;
        assert_eq!(gw.breakers().state("api"), CircuitState::Open);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let err = gw
            .call("api", CallOptions::<()>::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();

        assert_eq!(err, GatewayError::CircuitOpen { component: "api".into() });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_tripping_mid_call_keeps_last_error() {
        let gw = gateway(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let err = gw
            .call("api", CallOptions::<()>::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError::connectivity("connection refused")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(gw.breakers().state("api"), CircuitState::Open);
        match err {
            GatewayError::OperationFailed { attempts, last, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(last.kind, ErrorKind::Connectivity);
                assert!(last.message.contains("connection refused"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_alternate_fallback_runs_once() {
        let gw = gateway(10);
        let alt_calls = Arc::new(AtomicUsize::new(0));
        let counter = alt_calls.clone();

        let outcome = gw
            .call(
                "api",
                CallOptions::new().fallback(Fallback::alternate(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("from alternate")
                })),
                || async { Err(CallError::connectivity("down")) },
            )
            .await
            .unwrap();

        assert_eq!(outcome, CallOutcome::Alternate("from alternate"));
        assert_eq!(alt_calls.load(Ordering::SeqCst), 1);
        assert_eq!(gw.stats().snapshot().fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_skip_and_defer() {
        let gw = gateway(10);
        let fail = || async { Err::<String, _>(CallError::connectivity("down")) };

        let degraded = gw
            .call("a", CallOptions::new().fallback(Fallback::Degraded("canned".to_string())), fail)
            .await
            .unwrap();
        assert_eq!(degraded, CallOutcome::Degraded("canned".to_string()));

        let skipped = gw
            .call("b", CallOptions::new().fallback(Fallback::Skip), fail)
            .await
            .unwrap();
        assert_eq!(skipped.into_value(), None);

        let queue = Arc::new(DeferQueue::new());
        let deferred = gw
            .call(
                "c",
                CallOptions::new().fallback(Fallback::defer(queue.clone(), serde_json::json!({"prompt": "x"}))),
                fail,
            )
            .await
            .unwrap();
        assert_eq!(deferred, CallOutcome::Deferred);
        let parked = queue.drain();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].component, "c");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_on_open_breaker() {
        let gw = gateway(1);
        gw.breakers().record_failure("api");

        let outcome = gw
            .call(
                "api",
                CallOptions::new().fallback(Fallback::Degraded(0)),
                || async { Ok(1) },
            )
            .await
            .unwrap();
        assert_eq!(outcome, CallOutcome::Degraded(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_quota_denial_skips_breaker() {
        let gw = gateway(1);
        gw.limiters().register(
            "api",
            RateLimitConfig {
                requests_per_minute: 1,
                tokens_per_minute: 1_000_000,
                requests_per_day: 1_000,
            },
        );

        gw.call("api", CallOptions::new(), || async { Ok(()) })
            .await
            .unwrap();

        let err = gw
            .call("api", CallOptions::<()>::new().attempts(2), || async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert_eq!(gw.breakers().state("api"), CircuitState::Closed);
    }
}
