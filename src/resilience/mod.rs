//! Resilience layer
//!
//! Classifies failures, retries with backoff, trips circuit breakers and
//! applies fallbacks for every call that leaves the process.

pub mod backoff;
pub mod circuit_breaker;
pub mod error;
pub mod gateway;
pub mod stats;

pub use backoff::{BackoffStrategy, RetryPolicy};
pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, Rejection,
};
pub use error::{CallError, ErrorKind, Severity};
pub use gateway::{
    AlertSink, CallOptions, CallOutcome, DeferQueue, DeferredCall, Fallback, GatewayConfig,
    GatewayError, LogAlertSink, ResilientGateway,
};
pub use stats::{ErrorStats, ErrorStatsSnapshot};
