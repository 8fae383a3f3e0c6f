//! TierDispatch
//!
//! Tiered task dispatch with a resilience layer around every external call.
//!
//! # Features
//!
//! - **Classification**: keyword and structure based complexity estimate
//! - **Tier Chain**: local Llama, then Sonnet, then Opus, escalating on failure
//! - **Cost-free First**: cloud tiers try the local CLI before the paid API
//! - **Resilience**: retry with backoff, circuit breakers, rate limits, fallbacks
//! - **Durable Queue**: SQLite-backed task records with crash recovery
//! - **Tool Supervision**: lifecycle of auxiliary tool processes
//!
//! # Architecture
//!
//! ```text
//! Controller ──► Complexity ──► Escalation Engine ──► Gateway ──► Provider
//!     │                                                 │
//!     ├── Task Queue (SQLite)                           ├── Circuit Breakers
//!     ├── Status Board ──► Notifier                     ├── Rate Limiters
//!     ├── Collaborators (knowledge / activity)          └── Error Stats + Alerts
//!     └── Tool Supervisor
//! ```

pub mod collaborators;
pub mod complexity;
pub mod config;
pub mod controller;
pub mod escalation;
pub mod providers;
pub mod queue;
pub mod rate_limit;
pub mod resilience;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod task;

pub use collaborators::{Activity, Collaborators, KnowledgeEntry, SqliteActivityLog};
pub use complexity::{classify, Complexity};
pub use config::Config;
pub use controller::{DispatchController, DispatchError, DispatchMode, DispatchResult, TierProviders};
pub use escalation::{EscalationContext, EscalationEngine, ExecutionMode, Tier, TierSpec};
pub use providers::{AnthropicApiProvider, ClaudeCliProvider, OllamaProvider, Provider, ProviderResponse};
pub use queue::{QueueError, RecoveryReport, TaskQueue};
pub use rate_limit::{RateLimitConfig, RateLimiter, RateLimiterRegistry};
pub use resilience::{
    CallError, CallOptions, CallOutcome, CircuitBreakerRegistry, CircuitState, ErrorKind, ErrorStats,
    Fallback, GatewayConfig, GatewayError, ResilientGateway, RetryPolicy,
};
pub use status::{EntryKind, StatusBoard, StatusSnapshot};
pub use store::{MemoryTaskStore, SqliteTaskStore, StoreError, TaskStore};
pub use supervisor::{ToolSpec, ToolStatus, ToolSupervisor};
pub use task::{Task, TaskStatus};
