//! Configuration management

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::complexity::Complexity;
use crate::escalation::{ExecutionMode, Tier, TierSpec};
use crate::providers::OLLAMA_COMPONENT;
use crate::rate_limit::RateLimitConfig;
use crate::resilience::{BackoffStrategy, CircuitBreakerConfig, GatewayConfig, RetryPolicy};
use crate::supervisor::{ToolSpec, ToolTable};

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite task store
    pub db_path: PathBuf,

    /// Ollama URL for the local tier
    pub ollama_url: String,

    /// Local tier model
    pub llama_model: String,

    /// CLI binary for the cost-free cloud path
    pub claude_cli: String,

    /// Anthropic API key (optional - the paid path is unavailable without it)
    pub anthropic_api_key: Option<String>,

    pub sonnet_model: String,
    pub opus_model: String,

    /// Declared USD per paid call
    pub sonnet_cost: f64,
    pub opus_cost: f64,

    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,

    /// Deadline for cloud calls
    pub call_timeout: Duration,

    /// Deadline for local tier calls
    pub local_timeout: Duration,

    /// Direct API quota
    pub api_limits: RateLimitConfig,

    /// Concurrent dispatch workers
    pub workers: usize,

    /// TOML tool table
    pub tools_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup("TIERDISPATCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("tierdispatch")
                    .join("tasks.db")
            });

        let strategy = match lookup("TIERDISPATCH_BACKOFF") {
            Some(s) => match BackoffStrategy::parse(&s) {
                Some(strategy) => strategy,
                None => bail!("TIERDISPATCH_BACKOFF must be exponential, linear or constant, got '{}'", s),
            },
            None => BackoffStrategy::Exponential,
        };

        let retry = RetryPolicy {
            max_attempts: parse_var(&lookup, "TIERDISPATCH_MAX_ATTEMPTS", 3)?,
            base_delay: Duration::from_millis(parse_var(&lookup, "TIERDISPATCH_BASE_DELAY_MS", 1000)?),
            max_delay: Duration::from_millis(parse_var(&lookup, "TIERDISPATCH_MAX_DELAY_MS", 30_000)?),
            strategy,
            jitter: true,
        };
        if retry.max_attempts == 0 {
            bail!("TIERDISPATCH_MAX_ATTEMPTS must be at least 1");
        }

        let breaker = CircuitBreakerConfig {
            failure_threshold: parse_var(&lookup, "TIERDISPATCH_FAILURE_THRESHOLD", 5)?,
            recovery_timeout: Duration::from_secs(parse_var(&lookup, "TIERDISPATCH_RECOVERY_TIMEOUT_SECS", 60)?),
            half_open_max_requests: parse_var(&lookup, "TIERDISPATCH_HALF_OPEN_MAX", 1)?,
        };

        let api_limits = RateLimitConfig {
            requests_per_minute: parse_var(&lookup, "TIERDISPATCH_API_RPM", 50)?,
            tokens_per_minute: parse_var(&lookup, "TIERDISPATCH_API_TPM", 40_000)?,
            requests_per_day: parse_var(&lookup, "TIERDISPATCH_API_RPD", 1000)?,
        };

        Ok(Self {
            db_path,
            ollama_url: lookup("OLLAMA_URL").unwrap_or_else(|| "http://localhost:11434".to_string()),
            llama_model: lookup("LLAMA_MODEL").unwrap_or_else(|| "llama3.2:3b".to_string()),
            claude_cli: lookup("CLAUDE_CLI").unwrap_or_else(|| "claude".to_string()),
            anthropic_api_key: lookup("ANTHROPIC_API_KEY").filter(|k| !k.is_empty()),
            sonnet_model: lookup("TIERDISPATCH_SONNET_MODEL")
                .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
            opus_model: lookup("TIERDISPATCH_OPUS_MODEL")
                .unwrap_or_else(|| "claude-opus-4-20250514".to_string()),
            sonnet_cost: parse_var(&lookup, "TIERDISPATCH_SONNET_COST", 0.015)?,
            opus_cost: parse_var(&lookup, "TIERDISPATCH_OPUS_COST", 0.075)?,
            retry,
            breaker,
            call_timeout: Duration::from_secs(parse_var(&lookup, "TIERDISPATCH_CALL_TIMEOUT_SECS", 120)?),
            local_timeout: Duration::from_secs(parse_var(&lookup, "TIERDISPATCH_LOCAL_TIMEOUT_SECS", 60)?),
            api_limits,
            workers: parse_var(&lookup, "TIERDISPATCH_WORKERS", 2)?,
            tools_path: lookup("TIERDISPATCH_TOOLS").map(PathBuf::from),
        })
    }

    /// Tier chain, cheapest first
    pub fn tier_chain(&self) -> Vec<TierSpec> {
        vec![
            TierSpec {
                tier: Tier::Llama,
                model: self.llama_model.clone(),
                mode: ExecutionMode::Local,
                cost_per_call: 0.0,
                ceiling: Complexity::Medium,
            },
            TierSpec {
                tier: Tier::Sonnet,
                model: self.sonnet_model.clone(),
                mode: ExecutionMode::Cloud,
                cost_per_call: self.sonnet_cost,
                ceiling: Complexity::Complex,
            },
            TierSpec {
                tier: Tier::Opus,
                model: self.opus_model.clone(),
                mode: ExecutionMode::Cloud,
                cost_per_call: self.opus_cost,
                ceiling: Complexity::Strategic,
            },
        ]
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            retry: self.retry.clone(),
            default_timeout: self.call_timeout,
            timeouts: HashMap::from([(OLLAMA_COMPONENT.to_string(), self.local_timeout)]),
        }
    }

    /// Tool launch specs from the TOML table, empty when none is configured
    pub fn load_tools(&self) -> Result<Vec<ToolSpec>> {
        match &self.tools_path {
            Some(path) => {
                let table = ToolTable::load(path)
                    .with_context(|| format!("Failed to load tool table {}", path.display()))?;
                Ok(table.tools)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Activity log lives next to the task store
    pub fn activity_db_path(&self) -> PathBuf {
        self.db_path.with_file_name("activity.db")
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", name, raw, e)),
        None => Ok(default),
    }
}
