//! Rate Limiting for External Dependencies
//!
//! Tracks three independent ceilings per dependency:
//! - Requests per minute (sliding 60s window)
//! - Tokens per minute (sliding 60s window)
//! - Requests per day (resets when the local calendar day rolls over)
//!
//! Stale window entries are purged before every capacity check.

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitConfig {
    /// Maximum requests per sliding minute
    pub requests_per_minute: u32,
    /// Maximum tokens per sliding minute
    pub tokens_per_minute: u64,
    /// Maximum requests per calendar day
    pub requests_per_day: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 50,
            tokens_per_minute: 40_000,
            requests_per_day: 1_000,
        }
    }
}

/// Usage entry in the sliding window
#[derive(Debug, Clone, Copy)]
struct UsageEntry {
    at: Instant,
    tokens: u64,
}

#[derive(Debug)]
struct WindowState {
    entries: VecDeque<UsageEntry>,
    day: NaiveDate,
    daily_requests: u32,
}

impl WindowState {
    fn new(today: NaiveDate) -> Self {
        Self {
            entries: VecDeque::new(),
            day: today,
            daily_requests: 0,
        }
    }

    /// Drop entries that fell out of the window and roll the day counter
    fn purge(&mut self, now: Instant, today: NaiveDate) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.at) >= WINDOW {
                self.entries.pop_front();
            } else {
                break;
            }
        }

        if today != self.day {
            debug!("Daily request counter reset ({} -> {})", self.day, today);
            self.day = today;
            self.daily_requests = 0;
        }
    }

    fn tokens_in_window(&self) -> u64 {
        self.entries.iter().map(|e| e.tokens).sum()
    }
}

/// Sliding-window quota tracker for one dependency
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    pub fn new(name: &str, config: RateLimitConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: Mutex::new(WindowState::new(Local::now().date_naive())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Would a request of this size keep every ceiling intact?
    pub fn can_make_request(&self, estimated_tokens: u64) -> bool {
        self.can_make_request_at(estimated_tokens, Instant::now(), Local::now().date_naive())
    }

    /// Record a request that was made
    pub fn track_request(&self, tokens: u64) {
        self.track_request_at(tokens, Instant::now(), Local::now().date_naive());
    }

    /// Check and record in one critical section
    pub fn try_acquire(&self, estimated_tokens: u64) -> bool {
        self.try_acquire_at(estimated_tokens, Instant::now(), Local::now().date_naive())
    }

    fn has_capacity(&self, state: &WindowState, tokens: u64) -> bool {
        let requests = state.entries.len() as u64;
        requests < self.config.requests_per_minute as u64
            && state.tokens_in_window() + tokens <= self.config.tokens_per_minute
            && state.daily_requests < self.config.requests_per_day
    }

    fn can_make_request_at(&self, tokens: u64, now: Instant, today: NaiveDate) -> bool {
        let mut state = self.state.lock();
        state.purge(now, today);
        self.has_capacity(&state, tokens)
    }

    fn track_request_at(&self, tokens: u64, now: Instant, today: NaiveDate) {
        let mut state = self.state.lock();
        state.purge(now, today);
        state.entries.push_back(UsageEntry { at: now, tokens });
        state.daily_requests += 1;
    }

    fn try_acquire_at(&self, tokens: u64, now: Instant, today: NaiveDate) -> bool {
        let mut state = self.state.lock();
        state.purge(now, today);
        if !self.has_capacity(&state, tokens) {
            warn!(
                "Rate limit reached for {} ({} req/min, {} tokens/min, {} today)",
                self.name,
                state.entries.len(),
                state.tokens_in_window(),
                state.daily_requests
            );
            return false;
        }
        state.entries.push_back(UsageEntry { at: now, tokens });
        state.daily_requests += 1;
        true
    }

    /// Current usage
    pub fn stats(&self) -> RateLimitStats {
        let mut state = self.state.lock();
        state.purge(Instant::now(), Local::now().date_naive());
        RateLimitStats {
            name: self.name.clone(),
            requests_in_window: state.entries.len(),
            tokens_in_window: state.tokens_in_window(),
            requests_today: state.daily_requests,
            config: self.config.clone(),
        }
    }
}

/// Rate limit statistics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub name: String,
    pub requests_in_window: usize,
    pub tokens_in_window: u64,
    pub requests_today: u32,
    pub config: RateLimitConfig,
}

/// Limiters keyed by dependency name
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, config: RateLimitConfig) -> Arc<RateLimiter> {
        let limiter = Arc::new(RateLimiter::new(name, config));
        self.limiters
            .lock()
            .insert(name.to_string(), Arc::clone(&limiter));
        limiter
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.lock().get(name).cloned()
    }

    pub fn stats(&self) -> Vec<RateLimitStats> {
        let limiters: Vec<Arc<RateLimiter>> = self.limiters.lock().values().cloned().collect();
        let mut stats: Vec<RateLimitStats> = limiters.iter().map(|l| l.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

/// Rough token estimate: about four characters per token
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4).max(1)
}
