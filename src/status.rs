//! Operator status surface
//!
//! Bounded board of recent task events plus per-tier call counts and the
//! running cost. Each entry is also pushed to a [`Notifier`] (chat bot,
//! pager, ...); the default one just logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

use crate::escalation::Tier;
use crate::rate_limit::RateLimitStats;
use crate::resilience::{BreakerSnapshot, ErrorStatsSnapshot};
use crate::supervisor::ToolInfo;

/// Entries kept before the oldest are dropped
pub const DEFAULT_ENTRY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    InProgress,
    Completed,
    /// Needs an operator; never retried automatically
    ActionRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEntry {
    pub task_id: String,
    pub kind: EntryKind,
    pub tier: Option<Tier>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Receives every status entry
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, entry: &StatusEntry);
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, entry: &StatusEntry) {
        let tier = entry.tier.map(|t| t.as_str()).unwrap_or("-");
        match entry.kind {
            EntryKind::ActionRequired => warn!(
                task_id = %entry.task_id,
                tier,
                "Action required: {}",
                entry.message
            ),
            _ => info!(
                task_id = %entry.task_id,
                tier,
                kind = ?entry.kind,
                "{}",
                entry.message
            ),
        }
    }
}

#[derive(Default)]
struct Board {
    entries: VecDeque<StatusEntry>,
    tier_calls: BTreeMap<Tier, u64>,
    accrued_cost: f64,
}

pub struct StatusBoard {
    board: Mutex<Board>,
    notifier: Arc<dyn Notifier>,
    limit: usize,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(Arc::new(LogNotifier))
    }
}

impl StatusBoard {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            board: Mutex::new(Board::default()),
            notifier,
            limit: DEFAULT_ENTRY_LIMIT,
        }
    }

    /// Keep at most `limit` entries (at least one)
    pub fn with_entry_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Append an entry and notify
    pub async fn post(
        &self,
        task_id: &str,
        kind: EntryKind,
        tier: Option<Tier>,
        message: impl Into<String>,
    ) -> StatusEntry {
        let entry = StatusEntry {
            task_id: task_id.to_string(),
            kind,
            tier,
            message: message.into(),
            at: Utc::now(),
        };
        {
            let mut board = self.board.lock();
            if board.entries.len() >= self.limit {
                board.entries.pop_front();
            }
            board.entries.push_back(entry.clone());
        }
        self.notifier.notify(&entry).await;
        entry
    }

    /// Count one provider call against a tier
    pub fn record_call(&self, tier: Tier) {
        *self.board.lock().tier_calls.entry(tier).or_insert(0) += 1;
    }

    pub fn add_cost(&self, cost: f64) {
        self.board.lock().accrued_cost += cost;
    }

    pub fn entries(&self) -> Vec<StatusEntry> {
        self.board.lock().entries.iter().cloned().collect()
    }

    pub fn has_entries_for(&self, task_id: &str) -> bool {
        self.board.lock().entries.iter().any(|e| e.task_id == task_id)
    }

    pub fn entries_for(&self, task_id: &str) -> Vec<StatusEntry> {
        self.board
            .lock()
            .entries
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn tier_calls(&self) -> BTreeMap<String, u64> {
        self.board
            .lock()
            .tier_calls
            .iter()
            .map(|(tier, n)| (tier.as_str().to_string(), *n))
            .collect()
    }

    pub fn accrued_cost(&self) -> f64 {
        self.board.lock().accrued_cost
    }
}

/// Everything an operator can ask about, in one JSON-serializable value
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub pending_count: usize,
    pub breakers: Vec<BreakerSnapshot>,
    pub tier_calls: BTreeMap<String, u64>,
    pub accrued_cost: f64,
    pub rate_limits: Vec<RateLimitStats>,
    pub tools: Vec<ToolInfo>,
    pub errors: ErrorStatsSnapshot,
    pub action_required: Vec<StatusEntry>,
}

impl StatusSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
    }
}
