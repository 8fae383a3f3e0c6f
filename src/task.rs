//! Task model
//!
//! A unit of work moving through the tier chain. Status only moves
//! forward; Completed and Failed are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::complexity::Complexity;
use crate::escalation::Tier;

/// Context keys written by the dispatcher
pub mod context_keys {
    pub const MODE: &str = "mode";
    pub const FORCED_TIER: &str = "forced_tier";
    pub const SYSTEM_PROMPT: &str = "system_prompt";
    pub const ESCALATION: &str = "escalation";
    pub const ANALYSIS: &str = "analysis";
    pub const RECOMMENDATION: &str = "recommendation";
}

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Escalated,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Escalated => "escalated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "escalated" => Some(TaskStatus::Escalated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether a dequeuer may pick this task up
    pub fn is_runnable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Escalated)
    }

    /// Forward-only transition graph.
    ///
    /// Re-entering the same terminal state is allowed so that
    /// complete/fail stay idempotent.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, InProgress) | (Pending, Failed) => true,
            (InProgress, Completed) | (InProgress, Failed) | (InProgress, Escalated) => true,
            (Escalated, InProgress) | (Escalated, Failed) => true,
            (Completed, Completed) | (Failed, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submitted unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub complexity: Complexity,
    pub status: TaskStatus,
    pub assigned_tier: Option<Tier>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub context: HashMap<String, String>,
    pub escalation_count: u32,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(prompt: &str, complexity: Complexity) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.to_string(),
            complexity,
            status: TaskStatus::Pending,
            assigned_tier: None,
            result: None,
            error: None,
            context: HashMap::new(),
            escalation_count: 0,
            cost: 0.0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_context(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(|s| s.as_str())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
