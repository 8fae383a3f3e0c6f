//! Tier chain and escalation policy
//!
//! Static ordering of compute tiers plus the rules for moving a failed
//! task one rung up. All decisions here are deterministic; no calls out.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::complexity::Complexity;
use crate::task::{Task, TaskStatus};

/// Compute tiers, cheapest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Local Llama via Ollama - free
    Llama,
    /// Mid cloud tier
    Sonnet,
    /// Top cloud tier
    Opus,
}

impl Tier {
    pub const CHAIN: [Tier; 3] = [Tier::Llama, Tier::Sonnet, Tier::Opus];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Llama => "llama",
            Tier::Sonnet => "sonnet",
            Tier::Opus => "opus",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "llama" | "local" => Some(Tier::Llama),
            "sonnet" => Some(Tier::Sonnet),
            "opus" => Some(Tier::Opus),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a tier runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Local,
    Cloud,
}

/// Declared properties of one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSpec {
    pub tier: Tier,
    pub model: String,
    pub mode: ExecutionMode,
    /// USD charged per paid call
    pub cost_per_call: f64,
    /// Hardest work this tier is expected to handle well
    pub ceiling: Complexity,
}

impl TierSpec {
    pub fn can_handle(&self, complexity: Complexity) -> bool {
        complexity <= self.ceiling
    }
}

/// Stable document handed to the next tier on escalation.
///
/// Field order is fixed and every field is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationContext {
    pub original_prompt: String,
    pub category: String,
    pub prior_tier: String,
    pub escalation_count: u32,
    pub last_error: String,
    pub partial_result: String,
}

impl EscalationContext {
    pub fn to_json(&self) -> String {
        // Plain string/integer fields cannot fail to serialize
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Escalation policy over a fixed tier chain
#[derive(Debug, Clone)]
pub struct EscalationEngine {
    chain: Vec<TierSpec>,
    starting_tiers: HashMap<Complexity, Tier>,
}

impl EscalationEngine {
    /// Build an engine over the given chain (cheapest first)
    pub fn new(chain: Vec<TierSpec>) -> Self {
        let starting_tiers = HashMap::from([
            (Complexity::Simple, Tier::Llama),
            (Complexity::Medium, Tier::Llama),
            (Complexity::Complex, Tier::Sonnet),
            (Complexity::Strategic, Tier::Opus),
        ]);
        Self { chain, starting_tiers }
    }

    pub fn chain(&self) -> &[TierSpec] {
        &self.chain
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    pub fn spec(&self, tier: Tier) -> Option<&TierSpec> {
        self.chain.iter().find(|s| s.tier == tier)
    }

    /// Default starting tier for a complexity class
    pub fn starting_tier(&self, complexity: Complexity) -> Tier {
        self.starting_tiers
            .get(&complexity)
            .copied()
            .unwrap_or(Tier::Llama)
    }

    /// Execution mode a tier requires
    pub fn required_mode(&self, tier: Tier) -> ExecutionMode {
        self.spec(tier)
            .map(|s| s.mode)
            .unwrap_or(ExecutionMode::Cloud)
    }

    /// Next tier up the chain, or None at the top. Never wraps around.
    pub fn next(&self, tier: Tier) -> Option<Tier> {
        let pos = self.chain.iter().position(|s| s.tier == tier)?;
        self.chain.get(pos + 1).map(|s| s.tier)
    }

    /// Escalate only failed tasks that still have rungs left
    pub fn should_escalate(&self, task: &Task) -> bool {
        task.status == TaskStatus::Failed
            && (task.escalation_count as usize) < self.chain.len().saturating_sub(1)
    }

    /// Assemble the hand-off document for the next tier
    pub fn build_context(&self, task: &Task) -> EscalationContext {
        EscalationContext {
            original_prompt: task.prompt.clone(),
            category: task.complexity.as_str().to_string(),
            prior_tier: task
                .assigned_tier
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            escalation_count: task.escalation_count,
            last_error: task.error.clone().unwrap_or_default(),
            partial_result: task.result.clone().unwrap_or_default(),
        }
    }
}
