//! Complexity Estimator
//!
//! Keyword and structure based classification of incoming work.
//! Pure and table-driven: the same text always yields the same class.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Difficulty class driving tier selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
    Strategic,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
            Complexity::Strategic => "strategic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Some(Complexity::Simple),
            "medium" => Some(Complexity::Medium),
            "complex" => Some(Complexity::Complex),
            "strategic" => Some(Complexity::Strategic),
            _ => None,
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Keyword sets
static STRATEGIC_KEYWORDS: &[&str] = &[
    "strategy", "strategic", "roadmap", "long-term", "business plan",
    "product vision", "company vision", "go-to-market", "organization-wide", "company-wide",
    "multi-year", "quarterly plan",
];

static COMPLEX_KEYWORDS: &[&str] = &[
    "architecture", "architect", "refactor", "design", "security audit",
    "vulnerability", "migrate", "migration", "optimize", "performance",
    "distributed", "concurrency", "debug", "integrate", "implement",
];

static MEDIUM_KEYWORDS: &[&str] = &[
    "explain", "compare", "summarize", "summary", "review", "analyze",
    "analysis", "write", "draft", "update", "fix", "test", "document",
];

/// Lines that look like list entries: digit, dash, asterisk or bullet
static ACTION_ITEM_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:\d|-|\*|•|·|▪|‣)").expect("action item pattern is valid")
});

/// Thresholds and keyword tables for classification
#[derive(Debug, Clone)]
pub struct ComplexityRules {
    pub strategic_keywords: &'static [&'static str],
    pub complex_keywords: &'static [&'static str],
    pub medium_keywords: &'static [&'static str],
    /// Action items at or above this count make work Complex
    pub complex_action_items: usize,
    /// Action items at or above this count make work Medium
    pub medium_action_items: usize,
    /// Text longer than this (in characters) is at least Medium
    pub medium_length: usize,
}

impl Default for ComplexityRules {
    fn default() -> Self {
        Self {
            strategic_keywords: STRATEGIC_KEYWORDS,
            complex_keywords: COMPLEX_KEYWORDS,
            medium_keywords: MEDIUM_KEYWORDS,
            complex_action_items: 5,
            medium_action_items: 3,
            medium_length: 500,
        }
    }
}

impl ComplexityRules {
    /// Classify text against these rules.
    ///
    /// Evaluation order matters: Strategic keywords win over everything,
    /// then Complex signals, then Medium signals.
    pub fn classify(&self, text: &str) -> Complexity {
        let lower = text.to_lowercase();
        let matches_any = |keywords: &[&str]| keywords.iter().any(|kw| lower.contains(kw));

        if matches_any(self.strategic_keywords) {
            return Complexity::Strategic;
        }

        let action_items = count_action_items(text);

        if matches_any(self.complex_keywords) || action_items >= self.complex_action_items {
            return Complexity::Complex;
        }

        if matches_any(self.medium_keywords)
            || action_items >= self.medium_action_items
            || text.chars().count() > self.medium_length
        {
            return Complexity::Medium;
        }

        Complexity::Simple
    }
}

/// Classify text with the default rules
pub fn classify(text: &str) -> Complexity {
    ComplexityRules::default().classify(text)
}

/// Count list-style lines (numbered, dashed, starred or bulleted)
pub fn count_action_items(text: &str) -> usize {
    text.lines().filter(|line| ACTION_ITEM_PATTERN.is_match(line)).count()
}
