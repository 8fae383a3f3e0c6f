//! Error statistics for health reporting
//!
//! Owned by whoever builds the gateway and shared by `Arc`; not a global.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use super::error::ErrorKind;

#[derive(Debug, Default)]
struct Counters {
    total_errors: u64,
    by_component: HashMap<String, u64>,
    by_kind: HashMap<ErrorKind, u64>,
    recoveries: u64,
    fallbacks: u64,
}

/// Running failure counters
#[derive(Debug, Default)]
pub struct ErrorStats {
    counters: Mutex<Counters>,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, component: &str, kind: ErrorKind) {
        let mut c = self.counters.lock();
        c.total_errors += 1;
        *c.by_component.entry(component.to_string()).or_insert(0) += 1;
        *c.by_kind.entry(kind).or_insert(0) += 1;
    }

    /// A call succeeded after at least one failed attempt
    pub fn record_recovery(&self) {
        self.counters.lock().recoveries += 1;
    }

    pub fn record_fallback(&self) {
        self.counters.lock().fallbacks += 1;
    }

    pub fn snapshot(&self) -> ErrorStatsSnapshot {
        let c = self.counters.lock();
        ErrorStatsSnapshot {
            total_errors: c.total_errors,
            by_component: c.by_component.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            by_kind: c
                .by_kind
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            recoveries: c.recoveries,
            fallbacks: c.fallbacks,
        }
    }
}

/// Copy of the counters at one point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStatsSnapshot {
    pub total_errors: u64,
    pub by_component: BTreeMap<String, u64>,
    pub by_kind: BTreeMap<String, u64>,
    pub recoveries: u64,
    pub fallbacks: u64,
}

impl ErrorStatsSnapshot {
    /// Format for display
    pub fn format(&self) -> String {
        format!(
            "{} errors across {} components, {} recoveries, {} fallbacks",
            self.total_errors,
            self.by_component.len(),
            self.recoveries,
            self.fallbacks
        )
    }
}
