//! Failure taxonomy
//!
//! Every failed external call carries an explicit [`ErrorKind`] chosen at
//! the call site. Severity and retry policy are fixed lookups on the kind.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What went wrong, as tagged by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connectivity,
    Unavailable,
    RateLimit,
    Authentication,
    Permission,
    Configuration,
    Validation,
    Parse,
    ProcessLaunch,
    StorageWrite,
    Unknown,
}

/// How loudly a failure should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Permission => "permission",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::Parse => "parse",
            ErrorKind::ProcessLaunch => "process_launch",
            ErrorKind::StorageWrite => "storage_write",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Authentication | ErrorKind::Permission | ErrorKind::Configuration => {
                Severity::Critical
            }
            // A tool that will not launch is an availability problem
            ErrorKind::Connectivity
            | ErrorKind::Unavailable
            | ErrorKind::RateLimit
            | ErrorKind::ProcessLaunch => Severity::High,
            ErrorKind::Timeout | ErrorKind::Validation | ErrorKind::Parse => Severity::Medium,
            ErrorKind::StorageWrite | ErrorKind::Unknown => Severity::Low,
        }
    }

    /// Whether another attempt inside the gateway loop may help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Connectivity
                | ErrorKind::Unavailable
                | ErrorKind::RateLimit
                | ErrorKind::Unknown
        )
    }

    /// Map an HTTP status code to a kind
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Permission,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            400 | 404 | 413 | 422 => ErrorKind::Validation,
            500..=599 => ErrorKind::Unavailable,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Severity {
    pub fn should_alert(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

/// A failed call, tagged with its kind
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connectivity, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
