use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Unified application error for startup and wiring.
///
/// Once the monitor loop is running nothing is fatal: cycle-level failures
/// are reported through the heartbeat and the operational log instead.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed or unreadable monitor configuration. Aborts the current cycle.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Errors from the SQLite store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot open store: {0}")]
    Open(#[source] sqlx::Error),

    #[error("failed to write row: {0}")]
    Write(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),
}

/// Why a point failed during a cycle. Surfaced in the heartbeat, the
/// operational log and the `point_failures_total` metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    SourceUnavailable,
    SourceFormatError,
    StoreWriteError,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SourceUnavailable => "SourceUnavailable",
            FailureKind::SourceFormatError => "SourceFormatError",
            FailureKind::StoreWriteError => "StoreWriteError",
            FailureKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_messages_are_readable() {
        let err = ConfigError::invalid("interval_minutes must be at least 1");
        assert_eq!(
            err.to_string(),
            "invalid configuration: interval_minutes must be at least 1"
        );

        let app: AppError = AppError::Config(err.to_string());
        assert!(app.to_string().starts_with("Config error:"));
    }

    #[test]
    fn failure_kind_display_matches_taxonomy() {
        assert_eq!(FailureKind::SourceUnavailable.to_string(), "SourceUnavailable");
        assert_eq!(FailureKind::StoreWriteError.to_string(), "StoreWriteError");
    }
}
