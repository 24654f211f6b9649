//! Error types for the Punchclock core library.

use serde::Serialize;
use thiserror::Error;

use crate::db::DatabaseError;

/// Result type alias using the Punchclock error.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable, machine-readable error codes returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MalformedToken,
    InvalidSignature,
    TokenExpired,
    TokenAlreadyUsedOrExpired,
    TerminalNotFound,
    TerminalInactive,
    SequenceViolation,
    OutOfHours,
    DuplicateRecord,
    DailyLimitExceeded,
    ChainIntegrityViolation,
    StorageUnavailable,
    InvalidRequest,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedToken => "MALFORMED_TOKEN",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenAlreadyUsedOrExpired => "TOKEN_ALREADY_USED_OR_EXPIRED",
            Self::TerminalNotFound => "TERMINAL_NOT_FOUND",
            Self::TerminalInactive => "TERMINAL_INACTIVE",
            Self::SequenceViolation => "SEQUENCE_VIOLATION",
            Self::OutOfHours => "OUT_OF_HOURS",
            Self::DuplicateRecord => "DUPLICATE_RECORD",
            Self::DailyLimitExceeded => "DAILY_LIMIT_EXCEEDED",
            Self::ChainIntegrityViolation => "CHAIN_INTEGRITY_VIOLATION",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single blocking rule violation produced by scan validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub code: ErrorCode,
    pub message: String,
}

impl Violation {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Core error types for Punchclock operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Token signature does not match")]
    InvalidSignature,

    #[error("Token expired {expired_secs}s ago")]
    TokenExpired { expired_secs: i64 },

    #[error("Token was already used or has expired")]
    TokenAlreadyUsedOrExpired,

    #[error("Terminal not found: {0}")]
    TerminalNotFound(String),

    #[error("Terminal is inactive: {0}")]
    TerminalInactive(String),

    #[error("Sequence violation: {0}")]
    SequenceViolation(String),

    #[error("Outside permitted hours: {0}")]
    OutOfHours(String),

    #[error("Duplicate record: {0}")]
    DuplicateRecord(String),

    #[error("Daily limit exceeded: {0}")]
    DailyLimitExceeded(String),

    #[error("Chain integrity violation: {0}")]
    ChainIntegrityViolation(String),

    /// Scan validation failed with one or more blocking violations.
    #[error("Scan rejected: {}", join_violations(.0))]
    Rejected(Vec<Violation>),

    /// Transient storage failure; the only retryable error.
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Machine-readable code for this error. A rejection reports the code of
    /// its first violation.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedToken(_) => ErrorCode::MalformedToken,
            Self::InvalidSignature => ErrorCode::InvalidSignature,
            Self::TokenExpired { .. } => ErrorCode::TokenExpired,
            Self::TokenAlreadyUsedOrExpired => ErrorCode::TokenAlreadyUsedOrExpired,
            Self::TerminalNotFound(_) => ErrorCode::TerminalNotFound,
            Self::TerminalInactive(_) => ErrorCode::TerminalInactive,
            Self::SequenceViolation(_) => ErrorCode::SequenceViolation,
            Self::OutOfHours(_) => ErrorCode::OutOfHours,
            Self::DuplicateRecord(_) => ErrorCode::DuplicateRecord,
            Self::DailyLimitExceeded(_) => ErrorCode::DailyLimitExceeded,
            Self::ChainIntegrityViolation(_) => ErrorCode::ChainIntegrityViolation,
            Self::Rejected(violations) => violations
                .first()
                .map_or(ErrorCode::InvalidRequest, |v| v.code),
            Self::Storage(_) => ErrorCode::StorageUnavailable,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::Config(_) | Self::Json(_) | Self::Io(_) => ErrorCode::Internal,
        }
    }

    /// Whether the caller may retry the same request.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// The individual violations behind this error, if any.
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Rejected(v) => v,
            _ => &[],
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejected_reports_first_violation_code() {
        let err = Error::Rejected(vec![
            Violation::new(ErrorCode::DuplicateRecord, "tapped twice"),
            Violation::new(ErrorCode::SequenceViolation, "ENTRY after ENTRY"),
        ]);
        assert_eq!(err.code(), ErrorCode::DuplicateRecord);
        assert_eq!(err.violations().len(), 2);
        assert!(err.to_string().contains("tapped twice"));
    }

    #[test]
    fn only_storage_errors_are_retryable() {
        assert!(Error::Storage(DatabaseError::Query("locked".into())).is_retryable());
        assert!(!Error::TokenAlreadyUsedOrExpired.is_retryable());
        assert!(!Error::InvalidSignature.is_retryable());
    }

    #[test]
    fn codes_serialize_in_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::TokenAlreadyUsedOrExpired).unwrap();
        assert_eq!(json, "\"TOKEN_ALREADY_USED_OR_EXPIRED\"");
        assert_eq!(
            ErrorCode::DailyLimitExceeded.to_string(),
            "DAILY_LIMIT_EXCEEDED"
        );
    }
}
