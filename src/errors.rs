//! Closed error taxonomy shared by stages, the registry, and the failure ledger.
//!
//! Collaborators report raw kinds; the stage runner wraps them with retry and
//! circuit-breaker semantics; the orchestrator decides terminal vs
//! non-terminal. The set of kinds is fixed so that the ledger and breakers can
//! key on them without free-form strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat error taxonomy used in logs, the failure ledger, and breaker decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Config,
    NotFound,
    Corrupt,
    Validation,
    MissingTable,
    NoCalibrator,
    LowVisibility,
    Transient,
    Resource,
    Timeout,
    CircuitOpen,
    Conflict,
    Permanent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "Config",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Corrupt => "Corrupt",
            ErrorKind::Validation => "Validation",
            ErrorKind::MissingTable => "MissingTable",
            ErrorKind::NoCalibrator => "NoCalibrator",
            ErrorKind::LowVisibility => "LowVisibility",
            ErrorKind::Transient => "Transient",
            ErrorKind::Resource => "Resource",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::CircuitOpen => "CircuitOpen",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Permanent => "Permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Config" => ErrorKind::Config,
            "NotFound" => ErrorKind::NotFound,
            "Corrupt" => ErrorKind::Corrupt,
            "Validation" => ErrorKind::Validation,
            "MissingTable" => ErrorKind::MissingTable,
            "NoCalibrator" => ErrorKind::NoCalibrator,
            "LowVisibility" => ErrorKind::LowVisibility,
            "Transient" => ErrorKind::Transient,
            "Resource" => ErrorKind::Resource,
            "Timeout" => ErrorKind::Timeout,
            "CircuitOpen" => ErrorKind::CircuitOpen,
            "Conflict" => ErrorKind::Conflict,
            "Permanent" => ErrorKind::Permanent,
            _ => return None,
        })
    }

    /// Kinds that declare themselves retryable regardless of message text.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Resource)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error value carried out of every stage and collaborator call.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corrupt, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }
}

pub type StageResult<T> = Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        for kind in [
            ErrorKind::Config,
            ErrorKind::NotFound,
            ErrorKind::Corrupt,
            ErrorKind::Validation,
            ErrorKind::MissingTable,
            ErrorKind::NoCalibrator,
            ErrorKind::LowVisibility,
            ErrorKind::Transient,
            ErrorKind::Resource,
            ErrorKind::Timeout,
            ErrorKind::CircuitOpen,
            ErrorKind::Conflict,
            ErrorKind::Permanent,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("Bogus"), None);
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Resource.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
    }
}
