use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Duplicate key error code reported by the store on a unique index violation.
pub const DUPLICATE_KEY: i32 = 11000;
/// Code reported for commands the store does not understand.
pub const COMMAND_NOT_FOUND: i32 = 59;
/// Code reported when the store cannot be reached.
pub const HOST_UNREACHABLE: i32 = 6;

/// Raised synchronously while validating a workload, before any side effect.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("thread_count must be positive")]
    ZeroThreadCount,

    #[error("iterations must be positive")]
    ZeroIterations,

    #[error("start state '{0}' is not a declared state")]
    UnknownStartState(String),

    #[error("transitions declared for unknown state '{0}'")]
    UnknownSource(String),

    #[error("transitions for state '{0}' are declared more than once")]
    DuplicateSource(String),

    #[error("transition {from} -> {to} targets an unknown state")]
    UnknownTarget { from: String, to: String },

    #[error("terminal state '{0}' is not a declared state")]
    UnknownTerminal(String),

    #[error("transition {from} -> {to} has invalid weight {weight}")]
    InvalidWeight { from: String, to: String, weight: f64 },

    #[error("state '{0}' is reachable but has no outgoing transition with positive weight")]
    DeadEnd(String),

    #[error("state '{0}' has no outgoing transitions")]
    NoTransitions(String),
}

/// Structured failure returned by a [`Connection`](crate::store::Connection) call.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct StoreError {
    pub code: i32,
    pub message: String,
}

impl StoreError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unreachable() -> Self {
        Self::new(HOST_UNREACHABLE, "store is unreachable")
    }
}

/// Failure produced by a state handler or a setup/teardown hook.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{message} (code {code})")]
    Coded { code: i32, message: String },

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn coded(code: i32, message: impl Into<String>) -> Self {
        Self::Coded {
            code,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// The error code, if the failure carries one.
    pub fn code(&self) -> Option<i32> {
        match self {
            HandlerError::Store(e) => Some(e.code),
            HandlerError::Coded { code, .. } => Some(*code),
            HandlerError::Failed(_) => None,
        }
    }
}

/// Classifies a handler failure against the workload's declared expected codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Declared by the workload; swallowed and the state machine advances.
    Expected,
    /// Anything else; halts the worker that produced it.
    Unexpected,
}

impl ErrorClass {
    pub fn of(error: &HandlerError, expected_codes: &[i32]) -> Self {
        match error.code() {
            Some(code) if expected_codes.contains(&code) => ErrorClass::Expected,
            _ => ErrorClass::Unexpected,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Expected => write!(f, "Expected"),
            ErrorClass::Unexpected => write!(f, "Unexpected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_codes() {
        let store: HandlerError = StoreError::new(DUPLICATE_KEY, "dup").into();
        assert_eq!(store.code(), Some(DUPLICATE_KEY));
        assert_eq!(HandlerError::coded(42, "boom").code(), Some(42));
        assert_eq!(HandlerError::failed("no code").code(), None);
    }

    #[test]
    fn classify_expected_and_unexpected() {
        let dup: HandlerError = StoreError::new(DUPLICATE_KEY, "dup").into();
        assert_eq!(ErrorClass::of(&dup, &[DUPLICATE_KEY]), ErrorClass::Expected);
        assert_eq!(ErrorClass::of(&dup, &[]), ErrorClass::Unexpected);
        assert_eq!(
            ErrorClass::of(&HandlerError::failed("x"), &[DUPLICATE_KEY]),
            ErrorClass::Unexpected
        );
        assert_eq!(ErrorClass::Expected.to_string(), "Expected");
    }

    #[test]
    fn store_error_display() {
        let err = StoreError::new(DUPLICATE_KEY, "duplicate key");
        assert_eq!(err.to_string(), "duplicate key (code 11000)");
        let wrapped: HandlerError = err.into();
        assert_eq!(wrapped.to_string(), "duplicate key (code 11000)");
    }
}
