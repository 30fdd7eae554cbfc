//! Error taxonomy shared across all Valet crates.
//!
//! "Not found" and "duplicate id" conditions are explicit error kinds
//! returned to the caller, never fatal. Storage failures propagate to the
//! immediate caller; the scheduler catches and logs them per firing.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ValetError>;

#[derive(Debug, Error)]
pub enum ValetError {
    /// A referenced task, notification, message, or conversation is absent.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Task id collision on insert. The caller must generate a fresh id.
    #[error("duplicate task id: {0}")]
    DuplicateId(String),

    /// A task references a bot id with no registered handler.
    #[error("no handler registered for bot id: {0}")]
    HandlerUnavailable(String),

    /// I/O failure on a durable operation.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Invalid configuration or invalid request shape.
    #[error("config error: {0}")]
    Config(String),
}

impl ValetError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<std::io::Error> for ValetError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_formats_kind_and_id() {
        let err = ValetError::not_found("task", "abc-123");
        assert_eq!(err.to_string(), "task not found: abc-123");
        assert!(err.is_not_found());
        assert!(!ValetError::DuplicateId("x".into()).is_not_found());
    }
}
