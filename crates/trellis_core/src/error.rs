//! Core error types for TRELLIS.
//!
//! `CoreError` covers usage and state-corruption failures of the runtime
//! itself. Failures of application logic travel as [`crate::Escalation`].

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Runtime used in a way that corrupts its state (e.g. detach without attach)
    #[error("Illegal state: {reason}")]
    IllegalState {
        /// What was wrong
        reason: String,
    },

    /// Index or entity not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of entity
        kind: String,
        /// Identifier or index
        id: String,
    },

    /// Validation error
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Field being validated
        field: String,
        /// Reason for failure
        reason: String,
    },

    /// Work was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error (for unexpected errors)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl CoreError {
    /// Shorthand for [`CoreError::IllegalState`]
    #[must_use]
    pub fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`CoreError::NotFound`]
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation {
            field: "config".to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::illegal_state("detach without attach");
        assert_eq!(format!("{}", err), "Illegal state: detach without attach");

        let err = CoreError::not_found("Managed object", 3);
        assert_eq!(format!("{}", err), "Managed object not found: 3");
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(CoreError::Cancelled, CoreError::Cancelled);
        assert_ne!(CoreError::Cancelled, CoreError::illegal_state("x"));
    }

    #[test]
    fn test_from_json_error() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let core: CoreError = err.into();
        assert!(matches!(core, CoreError::Validation { .. }));
    }
}
