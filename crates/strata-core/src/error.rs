// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for strata-core.
//!
//! Provides a unified error type that maps to failed operation responses.

use std::fmt;

use strata_protocol::ServiceErrorResponse;
use strata_protocol::operation::{
    STATUS_CODE_BAD_REQUEST, STATUS_CODE_CONFLICT, STATUS_CODE_INTERNAL_ERROR,
    STATUS_CODE_NOT_FOUND, STATUS_CODE_UNAVAILABLE,
};

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while serving an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    /// A required field is missing or the document shape is invalid.
    StructuralValidation {
        /// What was wrong.
        message: String,
    },

    /// A patch tried to change a field that is fixed at creation.
    ImmutableFieldViolation {
        /// The offending field.
        field: String,
    },

    /// A stage/sub-stage move that the transition table does not allow.
    IllegalTransition {
        /// Current stage and sub-stage.
        from: String,
        /// Requested stage and sub-stage.
        to: String,
    },

    /// Document does not exist.
    NotFound {
        /// The link that was looked up.
        link: String,
    },

    /// A non-idempotent factory was asked to create an existing document.
    Conflict {
        /// The existing link.
        link: String,
    },

    /// The request could not be interpreted.
    BadRequest(String),

    /// Storage backend failure.
    Persistence {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A peer or the owner could not be reached.
    Unavailable(String),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::StructuralValidation {
            message: message.into(),
        }
    }

    pub fn not_found(link: impl Into<String>) -> Self {
        Self::NotFound { link: link.into() }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StructuralValidation { .. } => "STRUCTURAL_VALIDATION",
            Self::ImmutableFieldViolation { .. } => "IMMUTABLE_FIELD_VIOLATION",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Persistence { .. } => "PERSISTENCE_ERROR",
            Self::Unavailable(_) => "UNAVAILABLE",
        }
    }

    /// HTTP status the failed operation completes with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::StructuralValidation { .. }
            | Self::ImmutableFieldViolation { .. }
            | Self::IllegalTransition { .. }
            | Self::BadRequest(_) => STATUS_CODE_BAD_REQUEST,
            Self::NotFound { .. } => STATUS_CODE_NOT_FOUND,
            Self::Conflict { .. } => STATUS_CODE_CONFLICT,
            Self::Persistence { .. } => STATUS_CODE_INTERNAL_ERROR,
            Self::Unavailable(_) => STATUS_CODE_UNAVAILABLE,
        }
    }

    /// Convert this error to the body of a failed operation.
    pub fn to_error_response(&self) -> ServiceErrorResponse {
        ServiceErrorResponse::new(self.status_code(), self.to_string())
            .with_error_code(self.error_code())
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StructuralValidation { message } => write!(f, "{}", message),
            Self::ImmutableFieldViolation { field } => {
                write!(f, "{} is immutable", field)
            }
            Self::IllegalTransition { from, to } => {
                write!(f, "Invalid stage update {} -> {}", from, to)
            }
            Self::NotFound { link } => write!(f, "Document '{}' not found", link),
            Self::Conflict { link } => write!(f, "Document '{}' already exists", link),
            Self::BadRequest(message) => write!(f, "Bad request: {}", message),
            Self::Persistence { operation, details } => {
                write!(f, "Persistence error during '{}': {}", operation, details)
            }
            Self::Unavailable(message) => write!(f, "Unavailable: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Persistence {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::BadRequest(err.to_string())
    }
}
