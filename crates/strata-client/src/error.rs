// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for strata-client.

use serde_json::Value;
use thiserror::Error;

/// Result type using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;

/// How a sent operation failed.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The target document does not exist (404).
    #[error("document not found: {uri}")]
    NotFound { uri: String },

    /// The host rejected the request (400).
    #[error("bad request to {uri}: {message}")]
    BadRequest { uri: String, message: String },

    /// No completion before the deadline, a reported 408, or a deadline that
    /// had already passed when the operation was sent.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Any other non-success status. Status and body are preserved.
    #[error("operation on {uri} failed with status {status_code}: {message}")]
    RuntimeFailure {
        uri: String,
        status_code: u16,
        message: String,
        body: Option<Value>,
    },

    /// The completion channel was dropped before a completion arrived.
    #[error("operation interrupted: {0}")]
    Interrupted(String),

    /// Invalid input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The server set has no addresses to send to.
    #[error("server set is empty")]
    NoServers,
}

impl ClientError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::Timeout(_) => "TIMEOUT",
            Self::RuntimeFailure { .. } => "RUNTIME_FAILURE",
            Self::Interrupted(_) => "INTERRUPTED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::NoServers => "NO_SERVERS",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}
