// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for strata-workflows.

use strata_client::ClientError;
use strata_core::CoreError;
use thiserror::Error;

/// Result type using WorkflowError.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Failure of a workflow step. Every variant ends up as the failure message
/// of a FAILED task state.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A request to the local document group failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A request to a remote document cluster failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// An external collaborator (provisioner, etcd, swarm) failed.
    #[error("{0}")]
    External(String),

    /// The task document does not carry what the step needs.
    #[error("invalid task state: {0}")]
    InvalidState(String),
}

impl WorkflowError {
    pub fn external(message: impl Into<String>) -> Self {
        Self::External(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Core(e) => e.error_code(),
            Self::Client(e) => e.error_code(),
            Self::External(_) => "EXTERNAL_FAILURE",
            Self::InvalidState(_) => "INVALID_TASK_STATE",
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Core(CoreError::from(err))
    }
}
