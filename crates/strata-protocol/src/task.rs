// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task progress record embedded in workflow documents.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::operation::{STATUS_CODE_INTERNAL_ERROR, ServiceErrorResponse};

/// Disables automatic continuation after start and patch. Used to exercise a
/// single stage in isolation.
pub const CONTROL_FLAG_OPERATION_PROCESSING_DISABLED: u32 = 0x1;

pub fn is_operation_processing_disabled(control_flags: Option<u32>) -> bool {
    control_flags.unwrap_or(0) & CONTROL_FLAG_OPERATION_PROCESSING_DISABLED != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStage {
    Created,
    Started,
    Finished,
    Failed,
    Cancelled,
}

impl TaskStage {
    /// FINISHED, FAILED and CANCELLED have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStage::Finished | TaskStage::Failed | TaskStage::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStage::Created => "CREATED",
            TaskStage::Started => "STARTED",
            TaskStage::Finished => "FINISHED",
            TaskStage::Failed => "FAILED",
            TaskStage::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-stage type for tasks that only move between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoSubStage {}

/// Stage, optional sub-stage and failure detail of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState<S> {
    pub stage: TaskStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_stage: Option<S>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ServiceErrorResponse>,
}

impl<S> Default for TaskState<S> {
    fn default() -> Self {
        Self::new(TaskStage::Created)
    }
}

impl<S> TaskState<S> {
    pub fn new(stage: TaskStage) -> Self {
        Self {
            stage,
            sub_stage: None,
            failure: None,
        }
    }

    pub fn started(sub_stage: S) -> Self {
        Self {
            stage: TaskStage::Started,
            sub_stage: Some(sub_stage),
            failure: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            stage: TaskStage::Failed,
            sub_stage: None,
            failure: Some(ServiceErrorResponse::new(STATUS_CODE_INTERNAL_ERROR, message)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn failure_message(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.message.as_str())
    }
}
