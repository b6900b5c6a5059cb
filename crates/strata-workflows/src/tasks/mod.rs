// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task workflows.
//!
//! Every workflow follows the same loop: a hook sees a committed stage, does
//! the work for it, and self-patches the next stage. Failures always end in a
//! FAILED patch carrying the error message.

pub mod allocate_host_resource;
pub mod cluster_create;
pub mod copy_state;
pub mod copy_state_trigger;

use serde::Serialize;
use serde_json::json;
use strata_core::ServiceContext;
use strata_protocol::task::is_operation_processing_disabled;
use strata_protocol::{NoSubStage, TaskState};
use tracing::warn;

pub use allocate_host_resource::{AllocateHostResourceService, AllocateHostResourceState};
pub use cluster_create::{ClusterCreateService, ClusterCreateState, ClusterCreateStep};
pub use copy_state::{CopyStateService, CopyStateState};
pub use copy_state_trigger::{CopyStateTriggerService, CopyStateTriggerState, ExecutionState};

/// Move the task to `state` through a self-patch.
pub(crate) fn send_stage<S: Serialize>(ctx: &ServiceContext, state: TaskState<S>) {
    ctx.send_self_patch(&json!({ "taskState": state }));
}

/// Fail the task with `message`.
pub(crate) fn fail_task(ctx: &ServiceContext, message: impl Into<String>) {
    let message = message.into();
    warn!(link = %ctx.self_link(), %message, "Task failed");
    send_stage(ctx, TaskState::<NoSubStage>::failed(message));
}

/// Whether continuations are enabled for a document with these flags.
pub(crate) fn processing_enabled(control_flags: Option<u32>) -> bool {
    !is_operation_processing_disabled(control_flags)
}
