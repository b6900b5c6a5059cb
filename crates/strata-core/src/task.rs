// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declarative stage/sub-stage transition tables.
//!
//! A workflow declares its valid starting points and an explicit allow-list
//! of `(stage, sub-stage) -> (stage, sub-stage)` moves. Anything not listed is
//! rejected before the patch is applied.

use std::fmt::Debug;

use strata_protocol::{NoSubStage, TaskStage, TaskState};

use crate::error::{CoreError, Result};

/// A stage with its optional sub-stage.
pub type StagePair<S> = (TaskStage, Option<S>);

/// Allowed starts and transitions of one workflow.
#[derive(Debug)]
pub struct TransitionTable<S: 'static> {
    pub valid_starts: &'static [StagePair<S>],
    pub transitions: &'static [(StagePair<S>, StagePair<S>)],
}

impl<S> TransitionTable<S>
where
    S: Copy + PartialEq + Debug + 'static,
{
    pub fn is_valid_start(&self, stage: TaskStage, sub_stage: Option<S>) -> bool {
        self.valid_starts.contains(&(stage, sub_stage))
    }

    pub fn is_allowed(&self, from: StagePair<S>, to: StagePair<S>) -> bool {
        self.transitions.iter().any(|(f, t)| *f == from && *t == to)
    }

    /// Check the task state a document is started with.
    pub fn validate_start(&self, state: Option<&TaskState<S>>) -> Result<()> {
        let state = state.ok_or_else(|| CoreError::validation("taskState cannot be null"))?;

        if state.failure.is_some() && state.stage != TaskStage::Failed {
            return Err(CoreError::validation(format!(
                "taskState.failure is only valid when FAILED, stage is {}",
                state.stage
            )));
        }

        if !self.is_valid_start(state.stage, state.sub_stage) {
            return Err(CoreError::validation(format!(
                "Invalid start state {}",
                describe(state.stage, state.sub_stage)
            )));
        }

        Ok(())
    }

    /// Check a patch's task state against the current one. A patch without a
    /// task state does not move the task and is always accepted here.
    pub fn validate_transition(
        &self,
        current: Option<&TaskState<S>>,
        patch: Option<&TaskState<S>>,
    ) -> Result<()> {
        let Some(patch) = patch else {
            return Ok(());
        };
        let current = current.ok_or_else(|| CoreError::validation("taskState cannot be null"))?;

        let from = (current.stage, current.sub_stage);
        let to = (patch.stage, patch.sub_stage);

        if current.stage.is_terminal() || !self.is_allowed(from, to) {
            return Err(CoreError::IllegalTransition {
                from: describe(from.0, from.1),
                to: describe(to.0, to.1),
            });
        }

        match (patch.stage, patch.failure.is_some()) {
            (TaskStage::Failed, false) => Err(CoreError::BadRequest(
                "taskState.failure is required when moving to FAILED".to_string(),
            )),
            (stage, true) if stage != TaskStage::Failed => Err(CoreError::BadRequest(format!(
                "taskState.failure is only valid when FAILED, stage is {}",
                stage
            ))),
            _ => Ok(()),
        }
    }
}

fn describe<S: Debug>(stage: TaskStage, sub_stage: Option<S>) -> String {
    match sub_stage {
        Some(sub_stage) => format!("{}:{:?}", stage, sub_stage),
        None => stage.to_string(),
    }
}

/// Transitions for tasks that only move between stages: CREATED or STARTED
/// may go to STARTED or any terminal stage.
pub const STAGE_ONLY_TRANSITIONS: &[(StagePair<NoSubStage>, StagePair<NoSubStage>)] = &[
    ((TaskStage::Created, None), (TaskStage::Started, None)),
    ((TaskStage::Created, None), (TaskStage::Finished, None)),
    ((TaskStage::Created, None), (TaskStage::Failed, None)),
    ((TaskStage::Created, None), (TaskStage::Cancelled, None)),
    ((TaskStage::Started, None), (TaskStage::Started, None)),
    ((TaskStage::Started, None), (TaskStage::Finished, None)),
    ((TaskStage::Started, None), (TaskStage::Failed, None)),
    ((TaskStage::Started, None), (TaskStage::Cancelled, None)),
];

/// Every stage is a valid start for a stage-only task.
pub const STAGE_ONLY_STARTS: &[StagePair<NoSubStage>] = &[
    (TaskStage::Created, None),
    (TaskStage::Started, None),
    (TaskStage::Finished, None),
    (TaskStage::Failed, None),
    (TaskStage::Cancelled, None),
];

pub const STAGE_ONLY: TransitionTable<NoSubStage> = TransitionTable {
    valid_starts: STAGE_ONLY_STARTS,
    transitions: STAGE_ONLY_TRANSITIONS,
};
