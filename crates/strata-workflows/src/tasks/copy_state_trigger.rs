// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic trigger that keeps a copy-state task running for one
//! source/destination pair.
//!
//! The owner of a trigger document sends it a `pulse` on every maintenance
//! round. A pulse starts a new copy-state task only when every earlier task
//! for the same pair has finished, so at most one copy runs at a time. Pulses
//! for a trigger that is already starting a task are dropped.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strata_core::fields::merge_patch;
use strata_core::{CoreError, FieldSpec, ServiceContext, ServiceOptions, StatefulService};
use strata_protocol::{DocumentMeta, QuerySpecification, TaskStage, now_micros};
use tracing::{debug, info, instrument, warn};

use super::copy_state::{
    self, CopyStateState, DEFAULT_PROTOCOL, DEFAULT_QUERY_RESULT_LIMIT,
    DEFAULT_TASK_STATE_FIELD_NAME,
};
use super::processing_enabled;
use crate::error::Result;

pub const FACTORY_LINK: &str = "/tasks/copy-state-triggers";

pub const DEFAULT_TRIGGER_INTERVAL: Duration = Duration::from_secs(5 * 60);

const FIELD_NAME_TRIGGERS_SUCCESS: &str = "triggersSuccess";
const FIELD_NAME_TRIGGERS_ERROR: &str = "triggersError";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyStateTriggerState {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_flags: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_factory_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_state_field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_result_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<ExecutionState>,
    /// Set only on maintenance patches; never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers_success: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers_error: Option<i64>,
}

service_document!(CopyStateTriggerState, "strata:tasks:CopyStateTrigger");

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("sourceIp").required().immutable(),
    FieldSpec::new("sourcePort").required().immutable(),
    FieldSpec::new("sourceProtocol").immutable(),
    FieldSpec::new("destinationIp").required().immutable(),
    FieldSpec::new("destinationPort").required().immutable(),
    FieldSpec::new("destinationProtocol").immutable(),
    FieldSpec::new("factoryLink").required().immutable(),
    FieldSpec::new("sourceFactoryLink").required().immutable(),
    FieldSpec::new("taskStateFieldName").immutable(),
    FieldSpec::new("queryResultLimit").immutable(),
    FieldSpec::new("executionState"),
    FieldSpec::new(FIELD_NAME_TRIGGERS_SUCCESS).monotonic_max(),
    FieldSpec::new(FIELD_NAME_TRIGGERS_ERROR).monotonic_max(),
    FieldSpec::new("controlFlags").immutable(),
];

impl CopyStateTriggerState {
    /// Query terms identifying the copy-state tasks of this trigger.
    fn task_terms(&self) -> Vec<(&'static str, String)> {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        let port = |v: Option<u16>| v.map(|p| p.to_string()).unwrap_or_default();
        vec![
            ("sourceIp", text(&self.source_ip)),
            ("sourcePort", port(self.source_port)),
            ("sourceProtocol", text(&self.source_protocol)),
            ("destinationIp", text(&self.destination_ip)),
            ("destinationPort", port(self.destination_port)),
            ("destinationProtocol", text(&self.destination_protocol)),
            ("factoryLink", text(&self.factory_link)),
            ("sourceFactoryLink", text(&self.source_factory_link)),
        ]
    }

    /// Body of the next copy-state task, starting from `watermark`.
    fn copy_state_task(&self, watermark: u64) -> CopyStateState {
        CopyStateState {
            source_ip: self.source_ip.clone(),
            source_port: self.source_port,
            source_protocol: self.source_protocol.clone(),
            destination_ip: self.destination_ip.clone(),
            destination_port: self.destination_port,
            destination_protocol: self.destination_protocol.clone(),
            factory_link: self.factory_link.clone(),
            source_factory_link: self.source_factory_link.clone(),
            task_state_field_name: self.task_state_field_name.clone(),
            query_result_limit: self.query_result_limit,
            query_documents_changed_since_epoch: Some(watermark),
            ..CopyStateState::default()
        }
    }
}

/// Start of the next copy: the newest source update copied by a finished
/// task, or 0.
pub fn watermark(tasks: &[CopyStateState]) -> u64 {
    tasks
        .iter()
        .filter(|t| t.task_state.as_ref().is_some_and(|s| s.stage == TaskStage::Finished))
        .filter_map(|t| t.last_document_update_time_micros)
        .max()
        .unwrap_or(0)
}

/// Marks a trigger link busy until dropped.
struct InFlight<'a> {
    links: &'a Mutex<HashSet<String>>,
    link: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.link);
    }
}

#[derive(Debug)]
pub struct CopyStateTriggerService {
    trigger_interval: Duration,
    in_flight: Mutex<HashSet<String>>,
}

impl Default for CopyStateTriggerService {
    fn default() -> Self {
        Self {
            trigger_interval: DEFAULT_TRIGGER_INTERVAL,
            in_flight: Mutex::default(),
        }
    }
}

impl CopyStateTriggerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trigger_interval(mut self, interval: Duration) -> Self {
        self.trigger_interval = interval;
        self
    }

    /// Claim `link`, or `None` while another pulse holds it.
    fn claim(&self, link: &str) -> Option<InFlight<'_>> {
        let claimed = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(link.to_string());
        claimed.then(|| InFlight {
            links: &self.in_flight,
            link: link.to_string(),
        })
    }

    /// Bump `counter` by one on the committed trigger state.
    async fn count(&self, ctx: &ServiceContext, counter: &str) -> Result<()> {
        let current: CopyStateTriggerState = ctx.get(ctx.self_link()).await?;
        let previous = if counter == FIELD_NAME_TRIGGERS_SUCCESS {
            current.triggers_success
        } else {
            current.triggers_error
        };
        let mut patch = serde_json::Map::new();
        patch.insert(counter.to_string(), json!(previous.unwrap_or(0) + 1));
        ctx.patch_self(&patch).await?;
        Ok(())
    }

    /// Start a copy-state task unless one is still running. Returns whether
    /// a task was started.
    #[instrument(skip_all, fields(link = %ctx.self_link()))]
    async fn trigger(&self, ctx: &ServiceContext, state: &CopyStateTriggerState) -> Result<bool> {
        let spec = state
            .task_terms()
            .into_iter()
            .fold(QuerySpecification::for_document::<CopyStateState>(), |spec, (name, value)| {
                spec.term(name, value)
            });
        let tasks: Vec<CopyStateState> = ctx.query_documents(spec).await?;

        let running = tasks
            .iter()
            .filter(|t| !t.task_state.as_ref().is_some_and(|s| s.is_terminal()))
            .count();
        if running > 0 {
            debug!(running, "Copy-state task still running, skipping pulse");
            return Ok(false);
        }

        let watermark = watermark(&tasks);
        ctx.post(copy_state::FACTORY_LINK, &state.copy_state_task(watermark))
            .await?;
        info!(watermark, previous = tasks.len(), "Copy-state task started");
        Ok(true)
    }
}

#[async_trait]
impl StatefulService for CopyStateTriggerService {
    type State = CopyStateTriggerState;

    const FACTORY_LINK: &'static str = FACTORY_LINK;

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn options(&self) -> ServiceOptions {
        ServiceOptions {
            maintenance_interval: Some(self.trigger_interval),
            ..ServiceOptions::default()
        }
    }

    fn initialize(&self, state: &mut CopyStateTriggerState) {
        state.control_flags.get_or_insert(0);
        state
            .source_protocol
            .get_or_insert_with(|| DEFAULT_PROTOCOL.to_string());
        state
            .destination_protocol
            .get_or_insert_with(|| DEFAULT_PROTOCOL.to_string());
        state
            .task_state_field_name
            .get_or_insert_with(|| DEFAULT_TASK_STATE_FIELD_NAME.to_string());
        state.query_result_limit.get_or_insert(DEFAULT_QUERY_RESULT_LIMIT);
        state.execution_state.get_or_insert(ExecutionState::Running);
        state.pulse = None;
        state.triggers_success.get_or_insert(0);
        state.triggers_error.get_or_insert(0);
    }

    fn validate_start(&self, state: &CopyStateTriggerState) -> strata_core::Result<()> {
        if state.query_result_limit == Some(0) {
            return Err(CoreError::validation("queryResultLimit must be at least 1"));
        }
        copy_state::socket_addr(state.source_ip.as_deref(), state.source_port)
            .and(copy_state::socket_addr(
                state.destination_ip.as_deref(),
                state.destination_port,
            ))
            .map_err(|e| CoreError::validation(e.to_string()))?;
        Ok(())
    }

    fn validate_patch(
        &self,
        _current: &CopyStateTriggerState,
        patch: &CopyStateTriggerState,
    ) -> strata_core::Result<()> {
        let counters_or_pulse = patch.pulse.is_some()
            || patch.triggers_success.is_some()
            || patch.triggers_error.is_some();
        if !counters_or_pulse && patch.execution_state.is_none() {
            return Err(CoreError::validation("executionState cannot be null"));
        }
        Ok(())
    }

    fn apply_patch(
        &self,
        current: &CopyStateTriggerState,
        patch: &Value,
    ) -> strata_core::Result<CopyStateTriggerState> {
        let mut merged = serde_json::to_value(current)?;
        merge_patch(&mut merged, patch, self.fields())?;
        let mut next: CopyStateTriggerState = serde_json::from_value(merged)?;
        next.pulse = None;
        Ok(next)
    }

    async fn on_patched(
        &self,
        ctx: ServiceContext,
        state: CopyStateTriggerState,
        patch: CopyStateTriggerState,
    ) {
        if patch.pulse.is_none() || !processing_enabled(state.control_flags) {
            return;
        }
        if state.execution_state != Some(ExecutionState::Running) {
            debug!(link = %ctx.self_link(), "Trigger stopped, ignoring pulse");
            return;
        }

        let Some(_in_flight) = self.claim(ctx.self_link()) else {
            debug!(link = %ctx.self_link(), "Trigger busy, ignoring pulse");
            return;
        };

        let counter = match self.trigger(&ctx, &state).await {
            Ok(true) => FIELD_NAME_TRIGGERS_SUCCESS,
            Ok(false) => return,
            Err(e) => {
                warn!(link = %ctx.self_link(), error = %e, "Failed to trigger copy-state task");
                FIELD_NAME_TRIGGERS_ERROR
            }
        };
        if let Err(e) = self.count(&ctx, counter).await {
            warn!(link = %ctx.self_link(), counter, error = %e, "Failed to update trigger counter");
        }
    }

    async fn handle_maintenance(&self, ctx: ServiceContext, state: CopyStateTriggerState) {
        if state.execution_state != Some(ExecutionState::Running) {
            return;
        }
        ctx.send_self_patch(&json!({ "pulse": now_micros() }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{DocumentEngine, ServiceHandler};
    use strata_protocol::{NoSubStage, TaskState};

    fn engine() -> DocumentEngine<CopyStateTriggerService> {
        DocumentEngine::new(CopyStateTriggerService::new())
    }

    fn started() -> Value {
        engine()
            .handle_start(json!({
                "sourceIp": "127.0.0.1",
                "sourcePort": 19000,
                "destinationIp": "127.0.0.1",
                "destinationPort": 19100,
                "factoryLink": "/cloudstore/hosts",
                "sourceFactoryLink": "/cloudstore/hosts"
            }))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let state = started();
        assert_eq!(state["executionState"], "RUNNING");
        assert_eq!(state["triggersSuccess"], 0);
        assert_eq!(state["triggersError"], 0);
        assert_eq!(state["sourceProtocol"], "http");
        assert!(state.get("pulse").is_none());
    }

    #[test]
    fn test_patch_requires_execution_state() {
        let state = started();
        let engine = engine();
        assert!(engine.handle_patch(&state, &json!({})).is_err());

        let stopped = engine
            .handle_patch(&state, &json!({"executionState": "STOPPED"}))
            .unwrap();
        assert_eq!(stopped["executionState"], "STOPPED");
    }

    #[test]
    fn test_pulse_is_not_persisted() {
        let state = started();
        let next = engine().handle_patch(&state, &json!({"pulse": 42})).unwrap();
        assert!(next.get("pulse").is_none());
        assert_eq!(next["executionState"], "RUNNING");
    }

    #[test]
    fn test_counters_only_grow() {
        let engine = engine();
        let mut state = started();
        let mut seen = Vec::new();
        for value in [5, 3, 5, -1, 10] {
            state = engine
                .handle_patch(&state, &json!({"triggersSuccess": value}))
                .unwrap();
            seen.push(state["triggersSuccess"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![5, 5, 5, 5, 10]);
    }

    #[test]
    fn test_watermark_uses_finished_tasks() {
        let task = |stage: TaskStage, last_copied: u64| {
            let mut t = CopyStateState {
                task_state: Some(TaskState::<NoSubStage>::new(stage)),
                last_document_update_time_micros: Some(last_copied),
                ..CopyStateState::default()
            };
            // Finishing happens well after the copied updates.
            t.meta.document_update_time_micros = last_copied + 1_000;
            t
        };
        assert_eq!(watermark(&[]), 0);
        assert_eq!(
            watermark(&[
                task(TaskStage::Finished, 10),
                task(TaskStage::Failed, 50),
                task(TaskStage::Finished, 30),
            ]),
            30
        );
    }

    #[test]
    fn test_trigger_claim_is_exclusive() {
        let service = CopyStateTriggerService::new();
        let first = service.claim("/tasks/copy-state-triggers/a");
        assert!(first.is_some());
        assert!(service.claim("/tasks/copy-state-triggers/a").is_none());
        assert!(service.claim("/tasks/copy-state-triggers/b").is_some());

        drop(first);
        assert!(service.claim("/tasks/copy-state-triggers/a").is_some());
    }

    #[test]
    fn test_task_terms_cover_pair() {
        let state: CopyStateTriggerState = serde_json::from_value(started()).unwrap();
        let terms = state.task_terms();
        assert_eq!(terms.len(), 8);
        assert!(terms.contains(&("sourcePort", "19000".to_string())));
        assert!(terms.contains(&("destinationProtocol", "http".to_string())));

        let task = state.copy_state_task(7);
        assert_eq!(task.query_documents_changed_since_epoch, Some(7));
        assert_eq!(task.factory_link.as_deref(), Some("/cloudstore/hosts"));
    }
}
