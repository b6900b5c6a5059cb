// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Copies the documents of one factory from a source cluster into a factory
//! of the destination cluster.
//!
//! Source documents are read page by page through a broadcast query on their
//! self-link prefix. Only documents updated at or after
//! `queryDocumentsChangedSinceEpoch` are copied, and task documents that are
//! still running are left for a later pass. The destination factory must
//! accept repeated POSTs of the same link.
//!
//! A finished task records in `lastDocumentUpdateTimeMicros` the newest
//! update time among the documents it copied. That value, not the task's own
//! update time, is where the next copy starts, so writes that land on the
//! source while a copy runs are picked up by the next one.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_client::{ClientConfig, DocumentClient, StaticServerSet};
use strata_core::fields::strip_meta;
use strata_core::task::STAGE_ONLY;
use strata_core::{CoreError, FieldSpec, ServiceContext, StatefulService};
use strata_protocol::document::{FIELD_NAME_SELF_LINK, FIELD_NAME_UPDATE_TIME_MICROS};
use strata_protocol::paths::{child_link, last_segment};
use strata_protocol::query::QueryOption;
use strata_protocol::{
    DocumentMeta, NoSubStage, QueryResult, QuerySpecification, QueryTask, TaskStage, TaskState,
};
use tracing::{debug, info, instrument};

use super::{fail_task, processing_enabled, send_stage};
use crate::error::{Result, WorkflowError};

pub const FACTORY_LINK: &str = "/tasks/copy-state";

pub const DEFAULT_PROTOCOL: &str = "http";
pub const DEFAULT_TASK_STATE_FIELD_NAME: &str = "taskState.stage";
pub const DEFAULT_QUERY_RESULT_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyStateState {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_state: Option<TaskState<NoSubStage>>,
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
    /// Destination factory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_link: Option<String>,
    /// Factory whose documents are read on the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_factory_link: Option<String>,
    /// Dotted path of the task stage inside copied documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_state_field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_result_limit: Option<usize>,
    /// Watermark; source documents updated before it are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_documents_changed_since_epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents_copied: Option<u64>,
    /// Newest `documentUpdateTimeMicros` among copied documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_document_update_time_micros: Option<u64>,
}

service_document!(CopyStateState, "strata:tasks:CopyState");

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
    FieldSpec::new("queryDocumentsChangedSinceEpoch").immutable(),
    FieldSpec::new("documentsCopied").monotonic_max(),
    FieldSpec::new("lastDocumentUpdateTimeMicros").monotonic_max(),
    FieldSpec::new("controlFlags").immutable(),
];

/// Address of `ip:port`.
pub(crate) fn socket_addr(ip: Option<&str>, port: Option<u16>) -> Result<SocketAddr> {
    let ip = ip.ok_or_else(|| WorkflowError::invalid_state("ip address is not set"))?;
    let port = port.ok_or_else(|| WorkflowError::invalid_state("port is not set"))?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|e| WorkflowError::invalid_state(format!("invalid ip address {}: {}", ip, e)))?;
    Ok(SocketAddr::new(ip, port))
}

/// Value at a dotted `path` inside `document`.
fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(document, |value, key| value.get(key))
}

fn update_time(document: &Value) -> u64 {
    document
        .get(FIELD_NAME_UPDATE_TIME_MICROS)
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Whether `document` should be copied in a pass with this watermark.
fn should_copy(document: &Value, watermark: u64, task_state_field_name: &str) -> bool {
    if update_time(document) < watermark {
        return false;
    }
    let stage = lookup(document, task_state_field_name)
        .and_then(|v| serde_json::from_value::<TaskStage>(v.clone()).ok());
    !stage.is_some_and(|s| !s.is_terminal())
}

/// Body to POST on the destination for a source document.
fn destination_body(document: &Value, factory_link: &str) -> Option<Value> {
    let source_link = document.get(FIELD_NAME_SELF_LINK)?.as_str()?;
    let mut body = strip_meta(document);
    let object = body.as_object_mut()?;
    object.insert(
        FIELD_NAME_SELF_LINK.to_string(),
        Value::String(child_link(factory_link, last_segment(source_link))),
    );
    Some(body)
}

/// Result of one copy pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Copied {
    documents: u64,
    /// Newest update time copied, or the starting watermark.
    last_update_micros: u64,
}

#[derive(Debug, Default)]
pub struct CopyStateService {
    client_config: ClientConfig,
}

impl CopyStateService {
    pub fn new(client_config: ClientConfig) -> Self {
        Self { client_config }
    }

    fn client(&self, ctx: &ServiceContext, addr: SocketAddr) -> DocumentClient {
        DocumentClient::new(
            Arc::new(StaticServerSet::new([addr])),
            ctx.host().transport(),
            self.client_config.clone(),
        )
    }

    #[instrument(skip_all, fields(link = %ctx.self_link(), source = ?state.source_factory_link, destination = ?state.factory_link))]
    async fn copy(&self, ctx: &ServiceContext, state: &CopyStateState) -> Result<Copied> {
        let source = self.client(ctx, socket_addr(state.source_ip.as_deref(), state.source_port)?);
        let destination = self.client(
            ctx,
            socket_addr(state.destination_ip.as_deref(), state.destination_port)?,
        );
        let source_factory = state
            .source_factory_link
            .as_deref()
            .ok_or_else(|| WorkflowError::invalid_state("sourceFactoryLink is not set"))?;
        let factory_link = state
            .factory_link
            .as_deref()
            .ok_or_else(|| WorkflowError::invalid_state("factoryLink is not set"))?;
        let task_state_field_name = state
            .task_state_field_name
            .as_deref()
            .unwrap_or(DEFAULT_TASK_STATE_FIELD_NAME);
        let watermark = state.query_documents_changed_since_epoch.unwrap_or(0);

        let spec = QuerySpecification::default()
            .prefix(FIELD_NAME_SELF_LINK, format!("{}/", source_factory.trim_end_matches('/')))
            .with_option(QueryOption::Broadcast)
            .with_option(QueryOption::ExpandContent)
            .with_result_limit(state.query_result_limit.unwrap_or(DEFAULT_QUERY_RESULT_LIMIT));
        let task: QueryTask = source.query(spec, false).await?.body_as()?;
        let mut page: QueryResult = task.results.unwrap_or_default();

        let mut copied = Copied {
            documents: 0,
            last_update_micros: watermark,
        };
        loop {
            for document in page.documents.take().unwrap_or_default().into_values() {
                if !should_copy(&document, watermark, task_state_field_name) {
                    continue;
                }
                let Some(body) = destination_body(&document, factory_link) else {
                    continue;
                };
                destination.post(factory_link, &body).await?;
                copied.documents += 1;
                copied.last_update_micros = copied.last_update_micros.max(update_time(&document));
            }
            let Some(next) = page.next_page_link.take() else {
                break;
            };
            debug!(page = %next, copied = copied.documents, "Fetching next page");
            page = source.query_document_page(&next).await?;
        }

        info!(
            copied = copied.documents,
            watermark,
            last_update = copied.last_update_micros,
            "Documents copied"
        );
        Ok(copied)
    }

    async fn run(&self, ctx: &ServiceContext, state: &CopyStateState) {
        match self.copy(ctx, state).await {
            Ok(copied) => {
                let mut patch = serde_json::json!({
                    "taskState": TaskState::<NoSubStage>::new(TaskStage::Finished),
                    "documentsCopied": copied.documents,
                });
                // Without copies the starting watermark stays in place.
                if copied.documents > 0 {
                    patch["lastDocumentUpdateTimeMicros"] = copied.last_update_micros.into();
                }
                ctx.send_self_patch(&patch);
            }
            Err(e) => fail_task(ctx, e.to_string()),
        }
    }
}

#[async_trait]
impl StatefulService for CopyStateService {
    type State = CopyStateState;

    const FACTORY_LINK: &'static str = FACTORY_LINK;

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn initialize(&self, state: &mut CopyStateState) {
        state.task_state.get_or_insert_with(TaskState::default);
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
        let watermark = *state.query_documents_changed_since_epoch.get_or_insert(0);
        state.documents_copied.get_or_insert(0);
        state.last_document_update_time_micros.get_or_insert(watermark);
    }

    fn validate_start(&self, state: &CopyStateState) -> strata_core::Result<()> {
        STAGE_ONLY.validate_start(state.task_state.as_ref())?;
        if state.query_result_limit == Some(0) {
            return Err(CoreError::validation("queryResultLimit must be at least 1"));
        }
        socket_addr(state.source_ip.as_deref(), state.source_port)
            .and(socket_addr(state.destination_ip.as_deref(), state.destination_port))
            .map_err(|e| CoreError::validation(e.to_string()))?;
        Ok(())
    }

    fn validate_patch(&self, current: &CopyStateState, patch: &CopyStateState) -> strata_core::Result<()> {
        STAGE_ONLY.validate_transition(current.task_state.as_ref(), patch.task_state.as_ref())
    }

    async fn on_started(&self, ctx: ServiceContext, state: CopyStateState) {
        if !processing_enabled(state.control_flags) {
            return;
        }
        match state.task_state.as_ref().map(|t| t.stage) {
            Some(TaskStage::Created) => send_stage(&ctx, TaskState::<NoSubStage>::new(TaskStage::Started)),
            Some(TaskStage::Started) => self.run(&ctx, &state).await,
            _ => {}
        }
    }

    async fn on_patched(&self, ctx: ServiceContext, state: CopyStateState, patch: CopyStateState) {
        if !processing_enabled(state.control_flags) {
            return;
        }
        if patch
            .task_state
            .as_ref()
            .is_some_and(|t| t.stage == TaskStage::Started)
        {
            self.run(&ctx, &state).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::{DocumentEngine, ServiceHandler};

    #[test]
    fn test_should_copy_respects_watermark() {
        let doc = json!({"documentSelfLink": "/a/1", "documentUpdateTimeMicros": 100});
        assert!(should_copy(&doc, 0, DEFAULT_TASK_STATE_FIELD_NAME));
        assert!(should_copy(&doc, 100, DEFAULT_TASK_STATE_FIELD_NAME));
        assert!(!should_copy(&doc, 101, DEFAULT_TASK_STATE_FIELD_NAME));
    }

    #[test]
    fn test_should_copy_skips_running_tasks() {
        let running = json!({"taskState": {"stage": "STARTED"}, "documentUpdateTimeMicros": 5});
        let done = json!({"taskState": {"stage": "FINISHED"}, "documentUpdateTimeMicros": 5});
        assert!(!should_copy(&running, 0, "taskState.stage"));
        assert!(should_copy(&done, 0, "taskState.stage"));
        assert!(should_copy(&running, 0, "taskInfo.stage"));
    }

    #[test]
    fn test_destination_body_rewrites_link() {
        let doc = json!({
            "documentSelfLink": "/source/hosts/h1",
            "documentKind": "strata:cloudstore:Host",
            "documentVersion": 4,
            "documentUpdateTimeMicros": 9,
            "hostAddress": "10.0.0.1"
        });
        let body = destination_body(&doc, "/cloudstore/hosts").unwrap();
        assert_eq!(
            body,
            json!({"documentSelfLink": "/cloudstore/hosts/h1", "hostAddress": "10.0.0.1"})
        );
        assert!(destination_body(&json!({"hostAddress": "x"}), "/cloudstore/hosts").is_none());
    }

    #[test]
    fn test_start_defaults_and_validation() {
        let engine = DocumentEngine::new(CopyStateService::default());
        let body = json!({
            "sourceIp": "127.0.0.1",
            "sourcePort": 19000,
            "destinationIp": "127.0.0.1",
            "destinationPort": 19100,
            "factoryLink": "/cloudstore/hosts",
            "sourceFactoryLink": "/cloudstore/hosts"
        });
        let started = engine.handle_start(body.clone()).unwrap();
        assert_eq!(started["sourceProtocol"], "http");
        assert_eq!(started["taskStateFieldName"], "taskState.stage");
        assert_eq!(started["queryResultLimit"], 10);
        assert_eq!(started["taskState"]["stage"], "CREATED");
        assert_eq!(started["lastDocumentUpdateTimeMicros"], 0);

        let mut resumed = body.clone();
        resumed["queryDocumentsChangedSinceEpoch"] = json!(500);
        let resumed = engine.handle_start(resumed).unwrap();
        assert_eq!(resumed["lastDocumentUpdateTimeMicros"], 500);

        let mut bad_ip = body.clone();
        bad_ip["sourceIp"] = json!("not-an-ip");
        assert!(engine.handle_start(bad_ip).is_err());

        let mut no_factory = body;
        no_factory.as_object_mut().unwrap().remove("factoryLink");
        assert!(engine.handle_start(no_factory).is_err());
    }
}
