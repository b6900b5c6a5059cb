// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for strata-core integration tests.
//!
//! Provides a small job workflow service and a multi-node cluster on an
//! in-process network.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strata_core::task::TransitionTable;
use strata_core::{
    CoreError, DocumentEngine, FieldSpec, HostConfig, HostRuntime, LocalNetwork, NodeGroup,
    ServiceContext, ServiceOptions, StatefulService,
};
use strata_protocol::{DocumentMeta, Operation, ServiceDocument, ServiceUri, TaskStage, TaskState};

pub const JOBS: &str = "/test/jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStep {
    Run,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_state: Option<TaskState<JobStep>>,
}

impl ServiceDocument for JobState {
    const KIND: &'static str = "strata:test:Job";

    fn meta(&self) -> &DocumentMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut DocumentMeta {
        &mut self.meta
    }
}

const JOB_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("name").required().immutable(),
    FieldSpec::new("progress").monotonic_max(),
];

const JOB_TRANSITIONS: TransitionTable<JobStep> = TransitionTable {
    valid_starts: &[(TaskStage::Created, None), (TaskStage::Started, Some(JobStep::Run))],
    transitions: &[
        ((TaskStage::Created, None), (TaskStage::Started, Some(JobStep::Run))),
        ((TaskStage::Started, Some(JobStep::Run)), (TaskStage::Finished, None)),
        ((TaskStage::Started, Some(JobStep::Run)), (TaskStage::Failed, None)),
    ],
};

/// Job workflow: CREATED -> STARTED:RUN -> FINISHED when `autoRun` is set.
/// Maintenance passes are recorded as `(host id, link)`.
pub struct JobService {
    pub maintained: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl StatefulService for JobService {
    type State = JobState;

    const FACTORY_LINK: &'static str = JOBS;

    fn fields(&self) -> &'static [FieldSpec] {
        JOB_FIELDS
    }

    fn options(&self) -> ServiceOptions {
        ServiceOptions {
            idempotent_post: false,
            maintenance_interval: Some(Duration::from_millis(1)),
        }
    }

    fn initialize(&self, state: &mut JobState) {
        state.task_state.get_or_insert_with(TaskState::default);
        state.progress.get_or_insert(0);
    }

    fn validate_start(&self, state: &JobState) -> strata_core::Result<()> {
        JOB_TRANSITIONS.validate_start(state.task_state.as_ref())
    }

    fn validate_patch(&self, current: &JobState, patch: &JobState) -> strata_core::Result<()> {
        JOB_TRANSITIONS.validate_transition(current.task_state.as_ref(), patch.task_state.as_ref())
    }

    fn validate_state(&self, state: &JobState) -> strata_core::Result<()> {
        if state.progress.is_some_and(|p| p > 100) {
            return Err(CoreError::validation("progress cannot exceed 100"));
        }
        Ok(())
    }

    async fn on_started(&self, ctx: ServiceContext, state: JobState) {
        if state.auto_run == Some(true) {
            ctx.send_self_patch(&JobState {
                task_state: Some(TaskState::started(JobStep::Run)),
                ..JobState::default()
            });
        }
    }

    async fn on_patched(&self, ctx: ServiceContext, state: JobState, _patch: JobState) {
        let running = state
            .task_state
            .as_ref()
            .is_some_and(|t| t.sub_stage == Some(JobStep::Run));
        if state.auto_run == Some(true) && running {
            ctx.send_self_patch(&JobState {
                task_state: Some(TaskState::new(TaskStage::Finished)),
                progress: Some(100),
                ..JobState::default()
            });
        }
    }

    async fn handle_maintenance(&self, ctx: ServiceContext, _state: JobState) {
        if let Ok(mut maintained) = self.maintained.lock() {
            maintained.push((ctx.host_id().to_string(), ctx.self_link().to_string()));
        }
    }
}

pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub group: Arc<NodeGroup>,
    pub nodes: Vec<HostRuntime>,
    pub maintained: Arc<Mutex<Vec<(String, String)>>>,
}

impl TestCluster {
    pub async fn start(size: usize) -> Self {
        let network = LocalNetwork::new();
        let group = Arc::new(NodeGroup::new("test"));
        let maintained = Arc::new(Mutex::new(Vec::new()));

        let config = HostConfig {
            // Passes are driven by the tests.
            maintenance_poll_interval: Duration::from_secs(3600),
            operation_timeout: Duration::from_secs(5),
            ..HostConfig::default()
        };

        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let runtime = HostRuntime::builder()
                .id(format!("node-{}", i))
                .bind_addr(Self::addr(i))
                .group(group.clone())
                .network(network.clone())
                .config(config.clone())
                .service(DocumentEngine::new(JobService {
                    maintained: maintained.clone(),
                }))
                .build()
                .expect("valid runtime config")
                .start()
                .await
                .expect("runtime starts");
            nodes.push(runtime);
        }

        Self {
            network,
            group,
            nodes,
            maintained,
        }
    }

    pub fn addr(index: usize) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 19000 + index as u16))
    }

    pub fn uri(&self, index: usize, path: impl Into<String>) -> ServiceUri {
        self.nodes[index].uri(path)
    }

    /// Send from node `from` and wait for completion.
    pub async fn send(&self, from: usize, op: Operation) -> Operation {
        self.nodes[from].host().send_and_wait(op).await
    }

    pub fn owner_index(&self, link: &str) -> usize {
        let owner = self.group.select_owner(link).expect("non-empty group");
        self.nodes
            .iter()
            .position(|n| n.id() == owner.id)
            .expect("owner is a cluster node")
    }

    pub async fn create_job(&self, via: usize, name: &str, auto_run: bool) -> JobState {
        let body = JobState {
            meta: DocumentMeta::with_self_link(format!("{}/{}", JOBS, name)),
            name: Some(name.to_string()),
            auto_run: Some(auto_run),
            ..JobState::default()
        };
        let op = Operation::post(self.uri(via, JOBS)).with_body(&body).unwrap();
        let done = self.send(via, op).await;
        assert!(done.is_success(), "create failed: {:?}", done.error_response());
        done.body_as().unwrap()
    }

    pub async fn get_job(&self, via: usize, link: &str) -> Operation {
        self.send(via, Operation::get(self.uri(via, link))).await
    }

    /// Poll until the job reaches `stage` or the timeout elapses.
    pub async fn wait_for_stage(&self, link: &str, stage: TaskStage) -> JobState {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let done = self.get_job(0, link).await;
            if done.is_success() {
                let job: JobState = done.body_as().unwrap();
                if job.task_state.as_ref().map(|t| t.stage) == Some(stage) {
                    return job;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} never reached {}",
                link,
                stage
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
