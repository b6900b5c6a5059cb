// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Swarm cluster creation.
//!
//! ```text
//! CREATED -> ALLOCATE_RESOURCES -> SETUP_ETCD -> SETUP_MASTER -> SETUP_SLAVES -> FINISHED
//! ```
//!
//! Allocation reads the SWARM cluster configuration and creates the cluster
//! document. The setup steps roll out nodes through the [`NodeProvisioner`](crate::external::NodeProvisioner)
//! and confirm them through etcd and the swarm manager. On success the
//! cluster is marked READY, on failure ERROR.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strata_core::task::TransitionTable;
use strata_core::{CoreError, FieldSpec, ServiceContext, StatefulService};
use strata_protocol::paths::child_link;
use strata_protocol::{DocumentMeta, TaskStage, TaskState};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{fail_task, processing_enabled, send_stage};
use crate::cloud_store::cluster::{
    self, EXTENDED_PROPERTY_DNS, EXTENDED_PROPERTY_ETCD_IPS, EXTENDED_PROPERTY_GATEWAY,
    EXTENDED_PROPERTY_NETMASK,
};
use crate::cloud_store::{ClusterConfigurationState, ClusterState, ClusterStatus, ClusterType};
use crate::error::{Result, WorkflowError};
use crate::external::{Collaborators, NodeRole, NodeSpec};

pub const FACTORY_LINK: &str = "/tasks/swarm-cluster-create";

const PROPERTY_MASTER_IP: &str = "master_ip";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterCreateStep {
    AllocateResources,
    SetupEtcd,
    SetupMaster,
    SetupSlaves,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCreateState {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_state: Option<TaskState<ClusterCreateStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_flags: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_ips: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_count: Option<i64>,
    /// Set by allocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    /// Set once the master is rolled out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_ip: Option<String>,
}

service_document!(ClusterCreateState, "strata:tasks:SwarmClusterCreate");

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("clusterName").required().immutable(),
    FieldSpec::new("projectId").required().immutable(),
    FieldSpec::new("dns").required().immutable(),
    FieldSpec::new("gateway").required().immutable(),
    FieldSpec::new("netmask").required().immutable(),
    FieldSpec::new("etcdIps").required().immutable(),
    FieldSpec::new("slaveCount").required().immutable(),
    FieldSpec::new("controlFlags").immutable(),
];

use ClusterCreateStep::*;
use TaskStage::{Cancelled, Created, Failed, Finished, Started};

const TRANSITIONS: TransitionTable<ClusterCreateStep> = TransitionTable {
    valid_starts: &[
        (Created, None),
        (Started, Some(AllocateResources)),
        (Started, Some(SetupEtcd)),
        (Started, Some(SetupMaster)),
        (Started, Some(SetupSlaves)),
        (Finished, None),
        (Failed, None),
        (Cancelled, None),
    ],
    transitions: &[
        ((Created, None), (Started, Some(AllocateResources))),
        ((Created, None), (Failed, None)),
        ((Created, None), (Cancelled, None)),
        ((Started, Some(AllocateResources)), (Started, Some(SetupEtcd))),
        ((Started, Some(AllocateResources)), (Failed, None)),
        ((Started, Some(AllocateResources)), (Cancelled, None)),
        ((Started, Some(SetupEtcd)), (Started, Some(SetupMaster))),
        ((Started, Some(SetupEtcd)), (Failed, None)),
        ((Started, Some(SetupEtcd)), (Cancelled, None)),
        ((Started, Some(SetupMaster)), (Started, Some(SetupSlaves))),
        ((Started, Some(SetupMaster)), (Failed, None)),
        ((Started, Some(SetupMaster)), (Cancelled, None)),
        ((Started, Some(SetupSlaves)), (Finished, None)),
        ((Started, Some(SetupSlaves)), (Failed, None)),
        ((Started, Some(SetupSlaves)), (Cancelled, None)),
    ],
};

/// Drives [`ClusterCreateState`] documents.
pub struct ClusterCreateService {
    collaborators: Collaborators,
}

impl ClusterCreateService {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    async fn run_step(&self, ctx: &ServiceContext, state: &ClusterCreateState, step: ClusterCreateStep) {
        let outcome = match step {
            AllocateResources => self.allocate_resources(ctx, state).await,
            SetupEtcd => self
                .setup_etcd(state)
                .await
                .map_err(|e| rollout_failure(NodeRole::Etcd, e)),
            SetupMaster => self
                .setup_master(state)
                .await
                .map_err(|e| rollout_failure(NodeRole::Master, e)),
            SetupSlaves => self
                .setup_slaves(ctx, state)
                .await
                .map_err(|e| rollout_failure(NodeRole::Slave, e)),
        };

        match outcome {
            Ok(next) => ctx.send_self_patch(&next),
            Err(message) => {
                if let Some(cluster_id) = &state.cluster_id {
                    mark_cluster(ctx, cluster_id, ClusterStatus::Error).await;
                }
                fail_task(ctx, message);
            }
        }
    }

    #[instrument(skip_all, fields(link = %ctx.self_link()))]
    async fn allocate_resources(
        &self,
        ctx: &ServiceContext,
        state: &ClusterCreateState,
    ) -> std::result::Result<ClusterCreateState, String> {
        let configuration: ClusterConfigurationState = ctx
            .get(&ClusterType::Swarm.configuration_link())
            .await
            .map_err(|e| match e {
                CoreError::NotFound { .. } => {
                    format!("Cannot find cluster configuration for {}", ClusterType::Swarm)
                }
                other => format!(
                    "Cannot find cluster configuration for {}. Error: {}",
                    ClusterType::Swarm,
                    other
                ),
            })?;

        let cluster_id = Uuid::new_v4().to_string();
        let cluster = ClusterState {
            meta: DocumentMeta::with_self_link(child_link(cluster::FACTORY_LINK, &cluster_id)),
            cluster_name: state.cluster_name.clone(),
            cluster_type: Some(ClusterType::Swarm),
            cluster_state: Some(ClusterStatus::Creating),
            project_id: state.project_id.clone(),
            image_id: configuration.image_id,
            slave_count: state.slave_count,
            extended_properties: Some(extended_properties(state)),
        };
        ctx.post(cluster::FACTORY_LINK, &cluster)
            .await
            .map_err(|e| format!("Failed to create cluster document. Error: {}", e))?;

        info!(cluster_id = %cluster_id, "Cluster allocated");
        Ok(ClusterCreateState {
            task_state: Some(TaskState::started(SetupEtcd)),
            cluster_id: Some(cluster_id),
            ..ClusterCreateState::default()
        })
    }

    #[instrument(skip_all, fields(cluster_id = ?state.cluster_id))]
    async fn setup_etcd(&self, state: &ClusterCreateState) -> Result<ClusterCreateState> {
        let cluster_id = required(&state.cluster_id, "clusterId")?;
        let etcd_ips = state.etcd_ips.clone().unwrap_or_default();

        for (index, ip) in etcd_ips.iter().enumerate() {
            let spec = NodeSpec {
                role: NodeRole::Etcd,
                cluster_id: cluster_id.to_string(),
                index,
                address: Some(ip.clone()),
                properties: extended_properties(state),
            };
            let address = self.collaborators.provisioner.provision(&spec).await?;
            if !self.collaborators.etcd.check_status(&address).await? {
                return Err(WorkflowError::external(format!(
                    "etcd member {} is not healthy",
                    address
                )));
            }
        }

        info!(members = etcd_ips.len(), "Etcd ready");
        Ok(ClusterCreateState {
            task_state: Some(TaskState::started(SetupMaster)),
            ..ClusterCreateState::default()
        })
    }

    #[instrument(skip_all, fields(cluster_id = ?state.cluster_id))]
    async fn setup_master(&self, state: &ClusterCreateState) -> Result<ClusterCreateState> {
        let cluster_id = required(&state.cluster_id, "clusterId")?;
        let spec = NodeSpec {
            role: NodeRole::Master,
            cluster_id: cluster_id.to_string(),
            index: 0,
            address: None,
            properties: extended_properties(state),
        };
        let master_ip = self.collaborators.provisioner.provision(&spec).await?;
        self.collaborators.swarm.get_node_addresses(&master_ip).await?;

        info!(master_ip = %master_ip, "Swarm master ready");
        Ok(ClusterCreateState {
            task_state: Some(TaskState::started(SetupSlaves)),
            master_ip: Some(master_ip),
            ..ClusterCreateState::default()
        })
    }

    #[instrument(skip_all, fields(cluster_id = ?state.cluster_id))]
    async fn setup_slaves(
        &self,
        ctx: &ServiceContext,
        state: &ClusterCreateState,
    ) -> Result<ClusterCreateState> {
        let cluster_id = required(&state.cluster_id, "clusterId")?;
        let master_ip = required(&state.master_ip, "masterIp")?;

        let mut properties = extended_properties(state);
        properties.insert(PROPERTY_MASTER_IP.to_string(), master_ip.to_string());

        let slave_count = state.slave_count.unwrap_or_default().max(0) as usize;
        let mut slaves = Vec::with_capacity(slave_count);
        for index in 0..slave_count {
            let spec = NodeSpec {
                role: NodeRole::Slave,
                cluster_id: cluster_id.to_string(),
                index,
                address: None,
                properties: properties.clone(),
            };
            slaves.push(self.collaborators.provisioner.provision(&spec).await?);
        }

        let known = self.collaborators.swarm.get_node_addresses(master_ip).await?;
        if let Some(missing) = slaves.iter().find(|s| !known.contains(*s)) {
            return Err(WorkflowError::external(format!(
                "swarm master does not report slave {}",
                missing
            )));
        }

        ctx.patch(
            &child_link(cluster::FACTORY_LINK, cluster_id),
            &ClusterState {
                cluster_state: Some(ClusterStatus::Ready),
                ..ClusterState::default()
            },
        )
        .await?;

        info!(slaves = slaves.len(), "Swarm cluster ready");
        Ok(ClusterCreateState {
            task_state: Some(TaskState::new(Finished)),
            ..ClusterCreateState::default()
        })
    }
}

#[async_trait]
impl StatefulService for ClusterCreateService {
    type State = ClusterCreateState;

    const FACTORY_LINK: &'static str = FACTORY_LINK;

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn initialize(&self, state: &mut ClusterCreateState) {
        state.task_state.get_or_insert_with(TaskState::default);
        state.control_flags.get_or_insert(0);
    }

    fn validate_start(&self, state: &ClusterCreateState) -> strata_core::Result<()> {
        TRANSITIONS.validate_start(state.task_state.as_ref())?;
        if state.etcd_ips.as_ref().is_some_and(Vec::is_empty) {
            return Err(CoreError::validation("etcdIps cannot be empty"));
        }
        if state.slave_count.is_some_and(|count| count <= 0) {
            return Err(CoreError::validation("slaveCount must be greater than 0"));
        }
        Ok(())
    }

    fn validate_patch(
        &self,
        current: &ClusterCreateState,
        patch: &ClusterCreateState,
    ) -> strata_core::Result<()> {
        TRANSITIONS.validate_transition(current.task_state.as_ref(), patch.task_state.as_ref())
    }

    async fn on_started(&self, ctx: ServiceContext, state: ClusterCreateState) {
        if !processing_enabled(state.control_flags) {
            return;
        }
        let Some(task_state) = &state.task_state else {
            return;
        };
        match (task_state.stage, task_state.sub_stage) {
            (Created, _) => send_stage(&ctx, TaskState::started(AllocateResources)),
            (Started, Some(step)) => self.run_step(&ctx, &state, step).await,
            _ => {}
        }
    }

    async fn on_patched(&self, ctx: ServiceContext, state: ClusterCreateState, patch: ClusterCreateState) {
        if !processing_enabled(state.control_flags) || patch.task_state.is_none() {
            return;
        }
        if let Some(TaskState {
            stage: Started,
            sub_stage: Some(step),
            ..
        }) = &state.task_state
        {
            self.run_step(&ctx, &state, *step).await;
        }
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| WorkflowError::invalid_state(format!("{} is not set", name)))
}

fn rollout_failure(role: NodeRole, error: WorkflowError) -> String {
    format!("Failed to rollout {}. Error: {}", role.rollout_name(), error)
}

fn extended_properties(state: &ClusterCreateState) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    let mut put = |key: &str, value: &Option<String>| {
        if let Some(value) = value {
            properties.insert(key.to_string(), value.clone());
        }
    };
    put(EXTENDED_PROPERTY_DNS, &state.dns);
    put(EXTENDED_PROPERTY_GATEWAY, &state.gateway);
    put(EXTENDED_PROPERTY_NETMASK, &state.netmask);
    if let Some(ips) = &state.etcd_ips {
        properties.insert(EXTENDED_PROPERTY_ETCD_IPS.to_string(), serialize_addresses(ips));
    }
    properties
}

/// Comma-separated address list, as stored in cluster properties.
pub fn serialize_addresses(addresses: &[String]) -> String {
    addresses.join(",")
}

async fn mark_cluster(ctx: &ServiceContext, cluster_id: &str, status: ClusterStatus) {
    let link = child_link(cluster::FACTORY_LINK, cluster_id);
    let patch = ClusterState {
        cluster_state: Some(status),
        ..ClusterState::default()
    };
    if let Err(e) = ctx.patch(&link, &patch).await {
        warn!(link = %link, error = %e, "Failed to update cluster state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use strata_core::{DocumentEngine, ServiceHandler};
    use strata_protocol::NoSubStage;

    fn start_body(stage: &str, sub_stage: Option<&str>) -> serde_json::Value {
        let mut task_state = json!({ "stage": stage });
        if let Some(sub_stage) = sub_stage {
            task_state["subStage"] = json!(sub_stage);
        }
        json!({
            "taskState": task_state,
            "clusterName": "swarm-1",
            "projectId": "project-1",
            "dns": "10.0.0.250",
            "gateway": "10.0.0.1",
            "netmask": "255.255.255.128",
            "etcdIps": ["10.0.0.1", "10.0.0.2", "10.0.0.3"],
            "slaveCount": 3,
        })
    }

    #[test]
    fn test_valid_start_states() {
        let engine = DocumentEngine::from_arc(Arc::new(ClusterCreateService::new(mock_collaborators())));
        for (stage, sub_stage) in [
            ("CREATED", None),
            ("STARTED", Some("ALLOCATE_RESOURCES")),
            ("STARTED", Some("SETUP_SLAVES")),
            ("FINISHED", None),
            ("FAILED", None),
            ("CANCELLED", None),
        ] {
            assert!(
                engine.handle_start(start_body(stage, sub_stage)).is_ok(),
                "{} {:?}",
                stage,
                sub_stage
            );
        }
        for (stage, sub_stage) in [("CREATED", Some("SETUP_ETCD")), ("FINISHED", Some("SETUP_MASTER"))] {
            assert!(engine.handle_start(start_body(stage, sub_stage)).is_err());
        }
    }

    #[test]
    fn test_start_rejects_bad_shape() {
        let engine = DocumentEngine::new(ClusterCreateService::new(mock_collaborators()));
        let mut body = start_body("CREATED", None);
        body["etcdIps"] = json!([]);
        assert!(engine.handle_start(body).is_err());

        let mut body = start_body("CREATED", None);
        body["slaveCount"] = json!(0);
        assert!(engine.handle_start(body).is_err());

        let mut body = start_body("CREATED", None);
        body.as_object_mut().unwrap().remove("dns");
        assert_eq!(engine.handle_start(body).unwrap_err().error_code(), "STRUCTURAL_VALIDATION");
    }

    #[test]
    fn test_transitions() {
        let allowed = |from: (TaskStage, Option<ClusterCreateStep>), to| TRANSITIONS.is_allowed(from, to);
        assert!(allowed((Created, None), (Started, Some(AllocateResources))));
        assert!(allowed((Started, Some(SetupSlaves)), (Finished, None)));
        assert!(!allowed((Created, None), (Created, None)));
        assert!(!allowed((Started, Some(SetupEtcd)), (Started, Some(AllocateResources))));
        assert!(!allowed((Started, Some(SetupMaster)), (Finished, None)));
    }

    #[test]
    fn test_illegal_patch_rejected() {
        let engine = DocumentEngine::new(ClusterCreateService::new(mock_collaborators()));
        let current = engine.handle_start(start_body("STARTED", Some("SETUP_ETCD"))).unwrap();
        let err = engine
            .handle_patch(&current, &json!({"taskState": {"stage": "FINISHED"}}))
            .unwrap_err();
        assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");

        let err = engine
            .handle_patch(&current, &json!({"etcdIps": ["10.0.0.9"]}))
            .unwrap_err();
        assert_eq!(err.error_code(), "IMMUTABLE_FIELD_VIOLATION");

        let failed = json!({"taskState": TaskState::<NoSubStage>::failed("boom")});
        assert!(engine.handle_patch(&current, &failed).is_ok());
    }

    #[test]
    fn test_extended_properties() {
        let state: ClusterCreateState = serde_json::from_value(start_body("CREATED", None)).unwrap();
        let properties = extended_properties(&state);
        assert_eq!(properties[EXTENDED_PROPERTY_DNS], "10.0.0.250");
        assert_eq!(properties[EXTENDED_PROPERTY_ETCD_IPS], "10.0.0.1,10.0.0.2,10.0.0.3");
    }

    #[test]
    fn test_rollout_failure_message() {
        let message = rollout_failure(NodeRole::Master, WorkflowError::external("no capacity"));
        assert_eq!(message, "Failed to rollout SwarmMaster. Error: no capacity");
    }

    struct Unreachable;

    #[async_trait]
    impl crate::external::NodeProvisioner for Unreachable {
        async fn provision(&self, _spec: &NodeSpec) -> Result<String> {
            Err(WorkflowError::external("unreachable"))
        }
    }

    #[async_trait]
    impl crate::external::EtcdClient for Unreachable {
        async fn check_status(&self, _address: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[async_trait]
    impl crate::external::SwarmClient for Unreachable {
        async fn get_node_addresses(&self, _master: &str) -> Result<std::collections::BTreeSet<String>> {
            Ok(Default::default())
        }
    }

    fn mock_collaborators() -> Collaborators {
        Collaborators {
            provisioner: Arc::new(Unreachable),
            etcd: Arc::new(Unreachable),
            swarm: Arc::new(Unreachable),
        }
    }
}
