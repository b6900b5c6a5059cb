// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Swarm cluster creation against a fake datacenter.

mod common;

use common::{Cloud, FakeDatacenter};
use strata_protocol::{TaskStage, TaskState};
use strata_workflows::cloud_store::cluster::{EXTENDED_PROPERTY_DNS, EXTENDED_PROPERTY_ETCD_IPS};
use strata_workflows::cloud_store::{
    ClusterConfigurationState, ClusterState, ClusterStatus, ClusterType, cluster,
    cluster_configuration,
};
use strata_workflows::external::NodeRole;
use strata_workflows::tasks::cluster_create::FACTORY_LINK;
use strata_workflows::tasks::{ClusterCreateState, ClusterCreateStep};

fn request() -> ClusterCreateState {
    ClusterCreateState {
        cluster_name: Some("swarm-a".to_string()),
        project_id: Some("project-1".to_string()),
        dns: Some("10.0.0.2".to_string()),
        gateway: Some("10.0.0.1".to_string()),
        netmask: Some("255.255.255.0".to_string()),
        etcd_ips: Some(vec![
            "10.0.0.11".to_string(),
            "10.0.0.12".to_string(),
            "10.0.0.13".to_string(),
        ]),
        slave_count: Some(2),
        ..ClusterCreateState::default()
    }
}

async fn configure_swarm(cloud: &Cloud) {
    cloud
        .create(
            cluster_configuration::FACTORY_LINK,
            &ClusterConfigurationState::new(ClusterType::Swarm, "swarm-image-1"),
        )
        .await;
}

fn link_of(task: &ClusterCreateState) -> String {
    task.meta.document_self_link.clone().expect("task has a link")
}

fn stage(task: &ClusterCreateState) -> Option<(TaskStage, Option<ClusterCreateStep>)> {
    task.task_state.as_ref().map(|t| (t.stage, t.sub_stage))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_allocation_moves_to_setup_etcd() {
    let datacenter = FakeDatacenter::holding(NodeRole::Etcd);
    let cloud = Cloud::start(3, Some(datacenter.collaborators())).await;
    configure_swarm(&cloud).await;

    let task = cloud.create(FACTORY_LINK, &request()).await;
    let task: ClusterCreateState = cloud
        .wait_for(&link_of(&task), |t: &ClusterCreateState| {
            stage(t) == Some((TaskStage::Started, Some(ClusterCreateStep::SetupEtcd)))
        })
        .await;

    let cluster_id = task.cluster_id.expect("cluster allocated");
    let cluster: ClusterState = cloud
        .client
        .get_document(&format!("{}/{}", cluster::FACTORY_LINK, cluster_id))
        .await
        .unwrap();
    assert_eq!(cluster.cluster_state, Some(ClusterStatus::Creating));
    assert_eq!(cluster.image_id.as_deref(), Some("swarm-image-1"));
    assert_eq!(cluster.slave_count, Some(2));

    let properties = cluster.extended_properties.expect("extended properties");
    assert_eq!(properties[EXTENDED_PROPERTY_DNS], "10.0.0.2");
    assert_eq!(
        properties[EXTENDED_PROPERTY_ETCD_IPS],
        "10.0.0.11,10.0.0.12,10.0.0.13"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_configuration_fails_task() {
    let datacenter = FakeDatacenter::new();
    let cloud = Cloud::start(3, Some(datacenter.collaborators())).await;

    let task = cloud.create(FACTORY_LINK, &request()).await;
    let task: ClusterCreateState = cloud
        .wait_for(&link_of(&task), |t: &ClusterCreateState| {
            t.task_state.as_ref().is_some_and(TaskState::is_terminal)
        })
        .await;

    let state = task.task_state.unwrap();
    assert_eq!(state.stage, TaskStage::Failed);
    assert!(
        state
            .failure_message()
            .unwrap()
            .contains("Cannot find cluster configuration for SWARM")
    );
    assert!(datacenter.provisioned_roles().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_is_created_end_to_end() {
    let datacenter = FakeDatacenter::new();
    let cloud = Cloud::start(3, Some(datacenter.collaborators())).await;
    configure_swarm(&cloud).await;

    let task = cloud.create(FACTORY_LINK, &request()).await;
    let task: ClusterCreateState = cloud
        .wait_for(&link_of(&task), |t: &ClusterCreateState| {
            t.task_state.as_ref().is_some_and(TaskState::is_terminal)
        })
        .await;
    assert_eq!(task.task_state.as_ref().unwrap().stage, TaskStage::Finished);
    assert_eq!(task.master_ip.as_deref(), Some("10.20.0.1"));

    let cluster: ClusterState = cloud
        .client
        .get_document(&format!(
            "{}/{}",
            cluster::FACTORY_LINK,
            task.cluster_id.unwrap()
        ))
        .await
        .unwrap();
    assert_eq!(cluster.cluster_state, Some(ClusterStatus::Ready));

    assert_eq!(
        datacenter.provisioned_roles(),
        vec![
            NodeRole::Etcd,
            NodeRole::Etcd,
            NodeRole::Etcd,
            NodeRole::Master,
            NodeRole::Slave,
            NodeRole::Slave,
        ]
    );
    let provisioned = datacenter.provisioned.lock().unwrap();
    let slave = provisioned.last().unwrap();
    assert_eq!(slave.properties["master_ip"], "10.20.0.1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_etcd_rollout_failure_marks_cluster_error() {
    let datacenter = FakeDatacenter::failing(NodeRole::Etcd);
    let cloud = Cloud::start(3, Some(datacenter.collaborators())).await;
    configure_swarm(&cloud).await;

    let task = cloud.create(FACTORY_LINK, &request()).await;
    let task: ClusterCreateState = cloud
        .wait_for(&link_of(&task), |t: &ClusterCreateState| {
            t.task_state.as_ref().is_some_and(TaskState::is_terminal)
        })
        .await;

    let state = task.task_state.unwrap();
    assert_eq!(state.stage, TaskStage::Failed);
    assert_eq!(
        state.failure_message(),
        Some("Failed to rollout SwarmEtcd. Error: vm placement failed")
    );

    let cluster: ClusterState = cloud
        .wait_for(
            &format!("{}/{}", cluster::FACTORY_LINK, task.cluster_id.unwrap()),
            |c: &ClusterState| c.cluster_state == Some(ClusterStatus::Error),
        )
        .await;
    assert_eq!(cluster.cluster_name.as_deref(), Some("swarm-a"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalid_request_is_rejected() {
    let cloud = Cloud::start(1, Some(FakeDatacenter::new().collaborators())).await;

    let mut no_etcd = request();
    no_etcd.etcd_ips = Some(Vec::new());
    assert!(cloud.client.post(FACTORY_LINK, &no_etcd).await.is_err());

    let mut no_name = request();
    no_name.cluster_name = None;
    assert!(cloud.client.post(FACTORY_LINK, &no_name).await.is_err());
}
