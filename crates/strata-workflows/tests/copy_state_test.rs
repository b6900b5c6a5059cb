// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State copy between two clusters sharing one network, and the periodic
//! trigger that drives it.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::Cloud;
use serde_json::json;
use strata_core::{LinkFault, LocalNetwork};
use strata_protocol::task::CONTROL_FLAG_OPERATION_PROCESSING_DISABLED;
use strata_protocol::{DocumentMeta, TaskStage, TaskState};
use strata_workflows::cloud_store::{HostState, HostStatus, UsageTag, host};
use strata_workflows::tasks::copy_state_trigger::watermark;
use strata_workflows::tasks::{CopyStateState, CopyStateTriggerState, ExecutionState, copy_state, copy_state_trigger};

const SOURCE_PORT: u16 = 19300;
const DESTINATION_PORT: u16 = 19400;

async fn two_clusters() -> (Cloud, Cloud) {
    let network = LocalNetwork::new();
    let source = Cloud::start_on(network.clone(), "source", SOURCE_PORT, 2, None).await;
    let destination = Cloud::start_on(network, "destination", DESTINATION_PORT, 2, None).await;
    (source, destination)
}

async fn seed_hosts(cloud: &Cloud, count: usize) {
    for i in 0..count {
        cloud
            .create(
                host::FACTORY_LINK,
                &HostState {
                    meta: DocumentMeta::with_self_link(format!("{}/esx-{}", host::FACTORY_LINK, i)),
                    host_address: Some(format!("192.168.1.{}", 10 + i)),
                    usage_tags: Some(vec![UsageTag::Cloud]),
                    state: Some(HostStatus::Ready),
                    memory_mb: Some(4096),
                    cpu_count: Some(4),
                },
            )
            .await;
    }
}

fn copy_request() -> CopyStateState {
    CopyStateState {
        source_ip: Some("127.0.0.1".to_string()),
        source_port: Some(SOURCE_PORT),
        destination_ip: Some("127.0.0.1".to_string()),
        destination_port: Some(DESTINATION_PORT),
        factory_link: Some(host::FACTORY_LINK.to_string()),
        source_factory_link: Some(host::FACTORY_LINK.to_string()),
        query_result_limit: Some(2),
        ..CopyStateState::default()
    }
}

fn trigger_request() -> CopyStateTriggerState {
    CopyStateTriggerState {
        source_ip: Some("127.0.0.1".to_string()),
        source_port: Some(SOURCE_PORT),
        destination_ip: Some("127.0.0.1".to_string()),
        destination_port: Some(DESTINATION_PORT),
        factory_link: Some(host::FACTORY_LINK.to_string()),
        source_factory_link: Some(host::FACTORY_LINK.to_string()),
        query_result_limit: Some(2),
        ..CopyStateTriggerState::default()
    }
}

fn is_terminal(task: &CopyStateState) -> bool {
    task.task_state.as_ref().is_some_and(TaskState::is_terminal)
}

async fn copy_tasks(cloud: &Cloud) -> Vec<CopyStateState> {
    cloud
        .client
        .query_documents::<CopyStateState>(&[("factoryLink", host::FACTORY_LINK)])
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_copy_state_moves_every_page() {
    let (source, destination) = two_clusters().await;
    seed_hosts(&source, 5).await;

    let task = destination.create(copy_state::FACTORY_LINK, &copy_request()).await;
    let link = task.meta.document_self_link.unwrap();
    let task: CopyStateState = destination.wait_for(&link, is_terminal).await;

    let state = task.task_state.as_ref().unwrap();
    assert_eq!(state.stage, TaskStage::Finished, "{:?}", state.failure_message());
    assert_eq!(task.documents_copied, Some(5));

    let copied: Vec<HostState> = destination.client.query_documents(&[]).await.unwrap();
    assert_eq!(copied.len(), 5);
    let esx3: HostState = destination
        .client
        .get_document(&format!("{}/esx-3", host::FACTORY_LINK))
        .await
        .unwrap();
    assert_eq!(esx3.host_address.as_deref(), Some("192.168.1.13"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_copy_state_respects_watermark() {
    let (source, destination) = two_clusters().await;
    seed_hosts(&source, 3).await;

    let mut request = copy_request();
    request.query_documents_changed_since_epoch = Some(u64::MAX);
    let task = destination.create(copy_state::FACTORY_LINK, &request).await;
    let task: CopyStateState = destination
        .wait_for(&task.meta.document_self_link.unwrap(), is_terminal)
        .await;

    assert_eq!(task.task_state.unwrap().stage, TaskStage::Finished);
    assert_eq!(task.documents_copied, Some(0));
    let copied: Vec<HostState> = destination.client.query_documents(&[]).await.unwrap();
    assert!(copied.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_source_fails_task() {
    let (_source, destination) = two_clusters().await;

    let mut request = copy_request();
    request.source_port = Some(SOURCE_PORT + 50);
    let task = destination.create(copy_state::FACTORY_LINK, &request).await;
    let task: CopyStateState = destination
        .wait_for(&task.meta.document_self_link.unwrap(), is_terminal)
        .await;

    let state = task.task_state.unwrap();
    assert_eq!(state.stage, TaskStage::Failed);
    assert!(state.failure_message().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trigger_starts_one_task_at_a_time() {
    let (source, destination) = two_clusters().await;
    seed_hosts(&source, 3).await;

    // A copy for the same pair that never runs.
    let mut parked = copy_request();
    parked.control_flags = Some(CONTROL_FLAG_OPERATION_PROCESSING_DISABLED);
    let parked = destination.create(copy_state::FACTORY_LINK, &parked).await;
    let parked_link = parked.meta.document_self_link.unwrap();

    let trigger = destination
        .create(copy_state_trigger::FACTORY_LINK, &trigger_request())
        .await;
    let trigger_link = trigger.meta.document_self_link.unwrap();
    assert_eq!(trigger.execution_state, Some(ExecutionState::Running));

    // First maintenance round pulses the trigger; the parked task blocks it.
    destination.run_maintenance().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(copy_tasks(&destination).await.len(), 1);
    let trigger: CopyStateTriggerState = destination.client.get_document(&trigger_link).await.unwrap();
    assert_eq!(trigger.triggers_success, Some(0));

    destination
        .client
        .patch(&parked_link, &json!({"taskState": {"stage": "CANCELLED"}}))
        .await
        .unwrap();

    destination
        .client
        .patch(&trigger_link, &json!({"pulse": 1}))
        .await
        .unwrap();
    destination
        .wait_for(&trigger_link, |t: &CopyStateTriggerState| t.triggers_success == Some(1))
        .await;

    let tasks = copy_tasks(&destination).await;
    assert_eq!(tasks.len(), 2);
    let started = tasks
        .iter()
        .find(|t| t.meta.document_self_link.as_deref() != Some(parked_link.as_str()))
        .unwrap();
    assert_eq!(started.query_documents_changed_since_epoch, Some(0));
    let started = destination
        .wait_for(started.meta.document_self_link.as_deref().unwrap(), is_terminal)
        .await;
    assert_eq!(started.task_state.as_ref().unwrap().stage, TaskStage::Finished);

    // The next copy starts where the finished one left off.
    destination
        .client
        .patch(&trigger_link, &json!({"pulse": 2}))
        .await
        .unwrap();
    destination
        .wait_for(&trigger_link, |t: &CopyStateTriggerState| t.triggers_success == Some(2))
        .await;
    let tasks = copy_tasks(&destination).await;
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().any(|t| {
        t.query_documents_changed_since_epoch == started.last_document_update_time_micros
    }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stopped_trigger_ignores_pulses() {
    let (_source, destination) = two_clusters().await;

    let trigger = destination
        .create(copy_state_trigger::FACTORY_LINK, &trigger_request())
        .await;
    let trigger_link = trigger.meta.document_self_link.unwrap();

    destination
        .client
        .patch(&trigger_link, &json!({"executionState": "STOPPED"}))
        .await
        .unwrap();
    destination
        .client
        .patch(&trigger_link, &json!({"pulse": 1}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(copy_tasks(&destination).await.is_empty());
    let trigger: CopyStateTriggerState = destination.client.get_document(&trigger_link).await.unwrap();
    assert_eq!(trigger.triggers_success, Some(0));
    assert_eq!(trigger.execution_state, Some(ExecutionState::Stopped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_source_write_during_copy_is_picked_up_next_time() {
    // Slow hops keep the first copy running while the source changes.
    let network = LocalNetwork::with_latency(Duration::from_millis(20));
    let source = Cloud::start_on(network.clone(), "source", SOURCE_PORT, 2, None).await;
    let destination = Cloud::start_on(network, "destination", DESTINATION_PORT, 2, None).await;
    seed_hosts(&source, 10).await;

    let mut request = copy_request();
    request.query_result_limit = Some(1);
    let first = destination.create(copy_state::FACTORY_LINK, &request).await;
    let first_link = first.meta.document_self_link.unwrap();

    let esx0 = format!("{}/esx-0", host::FACTORY_LINK);
    destination.wait_for(&esx0, |_: &HostState| true).await;
    let changed: HostState = source
        .client
        .patch(&esx0, &json!({"memoryMb": 9999}))
        .await
        .unwrap()
        .body_as()
        .unwrap();

    let first: CopyStateState = destination.wait_for(&first_link, is_terminal).await;
    assert_eq!(first.task_state.as_ref().unwrap().stage, TaskStage::Finished);
    assert_eq!(first.documents_copied, Some(10));
    let copied_up_to = first.last_document_update_time_micros.unwrap();
    assert!(copied_up_to < changed.meta.document_update_time_micros);

    request.query_documents_changed_since_epoch = Some(watermark(std::slice::from_ref(&first)));
    let second = destination.create(copy_state::FACTORY_LINK, &request).await;
    let second: CopyStateState = destination
        .wait_for(&second.meta.document_self_link.unwrap(), is_terminal)
        .await;
    assert_eq!(second.task_state.unwrap().stage, TaskStage::Finished);
    assert!(second.documents_copied.unwrap() >= 1);

    let esx0: HostState = destination.client.get_document(&esx0).await.unwrap();
    assert_eq!(esx0.memory_mb, Some(9999));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pulses_start_one_task() {
    let network = LocalNetwork::with_latency(Duration::from_millis(20));
    let destination = Cloud::start_on(network.clone(), "destination", DESTINATION_PORT, 2, None).await;
    // The source never answers, so the started copy stays running.
    network.set_fault(
        SocketAddr::from(([127, 0, 0, 1], SOURCE_PORT)),
        Some(LinkFault::Blackhole),
    );

    let trigger = destination
        .create(copy_state_trigger::FACTORY_LINK, &trigger_request())
        .await;
    let trigger_link = trigger.meta.document_self_link.unwrap();

    let pulse_one = json!({"pulse": 1});
    let pulse_two = json!({"pulse": 2});
    let (first, second) = tokio::join!(
        destination.client.patch(&trigger_link, &pulse_one),
        destination.client.patch(&trigger_link, &pulse_two),
    );
    first.unwrap();
    second.unwrap();

    destination
        .wait_for(&trigger_link, |t: &CopyStateTriggerState| t.triggers_success == Some(1))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let tasks = copy_tasks(&destination).await;
    assert_eq!(tasks.len(), 1);
    assert!(!is_terminal(&tasks[0]));
    let trigger: CopyStateTriggerState = destination.client.get_document(&trigger_link).await.unwrap();
    assert_eq!(trigger.triggers_success, Some(1));
    assert_eq!(trigger.triggers_error, Some(0));
}
