// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributes a host's memory and cpu across the containers of its
//! management VM.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strata_core::task::STAGE_ONLY;
use strata_core::{FieldSpec, ServiceContext, StatefulService};
use strata_protocol::{DocumentMeta, NoSubStage, QuerySpecification, TaskStage, TaskState};
use tracing::{debug, info, instrument};

use super::{fail_task, processing_enabled, send_stage};
use crate::cloud_store::container::{
    DOCKER_CPU_SHARES_MAX, DOCKER_CPU_SHARES_MIN, DYNAMIC_PARAMETER_MEMORY_MB,
    FIELD_NAME_VM_SERVICE_LINK,
};
use crate::cloud_store::vm::FIELD_NAME_HOST_SERVICE_LINK;
use crate::cloud_store::{ContainerState, HostState, VmState};
use crate::error::{Result, WorkflowError};

pub const FACTORY_LINK: &str = "/tasks/allocate-host-resource";

/// Share of a mixed MGMT+CLOUD host given to the management VM.
pub const MANAGEMENT_VM_TO_HOST_RESOURCE_RATIO: f64 = 0.25;

/// Share of a management-only host given to the management VM.
pub const MANAGEMENT_VM_TO_MANAGEMENT_ONLY_HOST_RESOURCE_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateHostResourceState {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_state: Option<TaskState<NoSubStage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_flags: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_service_link: Option<String>,
}

service_document!(AllocateHostResourceState, "strata:tasks:AllocateHostResource");

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("hostServiceLink").required().immutable(),
    FieldSpec::new("controlFlags").immutable(),
];

/// Resources one container receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub memory_mb: i64,
    pub cpu_shares: i64,
}

/// Memory the management VM may use on `host`, or `None` without host data.
pub fn usable_memory_mb(host: &HostState) -> Option<i64> {
    let memory_mb = host.memory_mb?;
    host.cpu_count?;
    let ratio = if host.is_mixed() {
        MANAGEMENT_VM_TO_HOST_RESOURCE_RATIO
    } else {
        MANAGEMENT_VM_TO_MANAGEMENT_ONLY_HOST_RESOURCE_RATIO
    };
    Some((memory_mb as f64 * ratio).floor() as i64)
}

/// Split `usable_memory_mb` across containers by weight. The total stays
/// strictly below `usable_memory_mb`.
pub fn distribute(usable_memory_mb: i64, weights: &[i64]) -> Vec<Allocation> {
    let total_weight: i64 = weights.iter().map(|w| (*w).max(1)).sum();
    let max_weight = weights.iter().copied().max().unwrap_or(1).max(1);
    let budget = (usable_memory_mb - 1).max(0);

    weights
        .iter()
        .map(|weight| {
            let weight = (*weight).max(1);
            Allocation {
                memory_mb: budget * weight / total_weight,
                cpu_shares: (DOCKER_CPU_SHARES_MAX * weight / max_weight)
                    .clamp(DOCKER_CPU_SHARES_MIN, DOCKER_CPU_SHARES_MAX),
            }
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct AllocateHostResourceService;

impl AllocateHostResourceService {
    #[instrument(skip_all, fields(link = %ctx.self_link(), host = ?state.host_service_link))]
    async fn allocate(&self, ctx: &ServiceContext, state: &AllocateHostResourceState) -> Result<()> {
        let host_link = state
            .host_service_link
            .as_deref()
            .ok_or_else(|| WorkflowError::invalid_state("hostServiceLink is not set"))?;
        let host: HostState = ctx.get(host_link).await?;

        let Some(usable_memory_mb) = usable_memory_mb(&host) else {
            info!("Host has no memory or cpu data, nothing to allocate");
            return Ok(());
        };

        let vms: Vec<VmState> = ctx
            .query_documents(QuerySpecification::for_document::<VmState>().term(FIELD_NAME_HOST_SERVICE_LINK, host_link))
            .await?;
        let vm = match vms.as_slice() {
            [vm] => vm,
            [] => return Err(WorkflowError::invalid_state(format!("no VM found on host {}", host_link))),
            _ => {
                return Err(WorkflowError::invalid_state(format!(
                    "{} VMs found on host {}, expected one",
                    vms.len(),
                    host_link
                )));
            }
        };
        let vm_link = vm
            .meta
            .document_self_link
            .clone()
            .ok_or_else(|| WorkflowError::invalid_state("VM has no self link"))?;

        let mut containers: Vec<ContainerState> = ctx
            .query_documents(
                QuerySpecification::for_document::<ContainerState>().term(FIELD_NAME_VM_SERVICE_LINK, &vm_link),
            )
            .await?;
        containers.sort_by(|a, b| a.meta.document_self_link.cmp(&b.meta.document_self_link));

        let weights: Vec<i64> = containers.iter().map(|c| c.weight.unwrap_or(1)).collect();
        let allocations = distribute(usable_memory_mb, &weights);

        for (container, allocation) in containers.iter().zip(&allocations) {
            let Some(link) = container.meta.document_self_link.as_deref() else {
                continue;
            };
            let mut dynamic_parameters: BTreeMap<String, String> =
                container.dynamic_parameters.clone().unwrap_or_default();
            dynamic_parameters.insert(
                DYNAMIC_PARAMETER_MEMORY_MB.to_string(),
                allocation.memory_mb.to_string(),
            );

            ctx.patch(
                link,
                &ContainerState {
                    memory_mb: Some(allocation.memory_mb),
                    cpu_shares: Some(allocation.cpu_shares),
                    dynamic_parameters: Some(dynamic_parameters),
                    ..ContainerState::default()
                },
            )
            .await?;
            debug!(container = %link, memory_mb = allocation.memory_mb, cpu_shares = allocation.cpu_shares, "Container allocated");
        }

        let cpu_count = host.cpu_count.unwrap_or(1);
        ctx.patch(
            &vm_link,
            &VmState {
                memory_mb: Some(usable_memory_mb),
                cpu_count: Some(cpu_count),
                ..VmState::default()
            },
        )
        .await?;

        info!(
            containers = containers.len(),
            usable_memory_mb, "Host resources allocated"
        );
        Ok(())
    }
}

#[async_trait]
impl StatefulService for AllocateHostResourceService {
    type State = AllocateHostResourceState;

    const FACTORY_LINK: &'static str = FACTORY_LINK;

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn initialize(&self, state: &mut AllocateHostResourceState) {
        state.task_state.get_or_insert_with(TaskState::default);
        state.control_flags.get_or_insert(0);
    }

    fn validate_start(&self, state: &AllocateHostResourceState) -> strata_core::Result<()> {
        STAGE_ONLY.validate_start(state.task_state.as_ref())
    }

    fn validate_patch(
        &self,
        current: &AllocateHostResourceState,
        patch: &AllocateHostResourceState,
    ) -> strata_core::Result<()> {
        STAGE_ONLY.validate_transition(current.task_state.as_ref(), patch.task_state.as_ref())
    }

    async fn on_started(&self, ctx: ServiceContext, state: AllocateHostResourceState) {
        if !processing_enabled(state.control_flags) {
            return;
        }
        match state.task_state.as_ref().map(|t| t.stage) {
            Some(TaskStage::Created) => send_stage(&ctx, TaskState::<NoSubStage>::new(TaskStage::Started)),
            Some(TaskStage::Started) => self.run(&ctx, &state).await,
            _ => {}
        }
    }

    async fn on_patched(
        &self,
        ctx: ServiceContext,
        state: AllocateHostResourceState,
        patch: AllocateHostResourceState,
    ) {
        if !processing_enabled(state.control_flags) {
            return;
        }
        let entered_started = patch
            .task_state
            .as_ref()
            .is_some_and(|t| t.stage == TaskStage::Started);
        if entered_started {
            self.run(&ctx, &state).await;
        }
    }
}

impl AllocateHostResourceService {
    async fn run(&self, ctx: &ServiceContext, state: &AllocateHostResourceState) {
        match self.allocate(ctx, state).await {
            Ok(()) => send_stage(ctx, TaskState::<NoSubStage>::new(TaskStage::Finished)),
            Err(e) => fail_task(ctx, e.to_string()),
        }
    }
}
