// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker containers running inside management VMs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_core::{CoreError, FieldSpec, ServiceOptions, StatefulService};
use strata_protocol::DocumentMeta;

pub const FACTORY_LINK: &str = "/cloudstore/containers";

pub const FIELD_NAME_VM_SERVICE_LINK: &str = "vmServiceLink";

/// Docker accepts cpu shares in this range.
pub const DOCKER_CPU_SHARES_MIN: i64 = 2;
pub const DOCKER_CPU_SHARES_MAX: i64 = 1024;

/// Dynamic parameter mirroring the allocated memory.
pub const DYNAMIC_PARAMETER_MEMORY_MB: &str = "memoryMb";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_service_link: Option<String>,
    /// Relative share of the VM's resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_parameters: Option<BTreeMap<String, String>>,
}

service_document!(ContainerState, "strata:cloudstore:Container");

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("name").required().immutable(),
    FieldSpec::new("vmServiceLink").required().immutable(),
    FieldSpec::new("weight").required(),
];

#[derive(Debug, Default)]
pub struct ContainerService;

impl StatefulService for ContainerService {
    type State = ContainerState;

    const FACTORY_LINK: &'static str = FACTORY_LINK;

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    /// State copies re-POST existing links.
    fn options(&self) -> ServiceOptions {
        ServiceOptions {
            idempotent_post: true,
            ..ServiceOptions::default()
        }
    }

    fn initialize(&self, state: &mut ContainerState) {
        state.weight.get_or_insert(1);
    }

    fn validate_state(&self, state: &ContainerState) -> strata_core::Result<()> {
        if state.weight.is_some_and(|w| w < 1) {
            return Err(CoreError::validation("weight must be positive"));
        }
        if let Some(shares) = state.cpu_shares
            && !(DOCKER_CPU_SHARES_MIN..=DOCKER_CPU_SHARES_MAX).contains(&shares)
        {
            return Err(CoreError::validation(format!(
                "cpuShares must be between {} and {}, got {}",
                DOCKER_CPU_SHARES_MIN, DOCKER_CPU_SHARES_MAX, shares
            )));
        }
        Ok(())
    }
}
