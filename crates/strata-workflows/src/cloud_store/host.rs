// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Physical hosts.

use serde::{Deserialize, Serialize};
use strata_core::{CoreError, FieldSpec, ServiceOptions, StatefulService};
use strata_protocol::DocumentMeta;

pub const FACTORY_LINK: &str = "/cloudstore/hosts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageTag {
    Mgmt,
    Cloud,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostStatus {
    Creating,
    NotProvisioned,
    Ready,
    Maintenance,
    Suspended,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostState {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_tags: Option<Vec<UsageTag>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<HostStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<i64>,
}

impl HostState {
    pub fn has_tag(&self, tag: UsageTag) -> bool {
        self.usage_tags
            .as_ref()
            .is_some_and(|tags| tags.contains(&tag))
    }

    /// Hosts that run management VMs next to cloud workloads.
    pub fn is_mixed(&self) -> bool {
        self.has_tag(UsageTag::Mgmt) && self.has_tag(UsageTag::Cloud)
    }
}

service_document!(HostState, "strata:cloudstore:Host");

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("hostAddress").required().immutable(),
    FieldSpec::new("usageTags").required(),
    FieldSpec::new("state").required(),
];

#[derive(Debug, Default)]
pub struct HostService;

impl StatefulService for HostService {
    type State = HostState;

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

    fn validate_state(&self, state: &HostState) -> strata_core::Result<()> {
        if state.usage_tags.as_ref().is_some_and(Vec::is_empty) {
            return Err(CoreError::validation("usageTags cannot be empty"));
        }
        if state.memory_mb.is_some_and(|m| m < 0) || state.cpu_count.is_some_and(|c| c < 0) {
            return Err(CoreError::validation("host resources cannot be negative"));
        }
        Ok(())
    }
}
