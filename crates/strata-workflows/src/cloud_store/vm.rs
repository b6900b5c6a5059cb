// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Management VMs placed on hosts.

use serde::{Deserialize, Serialize};
use strata_core::{FieldSpec, ServiceOptions, StatefulService};
use strata_protocol::DocumentMeta;

pub const FACTORY_LINK: &str = "/cloudstore/vms";

pub const FIELD_NAME_HOST_SERVICE_LINK: &str = "hostServiceLink";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmState {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_service_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<i64>,
}

service_document!(VmState, "strata:cloudstore:Vm");

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("name").required(),
    FieldSpec::new("hostServiceLink").required().immutable(),
];

#[derive(Debug, Default)]
pub struct VmService;

impl StatefulService for VmService {
    type State = VmState;

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
}
