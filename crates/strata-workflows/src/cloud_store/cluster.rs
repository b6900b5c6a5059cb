// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container orchestration clusters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_core::{CoreError, FieldSpec, ServiceOptions, StatefulService};
use strata_protocol::DocumentMeta;

use super::cluster_configuration::ClusterType;

pub const FACTORY_LINK: &str = "/cloudstore/clusters";

pub const EXTENDED_PROPERTY_DNS: &str = "dns";
pub const EXTENDED_PROPERTY_GATEWAY: &str = "gateway";
pub const EXTENDED_PROPERTY_NETMASK: &str = "netmask";
pub const EXTENDED_PROPERTY_ETCD_IPS: &str = "etcd_ips";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Creating,
    Ready,
    Resizing,
    Error,
    PendingDelete,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_type: Option<ClusterType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_state: Option<ClusterStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<BTreeMap<String, String>>,
}

service_document!(ClusterState, "strata:cloudstore:Cluster");

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("clusterName").required().immutable(),
    FieldSpec::new("clusterType").required().immutable(),
    FieldSpec::new("clusterState").required(),
    FieldSpec::new("projectId").required().immutable(),
    FieldSpec::new("slaveCount").required(),
];

#[derive(Debug, Default)]
pub struct ClusterService;

impl StatefulService for ClusterService {
    type State = ClusterState;

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

    fn validate_state(&self, state: &ClusterState) -> strata_core::Result<()> {
        if state.slave_count.is_some_and(|count| count < 0) {
            return Err(CoreError::validation("slaveCount cannot be negative"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::{DocumentEngine, ServiceHandler};

    #[test]
    fn test_start_requires_fields() {
        let engine = DocumentEngine::new(ClusterService);
        let err = engine
            .handle_start(json!({"clusterName": "c", "clusterType": "SWARM"}))
            .unwrap_err();
        assert_eq!(err.error_code(), "STRUCTURAL_VALIDATION");

        let started = engine
            .handle_start(json!({
                "clusterName": "c",
                "clusterType": "SWARM",
                "clusterState": "CREATING",
                "projectId": "p",
                "slaveCount": 2,
            }))
            .unwrap();
        let patched = engine
            .handle_patch(&started, &json!({"clusterState": "READY"}))
            .unwrap();
        assert_eq!(patched["clusterState"], "READY");

        let err = engine
            .handle_patch(&started, &json!({"projectId": "other"}))
            .unwrap_err();
        assert_eq!(err.error_code(), "IMMUTABLE_FIELD_VIOLATION");
    }
}
