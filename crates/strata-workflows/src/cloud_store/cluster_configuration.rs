// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-cluster-type configuration, one document per type.

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_core::{FieldSpec, ServiceOptions, StatefulService};
use strata_protocol::DocumentMeta;
use strata_protocol::paths::child_link;

pub const FACTORY_LINK: &str = "/cloudstore/cluster-configurations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterType {
    Swarm,
    Kubernetes,
    Mesos,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Swarm => "SWARM",
            ClusterType::Kubernetes => "KUBERNETES",
            ClusterType::Mesos => "MESOS",
        }
    }

    /// Link of this type's configuration document.
    pub fn configuration_link(&self) -> String {
        child_link(FACTORY_LINK, &self.as_str().to_lowercase())
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfigurationState {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_type: Option<ClusterType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

impl ClusterConfigurationState {
    /// Configuration for `cluster_type`, addressed by its well-known link.
    pub fn new(cluster_type: ClusterType, image_id: impl Into<String>) -> Self {
        Self {
            meta: DocumentMeta::with_self_link(cluster_type.configuration_link()),
            cluster_type: Some(cluster_type),
            image_id: Some(image_id.into()),
        }
    }
}

service_document!(ClusterConfigurationState, "strata:cloudstore:ClusterConfiguration");

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("clusterType").required().immutable(),
    FieldSpec::new("imageId").required(),
];

/// Re-posting a configuration replaces it.
#[derive(Debug, Default)]
pub struct ClusterConfigurationService;

impl StatefulService for ClusterConfigurationService {
    type State = ClusterConfigurationState;

    const FACTORY_LINK: &'static str = FACTORY_LINK;

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn options(&self) -> ServiceOptions {
        ServiceOptions {
            idempotent_post: true,
            ..ServiceOptions::default()
        }
    }
}
