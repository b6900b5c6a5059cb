// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External collaborators driven by the workflows.
//!
//! Each call is an opaque asynchronous operation: it succeeds with a payload
//! or fails with a message that becomes the task's failure cause.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Role of a provisioned cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Etcd,
    Master,
    Slave,
}

impl NodeRole {
    /// Name used in rollout failure messages.
    pub fn rollout_name(&self) -> &'static str {
        match self {
            NodeRole::Etcd => "SwarmEtcd",
            NodeRole::Master => "SwarmMaster",
            NodeRole::Slave => "SwarmSlave",
        }
    }
}

/// What to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub role: NodeRole,
    pub cluster_id: String,
    /// Position among the nodes of the same role.
    pub index: usize,
    /// Fixed address for the node; the provisioner assigns one when `None`.
    pub address: Option<String>,
    /// Template parameters (dns, gateway, netmask, etcd_ips, master_ip).
    pub properties: BTreeMap<String, String>,
}

/// Creates and boots cluster node VMs.
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// Provision one node and return its address.
    async fn provision(&self, spec: &NodeSpec) -> Result<String>;
}

/// Health endpoint of an etcd member.
#[async_trait]
pub trait EtcdClient: Send + Sync {
    async fn check_status(&self, address: &str) -> Result<bool>;
}

/// Swarm manager API.
#[async_trait]
pub trait SwarmClient: Send + Sync {
    /// Addresses of every node the manager at `master_address` knows.
    async fn get_node_addresses(&self, master_address: &str) -> Result<BTreeSet<String>>;
}

/// The collaborators the cluster-create workflow needs.
#[derive(Clone)]
pub struct Collaborators {
    pub provisioner: Arc<dyn NodeProvisioner>,
    pub etcd: Arc<dyn EtcdClient>,
    pub swarm: Arc<dyn SwarmClient>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
