// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for strata-workflows integration tests.
//!
//! Provides an in-process cloud-store cluster with every workflow service
//! registered, and a fake datacenter standing in for the provisioning
//! backends.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use strata_client::{ClientConfig, DocumentClient, StaticServerSet};
use strata_core::{HostConfig, HostRuntime, LocalNetwork, NodeGroup};
use strata_protocol::ServiceDocument;
use strata_workflows::Collaborators;
use strata_workflows::external::{EtcdClient, NodeProvisioner, NodeRole, NodeSpec, SwarmClient};
use strata_workflows::{Result, WorkflowError};

/// Provisioner, etcd and swarm manager backed by one in-memory inventory.
#[derive(Default)]
pub struct FakeDatacenter {
    /// Every provisioning request, in order.
    pub provisioned: Mutex<Vec<NodeSpec>>,
    /// Provisioning of this role fails.
    pub fail_role: Option<NodeRole>,
    /// Provisioning of this role never completes.
    pub hold_role: Option<NodeRole>,
    swarm_nodes: Mutex<BTreeSet<String>>,
}

impl FakeDatacenter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(role: NodeRole) -> Arc<Self> {
        Arc::new(Self {
            fail_role: Some(role),
            ..Self::default()
        })
    }

    pub fn holding(role: NodeRole) -> Arc<Self> {
        Arc::new(Self {
            hold_role: Some(role),
            ..Self::default()
        })
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            provisioner: self.clone(),
            etcd: self.clone(),
            swarm: self.clone(),
        }
    }

    pub fn provisioned_roles(&self) -> Vec<NodeRole> {
        self.provisioned
            .lock()
            .unwrap()
            .iter()
            .map(|spec| spec.role)
            .collect()
    }
}

#[async_trait]
impl NodeProvisioner for FakeDatacenter {
    async fn provision(&self, spec: &NodeSpec) -> Result<String> {
        self.provisioned.lock().unwrap().push(spec.clone());

        if self.hold_role == Some(spec.role) {
            std::future::pending::<()>().await;
        }
        if self.fail_role == Some(spec.role) {
            return Err(WorkflowError::external("vm placement failed"));
        }

        let address = match spec.role {
            NodeRole::Etcd => spec
                .address
                .clone()
                .ok_or_else(|| WorkflowError::external("etcd node needs an address"))?,
            NodeRole::Master => "10.20.0.1".to_string(),
            NodeRole::Slave => format!("10.20.1.{}", spec.index + 1),
        };
        if spec.role != NodeRole::Etcd {
            self.swarm_nodes.lock().unwrap().insert(address.clone());
        }
        Ok(address)
    }
}

#[async_trait]
impl EtcdClient for FakeDatacenter {
    async fn check_status(&self, _address: &str) -> Result<bool> {
        Ok(true)
    }
}

#[async_trait]
impl SwarmClient for FakeDatacenter {
    async fn get_node_addresses(&self, _master_address: &str) -> Result<BTreeSet<String>> {
        Ok(self.swarm_nodes.lock().unwrap().clone())
    }
}

pub struct Cloud {
    pub network: Arc<LocalNetwork>,
    pub group: Arc<NodeGroup>,
    pub nodes: Vec<HostRuntime>,
    pub client: DocumentClient,
    pub base_port: u16,
}

impl Cloud {
    /// A cluster of `size` hosts on its own network.
    pub async fn start(size: usize, collaborators: Option<Collaborators>) -> Self {
        Self::start_on(LocalNetwork::new(), "cloudstore", 19200, size, collaborators).await
    }

    /// A cluster of `size` hosts on `network`, listening from `base_port`.
    pub async fn start_on(
        network: Arc<LocalNetwork>,
        name: &str,
        base_port: u16,
        size: usize,
        collaborators: Option<Collaborators>,
    ) -> Self {
        let group = Arc::new(NodeGroup::new(name));
        let config = HostConfig {
            // Passes are driven by the tests.
            maintenance_poll_interval: Duration::from_secs(3600),
            operation_timeout: Duration::from_secs(5),
            ..HostConfig::default()
        };

        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let builder = HostRuntime::builder()
                .id(format!("{}-{}", name, i))
                .bind_addr(Self::addr(base_port, i))
                .group(group.clone())
                .network(network.clone())
                .config(config.clone());
            let runtime = strata_workflows::register_services(builder, collaborators.as_ref())
                .build()
                .expect("valid runtime config")
                .start()
                .await
                .expect("runtime starts");
            nodes.push(runtime);
        }

        let client = DocumentClient::new(
            Arc::new(StaticServerSet::new((0..size).map(|i| Self::addr(base_port, i)))),
            network.clone(),
            ClientConfig::default()
                .with_latch_timeout(Duration::from_secs(5))
                .with_status_check_interval(Duration::from_millis(10)),
        );

        Self {
            network,
            group,
            nodes,
            client,
            base_port,
        }
    }

    pub fn addr(base_port: u16, index: usize) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], base_port + index as u16))
    }

    /// POST `body` and return the created document.
    pub async fn create<T: ServiceDocument>(&self, factory_link: &str, body: &T) -> T {
        self.client
            .post(factory_link, body)
            .await
            .expect("create succeeds")
            .body_as()
            .expect("created document decodes")
    }

    /// Run one maintenance pass on every host.
    pub async fn run_maintenance(&self) {
        for node in &self.nodes {
            node.maintenance().run_once().await.expect("maintenance pass");
        }
    }

    /// Poll `link` until `done` holds or five seconds pass.
    pub async fn wait_for<T: ServiceDocument>(&self, link: &str, done: impl Fn(&T) -> bool) -> T {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(document) = self.client.get_document::<T>(link).await
                && done(&document)
            {
                return document;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} never reached the expected state",
                link
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            node.shutdown().await.expect("clean shutdown");
        }
    }
}

