// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for one strata host.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strata_core::{HostRuntime, LocalNetwork, NodeGroup};
//!
//! let network = LocalNetwork::new();
//! let group = Arc::new(NodeGroup::new("cloudstore"));
//!
//! let runtime = HostRuntime::builder()
//!     .id("node-0")
//!     .bind_addr("127.0.0.1:19000".parse()?)
//!     .group(group)
//!     .network(network)
//!     .service(my_service)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... serve ...
//!
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use strata_protocol::ServiceUri;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::HostConfig;
use crate::host::ServiceHost;
use crate::maintenance::{MaintenanceConfig, MaintenanceLoop};
use crate::network::LocalNetwork;
use crate::node_group::NodeGroup;
use crate::persistence::{DocumentStore, MemoryStore};
use crate::service::ServiceHandler;

/// Builder for creating a [`HostRuntime`].
#[derive(Default)]
pub struct HostRuntimeBuilder {
    id: Option<String>,
    bind_addr: Option<SocketAddr>,
    group: Option<Arc<NodeGroup>>,
    network: Option<Arc<LocalNetwork>>,
    store: Option<Arc<dyn DocumentStore>>,
    services: Vec<Arc<dyn ServiceHandler>>,
    config: HostConfig,
}

impl std::fmt::Debug for HostRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRuntimeBuilder")
            .field("id", &self.id)
            .field("bind_addr", &self.bind_addr)
            .field("group", &self.group.as_ref().map(|g| g.name().to_string()))
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("services", &self.services.len())
            .field("config", &self.config)
            .finish()
    }
}

impl HostRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host id (required). Must be unique within the group.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the address the host is reachable at (required).
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Set the group the host joins on start (required).
    pub fn group(mut self, group: Arc<NodeGroup>) -> Self {
        self.group = Some(group);
        self
    }

    /// Set the network the host registers on (required).
    pub fn network(mut self, network: Arc<LocalNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    /// Set the document store.
    ///
    /// Default: a fresh [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a service factory.
    pub fn service(mut self, service: impl ServiceHandler + 'static) -> Self {
        self.services.push(Arc::new(service));
        self
    }

    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or two services share
    /// a factory link.
    pub fn build(self) -> Result<HostRuntimeConfig> {
        let id = self.id.ok_or_else(|| anyhow::anyhow!("id is required"))?;
        let bind_addr = self
            .bind_addr
            .ok_or_else(|| anyhow::anyhow!("bind_addr is required"))?;
        let group = self
            .group
            .ok_or_else(|| anyhow::anyhow!("group is required"))?;
        let network = self
            .network
            .ok_or_else(|| anyhow::anyhow!("network is required"))?;

        let mut links: Vec<&str> = self.services.iter().map(|s| s.factory_link()).collect();
        links.sort_unstable();
        if let Some(pair) = links.windows(2).find(|w| w[0] == w[1]) {
            anyhow::bail!("factory {} is registered twice", pair[0]);
        }

        Ok(HostRuntimeConfig {
            id,
            bind_addr,
            group,
            network,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryStore::new())),
            services: self.services,
            config: self.config,
        })
    }
}

/// Configuration for a [`HostRuntime`].
pub struct HostRuntimeConfig {
    id: String,
    bind_addr: SocketAddr,
    group: Arc<NodeGroup>,
    network: Arc<LocalNetwork>,
    store: Arc<dyn DocumentStore>,
    services: Vec<Arc<dyn ServiceHandler>>,
    config: HostConfig,
}

impl std::fmt::Debug for HostRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRuntimeConfig")
            .field("id", &self.id)
            .field("bind_addr", &self.bind_addr)
            .field("group", &self.group.name())
            .field("store", &"...")
            .field("services", &self.services.len())
            .finish()
    }
}

impl HostRuntimeConfig {
    /// Register the host on the network, join the group and spawn the
    /// maintenance loop.
    pub async fn start(self) -> Result<HostRuntime> {
        self.store
            .health_check()
            .await
            .map_err(|e| anyhow::anyhow!("document store unavailable: {}", e))?;

        let maintenance_config = MaintenanceConfig {
            poll_interval: self.config.maintenance_poll_interval,
        };
        let host = Arc::new(ServiceHost::new(
            self.id,
            self.bind_addr,
            self.group.clone(),
            self.network.clone(),
            self.store,
            self.services,
            self.config,
        ));

        self.network.register(&host);
        self.group.join(host.id(), host.addr());

        let maintenance = Arc::new(MaintenanceLoop::new(host.clone(), maintenance_config));
        let shutdown = maintenance.shutdown_handle();
        let maintenance_handle = tokio::spawn({
            let maintenance = maintenance.clone();
            async move { maintenance.run().await }
        });

        info!(host = %host.id(), addr = %host.addr(), group = %self.group.name(), "HostRuntime started");

        Ok(HostRuntime {
            host,
            group: self.group,
            network: self.network,
            maintenance,
            maintenance_handle,
            shutdown,
        })
    }
}

/// A running host.
///
/// Call [`shutdown`](Self::shutdown) to leave the group and stop the
/// maintenance loop.
pub struct HostRuntime {
    host: Arc<ServiceHost>,
    group: Arc<NodeGroup>,
    network: Arc<LocalNetwork>,
    maintenance: Arc<MaintenanceLoop>,
    maintenance_handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRuntime")
            .field("host", &self.host)
            .field("running", &self.is_running())
            .finish()
    }
}

impl HostRuntime {
    pub fn builder() -> HostRuntimeBuilder {
        HostRuntimeBuilder::new()
    }

    pub fn host(&self) -> &Arc<ServiceHost> {
        &self.host
    }

    pub fn id(&self) -> &str {
        self.host.id()
    }

    pub fn addr(&self) -> SocketAddr {
        self.host.addr()
    }

    /// Uri of `path` on this host.
    pub fn uri(&self, path: impl Into<String>) -> ServiceUri {
        self.host.uri(path)
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        self.host.store()
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceLoop> {
        &self.maintenance
    }

    pub fn is_running(&self) -> bool {
        !self.maintenance_handle.is_finished()
    }

    /// Leave the group, deregister from the network and stop maintenance.
    pub async fn shutdown(self) -> Result<()> {
        info!(host = %self.host.id(), "HostRuntime shutting down...");

        self.group.leave(self.host.id());
        self.network.deregister(self.host.addr());
        self.shutdown.notify_one();

        match self.maintenance_handle.await {
            Ok(()) => {
                info!(host = %self.host.id(), "HostRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!(host = %self.host.id(), "Maintenance task panicked: {}", e);
                Err(anyhow::anyhow!("maintenance task panicked: {}", e))
            }
        }
    }
}
