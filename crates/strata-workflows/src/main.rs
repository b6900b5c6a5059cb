// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strata Node - a local cloud-store cluster
//!
//! Starts `STRATA_NODE_COUNT` hosts in one process, joined into a single
//! node group over the in-process network, each serving the cloud-store and
//! task services.

use std::sync::Arc;

use strata_core::{DocumentStore, HostRuntime, LocalNetwork, MemoryStore, NodeGroup, SqliteStore};
use strata_workflows::Config;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata_core=info,strata_workflows=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        nodes = config.node_count,
        base_port = config.base_port,
        database_dir = ?config.database_dir,
        "Starting Strata Node"
    );

    let network = LocalNetwork::new();
    let group = Arc::new(NodeGroup::new("cloudstore"));

    let mut runtimes = Vec::with_capacity(config.node_count);
    for index in 0..config.node_count {
        let store: Arc<dyn DocumentStore> = match config.database_path(index) {
            Some(path) => Arc::new(SqliteStore::from_path(&path).await?),
            None => Arc::new(MemoryStore::new()),
        };

        let builder = HostRuntime::builder()
            .id(format!("node-{}", index))
            .bind_addr(config.node_addr(index))
            .group(group.clone())
            .network(network.clone())
            .store(store)
            .config(config.host.clone());

        let runtime = strata_workflows::register_services(builder, None)
            .build()?
            .start()
            .await?;
        runtimes.push(runtime);
    }

    info!(
        members = group.len(),
        "Cluster ready; swarm cluster creation is disabled without provisioning backends"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    for runtime in runtimes {
        runtime.shutdown().await?;
    }

    info!("Strata Node shut down");

    Ok(())
}
