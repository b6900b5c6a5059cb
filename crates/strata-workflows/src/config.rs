// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the strata-node binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use strata_core::HostConfig;

/// Node cluster configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of hosts started in this process.
    pub node_count: usize,
    /// Port of the first host; host `i` listens on `base_port + i`.
    pub base_port: u16,
    /// Directory holding one SQLite file per host. In-memory stores when unset.
    pub database_dir: Option<PathBuf>,
    pub host: HostConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `STRATA_NODE_COUNT`: hosts to start (default: 3)
    /// - `STRATA_BASE_PORT`: port of the first host (default: 19000)
    /// - `STRATA_DATABASE_DIR`: SQLite directory (default: in-memory)
    /// - plus everything read by [`HostConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_count: usize = std::env::var("STRATA_NODE_COUNT")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("STRATA_NODE_COUNT", "must be a positive integer"))?;
        if node_count == 0 {
            return Err(ConfigError::Invalid(
                "STRATA_NODE_COUNT",
                "must be a positive integer",
            ));
        }

        let base_port: u16 = std::env::var("STRATA_BASE_PORT")
            .unwrap_or_else(|_| "19000".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("STRATA_BASE_PORT", "must be a valid port"))?;
        if usize::from(base_port) + node_count > usize::from(u16::MAX) + 1 {
            return Err(ConfigError::Invalid(
                "STRATA_BASE_PORT",
                "leaves no room for every node",
            ));
        }

        let database_dir = std::env::var("STRATA_DATABASE_DIR").ok().map(PathBuf::from);

        Ok(Self {
            node_count,
            base_port,
            database_dir,
            host: HostConfig::from_env()?,
        })
    }

    /// Address of host `index`.
    pub fn node_addr(&self, index: usize) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.base_port.saturating_add(index as u16)))
    }

    /// SQLite file of host `index`, when a database directory is configured.
    pub fn database_path(&self, index: usize) -> Option<PathBuf> {
        self.database_dir
            .as_ref()
            .map(|dir| dir.join(format!("node-{}.db", index)))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),

    #[error(transparent)]
    Host(#[from] strata_core::config::ConfigError),
}
