// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host configuration loading from environment variables.

use std::time::Duration;

/// Per-host tuning.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// How often the maintenance loop wakes up.
    pub maintenance_poll_interval: Duration,
    /// Lifetime of query tasks and their result pages when the query op
    /// carries no deadline.
    pub query_expiration: Duration,
    /// Deadline for host-originated operations (forwarding, replication,
    /// self-patches) that carry none.
    pub operation_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            maintenance_poll_interval: Duration::from_secs(1),
            query_expiration: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(60),
        }
    }
}

impl HostConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `STRATA_MAINTENANCE_POLL_MS`: maintenance loop interval (default: 1000)
    /// - `STRATA_QUERY_EXPIRATION_SECS`: query task lifetime (default: 60)
    /// - `STRATA_OPERATION_TIMEOUT_SECS`: host operation deadline (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let maintenance_poll_ms: u64 = parse_var("STRATA_MAINTENANCE_POLL_MS", "1000")?;
        let query_expiration_secs: u64 = parse_var("STRATA_QUERY_EXPIRATION_SECS", "60")?;
        let operation_timeout_secs: u64 = parse_var("STRATA_OPERATION_TIMEOUT_SECS", "60")?;

        if maintenance_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "STRATA_MAINTENANCE_POLL_MS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            maintenance_poll_interval: Duration::from_millis(maintenance_poll_ms),
            query_expiration: Duration::from_secs(query_expiration_secs),
            operation_timeout: Duration::from_secs(operation_timeout_secs),
        })
    }
}

fn parse_var(key: &'static str, default: &str) -> Result<u64, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, "must be a non-negative integer"))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
