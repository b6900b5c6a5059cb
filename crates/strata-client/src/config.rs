// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the document client.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::{ClientError, Result};

/// Per-action deadlines and polling cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub post_expiration: Duration,
    pub get_expiration: Duration,
    pub patch_expiration: Duration,
    pub delete_expiration: Duration,
    pub query_expiration: Duration,
    /// Upper bound on a single wait for a completion; a batch may wait this
    /// long per batch.
    pub latch_timeout: Duration,
    /// Pause between polls of a pending task.
    pub status_check_interval: Duration,
    /// Address of this machine. A replica on it is preferred over a random one.
    pub local_ip: Option<IpAddr>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            post_expiration: Duration::from_secs(60),
            get_expiration: Duration::from_secs(120),
            patch_expiration: Duration::from_secs(60),
            delete_expiration: Duration::from_secs(60),
            query_expiration: Duration::from_secs(60),
            latch_timeout: Duration::from_secs(90),
            status_check_interval: Duration::from_millis(100),
            local_ip: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STRATA_CLIENT_POST_EXPIRATION_SECS` (default: 60)
    /// - `STRATA_CLIENT_GET_EXPIRATION_SECS` (default: 120)
    /// - `STRATA_CLIENT_PATCH_EXPIRATION_SECS` (default: 60)
    /// - `STRATA_CLIENT_DELETE_EXPIRATION_SECS` (default: 60)
    /// - `STRATA_CLIENT_QUERY_EXPIRATION_SECS` (default: 60)
    /// - `STRATA_CLIENT_LATCH_TIMEOUT_SECS` (default: 90)
    /// - `STRATA_CLIENT_STATUS_CHECK_INTERVAL_MS` (default: 100)
    /// - `STRATA_CLIENT_LOCAL_IP` (optional)
    pub fn from_env() -> Result<Self> {
        let local_ip = match std::env::var("STRATA_CLIENT_LOCAL_IP") {
            Ok(ip) => Some(ip.parse().map_err(|e| {
                ClientError::InvalidArgument(format!("invalid STRATA_CLIENT_LOCAL_IP: {}", e))
            })?),
            Err(_) => None,
        };

        Ok(Self {
            post_expiration: secs("STRATA_CLIENT_POST_EXPIRATION_SECS", 60)?,
            get_expiration: secs("STRATA_CLIENT_GET_EXPIRATION_SECS", 120)?,
            patch_expiration: secs("STRATA_CLIENT_PATCH_EXPIRATION_SECS", 60)?,
            delete_expiration: secs("STRATA_CLIENT_DELETE_EXPIRATION_SECS", 60)?,
            query_expiration: secs("STRATA_CLIENT_QUERY_EXPIRATION_SECS", 60)?,
            latch_timeout: secs("STRATA_CLIENT_LATCH_TIMEOUT_SECS", 90)?,
            status_check_interval: Duration::from_millis(number(
                "STRATA_CLIENT_STATUS_CHECK_INTERVAL_MS",
                100,
            )?),
            local_ip,
        })
    }

    pub fn with_post_expiration(mut self, expiration: Duration) -> Self {
        self.post_expiration = expiration;
        self
    }

    pub fn with_get_expiration(mut self, expiration: Duration) -> Self {
        self.get_expiration = expiration;
        self
    }

    pub fn with_patch_expiration(mut self, expiration: Duration) -> Self {
        self.patch_expiration = expiration;
        self
    }

    pub fn with_delete_expiration(mut self, expiration: Duration) -> Self {
        self.delete_expiration = expiration;
        self
    }

    pub fn with_query_expiration(mut self, expiration: Duration) -> Self {
        self.query_expiration = expiration;
        self
    }

    pub fn with_latch_timeout(mut self, timeout: Duration) -> Self {
        self.latch_timeout = timeout;
        self
    }

    pub fn with_status_check_interval(mut self, interval: Duration) -> Self {
        self.status_check_interval = interval;
        self
    }

    pub fn with_local_ip(mut self, ip: IpAddr) -> Self {
        self.local_ip = Some(ip);
        self
    }
}

fn number(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| ClientError::InvalidArgument(format!("invalid {}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

fn secs(key: &str, default: u64) -> Result<Duration> {
    number(key, default).map(Duration::from_secs)
}
