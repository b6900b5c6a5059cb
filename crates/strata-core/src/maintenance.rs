// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for periodic document maintenance.
//!
//! Each pass drops expired query tasks and pages, then walks the documents
//! of every service that asks for maintenance. A document is maintained on
//! the first pass that sees it and again whenever its interval has elapsed,
//! and only by the host that currently owns its link.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_protocol::now_micros;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::host::ServiceHost;

/// Configuration for the maintenance loop.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often the loop wakes up.
    pub poll_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Summary of one maintenance pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub purged_queries: usize,
    pub maintained: usize,
    pub skipped_not_owner: usize,
}

pub struct MaintenanceLoop {
    host: Arc<ServiceHost>,
    config: MaintenanceConfig,
    last_run: Mutex<HashMap<String, Instant>>,
    shutdown: Arc<Notify>,
}

impl MaintenanceLoop {
    pub fn new(host: Arc<ServiceHost>, config: MaintenanceConfig) -> Self {
        Self {
            host,
            config,
            last_run: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run passes until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            host = %self.host.id(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Maintenance loop started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(host = %self.host.id(), "Maintenance loop received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(host = %self.host.id(), error = %e, "Maintenance pass failed");
                    }
                }
            }
        }

        info!(host = %self.host.id(), "Maintenance loop stopped");
    }

    /// Run a single pass.
    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport {
            purged_queries: self.host.queries().purge_expired(now_micros()).await,
            ..MaintenanceReport::default()
        };

        for service in self.host.services() {
            let Some(interval) = service.options().maintenance_interval else {
                continue;
            };

            let records = self.host.store().list(Some(service.kind())).await?;
            for record in records {
                if !self.is_due(&record.link, interval).await {
                    continue;
                }
                if !self.host.is_owner(&record.link) {
                    debug!(host = %self.host.id(), link = %record.link, "Skipping maintenance, not owner");
                    report.skipped_not_owner += 1;
                    continue;
                }

                let ctx = self.host.context(record.link.clone());
                if let Some(work) = service.handle_maintenance(ctx, record.body) {
                    work.await;
                }
                report.maintained += 1;
            }
        }

        if report.maintained > 0 || report.purged_queries > 0 {
            debug!(host = %self.host.id(), ?report, "Maintenance pass complete");
        }
        Ok(report)
    }

    async fn is_due(&self, link: &str, interval: Duration) -> bool {
        let mut last_run = self.last_run.lock().await;
        let now = Instant::now();
        let due = last_run
            .get(link)
            .is_none_or(|last| now.duration_since(*last) >= interval);
        if due {
            last_run.insert(link.to_string(), now);
        }
        due
    }
}
