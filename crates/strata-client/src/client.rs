// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document client implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use strata_protocol::operation::{
    STATUS_CODE_BAD_REQUEST, STATUS_CODE_NOT_FOUND, STATUS_CODE_TIMEOUT,
};
use strata_protocol::paths::QUERY_TASKS;
use strata_protocol::time::remaining_until;
use strata_protocol::{
    Action, Operation, Pragma, QueryOption, QueryResult, QuerySpecification, QueryTask, ServiceDocument,
    ServiceUri, TaskStage, Transport, now_micros,
};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::context::request_id_or_new;
use crate::error::{ClientError, Result};
use crate::server_set::{ServerSet, resolve};

/// Client for one replicated document cluster.
///
/// Every request resolves a fresh target from the server set, so replicas
/// added or removed between calls are honored immediately.
pub struct DocumentClient {
    server_set: Arc<dyn ServerSet>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    referer: String,
}

impl std::fmt::Debug for DocumentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentClient")
            .field("servers", &self.server_set.servers())
            .field("config", &self.config)
            .finish()
    }
}

impl DocumentClient {
    pub fn new(
        server_set: Arc<dyn ServerSet>,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Self {
        let referer = match config.local_ip {
            Some(ip) => format!("strata-client://{}", ip),
            None => "strata-client://local".to_string(),
        };
        Self {
            server_set,
            transport,
            config,
            referer,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Uri of `path` on the replica chosen for this request.
    pub fn service_uri(&self, path: &str) -> Result<ServiceUri> {
        let servers = self.server_set.servers();
        let host = resolve(&servers, self.config.local_ip).ok_or(ClientError::NoServers)?;
        Ok(ServiceUri::new(host, path))
    }

    fn prepare(&self, action: Action, path: &str, expiration: Duration) -> Result<Operation> {
        Ok(Operation::new(action, self.service_uri(path)?)
            .with_expiration_after(expiration)
            .with_referer(self.referer.clone())
            .with_context_id(request_id_or_new()))
    }

    /// Send one operation and wait for its completion.
    ///
    /// An operation whose deadline has already passed fails with
    /// [`ClientError::Timeout`] without being sent.
    #[instrument(skip(self, op), fields(action = %op.action, uri = %op.uri, op_id = op.id))]
    pub async fn send(&self, op: Operation) -> Result<Operation> {
        let Some(remaining) = remaining_until(op.expiration_micros) else {
            warn!("send: TIMEOUT deadline passed before send");
            return Err(ClientError::Timeout(format!(
                "{} expired before it was sent",
                op
            )));
        };

        debug!(body = ?op.body, "send: STARTED");
        let started = Instant::now();
        let (tx, rx) = oneshot::channel();
        self.transport.send(op.clone(), tx);

        let wait = remaining.min(self.config.latch_timeout);
        let completed = match tokio::time::timeout(wait, rx).await {
            Ok(Ok(completed)) => completed,
            Ok(Err(_)) => {
                warn!("send: INTERRUPTED completion dropped");
                return Err(ClientError::Interrupted(format!(
                    "completion of {} was dropped",
                    op
                )));
            }
            Err(_) => {
                warn!(waited_ms = wait.as_millis() as u64, "send: TIMEOUT");
                return Err(ClientError::Timeout(format!(
                    "no completion for {} within {}ms",
                    op,
                    wait.as_millis()
                )));
            }
        };

        classify(completed, started.elapsed())
    }

    /// Send `ops` in sequential batches of `batch_size`, each batch
    /// concurrently. Results are keyed by the caller's source key.
    #[instrument(skip(self, ops), fields(count = ops.len()))]
    pub async fn send_batch(
        &self,
        ops: Vec<(String, Operation)>,
        batch_size: usize,
    ) -> Result<HashMap<String, Operation>> {
        if ops.is_empty() {
            return Err(ClientError::InvalidArgument(
                "operation batch cannot be empty".to_string(),
            ));
        }
        if batch_size == 0 {
            return Err(ClientError::InvalidArgument(
                "batch size must be greater than zero".to_string(),
            ));
        }

        let batch_count = batch_count(ops.len(), batch_size);
        let deadline = Instant::now() + self.config.latch_timeout * batch_count as u32;
        let mut results = HashMap::with_capacity(ops.len());

        let mut pending = ops.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<(String, Operation)> = pending.by_ref().take(batch_size).collect();
            let sends = batch
                .into_iter()
                .map(|(key, op)| async move { (key, self.send(op).await) });

            let remaining = deadline.saturating_duration_since(Instant::now());
            let completed = tokio::time::timeout(remaining, join_all(sends))
                .await
                .map_err(|_| {
                    ClientError::Timeout(format!("batch of {} batches timed out", batch_count))
                })?;

            for (key, result) in completed {
                results.insert(key, result?);
            }
        }

        info!(count = results.len(), batches = batch_count, "send: SUCCESS batch");
        Ok(results)
    }

    pub async fn get(&self, link: &str) -> Result<Operation> {
        let op = self
            .prepare(Action::Get, link, self.config.get_expiration)?
            .with_pragma(Pragma::NoQueuing);
        self.send(op).await
    }

    /// Read and decode one document.
    pub async fn get_document<T: ServiceDocument>(&self, link: &str) -> Result<T> {
        Ok(self.get(link).await?.body_as()?)
    }

    /// Batched GET of many links. Each operation's deadline is scaled by the
    /// number of batches.
    pub async fn get_many(
        &self,
        links: &[String],
        batch_size: usize,
    ) -> Result<HashMap<String, Operation>> {
        if links.is_empty() {
            return Err(ClientError::InvalidArgument(
                "links cannot be empty".to_string(),
            ));
        }
        if batch_size == 0 {
            return Err(ClientError::InvalidArgument(
                "batch size must be greater than zero".to_string(),
            ));
        }

        let expiration = self.config.get_expiration * batch_count(links.len(), batch_size) as u32;
        let mut ops = Vec::with_capacity(links.len());
        for link in links {
            let op = self
                .prepare(Action::Get, link, expiration)?
                .with_pragma(Pragma::NoQueuing);
            ops.push((link.clone(), op));
        }
        self.send_batch(ops, batch_size).await
    }

    pub async fn post<T: Serialize + ?Sized>(&self, factory_link: &str, body: &T) -> Result<Operation> {
        let op = self
            .prepare(Action::Post, factory_link, self.config.post_expiration)?
            .with_body(body)?;
        self.send(op).await
    }

    pub async fn patch<T: Serialize + ?Sized>(&self, link: &str, body: &T) -> Result<Operation> {
        let op = self
            .prepare(Action::Patch, link, self.config.patch_expiration)?
            .with_pragma(Pragma::NoQueuing)
            .with_body(body)?;
        self.send(op).await
    }

    pub async fn delete(&self, link: &str) -> Result<Operation> {
        let op = self
            .prepare(Action::Delete, link, self.config.delete_expiration)?
            .with_pragma(Pragma::NoQueuing);
        self.send(op).await
    }

    /// Post a query task. An indirect query is polled until it is terminal.
    pub async fn query(&self, spec: QuerySpecification, direct: bool) -> Result<Operation> {
        self.query_task(QueryTask::create(spec).set_direct(direct))
            .await
    }

    pub async fn query_task(&self, task: QueryTask) -> Result<Operation> {
        let op = self
            .prepare(Action::Post, QUERY_TASKS, self.config.query_expiration)?
            .with_body(&task)?;
        let deadline = op.expiration_micros;
        let completed = self.send(op).await?;
        if task.is_direct {
            return Ok(completed);
        }

        let accepted: QueryTask = completed.body_as()?;
        if accepted.task_info.is_terminal() {
            return Ok(completed);
        }
        let link = accepted
            .meta
            .document_self_link
            .ok_or_else(|| ClientError::Serialization("query task has no self link".to_string()))?;
        self.wait_for_task_to_finish(&link, deadline).await
    }

    /// Poll a task document until its stage is terminal or `deadline_micros`
    /// passes. Works for query tasks (`taskInfo`) and workflow documents
    /// (`taskState`).
    pub async fn wait_for_task_to_finish(&self, link: &str, deadline_micros: u64) -> Result<Operation> {
        loop {
            let op = self
                .prepare(Action::Get, link, self.config.get_expiration)?
                .with_expiration_micros(deadline_micros);
            let completed = self.send(op).await?;

            let stage = completed.body.as_ref().and_then(task_stage);
            if stage.is_some_and(|s| s.is_terminal()) {
                return Ok(completed);
            }
            if now_micros() > deadline_micros {
                return Err(ClientError::Timeout(format!(
                    "{} did not finish before its deadline",
                    link
                )));
            }
            tokio::time::sleep(self.config.status_check_interval).await;
        }
    }

    /// Direct broadcast query; returns the merged result of every replica.
    pub async fn post_to_broadcast_query_service(&self, spec: QuerySpecification) -> Result<QueryResult> {
        let spec = spec.with_option(QueryOption::Broadcast);
        let completed = self.query(spec, true).await?;
        let task: QueryTask = completed.body_as()?;
        Ok(task.results.unwrap_or_default())
    }

    /// All documents of type `T` matching `terms`, read from every replica.
    pub async fn query_documents<T: ServiceDocument>(&self, terms: &[(&str, &str)]) -> Result<Vec<T>> {
        let spec = build_spec::<T>(terms).with_option(QueryOption::ExpandContent);
        let result = self.post_to_broadcast_query_service(spec).await?;
        result
            .documents
            .unwrap_or_default()
            .into_values()
            .map(|d| serde_json::from_value(d).map_err(ClientError::from))
            .collect()
    }

    /// Links of every document of type `T` matching `terms`.
    pub async fn query_documents_for_links<T: ServiceDocument>(
        &self,
        terms: &[(&str, &str)],
    ) -> Result<Vec<String>> {
        let result = self
            .post_to_broadcast_query_service(build_spec::<T>(terms))
            .await?;
        Ok(result.document_links)
    }

    /// Broadcast query with optional paging. With a page size the first real
    /// page is returned; follow its `next_page_link` with
    /// [`query_document_page`](Self::query_document_page).
    pub async fn query_documents_paged<T: ServiceDocument>(
        &self,
        terms: &[(&str, &str)],
        page_size: Option<usize>,
        expand_content: bool,
    ) -> Result<QueryResult> {
        if page_size.is_some_and(|size| size < 1) {
            return Err(ClientError::InvalidArgument(
                "page size must be at least 1".to_string(),
            ));
        }

        let mut spec = build_spec::<T>(terms).with_option(QueryOption::Broadcast);
        if expand_content {
            spec = spec.with_option(QueryOption::ExpandContent);
        }
        if let Some(size) = page_size {
            spec = spec.with_result_limit(size);
        }

        let completed = self.query(spec, false).await?;
        let task: QueryTask = completed.body_as()?;
        let result = task.results.unwrap_or_default();

        match (&page_size, &result.next_page_link) {
            (Some(_), Some(first_page)) => self.query_document_page(first_page).await,
            _ => Ok(result),
        }
    }

    pub async fn query_document_page(&self, page_link: &str) -> Result<QueryResult> {
        if page_link.is_empty() {
            return Err(ClientError::InvalidArgument(
                "page link cannot be empty".to_string(),
            ));
        }
        let task: QueryTask = self.get(page_link).await?.body_as()?;
        Ok(task.results.unwrap_or_default())
    }
}

fn batch_count(len: usize, batch_size: usize) -> usize {
    len.div_ceil(batch_size).max(1)
}

fn build_spec<T: ServiceDocument>(terms: &[(&str, &str)]) -> QuerySpecification {
    terms
        .iter()
        .fold(QuerySpecification::for_document::<T>(), |spec, (name, value)| {
            spec.term(*name, *value)
        })
}

fn task_stage(body: &Value) -> Option<TaskStage> {
    let info = body.get("taskInfo").or_else(|| body.get("taskState"))?;
    serde_json::from_value(info.get("stage")?.clone()).ok()
}

/// Map a completed operation onto the client error taxonomy.
fn classify(completed: Operation, elapsed: Duration) -> Result<Operation> {
    let elapsed_ms = elapsed.as_millis() as u64;
    let uri = completed.uri.to_string();
    let message = || {
        completed
            .error_response()
            .map(|e| e.message)
            .unwrap_or_else(|| format!("status {}", completed.status_code))
    };

    match completed.status_code {
        _ if completed.is_success() => {
            match completed.action {
                Action::Get | Action::Post => {
                    info!(elapsed_ms, status = completed.status_code, body = ?completed.body, "send: SUCCESS")
                }
                Action::Patch | Action::Delete => {
                    info!(elapsed_ms, status = completed.status_code, "send: SUCCESS")
                }
            }
            Ok(completed)
        }
        STATUS_CODE_NOT_FOUND => {
            info!(elapsed_ms, status = completed.status_code, "send: COMPLETED");
            Err(ClientError::NotFound { uri })
        }
        STATUS_CODE_TIMEOUT => {
            let message = message();
            warn!(elapsed_ms, %message, "send: TIMEOUT");
            Err(ClientError::Timeout(message))
        }
        STATUS_CODE_BAD_REQUEST => {
            let message = message();
            warn!(elapsed_ms, %message, "send: WARN bad request");
            Err(ClientError::BadRequest { uri, message })
        }
        status_code => {
            let message = message();
            warn!(elapsed_ms, status_code, %message, "send: WARN");
            Err(ClientError::RuntimeFailure {
                uri,
                status_code,
                message,
                body: completed.body,
            })
        }
    }
}
