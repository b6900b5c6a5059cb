// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service host: routes operations to factories, documents and queries.
//!
//! # Request flow
//!
//! ```text
//! op ──► expired? ──► route by path
//!          │
//!          ├─ /core/query-tasks          run query (broadcast when flagged), direct or pollable
//!          ├─ /core/local-query-tasks    answer from the local store only
//!          ├─ /core/query-tasks/{n}/..   query task status (relayed to node n)
//!          ├─ /core/query-page/{n}/..    one result page (relayed to node n)
//!          ├─ <factory>                  POST: create, relayed to the owner of the new link
//!          └─ <factory>/<id>             GET/PATCH/DELETE, relayed to the owner of the link
//! ```
//!
//! The owner serializes writes per link, commits with a bumped version,
//! replicates the committed body to every other member, and only then
//! completes the operation. Workflow continuations run after completion.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use strata_protocol::document::{
    FIELD_NAME_KIND, FIELD_NAME_SELF_LINK, FIELD_NAME_UPDATE_TIME_MICROS, FIELD_NAME_VERSION,
};
use strata_protocol::operation::{
    STATUS_CODE_BAD_REQUEST, STATUS_CODE_CONFLICT, STATUS_CODE_NOT_FOUND, STATUS_CODE_TIMEOUT,
    STATUS_CODE_UNAVAILABLE,
};
use strata_protocol::paths::{self, LOCAL_QUERY_TASKS, QUERY_PAGE, QUERY_TASKS};
use strata_protocol::time::{micros_after, remaining_until};
use strata_protocol::{
    Action, Operation, Pragma, QueryOption, QueryResult, QuerySpecification, QueryTask,
    ServiceDocument, ServiceErrorResponse, ServiceUri, TaskStage, TaskState, Transport, now_micros,
};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::HostConfig;
use crate::error::{CoreError, Result};
use crate::node_group::{Member, NodeGroup};
use crate::persistence::{DocumentRecord, DocumentStore};
use crate::query::{self, QueryRegistry};
use crate::service::{Continuation, ServiceHandler};

/// A served operation and the work to run once its completion is delivered.
pub struct Handled {
    pub op: Operation,
    pub continuation: Option<Continuation>,
}

enum Outcome {
    Reply {
        body: Option<Value>,
        continuation: Option<Continuation>,
    },
    Relayed(Operation),
}

impl Outcome {
    fn body(body: Value) -> Self {
        Outcome::Reply {
            body: Some(body),
            continuation: None,
        }
    }
}

enum Route {
    QueryTasks,
    LocalQueryTasks,
    QueryTask,
    QueryPage,
    Factory(Arc<dyn ServiceHandler>),
    Document(Arc<dyn ServiceHandler>),
    Unknown,
}

/// One member of a replica group.
pub struct ServiceHost {
    id: String,
    addr: SocketAddr,
    group: Arc<NodeGroup>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DocumentStore>,
    services: Vec<Arc<dyn ServiceHandler>>,
    document_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    queries: QueryRegistry,
    config: HostConfig,
}

impl std::fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHost")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("group", &self.group.name())
            .field(
                "services",
                &self.services.iter().map(|s| s.factory_link()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ServiceHost {
    pub fn new(
        id: impl Into<String>,
        addr: SocketAddr,
        group: Arc<NodeGroup>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn DocumentStore>,
        mut services: Vec<Arc<dyn ServiceHandler>>,
        config: HostConfig,
    ) -> Self {
        // Longest factory first so nested factories win prefix matching.
        services.sort_by_key(|s| std::cmp::Reverse(s.factory_link().len()));
        Self {
            id: id.into(),
            addr,
            group,
            transport,
            store,
            services,
            document_locks: Mutex::new(HashMap::new()),
            queries: QueryRegistry::new(),
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn group(&self) -> &Arc<NodeGroup> {
        &self.group
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn services(&self) -> &[Arc<dyn ServiceHandler>] {
        &self.services
    }

    pub fn queries(&self) -> &QueryRegistry {
        &self.queries
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Uri of `path` on this host.
    pub fn uri(&self, path: impl Into<String>) -> ServiceUri {
        ServiceUri::new(self.addr, path)
    }

    /// Whether this host currently owns `link`.
    pub fn is_owner(&self, link: &str) -> bool {
        self.group
            .select_owner(link)
            .is_some_and(|owner| owner.id == self.id)
    }

    /// Context handed to service hooks for `link`.
    pub fn context(self: &Arc<Self>, link: impl Into<String>) -> ServiceContext {
        ServiceContext {
            host: self.clone(),
            self_link: link.into(),
        }
    }

    fn peers(&self) -> Vec<Member> {
        self.group
            .members()
            .into_iter()
            .filter(|m| m.id != self.id)
            .collect()
    }

    /// Send an operation through the transport and wait for its completion
    /// until its deadline. Transport failures come back as failed operations.
    pub async fn send_and_wait(&self, mut op: Operation) -> Operation {
        if op.expiration_micros == 0 {
            op.expiration_micros = micros_after(self.config.operation_timeout);
        }
        if op.referer.is_none() {
            op.referer = Some(self.uri("").to_string());
        }
        let Some(wait) = remaining_until(op.expiration_micros) else {
            op.fail(ServiceErrorResponse::new(STATUS_CODE_TIMEOUT, "deadline already passed"));
            return op;
        };

        let (tx, rx) = oneshot::channel();
        self.transport.send(op.clone(), tx);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(completed)) => completed,
            Ok(Err(_)) => {
                op.fail(ServiceErrorResponse::new(
                    STATUS_CODE_UNAVAILABLE,
                    "request abandoned by transport",
                ));
                op
            }
            Err(_) => {
                op.fail(ServiceErrorResponse::new(STATUS_CODE_TIMEOUT, "request timed out"));
                op
            }
        }
    }

    /// Serve one operation.
    pub async fn handle(self: &Arc<Self>, mut op: Operation) -> Handled {
        if op.expiration_micros != 0 && op.expiration_micros <= now_micros() {
            op.fail(ServiceErrorResponse::new(STATUS_CODE_TIMEOUT, "operation expired"));
            return Handled {
                op,
                continuation: None,
            };
        }

        let outcome = match self.route(&op.uri.path) {
            Route::QueryTasks if op.action == Action::Post => self.post_query(&op).await,
            Route::LocalQueryTasks if op.action == Action::Post => self.post_local_query(&op).await,
            Route::QueryTask if op.action == Action::Get => self.get_query_task(&op).await,
            Route::QueryPage if op.action == Action::Get => self.get_query_page(&op).await,
            Route::Factory(service) if op.action == Action::Post => {
                self.post_to_factory(service, &op).await
            }
            Route::Document(service) => self.handle_document(service, &op).await,
            Route::Unknown => Err(CoreError::not_found(op.uri.path.clone())),
            _ => Err(CoreError::BadRequest(format!(
                "{} not supported on {}",
                op.action, op.uri.path
            ))),
        };

        match outcome {
            Ok(Outcome::Reply { body, continuation }) => {
                op.complete(body);
                Handled { op, continuation }
            }
            Ok(Outcome::Relayed(completed)) => {
                op.status_code = completed.status_code;
                op.body = completed.body;
                Handled {
                    op,
                    continuation: None,
                }
            }
            Err(e) => {
                debug!(host = %self.id, op = %op, error = %e, "Operation failed");
                op.fail(e.to_error_response());
                Handled {
                    op,
                    continuation: None,
                }
            }
        }
    }

    fn route(&self, path: &str) -> Route {
        if path == QUERY_TASKS {
            return Route::QueryTasks;
        }
        if path == LOCAL_QUERY_TASKS {
            return Route::LocalQueryTasks;
        }
        if is_child_of(path, QUERY_TASKS) {
            return Route::QueryTask;
        }
        if is_child_of(path, QUERY_PAGE) {
            return Route::QueryPage;
        }
        for service in &self.services {
            if path == service.factory_link() {
                return Route::Factory(service.clone());
            }
            if is_child_of(path, service.factory_link()) {
                return Route::Document(service.clone());
            }
        }
        Route::Unknown
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    async fn handle_document(
        self: &Arc<Self>,
        service: Arc<dyn ServiceHandler>,
        op: &Operation,
    ) -> Result<Outcome> {
        if op.has_pragma(Pragma::Replicated) {
            return self.apply_replica(op).await;
        }
        let link = op.uri.path.as_str();
        if let Some(relayed) = self.relay_to_owner(op, link, None).await? {
            return Ok(relayed);
        }
        match op.action {
            Action::Get => self.get_document(link, op.has_pragma(Pragma::NoQueuing)).await,
            Action::Patch => self.patch_document(service, link, op).await,
            Action::Delete => self.delete_document(link).await,
            Action::Post => self.create_document(service, link, op.body.clone()).await,
        }
    }

    async fn post_to_factory(
        self: &Arc<Self>,
        service: Arc<dyn ServiceHandler>,
        op: &Operation,
    ) -> Result<Outcome> {
        let mut body = op
            .body
            .clone()
            .filter(Value::is_object)
            .ok_or_else(|| CoreError::BadRequest("POST body must be a JSON object".to_string()))?;

        let link = new_document_link(service.factory_link(), &body);
        body[FIELD_NAME_SELF_LINK] = Value::String(link.clone());

        if let Some(relayed) = self.relay_to_owner(op, &link, Some(body.clone())).await? {
            return Ok(relayed);
        }
        self.create_document(service, &link, Some(body)).await
    }

    /// Forward `op` to the owner of `link` unless this host owns it or the
    /// op was already forwarded once.
    async fn relay_to_owner(
        &self,
        op: &Operation,
        link: &str,
        body: Option<Value>,
    ) -> Result<Option<Outcome>> {
        if op.has_pragma(Pragma::Forwarded) {
            return Ok(None);
        }
        let owner = self
            .group
            .select_owner(link)
            .ok_or_else(|| CoreError::Unavailable("node group has no members".to_string()))?;
        if owner.id == self.id {
            return Ok(None);
        }

        debug!(host = %self.id, owner = %owner.id, link, action = %op.action, "Forwarding to owner");
        let mut forwarded = op.clone().with_pragma(Pragma::Forwarded);
        forwarded.uri = ServiceUri::new(owner.addr, op.uri.path.clone());
        if body.is_some() {
            forwarded.body = body;
        }
        Ok(Some(Outcome::Relayed(self.send_and_wait(forwarded).await)))
    }

    /// Run `work` holding the write lock of `link`. The lock entry is
    /// removed once no other operation holds or waits for it.
    async fn locked<T>(&self, link: &str, work: impl Future<Output = T>) -> T {
        let lock = self
            .document_locks
            .lock()
            .await
            .entry(link.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            work.await
        };

        let mut locks = self.document_locks.lock().await;
        // The map and `lock` are the only references left.
        if Arc::strong_count(&lock) == 2 && locks.get(link).is_some_and(|l| Arc::ptr_eq(l, &lock)) {
            locks.remove(link);
        }
        result
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.document_locks.lock().await.len()
    }

    /// Local copy of `link`, or the newest copy held by any peer.
    async fn load_document(&self, link: &str) -> Result<Option<DocumentRecord>> {
        if let Some(record) = self.store.get(link).await? {
            return Ok(Some(record));
        }

        let peers = self.peers();
        if peers.is_empty() {
            return Ok(None);
        }
        let reads = peers.iter().map(|peer| {
            let op = Operation::get(ServiceUri::new(peer.addr, link))
                .with_pragma(Pragma::Replicated)
                .with_expiration_after(self.config.operation_timeout);
            self.send_and_wait(op)
        });
        let newest = join_all(reads)
            .await
            .into_iter()
            .filter(|done| done.is_success())
            .filter_map(|done| done.body.and_then(|b| record_from_body(&b).ok()))
            .max_by_key(|r| r.version);

        if let Some(record) = &newest {
            info!(host = %self.id, link, version = record.version, "Synchronized document from peers");
            self.store.put(record.clone()).await?;
        }
        Ok(newest)
    }

    /// Stamp metadata, persist locally and replicate to every peer.
    async fn commit(
        &self,
        kind: &str,
        link: &str,
        mut body: Value,
        previous_version: u64,
    ) -> Result<DocumentRecord> {
        let version = previous_version + 1;
        let update_time_micros = now_micros();
        if let Some(object) = body.as_object_mut() {
            object.insert(FIELD_NAME_SELF_LINK.to_string(), Value::from(link));
            object.insert(FIELD_NAME_KIND.to_string(), Value::from(kind));
            object.insert(FIELD_NAME_VERSION.to_string(), Value::from(version));
            object.insert(
                FIELD_NAME_UPDATE_TIME_MICROS.to_string(),
                Value::from(update_time_micros),
            );
        }

        let record = DocumentRecord {
            link: link.to_string(),
            kind: kind.to_string(),
            version,
            update_time_micros,
            body,
        };
        self.store.put(record.clone()).await?;
        self.replicate(Action::Post, link, Some(record.body.clone()))
            .await;
        Ok(record)
    }

    async fn replicate(&self, action: Action, link: &str, body: Option<Value>) {
        let peers = self.peers();
        let sends = peers.iter().map(|peer| {
            let mut op = Operation::new(action, ServiceUri::new(peer.addr, link))
                .with_pragma(Pragma::Replicated)
                .with_expiration_after(self.config.operation_timeout);
            op.body = body.clone();
            self.send_and_wait(op)
        });
        for (peer, done) in peers.iter().zip(join_all(sends).await) {
            if !done.is_success() {
                warn!(
                    host = %self.id,
                    peer = %peer.id,
                    link,
                    status = done.status_code,
                    "Replication to peer failed"
                );
            }
        }
    }

    async fn apply_replica(&self, op: &Operation) -> Result<Outcome> {
        let link = op.uri.path.as_str();
        match op.action {
            Action::Get => self
                .store
                .get(link)
                .await?
                .map(|r| Outcome::body(r.body))
                .ok_or_else(|| CoreError::not_found(link)),
            Action::Post => {
                let body = op
                    .body
                    .as_ref()
                    .ok_or_else(|| CoreError::BadRequest("replica without body".to_string()))?;
                let incoming = record_from_body(body)?;
                self.locked(link, async {
                    let stale = self
                        .store
                        .get(link)
                        .await?
                        .is_some_and(|local| local.version >= incoming.version);
                    if !stale {
                        self.store.put(incoming).await?;
                    }
                    Ok::<_, CoreError>(())
                })
                .await?;
                Ok(Outcome::Reply {
                    body: None,
                    continuation: None,
                })
            }
            Action::Delete => {
                self.store.delete(link).await?;
                Ok(Outcome::Reply {
                    body: None,
                    continuation: None,
                })
            }
            Action::Patch => Err(CoreError::BadRequest(
                "replicas accept full state only".to_string(),
            )),
        }
    }

    async fn create_document(
        self: &Arc<Self>,
        service: Arc<dyn ServiceHandler>,
        link: &str,
        body: Option<Value>,
    ) -> Result<Outcome> {
        let mut body = body
            .filter(Value::is_object)
            .ok_or_else(|| CoreError::BadRequest("POST body must be a JSON object".to_string()))?;
        body[FIELD_NAME_SELF_LINK] = Value::from(link);
        self.locked(link, self.create_locked(service, link, body)).await
    }

    async fn create_locked(
        self: &Arc<Self>,
        service: Arc<dyn ServiceHandler>,
        link: &str,
        body: Value,
    ) -> Result<Outcome> {
        let previous_version = match self.load_document(link).await? {
            Some(existing) if service.options().idempotent_post => existing.version,
            Some(_) => {
                return Err(CoreError::Conflict {
                    link: link.to_string(),
                });
            }
            None => 0,
        };

        let state = service.handle_start(body).inspect_err(|e| {
            warn!(host = %self.id, link, error = %e, "Start rejected");
        })?;
        let record = self
            .commit(service.kind(), link, state, previous_version)
            .await?;
        info!(host = %self.id, link, kind = service.kind(), version = record.version, "Document created");

        let continuation = service.on_started(self.context(link), record.body.clone());
        Ok(Outcome::Reply {
            body: Some(record.body),
            continuation,
        })
    }

    async fn patch_document(
        self: &Arc<Self>,
        service: Arc<dyn ServiceHandler>,
        link: &str,
        op: &Operation,
    ) -> Result<Outcome> {
        let patch = op
            .body
            .clone()
            .filter(Value::is_object)
            .ok_or_else(|| CoreError::BadRequest("PATCH body must be a JSON object".to_string()))?;
        self.locked(link, self.patch_locked(service, link, patch)).await
    }

    async fn patch_locked(
        self: &Arc<Self>,
        service: Arc<dyn ServiceHandler>,
        link: &str,
        patch: Value,
    ) -> Result<Outcome> {
        let current = self
            .load_document(link)
            .await?
            .ok_or_else(|| CoreError::not_found(link))?;
        let next = service
            .handle_patch(&current.body, &patch)
            .inspect_err(|e| {
                warn!(host = %self.id, link, error = %e, "Patch rejected");
            })?;
        let record = self
            .commit(service.kind(), link, next, current.version)
            .await?;
        debug!(host = %self.id, link, version = record.version, "Document patched");

        let continuation = service.on_patched(self.context(link), record.body.clone(), patch);
        Ok(Outcome::Reply {
            body: Some(record.body),
            continuation,
        })
    }

    async fn get_document(&self, link: &str, no_queuing: bool) -> Result<Outcome> {
        let record = if no_queuing {
            self.load_document(link).await?
        } else {
            // Queue behind any in-flight write to the link.
            self.locked(link, self.load_document(link)).await?
        };
        record
            .map(|r| Outcome::body(r.body))
            .ok_or_else(|| CoreError::not_found(link))
    }

    async fn delete_document(&self, link: &str) -> Result<Outcome> {
        self.locked(link, async {
            let existed = self.store.delete(link).await?;
            self.replicate(Action::Delete, link, None).await;
            if existed {
                info!(host = %self.id, link, "Document deleted");
            }
            Ok::<_, CoreError>(())
        })
        .await?;
        Ok(Outcome::Reply {
            body: None,
            continuation: None,
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn new_query_link(&self, prefix: &str) -> String {
        format!("{}/{}/{}", prefix, self.id, Uuid::new_v4())
    }

    fn query_expiration(&self, op: &Operation) -> u64 {
        if op.expiration_micros != 0 {
            op.expiration_micros
        } else {
            micros_after(self.config.query_expiration)
        }
    }

    async fn post_local_query(&self, op: &Operation) -> Result<Outcome> {
        let mut task: QueryTask = op
            .body_as()
            .map_err(|e| CoreError::BadRequest(format!("invalid query task: {}", e)))?;
        let results = query::execute_local(self.store.as_ref(), &task.query_spec).await?;
        task.results = Some(results);
        task.task_info = TaskState::new(TaskStage::Finished);
        task.document_expiration_time_micros = self.query_expiration(op);
        Ok(Outcome::body(serde_json::to_value(&task)?))
    }

    #[instrument(skip(self, op), fields(host = %self.id))]
    async fn post_query(self: &Arc<Self>, op: &Operation) -> Result<Outcome> {
        let mut task: QueryTask = op
            .body_as()
            .map_err(|e| CoreError::BadRequest(format!("invalid query task: {}", e)))?;
        let expiration = self.query_expiration(op);
        let link = self.new_query_link(QUERY_TASKS);
        task.meta.document_self_link = Some(link.clone());
        task.meta.document_kind = Some(QueryTask::KIND.to_string());
        task.document_expiration_time_micros = expiration;

        if task.is_direct {
            task.results = Some(self.run_query(&task.query_spec, expiration).await?);
            task.task_info = TaskState::new(TaskStage::Finished);
            return Ok(Outcome::body(serde_json::to_value(&task)?));
        }

        task.task_info = TaskState::new(TaskStage::Started);
        self.queries.put_task(link.clone(), task.clone()).await;

        let host = self.clone();
        let mut pending = task.clone();
        let continuation: Continuation = Box::pin(async move {
            match host.run_query(&pending.query_spec, expiration).await {
                Ok(results) => {
                    pending.results = Some(results);
                    pending.task_info = TaskState::new(TaskStage::Finished);
                }
                Err(e) => {
                    warn!(link = %link, error = %e, "Query task failed");
                    pending.task_info = TaskState::failed(e.to_string());
                }
            }
            host.queries.put_task(link, pending).await;
        });

        Ok(Outcome::Reply {
            body: Some(serde_json::to_value(&task)?),
            continuation: Some(continuation),
        })
    }

    /// Evaluate a query, fanning out when it is flagged as broadcast. With a
    /// result limit, the result only carries the link of the first page.
    pub async fn run_query(
        &self,
        spec: &QuerySpecification,
        expiration_micros: u64,
    ) -> Result<QueryResult> {
        let merged = if spec.has_option(QueryOption::Broadcast) {
            self.broadcast_query(spec, expiration_micros).await?
        } else {
            query::execute_local(self.store.as_ref(), spec).await?
        };

        match spec.result_limit {
            Some(limit) => {
                let first = self
                    .queries
                    .open_pages(self.new_query_link(QUERY_PAGE), merged, limit, expiration_micros)
                    .await;
                Ok(QueryResult {
                    document_links: Vec::new(),
                    documents: None,
                    next_page_link: Some(first),
                })
            }
            None => Ok(merged),
        }
    }

    async fn broadcast_query(
        &self,
        spec: &QuerySpecification,
        expiration_micros: u64,
    ) -> Result<QueryResult> {
        let mut local_spec = spec.clone();
        local_spec.options.remove(&QueryOption::Broadcast);
        local_spec.result_limit = None;
        let task = QueryTask::create(local_spec).set_direct(true);

        let members = self.group.members();
        let mut sends = Vec::with_capacity(members.len());
        for member in &members {
            let op = Operation::post(ServiceUri::new(member.addr, LOCAL_QUERY_TASKS))
                .with_body(&task)?
                .with_expiration_micros(expiration_micros);
            sends.push(self.send_and_wait(op));
        }

        let mut results = Vec::with_capacity(members.len());
        for (member, done) in members.iter().zip(join_all(sends).await) {
            if !done.is_success() {
                return Err(CoreError::Unavailable(format!(
                    "query on node {} failed with status {}",
                    member.id, done.status_code
                )));
            }
            let answered: QueryTask = done.body_as()?;
            results.push(answered.results.unwrap_or_default());
        }

        debug!(host = %self.id, nodes = members.len(), "Broadcast query merged");
        Ok(query::merge_results(
            results,
            spec.has_option(QueryOption::ExpandContent),
        ))
    }

    /// Relay a query-task or page request to the node that issued it.
    async fn relay_to_issuer(&self, op: &Operation, prefix: &str) -> Result<Option<Outcome>> {
        let node = op.uri.path[prefix.len()..]
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default();
        if node == self.id {
            return Ok(None);
        }
        if op.has_pragma(Pragma::Forwarded) {
            return Err(CoreError::not_found(op.uri.path.clone()));
        }
        let addr = self
            .group
            .address_of(node)
            .ok_or_else(|| CoreError::not_found(op.uri.path.clone()))?;
        let mut forwarded = op.clone().with_pragma(Pragma::Forwarded);
        forwarded.uri = ServiceUri::new(addr, op.uri.path.clone());
        Ok(Some(Outcome::Relayed(self.send_and_wait(forwarded).await)))
    }

    async fn get_query_task(&self, op: &Operation) -> Result<Outcome> {
        if let Some(relayed) = self.relay_to_issuer(op, QUERY_TASKS).await? {
            return Ok(relayed);
        }
        let task = self
            .queries
            .get_task(&op.uri.path, now_micros())
            .await
            .ok_or_else(|| CoreError::not_found(op.uri.path.clone()))?;
        Ok(Outcome::body(serde_json::to_value(&task)?))
    }

    async fn get_query_page(&self, op: &Operation) -> Result<Outcome> {
        if let Some(relayed) = self.relay_to_issuer(op, QUERY_PAGE).await? {
            return Ok(relayed);
        }
        let page = self
            .queries
            .read_page(&op.uri.path, || self.new_query_link(QUERY_PAGE), now_micros())
            .await
            .ok_or_else(|| CoreError::not_found(op.uri.path.clone()))?;

        let mut task = QueryTask::default().set_direct(true);
        task.meta.document_self_link = Some(op.uri.path.clone());
        task.meta.document_kind = Some(QueryTask::KIND.to_string());
        task.results = Some(page);
        task.task_info = TaskState::new(TaskStage::Finished);
        Ok(Outcome::body(serde_json::to_value(&task)?))
    }
}

fn is_child_of(path: &str, parent: &str) -> bool {
    path.len() > parent.len() + 1
        && path.starts_with(parent)
        && path.as_bytes()[parent.len()] == b'/'
}

/// Link for a document POSTed to `factory_link`: the body's self-link if it
/// names one (relative names are placed under the factory), else a new id.
fn new_document_link(factory_link: &str, body: &Value) -> String {
    match body.get(FIELD_NAME_SELF_LINK).and_then(Value::as_str) {
        Some(link) if is_child_of(link, factory_link) => link.to_string(),
        Some(link) if !link.trim_matches('/').is_empty() => {
            paths::child_link(factory_link, paths::last_segment(link))
        }
        _ => paths::child_link(factory_link, &Uuid::new_v4().to_string()),
    }
}

fn record_from_body(body: &Value) -> Result<DocumentRecord> {
    let text = |field: &str| {
        body.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CoreError::BadRequest(format!("replica is missing {}", field)))
    };
    let number = |field: &str| body.get(field).and_then(Value::as_u64).unwrap_or(0);
    Ok(DocumentRecord {
        link: text(FIELD_NAME_SELF_LINK)?,
        kind: text(FIELD_NAME_KIND)?,
        version: number(FIELD_NAME_VERSION),
        update_time_micros: number(FIELD_NAME_UPDATE_TIME_MICROS),
        body: body.clone(),
    })
}

/// Handle given to service hooks for talking to their own host.
#[derive(Clone)]
pub struct ServiceContext {
    host: Arc<ServiceHost>,
    self_link: String,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("host", &self.host.id)
            .field("self_link", &self.self_link)
            .finish()
    }
}

impl ServiceContext {
    pub fn self_link(&self) -> &str {
        &self.self_link
    }

    pub fn host(&self) -> &Arc<ServiceHost> {
        &self.host
    }

    pub fn host_id(&self) -> &str {
        &self.host.id
    }

    /// Uri of `path` on this host.
    pub fn uri(&self, path: impl Into<String>) -> ServiceUri {
        self.host.uri(path)
    }

    pub async fn send(&self, op: Operation) -> Operation {
        self.host.send_and_wait(op).await
    }

    /// Patch this document without waiting for the result.
    ///
    /// The patch travels through the transport like any other request, so it
    /// is serialized with every other write to the document.
    pub fn send_self_patch<T: Serialize>(&self, patch: &T) {
        let body = match serde_json::to_value(patch) {
            Ok(body) => body,
            Err(e) => {
                error!(link = %self.self_link, error = %e, "Failed to encode self patch");
                return;
            }
        };
        let host = self.host.clone();
        let link = self.self_link.clone();
        tokio::spawn(async move {
            let op = Operation::patch(host.uri(link.clone()))
                .with_body_value(body)
                .with_referer(link.clone());
            let done = host.send_and_wait(op).await;
            if !done.is_success() {
                warn!(
                    link = %link,
                    status = done.status_code,
                    error = ?done.error_response().map(|e| e.message),
                    "Self patch rejected"
                );
            }
        });
    }

    /// Patch this document and wait for the committed state.
    pub async fn patch_self<T: Serialize>(&self, patch: &T) -> Result<Value> {
        let op = Operation::patch(self.uri(self.self_link.clone())).with_body(patch)?;
        into_result(self.send(op).await)
    }

    pub async fn get<T: DeserializeOwned>(&self, link: &str) -> Result<T> {
        let body = into_result(self.send(Operation::get(self.uri(link))).await)?;
        Ok(serde_json::from_value(body)?)
    }

    /// POST `body` to a factory on this host's group.
    pub async fn post<T: Serialize>(&self, factory_link: &str, body: &T) -> Result<Value> {
        let op = Operation::post(self.uri(factory_link)).with_body(body)?;
        into_result(self.send(op).await)
    }

    /// Patch another document and wait for its committed state.
    pub async fn patch<T: Serialize>(&self, link: &str, body: &T) -> Result<Value> {
        let op = Operation::patch(self.uri(link)).with_body(body)?;
        into_result(self.send(op).await)
    }

    /// Evaluate a query against this host's group without paging.
    pub async fn query(&self, mut spec: QuerySpecification) -> Result<QueryResult> {
        spec.result_limit = None;
        self.host
            .run_query(&spec, micros_after(self.host.config.operation_timeout))
            .await
    }

    /// Typed documents matching `spec`, read across the whole group.
    pub async fn query_documents<T: ServiceDocument>(
        &self,
        spec: QuerySpecification,
    ) -> Result<Vec<T>> {
        let spec = spec
            .with_option(QueryOption::Broadcast)
            .with_option(QueryOption::ExpandContent);
        let result = self.query(spec).await?;
        result
            .documents
            .unwrap_or_default()
            .into_values()
            .map(|d| serde_json::from_value(d).map_err(CoreError::from))
            .collect()
    }
}

/// Body of a completed operation, or the error it failed with.
fn into_result(done: Operation) -> Result<Value> {
    if done.is_success() {
        return Ok(done.body.unwrap_or(Value::Null));
    }
    let message = done
        .error_response()
        .map(|e| e.message)
        .unwrap_or_else(|| format!("status {}", done.status_code));
    Err(match done.status_code {
        STATUS_CODE_NOT_FOUND => CoreError::not_found(done.uri.path),
        STATUS_CODE_BAD_REQUEST => CoreError::BadRequest(message),
        STATUS_CODE_CONFLICT => CoreError::Conflict {
            link: done.uri.path,
        },
        _ => CoreError::Unavailable(message),
    })
}
