// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Query evaluation, broadcast merge and result paging.
//!
//! Each host answers a query from its own store. A broadcast query is sent to
//! every member's local query factory and the per-node answers are merged.
//! When a result limit is set the merged result is parked in a
//! [`QueryRegistry`] and handed out one page per GET.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use strata_protocol::document::FIELD_NAME_VERSION;
use strata_protocol::{MatchType, QueryOption, QueryResult, QuerySpecification, QueryTask, QueryTerm};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::persistence::DocumentStore;

/// Resolve a dotted property path inside a document.
fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |value, segment| value.get(segment))
}

fn scalar_matches(value: &Value, expected: &str, match_type: MatchType) -> bool {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return false,
    };
    match match_type {
        MatchType::Term => text == expected,
        MatchType::Prefix => text.starts_with(expected),
    }
}

fn term_matches(document: &Value, term: &QueryTerm) -> bool {
    match lookup(document, &term.property_name) {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| scalar_matches(item, &term.match_value, term.match_type)),
        Some(value) => scalar_matches(value, &term.match_value, term.match_type),
        None => false,
    }
}

/// Every clause must match. Array-valued properties match if any element does.
pub fn matches(document: &Value, spec: &QuerySpecification) -> bool {
    spec.query
        .boolean_clauses
        .iter()
        .all(|term| term_matches(document, term))
}

/// Run a query against one store, ignoring the broadcast and limit options.
pub async fn execute_local(store: &dyn DocumentStore, spec: &QuerySpecification) -> Result<QueryResult> {
    let expand = spec.has_option(QueryOption::ExpandContent);
    let records = store.list(spec.kind()).await?;

    let mut result = QueryResult {
        documents: expand.then(BTreeMap::new),
        ..QueryResult::default()
    };
    for record in records.into_iter().filter(|r| matches(&r.body, spec)) {
        result.document_links.push(record.link.clone());
        if let Some(documents) = result.documents.as_mut() {
            documents.insert(record.link, record.body);
        }
    }
    Ok(result)
}

fn version_of(document: &Value) -> u64 {
    document
        .get(FIELD_NAME_VERSION)
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Merge per-node results into one deduplicated, link-ordered result. When
/// expanded, the highest version of each document wins.
pub fn merge_results(results: Vec<QueryResult>, expand: bool) -> QueryResult {
    let mut links = BTreeSet::new();
    let mut documents: BTreeMap<String, Value> = BTreeMap::new();

    for result in results {
        links.extend(result.document_links);
        for (link, document) in result.documents.unwrap_or_default() {
            let newer = documents
                .get(&link)
                .is_none_or(|existing| version_of(&document) > version_of(existing));
            if newer {
                documents.insert(link, document);
            }
        }
    }

    QueryResult {
        document_links: links.into_iter().collect(),
        documents: expand.then_some(documents),
        next_page_link: None,
    }
}

#[derive(Debug, Clone)]
struct PageCursor {
    links: Arc<Vec<String>>,
    documents: Option<Arc<BTreeMap<String, Value>>>,
    offset: usize,
    limit: usize,
    expires_at_micros: u64,
    next: Option<String>,
}

/// Query tasks and result pages held by one host until they expire.
#[derive(Debug, Default)]
pub struct QueryRegistry {
    tasks: Mutex<HashMap<String, QueryTask>>,
    pages: Mutex<HashMap<String, PageCursor>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_task(&self, link: String, task: QueryTask) {
        self.tasks.lock().await.insert(link, task);
    }

    /// A live task, or `None` if unknown or expired.
    pub async fn get_task(&self, link: &str, now_micros: u64) -> Option<QueryTask> {
        self.tasks
            .lock()
            .await
            .get(link)
            .filter(|t| t.document_expiration_time_micros > now_micros)
            .cloned()
    }

    /// Park a full result and return the link of its first page.
    pub async fn open_pages(
        &self,
        page_link: String,
        result: QueryResult,
        limit: usize,
        expires_at_micros: u64,
    ) -> String {
        let cursor = PageCursor {
            links: Arc::new(result.document_links),
            documents: result.documents.map(Arc::new),
            offset: 0,
            limit: limit.max(1),
            expires_at_micros,
            next: None,
        };
        self.pages.lock().await.insert(page_link.clone(), cursor);
        page_link
    }

    /// Read one page. `next_link` names the following page if one is needed.
    pub async fn read_page(
        &self,
        page_link: &str,
        next_link: impl FnOnce() -> String,
        now_micros: u64,
    ) -> Option<QueryResult> {
        let mut pages = self.pages.lock().await;
        let cursor = pages
            .get(page_link)
            .filter(|c| c.expires_at_micros > now_micros)
            .cloned()?;

        let end = (cursor.offset + cursor.limit).min(cursor.links.len());
        let slice: Vec<String> = cursor.links[cursor.offset..end].to_vec();
        let documents = cursor.documents.as_ref().map(|all| {
            slice
                .iter()
                .filter_map(|l| all.get(l).map(|d| (l.clone(), d.clone())))
                .collect::<BTreeMap<_, _>>()
        });

        let next_page_link = if end < cursor.links.len() {
            let next = match &cursor.next {
                Some(next) => next.clone(),
                None => {
                    let next = next_link();
                    pages.insert(
                        next.clone(),
                        PageCursor {
                            offset: end,
                            next: None,
                            ..cursor.clone()
                        },
                    );
                    if let Some(current) = pages.get_mut(page_link) {
                        current.next = Some(next.clone());
                    }
                    next
                }
            };
            Some(next)
        } else {
            None
        };

        Some(QueryResult {
            document_links: slice,
            documents,
            next_page_link,
        })
    }

    /// Drop expired tasks and pages. Returns how many entries were removed.
    pub async fn purge_expired(&self, now_micros: u64) -> usize {
        let mut removed = 0;
        {
            let mut tasks = self.tasks.lock().await;
            let before = tasks.len();
            tasks.retain(|_, t| t.document_expiration_time_micros > now_micros);
            removed += before - tasks.len();
        }
        let mut pages = self.pages.lock().await;
        let before = pages.len();
        pages.retain(|_, p| p.expires_at_micros > now_micros);
        removed + before - pages.len()
    }
}
