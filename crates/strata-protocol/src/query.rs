// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Query specification and result wire shapes.
//!
//! ```json
//! {
//!   "querySpec": {
//!     "query": { "booleanClauses": [{ "propertyName": "documentKind", "matchValue": "..." }] },
//!     "options": ["BROADCAST", "EXPAND_CONTENT"],
//!     "resultLimit": 10
//!   },
//!   "results": { "documentLinks": [], "nextPageLink": "/core/query-page/..." },
//!   "taskInfo": { "stage": "FINISHED" },
//!   "isDirect": true
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{DocumentMeta, FIELD_NAME_KIND, ServiceDocument};
use crate::task::{NoSubStage, TaskState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    #[default]
    Term,
    Prefix,
}

/// One required clause: `propertyName` (a dotted path) must match `matchValue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTerm {
    pub property_name: String,
    pub match_value: String,
    #[serde(default)]
    pub match_type: MatchType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default)]
    pub boolean_clauses: Vec<QueryTerm>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryOption {
    /// Return document bodies in `documents`, not just links.
    ExpandContent,
    /// Survey every node of the group and merge.
    Broadcast,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpecification {
    #[serde(default)]
    pub query: Query,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub options: BTreeSet<QueryOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_limit: Option<usize>,
}

impl QuerySpecification {
    /// Query for every document of `kind`.
    pub fn for_kind(kind: &str) -> Self {
        Self::default().term(FIELD_NAME_KIND, kind)
    }

    /// Query for every document of `T`.
    pub fn for_document<T: ServiceDocument>() -> Self {
        Self::for_kind(T::KIND)
    }

    pub fn term(mut self, property_name: impl Into<String>, match_value: impl Into<String>) -> Self {
        self.query.boolean_clauses.push(QueryTerm {
            property_name: property_name.into(),
            match_value: match_value.into(),
            match_type: MatchType::Term,
        });
        self
    }

    pub fn prefix(mut self, property_name: impl Into<String>, match_value: impl Into<String>) -> Self {
        self.query.boolean_clauses.push(QueryTerm {
            property_name: property_name.into(),
            match_value: match_value.into(),
            match_type: MatchType::Prefix,
        });
        self
    }

    pub fn with_option(mut self, option: QueryOption) -> Self {
        self.options.insert(option);
        self
    }

    pub fn with_result_limit(mut self, limit: usize) -> Self {
        self.result_limit = Some(limit);
        self
    }

    pub fn has_option(&self, option: QueryOption) -> bool {
        self.options.contains(&option)
    }

    /// Kind named by a TERM clause on `documentKind`, if any.
    pub fn kind(&self) -> Option<&str> {
        self.query
            .boolean_clauses
            .iter()
            .find(|c| c.property_name == FIELD_NAME_KIND && c.match_type == MatchType::Term)
            .map(|c| c.match_value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    #[serde(default)]
    pub document_links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_link: Option<String>,
}

/// A query submitted to a query task factory, and its outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTask {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    pub query_spec: QuerySpecification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<QueryResult>,
    #[serde(default)]
    pub task_info: TaskState<NoSubStage>,
    /// Direct tasks answer the POST with finished results.
    #[serde(default)]
    pub is_direct: bool,
    #[serde(default)]
    pub document_expiration_time_micros: u64,
}

impl QueryTask {
    pub fn create(query_spec: QuerySpecification) -> Self {
        Self {
            query_spec,
            ..Self::default()
        }
    }

    pub fn set_direct(mut self, direct: bool) -> Self {
        self.is_direct = direct;
        self
    }
}

impl ServiceDocument for QueryTask {
    const KIND: &'static str = "strata:core:QueryTask";

    fn meta(&self) -> &DocumentMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut DocumentMeta {
        &mut self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_specification_wire_shape() {
        let spec = QuerySpecification::for_kind("strata:cloudstore:Host")
            .term("usageTags", "MGMT")
            .with_option(QueryOption::Broadcast)
            .with_option(QueryOption::ExpandContent)
            .with_result_limit(10);

        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            json!({
                "query": {"booleanClauses": [
                    {"propertyName": "documentKind", "matchValue": "strata:cloudstore:Host", "matchType": "TERM"},
                    {"propertyName": "usageTags", "matchValue": "MGMT", "matchType": "TERM"},
                ]},
                "options": ["EXPAND_CONTENT", "BROADCAST"],
                "resultLimit": 10,
            })
        );
    }

    #[test]
    fn test_kind_lookup_ignores_prefix_clauses() {
        let spec = QuerySpecification::default().prefix(FIELD_NAME_KIND, "strata:");
        assert!(spec.kind().is_none());

        let spec = QuerySpecification::for_kind("strata:cloudstore:Vm");
        assert_eq!(spec.kind(), Some("strata:cloudstore:Vm"));
    }

    #[test]
    fn test_match_type_defaults_to_term() {
        let term: QueryTerm =
            serde_json::from_value(json!({"propertyName": "name", "matchValue": "x"})).unwrap();
        assert_eq!(term.match_type, MatchType::Term);
    }

    #[test]
    fn test_query_task_decodes_task_info() {
        let task: QueryTask = serde_json::from_value(json!({
            "documentSelfLink": "/core/query-tasks/node-0/q1",
            "querySpec": {"query": {"booleanClauses": []}},
            "taskInfo": {"stage": "STARTED"},
        }))
        .unwrap();
        assert_eq!(task.task_info.stage, crate::task::TaskStage::Started);
        assert!(task.task_info.sub_stage.is_none());

        let task: QueryTask = serde_json::from_value(json!({
            "querySpec": {"query": {"booleanClauses": []}},
        }))
        .unwrap();
        assert_eq!(task.task_info.stage, crate::task::TaskStage::Created);
    }
}
