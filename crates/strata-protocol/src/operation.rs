// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The operation envelope.
//!
//! An [`Operation`] is created by a caller, handed to a [`Transport`](crate::Transport),
//! and comes back through the completion channel with `status_code` and `body`
//! filled in by the host that served it. Operations are never persisted.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::micros_after;

pub const STATUS_CODE_OK: u16 = 200;
pub const STATUS_CODE_ACCEPTED: u16 = 202;
pub const STATUS_CODE_BAD_REQUEST: u16 = 400;
pub const STATUS_CODE_NOT_FOUND: u16 = 404;
pub const STATUS_CODE_TIMEOUT: u16 = 408;
pub const STATUS_CODE_CONFLICT: u16 = 409;
pub const STATUS_CODE_FAILURE_THRESHOLD: u16 = 400;
pub const STATUS_CODE_INTERNAL_ERROR: u16 = 500;
pub const STATUS_CODE_UNAVAILABLE: u16 = 503;

/// Request verb. A query is a `Post` to a query task factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Get,
    Post,
    Patch,
    Delete,
}

impl Action {
    /// Whether this action changes document state.
    pub fn is_write(&self) -> bool {
        !matches!(self, Action::Get)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Get => "GET",
            Action::Post => "POST",
            Action::Patch => "PATCH",
            Action::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Host address plus path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceUri {
    pub host: SocketAddr,
    pub path: String,
}

impl ServiceUri {
    pub fn new(host: SocketAddr, path: impl Into<String>) -> Self {
        Self {
            host,
            path: path.into(),
        }
    }

    /// Same host, different path.
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self::new(self.host, path)
    }
}

impl fmt::Display for ServiceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}{}", self.host, self.path)
    }
}

/// Request directives understood by hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pragma {
    /// Fail fast with 404 instead of waiting for the document to appear.
    NoQueuing,
    /// The op was forwarded by a peer to the document owner.
    Forwarded,
    /// The op carries committed state from the owner to a replica.
    Replicated,
}

/// Error body returned with every failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceErrorResponse {
    pub message: String,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ServiceErrorResponse {
    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code,
            error_code: None,
        }
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

/// An addressed request and, once completed, its response.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Assigned by the client pipeline before dispatch.
    pub id: u64,
    pub action: Action,
    pub uri: ServiceUri,
    /// Origin of the request.
    pub referer: Option<String>,
    /// Causal context id propagated across derived operations.
    pub context_id: Option<String>,
    /// Absolute deadline in microseconds. Zero means "not yet assigned".
    pub expiration_micros: u64,
    pub status_code: u16,
    pub body: Option<Value>,
    pub pragmas: Vec<Pragma>,
}

impl Operation {
    pub fn new(action: Action, uri: ServiceUri) -> Self {
        Self {
            id: 0,
            action,
            uri,
            referer: None,
            context_id: None,
            expiration_micros: 0,
            status_code: STATUS_CODE_OK,
            body: None,
            pragmas: Vec::new(),
        }
    }

    pub fn get(uri: ServiceUri) -> Self {
        Self::new(Action::Get, uri)
    }

    pub fn post(uri: ServiceUri) -> Self {
        Self::new(Action::Post, uri)
    }

    pub fn patch(uri: ServiceUri) -> Self {
        Self::new(Action::Patch, uri)
    }

    pub fn delete(uri: ServiceUri) -> Self {
        Self::new(Action::Delete, uri)
    }

    /// Serialize `body` into the operation.
    pub fn with_body<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn with_body_value(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_expiration_micros(mut self, expiration_micros: u64) -> Self {
        self.expiration_micros = expiration_micros;
        self
    }

    /// Set the deadline to `duration` from now.
    pub fn with_expiration_after(mut self, duration: Duration) -> Self {
        self.expiration_micros = micros_after(duration);
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn with_pragma(mut self, pragma: Pragma) -> Self {
        if !self.pragmas.contains(&pragma) {
            self.pragmas.push(pragma);
        }
        self
    }

    pub fn has_pragma(&self, pragma: Pragma) -> bool {
        self.pragmas.contains(&pragma)
    }

    /// Deserialize the body. A missing body deserializes from `null`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone().unwrap_or(Value::Null))
    }

    /// 200 and 202 are the only success statuses.
    pub fn is_success(&self) -> bool {
        matches!(self.status_code, STATUS_CODE_OK | STATUS_CODE_ACCEPTED)
    }

    /// Complete successfully with `body`.
    pub fn complete(&mut self, body: Option<Value>) {
        self.status_code = STATUS_CODE_OK;
        self.body = body;
    }

    /// Complete with an error status and [`ServiceErrorResponse`] body.
    pub fn fail(&mut self, response: ServiceErrorResponse) {
        self.status_code = response.status_code;
        self.body = serde_json::to_value(&response).ok();
    }

    /// The error body, if the op failed with one.
    pub fn error_response(&self) -> Option<ServiceErrorResponse> {
        if self.is_success() {
            return None;
        }
        self.body
            .as_ref()
            .and_then(|b| serde_json::from_value(b.clone()).ok())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (id {})", self.action, self.uri, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn uri() -> ServiceUri {
        ServiceUri::new("127.0.0.1:19000".parse().unwrap(), "/cloudstore/hosts/h1")
    }

    #[test]
    fn test_operation_display() {
        let mut op = Operation::get(uri());
        op.id = 7;
        assert_eq!(op.to_string(), "GET http://127.0.0.1:19000/cloudstore/hosts/h1 (id 7)");
    }

    #[test]
    fn test_success_statuses() {
        let mut op = Operation::post(uri());
        assert!(op.is_success());
        op.status_code = STATUS_CODE_ACCEPTED;
        assert!(op.is_success());
        op.status_code = 201;
        assert!(!op.is_success());
    }

    #[test]
    fn test_fail_sets_error_body() {
        let mut op = Operation::patch(uri());
        op.fail(ServiceErrorResponse::new(STATUS_CODE_BAD_REQUEST, "bad").with_error_code("X"));
        assert_eq!(op.status_code, 400);
        let response = op.error_response().unwrap();
        assert_eq!(response.message, "bad");
        assert_eq!(response.error_code.as_deref(), Some("X"));
    }

    #[test]
    fn test_pragma_added_once() {
        let op = Operation::get(uri())
            .with_pragma(Pragma::NoQueuing)
            .with_pragma(Pragma::NoQueuing);
        assert_eq!(op.pragmas.len(), 1);
        assert!(op.has_pragma(Pragma::NoQueuing));
        assert!(!op.has_pragma(Pragma::Forwarded));
    }

    #[test]
    fn test_body_as_missing_body_is_null() {
        let op = Operation::get(uri());
        let value: Option<String> = op.body_as().unwrap();
        assert!(value.is_none());

        let op = Operation::post(uri()).with_body(&json!({"a": 1})).unwrap();
        let value: Value = op.body_as().unwrap();
        assert_eq!(value["a"], 1);
    }
}
