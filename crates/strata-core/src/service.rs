// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document services.
//!
//! A host serves factories through the object-safe [`ServiceHandler`] trait,
//! which speaks JSON. Typed services implement [`StatefulService`] and are
//! wrapped in a [`DocumentEngine`], which runs the shared start/patch
//! pipeline:
//!
//! ```text
//! start:  decode -> initialize -> required fields -> validate_start -> validate_state
//! patch:  immutable fields -> validate_patch -> apply_patch -> validate_state
//! ```
//!
//! Hooks (`on_started`, `on_patched`, `handle_maintenance`) are returned as
//! continuations that the host runs only after the caller has received the
//! completed operation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use strata_protocol::ServiceDocument;

use crate::error::{CoreError, Result};
use crate::fields::{FieldSpec, merge_patch, strip_meta, validate_immutable, validate_required};
use crate::host::ServiceContext;

/// Work scheduled to run after an operation has been completed.
pub type Continuation = BoxFuture<'static, ()>;

#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// A POST to an existing link replaces the document instead of failing
    /// with a conflict.
    pub idempotent_post: bool,
    /// Run `handle_maintenance` for each document at this interval, on the
    /// document's owner only.
    pub maintenance_interval: Option<Duration>,
}

/// Untyped service contract used by the host.
pub trait ServiceHandler: Send + Sync {
    fn factory_link(&self) -> &str;

    fn kind(&self) -> &str;

    fn options(&self) -> ServiceOptions;

    /// Validate and initialize a new document body.
    fn handle_start(&self, body: Value) -> Result<Value>;

    /// Validate `patch` against `current` and produce the next state.
    fn handle_patch(&self, current: &Value, patch: &Value) -> Result<Value>;

    fn on_started(&self, ctx: ServiceContext, state: Value) -> Option<Continuation>;

    fn on_patched(&self, ctx: ServiceContext, state: Value, patch: Value) -> Option<Continuation>;

    fn handle_maintenance(&self, ctx: ServiceContext, state: Value) -> Option<Continuation>;
}

/// Typed document service.
///
/// Only `FACTORY_LINK` and `State` are mandatory; every hook has a no-op
/// default.
#[async_trait]
pub trait StatefulService: Send + Sync + 'static {
    type State: ServiceDocument;

    const FACTORY_LINK: &'static str;

    /// Field table checked by the engine.
    fn fields(&self) -> &'static [FieldSpec] {
        &[]
    }

    fn options(&self) -> ServiceOptions {
        ServiceOptions::default()
    }

    /// Fill default values into a new document.
    fn initialize(&self, _state: &mut Self::State) {}

    fn validate_start(&self, _state: &Self::State) -> Result<()> {
        Ok(())
    }

    fn validate_patch(&self, _current: &Self::State, _patch: &Self::State) -> Result<()> {
        Ok(())
    }

    /// Produce the next state. The default applies the present fields of the
    /// raw patch using the field table's merge rules.
    fn apply_patch(&self, current: &Self::State, patch: &Value) -> Result<Self::State> {
        let mut merged = serde_json::to_value(current)?;
        merge_patch(&mut merged, patch, self.fields())?;
        decode(merged)
    }

    /// Invariants that must hold for every committed state.
    fn validate_state(&self, _state: &Self::State) -> Result<()> {
        Ok(())
    }

    async fn on_started(&self, _ctx: ServiceContext, _state: Self::State) {}

    async fn on_patched(&self, _ctx: ServiceContext, _state: Self::State, _patch: Self::State) {}

    async fn handle_maintenance(&self, _ctx: ServiceContext, _state: Self::State) {}
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| CoreError::validation(e.to_string()))
}

/// Adapts a [`StatefulService`] to [`ServiceHandler`].
pub struct DocumentEngine<S: StatefulService> {
    service: Arc<S>,
}

impl<S: StatefulService> DocumentEngine<S> {
    pub fn new(service: S) -> Self {
        Self::from_arc(Arc::new(service))
    }

    pub fn from_arc(service: Arc<S>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }
}

impl<S: StatefulService> ServiceHandler for DocumentEngine<S> {
    fn factory_link(&self) -> &str {
        S::FACTORY_LINK
    }

    fn kind(&self) -> &str {
        <S::State as ServiceDocument>::KIND
    }

    fn options(&self) -> ServiceOptions {
        self.service.options()
    }

    fn handle_start(&self, body: Value) -> Result<Value> {
        let mut state: S::State = decode(body)?;
        self.service.initialize(&mut state);

        let value = serde_json::to_value(&state)?;
        validate_required(&value, self.service.fields())?;
        self.service.validate_start(&state)?;
        self.service.validate_state(&state)?;
        Ok(value)
    }

    fn handle_patch(&self, current: &Value, patch: &Value) -> Result<Value> {
        let patch = strip_meta(patch);
        let current_state: S::State = decode(current.clone())?;
        let patch_state: S::State = decode(patch.clone())?;

        validate_immutable(current, &patch, self.service.fields())?;
        self.service.validate_patch(&current_state, &patch_state)?;

        let next = self.service.apply_patch(&current_state, &patch)?;
        self.service.validate_state(&next)?;
        Ok(serde_json::to_value(&next)?)
    }

    fn on_started(&self, ctx: ServiceContext, state: Value) -> Option<Continuation> {
        let state: S::State = serde_json::from_value(state).ok()?;
        let service = self.service.clone();
        Some(Box::pin(async move { service.on_started(ctx, state).await }))
    }

    fn on_patched(&self, ctx: ServiceContext, state: Value, patch: Value) -> Option<Continuation> {
        let state: S::State = serde_json::from_value(state).ok()?;
        let patch: S::State = serde_json::from_value(strip_meta(&patch)).ok()?;
        let service = self.service.clone();
        Some(Box::pin(async move { service.on_patched(ctx, state, patch).await }))
    }

    fn handle_maintenance(&self, ctx: ServiceContext, state: Value) -> Option<Continuation> {
        let state: S::State = serde_json::from_value(state).ok()?;
        let service = self.service.clone();
        Some(Box::pin(async move { service.handle_maintenance(ctx, state).await }))
    }
}
