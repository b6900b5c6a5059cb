// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request id carried as the causal context id of every operation.

use std::future::Future;

use uuid::Uuid;

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Run `future` with `request_id` as the current request id.
pub async fn with_request_id<F: Future>(request_id: impl Into<String>, future: F) -> F::Output {
    REQUEST_ID.scope(request_id.into(), future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

/// The current request id, or a fresh one outside any request scope.
pub fn request_id_or_new() -> String {
    current_request_id().unwrap_or_else(|| Uuid::new_v4().to_string())
}
