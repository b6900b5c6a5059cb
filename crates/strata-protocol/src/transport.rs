// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport seam between callers and hosts.

use tokio::sync::oneshot;

use crate::operation::Operation;

/// Moves an operation to the host named by its uri.
///
/// `send` returns immediately. The completed operation arrives on
/// `completion`; dropping the sender without sending signals that the
/// request was abandoned.
pub trait Transport: Send + Sync {
    fn send(&self, op: Operation, completion: oneshot::Sender<Operation>);
}
