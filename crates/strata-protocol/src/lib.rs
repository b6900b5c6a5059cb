// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strata Protocol - documents, operations and queries
//!
//! This crate holds the data types shared by every other strata crate:
//! - [`Operation`]: the addressed request/response envelope with an absolute deadline
//! - [`DocumentMeta`] and [`ServiceDocument`]: the replicated document model
//! - [`TaskState`]: the stage/sub-stage/failure record embedded in workflow documents
//! - [`QuerySpecification`], [`QueryResult`], [`QueryTask`]: the query wire shapes
//! - [`Transport`]: the seam between callers and whatever moves operations between hosts
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      Operation      ┌──────────────────────┐
//! │    strata-client     │ ──────────────────► │     strata-core      │
//! │   (DocumentClient)   │ ◄────────────────── │    (ServiceHost)     │
//! └──────────────────────┘   completed op      └──────────────────────┘
//!            │                                            │
//!            └──────────────► Transport ◄─────────────────┘
//! ```
//!
//! Deadlines are absolute microsecond timestamps produced by [`now_micros`]; there
//! is no relative timeout anywhere on the wire.

pub mod document;
pub mod operation;
pub mod paths;
pub mod query;
pub mod task;
pub mod time;
pub mod transport;

pub use document::{DocumentMeta, ServiceDocument};
pub use operation::{Action, Operation, Pragma, ServiceErrorResponse, ServiceUri};
pub use query::{MatchType, QueryOption, QueryResult, QuerySpecification, QueryTask, QueryTerm};
pub use task::{NoSubStage, TaskStage, TaskState};
pub use time::now_micros;
pub use transport::Transport;
