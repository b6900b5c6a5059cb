// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strata Core - replicated document hosts
//!
//! This crate runs groups of service hosts that replicate every document to
//! every member. Each document link has exactly one owner, chosen by
//! rendezvous hashing over the live membership; writes are serialized
//! through the owner and maintenance runs only there.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   Operation   ┌───────────────────────────────────────────┐
//! │    caller     │ ────────────► │ ServiceHost (any member)                  │
//! └───────────────┘               │   relay to owner ──► owner:               │
//!                                 │     lock link, validate, commit version,  │
//!                                 │     replicate to peers, complete,         │
//!                                 │     run continuation                      │
//!                                 └───────────────────────────────────────────┘
//!                                              │
//!                                              ▼
//!                                 ┌───────────────────────────┐
//!                                 │ DocumentStore per host    │
//!                                 │ (memory or SQLite)        │
//!                                 └───────────────────────────┘
//! ```
//!
//! # Services
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`StatefulService`] | Typed document service: field table, validation, hooks |
//! | [`ServiceHandler`] | Object-safe JSON contract the host dispatches to |
//! | [`DocumentEngine`] | Adapts the first to the second |
//!
//! Workflow documents embed a task state; [`TransitionTable`] declares which
//! stage moves a workflow accepts.
//!
//! # Queries
//!
//! `POST /core/query-tasks` evaluates a [`QuerySpecification`](strata_protocol::QuerySpecification)
//! on this host or, with the broadcast option, on every member, merging the
//! answers. Results with a limit are served page by page from
//! `/core/query-page/...` until they expire.

pub mod config;
pub mod error;
pub mod fields;
pub mod host;
pub mod maintenance;
pub mod network;
pub mod node_group;
pub mod persistence;
pub mod query;
pub mod runtime;
pub mod service;
pub mod task;

pub use config::HostConfig;
pub use error::{CoreError, Result};
pub use fields::{FieldSpec, MergeRule};
pub use host::{ServiceContext, ServiceHost};
pub use maintenance::{MaintenanceConfig, MaintenanceLoop};
pub use network::{LinkFault, LocalNetwork};
pub use node_group::{Member, NodeGroup};
pub use persistence::{DocumentRecord, DocumentStore, MemoryStore, SqliteStore};
pub use runtime::HostRuntime;
pub use service::{DocumentEngine, ServiceHandler, ServiceOptions, StatefulService};
pub use task::TransitionTable;
