// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strata Client - operations against a replicated document cluster
//!
//! [`DocumentClient`] resolves a replica from a [`ServerSet`] on every send,
//! stamps the operation with a deadline, referer and request id, waits for
//! the completion and maps its status onto [`ClientError`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata_client::{ClientConfig, DocumentClient, StaticServerSet};
//!
//! let servers = Arc::new(StaticServerSet::new(["127.0.0.1:19000".parse()?]));
//! let client = DocumentClient::new(servers, transport, ClientConfig::from_env()?);
//!
//! let host: HostState = client.get_document("/cloudstore/hosts/h1").await?;
//! let page = client
//!     .query_documents_paged::<HostState>(&[("clusterLink", "/cloudstore/clusters/c1")], Some(50), true)
//!     .await?;
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod server_set;

pub use client::DocumentClient;
pub use config::ClientConfig;
pub use context::{current_request_id, request_id_or_new, with_request_id};
pub use error::{ClientError, Result};
pub use server_set::{DynamicServerSet, ServerSet, StaticServerSet};
