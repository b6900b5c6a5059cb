// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strata Workflows - provisioning on top of strata hosts
//!
//! This crate holds the cloud-store inventory services and the task
//! workflows that act on them. Every workflow is a document whose task state
//! advances only through self-patches; the work for a stage runs after the
//! stage is committed.
//!
//! # Services
//!
//! | Factory | Service |
//! |---------|---------|
//! | `/cloudstore/cluster-configurations` | [`ClusterConfigurationService`](cloud_store::ClusterConfigurationService) |
//! | `/cloudstore/clusters` | [`ClusterService`](cloud_store::ClusterService) |
//! | `/cloudstore/hosts` | [`HostService`](cloud_store::HostService) |
//! | `/cloudstore/vms` | [`VmService`](cloud_store::VmService) |
//! | `/cloudstore/containers` | [`ContainerService`](cloud_store::ContainerService) |
//! | `/tasks/swarm-cluster-create` | [`ClusterCreateService`](tasks::ClusterCreateService) |
//! | `/tasks/allocate-host-resource` | [`AllocateHostResourceService`](tasks::AllocateHostResourceService) |
//! | `/tasks/copy-state` | [`CopyStateService`](tasks::CopyStateService) |
//! | `/tasks/copy-state-triggers` | [`CopyStateTriggerService`](tasks::CopyStateTriggerService) |
//!
//! Cluster creation talks to the outside world through the traits in
//! [`external`]; it is registered only when those are supplied.

/// Implement `ServiceDocument` for a state struct with a flattened `meta`.
macro_rules! service_document {
    ($state:ty, $kind:literal) => {
        impl strata_protocol::ServiceDocument for $state {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &strata_protocol::DocumentMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut strata_protocol::DocumentMeta {
                &mut self.meta
            }
        }
    };
}

pub mod cloud_store;
pub mod config;
pub mod error;
pub mod external;
pub mod tasks;

use strata_core::DocumentEngine;
use strata_core::runtime::HostRuntimeBuilder;

pub use config::{Config, ConfigError};
pub use error::{Result, WorkflowError};
pub use external::Collaborators;

/// Register every workflow service on `builder`. Cluster creation is added
/// only when `collaborators` are given.
pub fn register_services(
    builder: HostRuntimeBuilder,
    collaborators: Option<&Collaborators>,
) -> HostRuntimeBuilder {
    let builder = builder
        .service(DocumentEngine::new(cloud_store::ClusterConfigurationService))
        .service(DocumentEngine::new(cloud_store::ClusterService))
        .service(DocumentEngine::new(cloud_store::HostService))
        .service(DocumentEngine::new(cloud_store::VmService))
        .service(DocumentEngine::new(cloud_store::ContainerService))
        .service(DocumentEngine::new(tasks::AllocateHostResourceService))
        .service(DocumentEngine::new(tasks::CopyStateService::default()))
        .service(DocumentEngine::new(tasks::CopyStateTriggerService::new()));

    match collaborators {
        Some(collaborators) => builder.service(DocumentEngine::new(
            tasks::ClusterCreateService::new(collaborators.clone()),
        )),
        None => builder,
    }
}
