// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replica address sets.
//!
//! A server set is read on every request and never cached by the client,
//! so membership changes take effect on the next send.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{PoisonError, RwLock};

use rand::seq::IndexedRandom;

/// Live set of replica addresses for one logical cluster.
pub trait ServerSet: Send + Sync {
    fn servers(&self) -> Vec<SocketAddr>;
}

/// A fixed list of addresses.
#[derive(Debug, Clone)]
pub struct StaticServerSet {
    servers: Vec<SocketAddr>,
}

impl StaticServerSet {
    pub fn new(servers: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            servers: servers.into_iter().collect(),
        }
    }
}

impl ServerSet for StaticServerSet {
    fn servers(&self) -> Vec<SocketAddr> {
        self.servers.clone()
    }
}

/// Addresses that may be added and removed while clients use them.
#[derive(Debug, Default)]
pub struct DynamicServerSet {
    servers: RwLock<BTreeSet<SocketAddr>>,
}

impl DynamicServerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, addr: SocketAddr) -> bool {
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr)
    }

    pub fn remove(&self, addr: &SocketAddr) -> bool {
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(addr)
    }

    /// Swap in a whole new membership.
    pub fn replace(&self, servers: impl IntoIterator<Item = SocketAddr>) {
        *self.servers.write().unwrap_or_else(PoisonError::into_inner) =
            servers.into_iter().collect();
    }
}

impl ServerSet for DynamicServerSet {
    fn servers(&self) -> Vec<SocketAddr> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}

/// Pick the address to send to: a replica on `local_ip` if there is one,
/// otherwise one chosen uniformly at random.
pub fn resolve(servers: &[SocketAddr], local_ip: Option<IpAddr>) -> Option<SocketAddr> {
    if let Some(local_ip) = local_ip
        && let Some(local) = servers.iter().find(|s| s.ip() == local_ip)
    {
        return Some(*local);
    }
    servers.choose(&mut rand::rng()).copied()
}
