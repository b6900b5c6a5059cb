// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process transport connecting the hosts of one process.
//!
//! Every send is served on its own task: the target host handles the
//! operation, the completion is delivered, and only then does the
//! operation's continuation run. Links can be faulted to simulate
//! unreachable nodes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use strata_protocol::operation::STATUS_CODE_UNAVAILABLE;
use strata_protocol::{Operation, ServiceErrorResponse, Transport};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::host::ServiceHost;

/// How a faulted address treats traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    /// Requests are accepted but never answered; callers hit their deadline.
    Blackhole,
    /// Requests are dropped; callers see the transport abandon them.
    Drop,
}

#[derive(Default)]
pub struct LocalNetwork {
    hosts: RwLock<HashMap<SocketAddr, Weak<ServiceHost>>>,
    faults: RwLock<HashMap<SocketAddr, LinkFault>>,
    parked: Mutex<Vec<oneshot::Sender<Operation>>>,
    latency: Option<Duration>,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("LocalNetwork")
            .field("hosts", &hosts.keys().collect::<Vec<_>>())
            .field("latency", &self.latency)
            .finish()
    }
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A network that delays every delivery by `latency`.
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency: Some(latency),
            ..Self::default()
        })
    }

    /// Route traffic for the host's address to it.
    pub fn register(&self, host: &Arc<ServiceHost>) {
        debug!(host = %host.id(), addr = %host.addr(), "Host registered on local network");
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.addr(), Arc::downgrade(host));
    }

    pub fn deregister(&self, addr: SocketAddr) {
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr);
    }

    /// Fault (or with `None`, heal) the link to `addr`.
    pub fn set_fault(&self, addr: SocketAddr, fault: Option<LinkFault>) {
        let mut faults = self.faults.write().unwrap_or_else(PoisonError::into_inner);
        match fault {
            Some(fault) => {
                faults.insert(addr, fault);
            }
            None => {
                faults.remove(&addr);
            }
        }
    }

    fn fault_for(&self, addr: SocketAddr) -> Option<LinkFault> {
        self.faults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .copied()
    }

    fn host_at(&self, addr: SocketAddr) -> Option<Arc<ServiceHost>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .and_then(Weak::upgrade)
    }
}

impl Transport for LocalNetwork {
    fn send(&self, op: Operation, completion: oneshot::Sender<Operation>) {
        let target = op.uri.host;
        match self.fault_for(target) {
            Some(LinkFault::Blackhole) => {
                trace!(op = %op, "Blackholed");
                let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
                // Callers that gave up no longer need their sender kept alive.
                parked.retain(|sender| !sender.is_closed());
                parked.push(completion);
                return;
            }
            Some(LinkFault::Drop) => {
                trace!(op = %op, "Dropped");
                return;
            }
            None => {}
        }

        let host = self.host_at(target);
        let latency = self.latency;
        tokio::spawn(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            let Some(host) = host else {
                let mut op = op;
                op.fail(ServiceErrorResponse::new(
                    STATUS_CODE_UNAVAILABLE,
                    format!("no host listening on {}", target),
                ));
                let _ = completion.send(op);
                return;
            };

            let handled = host.handle(op).await;
            let _ = completion.send(handled.op);
            if let Some(continuation) = handled.continuation {
                continuation.await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_protocol::ServiceUri;

    fn parked(network: &LocalNetwork) -> usize {
        network.parked.lock().unwrap().len()
    }

    #[test]
    fn test_blackhole_keeps_only_waiting_callers() {
        let network = LocalNetwork::new();
        let addr = SocketAddr::from(([127, 0, 0, 1], 19991));
        network.set_fault(addr, Some(LinkFault::Blackhole));

        let (tx, abandoned) = oneshot::channel();
        network.send(Operation::get(ServiceUri::new(addr, "/a")), tx);
        let (tx, _waiting) = oneshot::channel();
        network.send(Operation::get(ServiceUri::new(addr, "/b")), tx);
        assert_eq!(parked(&network), 2);

        drop(abandoned);
        let (tx, _next) = oneshot::channel();
        network.send(Operation::get(ServiceUri::new(addr, "/c")), tx);
        assert_eq!(parked(&network), 2);
    }
}
