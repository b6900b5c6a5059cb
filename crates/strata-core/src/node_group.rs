// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node group membership and per-document owner selection.
//!
//! Every host of a group replicates every document, but exactly one member
//! owns each link at any moment: writes are serialized through it and only it
//! runs maintenance for the link. Ownership is computed with rendezvous
//! hashing, so every member that sees the same membership picks the same
//! owner without coordination, and a membership change only moves the links
//! whose winning member joined or left.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

use sha2::{Digest, Sha256};

/// A member of a node group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub addr: SocketAddr,
}

/// Live membership of one replica group.
///
/// Shared by reference between the hosts of the group and whatever manages
/// membership; every read sees the current members.
#[derive(Debug)]
pub struct NodeGroup {
    name: String,
    members: RwLock<BTreeMap<String, SocketAddr>>,
}

impl NodeGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add or re-address a member.
    pub fn join(&self, id: impl Into<String>, addr: SocketAddr) {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), addr);
    }

    /// Remove a member. Returns whether it was present.
    pub fn leave(&self, id: &str) -> bool {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    /// Current members ordered by id.
    pub fn members(&self) -> Vec<Member> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, addr)| Member {
                id: id.clone(),
                addr: *addr,
            })
            .collect()
    }

    /// Current member addresses ordered by member id.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.members().into_iter().map(|m| m.addr).collect()
    }

    pub fn address_of(&self, id: &str) -> Option<SocketAddr> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The member that owns `key` under the current membership.
    pub fn select_owner(&self, key: &str) -> Option<Member> {
        self.members()
            .into_iter()
            .max_by(|a, b| {
                rendezvous_score(&a.id, key)
                    .cmp(&rendezvous_score(&b.id, key))
                    .then_with(|| b.id.cmp(&a.id))
            })
    }
}

fn rendezvous_score(member_id: &str, key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(member_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn group_of(n: u16) -> NodeGroup {
        let group = NodeGroup::new("default");
        for i in 0..n {
            group.join(format!("node-{}", i), addr(19000 + i));
        }
        group
    }

    #[test]
    fn test_empty_group_has_no_owner() {
        let group = NodeGroup::new("default");
        assert!(group.is_empty());
        assert!(group.select_owner("/tasks/a").is_none());
    }

    #[test]
    fn test_owner_is_stable_for_same_membership() {
        let group = group_of(3);
        let first = group.select_owner("/tasks/copy-state-triggers/t1").unwrap();
        for _ in 0..10 {
            assert_eq!(group.select_owner("/tasks/copy-state-triggers/t1").unwrap(), first);
        }
    }

    #[test]
    fn test_owners_agree_across_group_instances() {
        let a = group_of(3);
        let b = group_of(3);
        for i in 0..50 {
            let key = format!("/docs/{}", i);
            assert_eq!(a.select_owner(&key), b.select_owner(&key));
        }
    }

    #[test]
    fn test_ownership_spreads_across_members() {
        let group = group_of(3);
        let mut owners = std::collections::BTreeSet::new();
        for i in 0..100 {
            owners.insert(group.select_owner(&format!("/docs/{}", i)).unwrap().id);
        }
        assert_eq!(owners.len(), 3);
    }

    #[test]
    fn test_leave_only_moves_links_of_departed_member() {
        let group = group_of(3);
        let before: Vec<Member> = (0..100)
            .map(|i| group.select_owner(&format!("/docs/{}", i)).unwrap())
            .collect();

        assert!(group.leave("node-1"));
        assert!(!group.leave("node-1"));

        for (i, owner) in before.iter().enumerate() {
            let after = group.select_owner(&format!("/docs/{}", i)).unwrap();
            if owner.id != "node-1" {
                assert_eq!(&after, owner);
            } else {
                assert_ne!(after.id, "node-1");
            }
        }
    }

    #[test]
    fn test_address_lookup() {
        let group = group_of(2);
        assert_eq!(group.address_of("node-1"), Some(addr(19001)));
        assert_eq!(group.address_of("node-9"), None);
        assert_eq!(group.addresses(), vec![addr(19000), addr(19001)]);
    }
}
