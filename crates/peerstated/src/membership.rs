//! Peer membership and lifecycle tracking
//!
//! Each peer moves through `Joining -> Active -> Leaving -> Removed`.
//! Transitions are the only way a record changes. Removed peers stay in the
//! table (their state and ledger history are kept elsewhere) but drop out of
//! gossip fan-out.

use parking_lot::RwLock;
use peerstate_core::{LifecycleState, NodeAddress, PeerRecord};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Membership errors
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Peer {address}: cannot move from {from:?} to {to}")]
    InvalidTransition {
        address: NodeAddress,
        from: Option<LifecycleState>,
        to: LifecycleState,
    },
}

/// Proof of a started join, used to roll it back
#[derive(Debug)]
pub struct JoinTicket {
    address: NodeAddress,
    previous: Option<PeerRecord>,
}

impl JoinTicket {
    pub fn address(&self) -> NodeAddress {
        self.address
    }
}

/// Membership table
pub struct MembershipTable {
    /// Member registry
    members: RwLock<HashMap<NodeAddress, PeerRecord>>,
    /// Snapshot of Active peers, replaced on every transition touching Active
    active: RwLock<Arc<Vec<PeerRecord>>>,
}

impl Default for MembershipTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipTable {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            active: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Absent/Removed -> Joining
    pub fn begin_join(
        &self,
        address: NodeAddress,
        endpoint: impl Into<String>,
    ) -> Result<JoinTicket, MembershipError> {
        let mut members = self.members.write();
        let previous = members.get(&address).cloned();
        match previous.as_ref().map(|r| r.lifecycle) {
            None | Some(LifecycleState::Removed) => {}
            from => {
                return Err(MembershipError::InvalidTransition {
                    address,
                    from,
                    to: LifecycleState::Joining,
                })
            }
        }

        let record = PeerRecord {
            address,
            endpoint: endpoint.into(),
            lifecycle: LifecycleState::Joining,
        };
        info!("Peer {} joining via {}", address, record.endpoint);
        members.insert(address, record);

        Ok(JoinTicket { address, previous })
    }

    /// Joining -> Active
    pub fn activate(&self, address: &NodeAddress) -> Result<(), MembershipError> {
        self.transition(address, LifecycleState::Joining, LifecycleState::Active)
    }

    /// Undo a join whose initial exchange failed
    pub fn abort_join(&self, ticket: JoinTicket) {
        let mut members = self.members.write();
        let still_joining = members
            .get(&ticket.address)
            .map(|r| r.lifecycle == LifecycleState::Joining)
            .unwrap_or(false);
        if !still_joining {
            return;
        }
        match ticket.previous {
            Some(record) => {
                members.insert(ticket.address, record);
            }
            None => {
                members.remove(&ticket.address);
            }
        }
        info!("Peer {} join aborted", ticket.address);
    }

    /// Active -> Leaving
    pub fn begin_leave(&self, address: &NodeAddress) -> Result<PeerRecord, MembershipError> {
        self.transition(address, LifecycleState::Active, LifecycleState::Leaving)?;
        self.members
            .read()
            .get(address)
            .cloned()
            .ok_or(MembershipError::InvalidTransition {
                address: *address,
                from: None,
                to: LifecycleState::Leaving,
            })
    }

    /// Leaving -> Removed
    pub fn complete_leave(&self, address: &NodeAddress) -> Result<(), MembershipError> {
        self.transition(address, LifecycleState::Leaving, LifecycleState::Removed)
    }

    fn transition(
        &self,
        address: &NodeAddress,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<(), MembershipError> {
        let mut members = self.members.write();
        let record = match members.get_mut(address) {
            Some(r) if r.lifecycle == from => r,
            other => {
                return Err(MembershipError::InvalidTransition {
                    address: *address,
                    from: other.map(|r| r.lifecycle),
                    to,
                })
            }
        };
        record.lifecycle = to;
        info!("Peer {} {} -> {}", address, from, to);

        if from == LifecycleState::Active || to == LifecycleState::Active {
            let snapshot: Vec<PeerRecord> = members
                .values()
                .filter(|r| r.lifecycle == LifecycleState::Active)
                .cloned()
                .collect();
            *self.active.write() = Arc::new(snapshot);
        }
        Ok(())
    }

    /// Stable snapshot of Active peers for fan-out
    pub fn active_peers(&self) -> Arc<Vec<PeerRecord>> {
        self.active.read().clone()
    }

    pub fn get(&self, address: &NodeAddress) -> Option<PeerRecord> {
        self.members.read().get(address).cloned()
    }

    pub fn is_active(&self, address: &NodeAddress) -> bool {
        self.get(address)
            .map(|r| r.lifecycle == LifecycleState::Active)
            .unwrap_or(false)
    }

    /// Get membership stats
    pub fn stats(&self) -> MembershipStats {
        let members = self.members.read();
        let count = |state| {
            members
                .values()
                .filter(|r| r.lifecycle == state)
                .count()
        };
        MembershipStats {
            total: members.len(),
            joining: count(LifecycleState::Joining),
            active: count(LifecycleState::Active),
            leaving: count(LifecycleState::Leaving),
            removed: count(LifecycleState::Removed),
        }
    }
}

/// Membership statistics
#[derive(Debug, Clone)]
pub struct MembershipStats {
    pub total: usize,
    pub joining: usize,
    pub active: usize,
    pub leaving: usize,
    pub removed: usize,
}
