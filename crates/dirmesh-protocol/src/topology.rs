//! Topology records: what a replica knows about the other participants of
//! its domain, as pushed by the replication server it is connected to.

use crate::csn::ReplicaId;
use crate::status::ServerStatus;
use serde::{Deserialize, Serialize};

/// Information about a peer replica (directory server) in the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// The peer replica id.
    pub replica_id: ReplicaId,
    /// The replication server id the peer is connected to.
    pub server_id: u32,
    /// Current status of the peer.
    pub status: ServerStatus,
    /// Data generation the peer holds, when known.
    pub generation_id: Option<u64>,
    /// Group the peer belongs to.
    pub group_id: u8,
    /// Protocol version the peer speaks.
    pub protocol_version: u8,
    /// Referral URLs the peer publishes for redirected operations.
    pub referral_urls: Vec<String>,
}

/// Information about a peer replication server in the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerServerInfo {
    /// The replication server id.
    pub server_id: u32,
    /// Address the server listens on.
    pub server_url: String,
    /// Data generation the server holds, when known.
    pub generation_id: Option<u64>,
    /// Group the server belongs to.
    pub group_id: u8,
}

/// A consistent snapshot of the domain topology.
///
/// Both lists are always replaced together: readers must never observe a
/// replica list from one push paired with a server list from another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyView {
    /// Peer replicas (never includes the local replica).
    pub replicas: Vec<ReplicaInfo>,
    /// Replication servers of the topology.
    pub servers: Vec<PeerServerInfo>,
}

impl TopologyView {
    /// Looks up a peer replica by id.
    pub fn replica(&self, replica_id: ReplicaId) -> Option<&ReplicaInfo> {
        self.replicas.iter().find(|r| r.replica_id == replica_id)
    }

    /// Returns true if any known peer replication server carries `group_id`.
    pub fn has_server_with_group(&self, group_id: u8) -> bool {
        self.servers.iter().any(|s| s.group_id == group_id)
    }

    /// The ids of all peer replicas, in topology order.
    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        self.replicas.iter().map(|r| r.replica_id).collect()
    }
}
