#![warn(missing_docs)]

//! DirMesh replication protocol: change sequence numbers, per-replica server
//! state, the server status machine, topology records and the wire message set
//! exchanged between replicas and replication servers.

pub mod csn;
pub mod error;
pub mod messages;
pub mod state;
pub mod status;
pub mod topology;

pub use csn::{Csn, CsnGenerator, ReplicaId};
pub use error::ProtocolError;
pub use messages::{
    AckMsg, AssuredMode, ChangeStatusMsg, EntryMsg, ErrorMsg, InitTarget, InitializeRequestMsg,
    InitializeTargetMsg, ReplServerStartMsg, ReplicationMsg, ServerStartMsg, StartSessionMsg,
    UpdateMsg, PROTOCOL_VERSION,
};
pub use state::ServerState;
pub use status::{next_status, ServerStatus, StatusEvent};
pub use topology::{PeerServerInfo, ReplicaInfo, TopologyView};
