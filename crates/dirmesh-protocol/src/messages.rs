//! Replication wire messages.
//!
//! Every message exchanged between a replica and a replication server is a
//! variant of [`ReplicationMsg`], serialized with bincode inside a 4-byte
//! big-endian length-prefixed frame. The protocol state machines only care
//! about the message roles; payload contents are opaque to the transport.

use crate::csn::{Csn, ReplicaId};
use crate::error::ProtocolError;
use crate::state::ServerState;
use crate::status::ServerStatus;
use crate::topology::TopologyView;
use serde::{Deserialize, Serialize};

/// Version of the replication protocol spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 4;

/// Maximum accepted frame payload size.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Acknowledgment discipline for assured replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssuredMode {
    /// Wait until the designated peers have replayed the change.
    SafeRead,
    /// Wait until enough replication servers have persisted the change.
    SafeData,
}

/// First message of handshake phase 1, sent by the replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStartMsg {
    /// Identifier of the replicated domain (base identifier).
    pub domain: String,
    /// The connecting replica.
    pub replica_id: ReplicaId,
    /// The replica's current server state.
    pub server_state: ServerState,
    /// Receive window size the replica offers.
    pub window_size: u32,
    /// Heartbeat interval requested, in milliseconds (0 disables heartbeats).
    pub heartbeat_interval_ms: u64,
    /// Protocol version the replica speaks.
    pub protocol_version: u8,
    /// Data generation the replica holds, when computed.
    pub generation_id: Option<u64>,
    /// Group the replica belongs to.
    pub group_id: u8,
}

/// Reply to [`ServerStartMsg`], completing handshake phase 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplServerStartMsg {
    /// Identifier of the replicated domain (base identifier).
    pub domain: String,
    /// The replying replication server.
    pub server_id: u32,
    /// Address the server listens on.
    pub server_url: String,
    /// The server's view of the domain state.
    pub server_state: ServerState,
    /// Send window size the server grants to the replica.
    pub window_size: u32,
    /// Protocol version the server speaks.
    pub protocol_version: u8,
    /// Data generation the server holds, when known.
    pub generation_id: Option<u64>,
    /// Group the server belongs to.
    pub group_id: u8,
    /// Number of pending changes beyond which a replica is degraded
    /// (0 disables degraded detection).
    pub degraded_status_threshold: u64,
}

/// First message of handshake phase 2, sent by the replica on the chosen
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSessionMsg {
    /// Status the replica starts the session in.
    pub status: ServerStatus,
    /// Referral URLs the replica publishes.
    pub referral_urls: Vec<String>,
    /// Whether assured replication is enabled on the replica.
    pub assured: bool,
    /// Assured mode in use when enabled.
    pub assured_mode: AssuredMode,
    /// Safe-data level when the mode is safe-data.
    pub safe_data_level: u8,
}

/// Requests or announces a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatusMsg {
    /// Status the replication server asks the replica to enter.
    pub requested_status: Option<ServerStatus>,
    /// Status the replica announces it has entered.
    pub new_status: Option<ServerStatus>,
}

/// Acknowledgment of an assured update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMsg {
    /// The acknowledged change.
    pub csn: Csn,
    /// At least one server timed out.
    pub timeout: bool,
    /// At least one server failed to replay the change.
    pub replay_error: bool,
    /// At least one server was in a status excluding it from acknowledgment.
    pub wrong_status: bool,
    /// Servers that did not acknowledge properly.
    pub failed_servers: Vec<u32>,
}

impl AckMsg {
    /// A fully successful acknowledgment for `csn`.
    pub fn success(csn: Csn) -> Self {
        Self {
            csn,
            timeout: false,
            replay_error: false,
            wrong_status: false,
            failed_servers: Vec::new(),
        }
    }

    /// Returns true if any failure flag is set.
    pub fn has_errors(&self) -> bool {
        self.timeout || self.replay_error || self.wrong_status
    }
}

/// An application change propagated through the domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMsg {
    /// Change sequence number assigned by the originating replica.
    pub csn: Csn,
    /// Whether the originator waits for an acknowledgment.
    pub assured: bool,
    /// Acknowledgment discipline when assured.
    pub assured_mode: AssuredMode,
    /// Safe-data level when the mode is safe-data.
    pub safe_data_level: u8,
    /// Opaque change payload.
    pub payload: Vec<u8>,
}

impl UpdateMsg {
    /// Creates a non-assured update carrying `payload`.
    pub fn new(csn: Csn, payload: Vec<u8>) -> Self {
        Self {
            csn,
            assured: false,
            assured_mode: AssuredMode::SafeData,
            safe_data_level: 1,
            payload,
        }
    }
}

/// Destination of a routable total-update message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitTarget {
    /// Every peer replica of the domain.
    All,
    /// One specific replica.
    Replica(ReplicaId),
}

impl InitTarget {
    /// Returns true if `replica_id` is addressed by this target.
    pub fn matches(&self, replica_id: ReplicaId) -> bool {
        match self {
            InitTarget::All => true,
            InitTarget::Replica(id) => *id == replica_id,
        }
    }
}

/// Announces a full content export about to be streamed to the target(s).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeTargetMsg {
    /// Identifier of the replicated domain.
    pub domain: String,
    /// The exporting replica.
    pub sender_id: ReplicaId,
    /// The replica(s) to be initialized.
    pub target: InitTarget,
    /// The replica on which the operation was requested.
    pub requestor_id: ReplicaId,
    /// Number of entries the export will stream.
    pub entry_count: u64,
    /// Flow-control window for the entry stream.
    pub init_window: u32,
}

/// Asks a peer replica to export its content to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeRequestMsg {
    /// Identifier of the replicated domain.
    pub domain: String,
    /// The replica requesting to be initialized.
    pub sender_id: ReplicaId,
    /// The replica that should perform the export.
    pub source: ReplicaId,
    /// Flow-control window the requester supports.
    pub init_window: u32,
}

/// One chunk of exported entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMsg {
    /// The exporting replica.
    pub sender_id: ReplicaId,
    /// The importing replica(s).
    pub target: InitTarget,
    /// Raw entry bytes; entries are delimited by a blank line.
    pub bytes: Vec<u8>,
    /// Strictly increasing per-export message id, starting at 1.
    pub msg_id: u64,
}

/// Reports a failure to a peer, timestamped so stale reports can be ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    /// The replica or server reporting the failure.
    pub sender_id: u32,
    /// The replica(s) the report is routed to.
    pub target: InitTarget,
    /// Human-readable failure detail.
    pub details: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

/// The complete replication message set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMsg {
    /// Handshake phase 1 request.
    ServerStart(ServerStartMsg),
    /// Handshake phase 1 reply.
    ReplServerStart(ReplServerStartMsg),
    /// Handshake phase 2 request.
    StartSession(StartSessionMsg),
    /// Handshake phase 2 reply and periodic topology pushes.
    Topology(TopologyView),
    /// Status transition request or notification.
    ChangeStatus(ChangeStatusMsg),
    /// Assured replication acknowledgment.
    Ack(AckMsg),
    /// Flow-control credit: the peer has replayed `num_ack` updates.
    Window {
        /// Number of replayed updates being credited back.
        num_ack: u32,
    },
    /// Keepalive nudge when the send window appears stuck.
    WindowProbe,
    /// Application change.
    Update(UpdateMsg),
    /// Periodic liveness signal.
    Heartbeat,
    /// Full-update export announcement.
    InitializeTarget(InitializeTargetMsg),
    /// Full-update import request.
    InitializeRequest(InitializeRequestMsg),
    /// Full-update entry chunk.
    Entry(EntryMsg),
    /// Full-update flow-control acknowledgment.
    InitializeRcvAck {
        /// The acknowledging replica.
        sender_id: ReplicaId,
        /// Highest entry message id received so far.
        num_ack: u64,
    },
    /// Normal termination of a full-update stream.
    Done {
        /// The exporting replica.
        sender_id: ReplicaId,
        /// The importing replica(s).
        target: InitTarget,
    },
    /// Failure report.
    Error(ErrorMsg),
    /// Administrative request to reset the domain generation id.
    ResetGenerationId {
        /// The new generation id; `None` clears it.
        generation_id: Option<u64>,
    },
}

impl ReplicationMsg {
    /// Short name of the message role, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationMsg::ServerStart(_) => "server-start",
            ReplicationMsg::ReplServerStart(_) => "repl-server-start",
            ReplicationMsg::StartSession(_) => "start-session",
            ReplicationMsg::Topology(_) => "topology",
            ReplicationMsg::ChangeStatus(_) => "change-status",
            ReplicationMsg::Ack(_) => "ack",
            ReplicationMsg::Window { .. } => "window",
            ReplicationMsg::WindowProbe => "window-probe",
            ReplicationMsg::Update(_) => "update",
            ReplicationMsg::Heartbeat => "heartbeat",
            ReplicationMsg::InitializeTarget(_) => "initialize-target",
            ReplicationMsg::InitializeRequest(_) => "initialize-request",
            ReplicationMsg::Entry(_) => "entry",
            ReplicationMsg::InitializeRcvAck { .. } => "initialize-rcv-ack",
            ReplicationMsg::Done { .. } => "done",
            ReplicationMsg::Error(_) => "error",
            ReplicationMsg::ResetGenerationId { .. } => "reset-generation-id",
        }
    }

    /// Returns true for data-class messages, which consume window credit.
    pub fn is_update(&self) -> bool {
        matches!(self, ReplicationMsg::Update(_))
    }
}

/// Encodes a message into a length-prefixed frame ready for the wire.
pub fn encode_frame(msg: &ReplicationMsg) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::serialize(msg).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes a frame body (without the length prefix) into a message.
pub fn decode_body(body: &[u8]) -> Result<ReplicationMsg, ProtocolError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    bincode::deserialize(body).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> ServerState {
        let mut state = ServerState::new();
        state.update(Csn::new(1000, 2, 1));
        state.update(Csn::new(1001, 0, 2));
        state
    }

    #[test]
    fn frame_roundtrip() {
        let msg = ReplicationMsg::ReplServerStart(ReplServerStartMsg {
            domain: "dc=example".into(),
            server_id: 101,
            server_url: "rs1:8989".into(),
            server_state: sample_state(),
            window_size: 100,
            protocol_version: PROTOCOL_VERSION,
            generation_id: Some(42),
            group_id: 1,
            degraded_status_threshold: 5000,
        });

        let frame = encode_frame(&msg).unwrap();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        let decoded = decode_body(&frame[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn update_roundtrip_preserves_assured_settings() {
        let mut msg = UpdateMsg::new(Csn::new(7, 0, 3), b"cn=test\nsn=x\n\n".to_vec());
        msg.assured = true;
        msg.assured_mode = AssuredMode::SafeRead;
        let frame = encode_frame(&ReplicationMsg::Update(msg.clone())).unwrap();
        match decode_body(&frame[4..]).unwrap() {
            ReplicationMsg::Update(u) => assert_eq!(u, msg),
            other => panic!("unexpected message {}", other.kind()),
        }
    }

    #[test]
    fn only_updates_consume_window_credit() {
        let update = ReplicationMsg::Update(UpdateMsg::new(Csn::new(1, 0, 1), vec![]));
        assert!(update.is_update());
        assert!(!ReplicationMsg::Heartbeat.is_update());
        assert!(!ReplicationMsg::Window { num_ack: 3 }.is_update());
        assert!(!ReplicationMsg::Entry(EntryMsg {
            sender_id: 1,
            target: InitTarget::All,
            bytes: vec![],
            msg_id: 1,
        })
        .is_update());
    }

    #[test]
    fn init_target_matching() {
        assert!(InitTarget::All.matches(9));
        assert!(InitTarget::Replica(9).matches(9));
        assert!(!InitTarget::Replica(9).matches(8));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_body(&[0xff, 0xfe, 0xfd]).is_err());
    }
}
