//! Error types for the replication service.

use dirmesh_protocol::ProtocolError;
use thiserror::Error;

/// Errors that can occur in the replication service.
#[derive(Debug, Error)]
pub enum ReplError {
    /// I/O failure on a session.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Wire encoding or decoding failure.
    #[error("protocol error")]
    Protocol(#[from] ProtocolError),

    /// A bounded wait elapsed before the expected event.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The session was closed by either side.
    #[error("session closed")]
    SessionClosed,

    /// The peer answered for a different replicated domain.
    #[error("domain mismatch: expected {expected}, got {got}")]
    DomainMismatch {
        /// The locally configured domain identifier.
        expected: String,
        /// The identifier the peer answered with.
        got: String,
    },

    /// An unexpected message arrived at a point of the protocol.
    #[error("unexpected {got} message while waiting for {expected}")]
    UnexpectedMessage {
        /// The message role that was expected.
        expected: &'static str,
        /// The message role that arrived.
        got: &'static str,
    },

    /// An entry message arrived out of sequence during an import.
    #[error("bad entry sequence: expected msg id {expected}, got {got}")]
    BadMsgSequence {
        /// The expected next message id.
        expected: u64,
        /// The message id that arrived.
        got: u64,
    },

    /// A total update was requested while another one is running.
    #[error("another full initialization is already in progress")]
    SimultaneousImportExport,

    /// The operation requires a connected broker.
    #[error("not connected to any replication server")]
    NotConnected,

    /// No peer replica is available for the requested operation.
    #[error("no reachable peer replica for {0}")]
    NoReachablePeer(String),

    /// The storage backend reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// A running import or export was aborted.
    #[error("full initialization aborted: {0}")]
    ImportExportAborted(String),

    /// Some targeted replicas did not complete their initialization.
    #[error("initialization incomplete for replicas {0:?}")]
    InitIncomplete(Vec<u32>),

    /// The service is shutting down.
    #[error("replication service shut down")]
    Shutdown,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplError>;
