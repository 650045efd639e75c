//! Replica status and the status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operational status of a replica within its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Not connected to any replication server.
    NotConnected,
    /// Connected and replaying changes in time.
    Normal,
    /// Connected but late beyond the degraded threshold.
    Degraded,
    /// Receiving a full content initialization from a peer.
    FullUpdate,
    /// Connected to a server holding data from a different generation.
    BadGenId,
    /// Sentinel for an impossible transition; never stored.
    Invalid,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::NotConnected => "not-connected",
            ServerStatus::Normal => "normal",
            ServerStatus::Degraded => "degraded",
            ServerStatus::FullUpdate => "full-update",
            ServerStatus::BadGenId => "bad-gen-id",
            ServerStatus::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Events driving status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusEvent {
    /// Session lost or service disabled.
    ToNotConnected,
    /// Session established (or caught up) in normal condition.
    ToNormal,
    /// Late threshold crossed.
    ToDegraded,
    /// Full content initialization starting.
    ToFullUpdate,
    /// Generation id mismatch detected.
    ToBadGenId,
}

impl StatusEvent {
    /// Maps a requested status (as carried by a change-status message) to the
    /// event that would drive the machine there.
    pub fn for_target(status: ServerStatus) -> Option<StatusEvent> {
        match status {
            ServerStatus::NotConnected => Some(StatusEvent::ToNotConnected),
            ServerStatus::Normal => Some(StatusEvent::ToNormal),
            ServerStatus::Degraded => Some(StatusEvent::ToDegraded),
            ServerStatus::FullUpdate => Some(StatusEvent::ToFullUpdate),
            ServerStatus::BadGenId => Some(StatusEvent::ToBadGenId),
            ServerStatus::Invalid => None,
        }
    }
}

/// Computes the status reached from `current` on `event`.
///
/// Returns [`ServerStatus::Invalid`] for transitions the machine does not
/// allow; callers log and keep the current status in that case.
pub fn next_status(current: ServerStatus, event: StatusEvent) -> ServerStatus {
    use ServerStatus::*;
    use StatusEvent::*;
    match (current, event) {
        (NotConnected, ToNotConnected) => NotConnected,
        (NotConnected, ToNormal) => Normal,
        (NotConnected, ToDegraded) => Degraded,
        (NotConnected, ToBadGenId) => BadGenId,

        (Normal, ToNotConnected) => NotConnected,
        (Normal, ToNormal) => Normal,
        (Normal, ToDegraded) => Degraded,
        (Normal, ToFullUpdate) => FullUpdate,
        (Normal, ToBadGenId) => BadGenId,

        (Degraded, ToNotConnected) => NotConnected,
        (Degraded, ToNormal) => Normal,
        (Degraded, ToDegraded) => Degraded,
        (Degraded, ToFullUpdate) => FullUpdate,
        (Degraded, ToBadGenId) => BadGenId,

        // A full update ends with a session restart, so the only way out is
        // through disconnection.
        (FullUpdate, ToNotConnected) => NotConnected,

        (BadGenId, ToNotConnected) => NotConnected,
        (BadGenId, ToBadGenId) => BadGenId,
        (BadGenId, ToFullUpdate) => FullUpdate,

        _ => Invalid,
    }
}

/// Returns true if `status` is acceptable as the initial status of a freshly
/// established session.
pub fn is_valid_initial_status(status: ServerStatus) -> bool {
    matches!(
        status,
        ServerStatus::Normal | ServerStatus::Degraded | ServerStatus::BadGenId
    )
}
