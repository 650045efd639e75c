//! Configuration for a replicated domain.

use dirmesh_protocol::{AssuredMode, ReplicaId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Assured replication settings.
///
/// These can change at runtime without a session restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssuredConfig {
    /// Whether published updates request an acknowledgment.
    pub enabled: bool,
    /// Acknowledgment discipline.
    pub mode: AssuredMode,
    /// Number of replication servers that must persist a safe-data update.
    pub safe_data_level: u8,
    /// How long a publisher waits for an acknowledgment, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for AssuredConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: AssuredMode::SafeData,
            safe_data_level: 1,
            timeout_ms: 2000,
        }
    }
}

/// How many attempts a total update may make after a connection loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts for a locally task-driven export to a single peer.
    pub export_attempts: u32,
    /// Attempts for a locally task-driven import.
    pub import_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            export_attempts: 2,
            import_attempts: 2,
        }
    }
}

/// Configuration of one replicated domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Identifier of the replicated service (base identifier). All replicas
    /// sharing it converge to the same content.
    pub service_id: String,
    /// Identifier of this replica, unique within the domain.
    pub replica_id: ReplicaId,
    /// Candidate replication server addresses (`host:port`).
    pub servers: Vec<String>,
    /// Receive window size offered to the replication server.
    pub window_size: u32,
    /// Heartbeat interval in milliseconds; 0 disables heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Group id used to prefer same-locality replication servers.
    pub group_id: u8,
    /// Data generation this replica holds, when computed.
    pub generation_id: Option<u64>,
    /// Referral URLs published to the topology.
    pub referral_urls: Vec<String>,
    /// Assured replication settings.
    pub assured: AssuredConfig,
    /// Flow-control window for total-update entry streams.
    pub init_window: u32,
    /// Connection establishment timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Session read timeout in milliseconds; bounds every blocking receive so
    /// shutdown is noticed promptly.
    pub receive_timeout_ms: u64,
    /// Retry policy for total updates interrupted by connection loss.
    pub retry: RetryPolicy,
}

impl DomainConfig {
    /// Creates a configuration with defaults for the given identity.
    pub fn new(service_id: impl Into<String>, replica_id: ReplicaId, servers: Vec<String>) -> Self {
        Self {
            service_id: service_id.into(),
            replica_id,
            servers,
            window_size: 100,
            heartbeat_interval_ms: 10_000,
            group_id: 1,
            generation_id: None,
            referral_urls: Vec::new(),
            assured: AssuredConfig::default(),
            init_window: 100,
            connect_timeout_ms: 500,
            receive_timeout_ms: 1000,
            retry: RetryPolicy::default(),
        }
    }

    /// Connection establishment timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Session read timeout.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Heartbeat interval; `None` when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0)
            .then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    /// Returns true if `other` differs in a way that requires a session
    /// restart (servers, window, heartbeat interval or group id).
    pub fn requires_restart(&self, other: &DomainConfig) -> bool {
        self.servers != other.servers
            || self.window_size != other.window_size
            || self.heartbeat_interval_ms != other.heartbeat_interval_ms
            || self.group_id != other.group_id
    }
}
