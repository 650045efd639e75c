//! Monitoring counters for a replicated domain.
//!
//! All counters live in one struct of atomics behind accessor methods, so
//! synchronization concerns stay out of the protocol code paths.

use dirmesh_protocol::AssuredMode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters tracked for one domain; reset when the domain disconnects.
#[derive(Debug, Default)]
pub struct MonitorCounters {
    processed_updates: AtomicU64,
    received_updates: AtomicU64,
    sent_updates: AtomicU64,

    sr_sent: AtomicU64,
    sr_acknowledged: AtomicU64,
    sr_not_acknowledged: AtomicU64,
    sr_timeout: AtomicU64,
    sr_wrong_status: AtomicU64,
    sr_replay_error: AtomicU64,
    sr_received: AtomicU64,
    sr_received_acked: AtomicU64,
    sr_received_not_acked: AtomicU64,

    sd_sent: AtomicU64,
    sd_acknowledged: AtomicU64,
    sd_timeout: AtomicU64,

    sr_server_errors: Mutex<BTreeMap<u32, u64>>,
    sd_server_timeouts: Mutex<BTreeMap<u32, u64>>,
}

/// Point-in-time copy of the counters, for monitoring surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    /// Updates replayed locally.
    pub processed_updates: u64,
    /// Updates received from the replication server.
    pub received_updates: u64,
    /// Updates published to the replication server.
    pub sent_updates: u64,
    /// Safe-read updates sent.
    pub sr_sent: u64,
    /// Safe-read updates acknowledged without error.
    pub sr_acknowledged: u64,
    /// Safe-read updates not acknowledged properly.
    pub sr_not_acknowledged: u64,
    /// Safe-read updates that timed out.
    pub sr_timeout: u64,
    /// Safe-read updates refused for wrong status.
    pub sr_wrong_status: u64,
    /// Safe-read updates that failed replay on a peer.
    pub sr_replay_error: u64,
    /// Safe-read updates received from peers.
    pub sr_received: u64,
    /// Safe-read updates received and acked without error.
    pub sr_received_acked: u64,
    /// Safe-read updates received and acked with a replay error.
    pub sr_received_not_acked: u64,
    /// Safe-data updates sent.
    pub sd_sent: u64,
    /// Safe-data updates acknowledged without error.
    pub sd_acknowledged: u64,
    /// Safe-data updates that timed out.
    pub sd_timeout: u64,
    /// Safe-read failures per server.
    pub sr_server_errors: BTreeMap<u32, u64>,
    /// Safe-data timeouts per server.
    pub sd_server_timeouts: BTreeMap<u32, u64>,
}

impl MonitorCounters {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a locally replayed update.
    pub fn record_processed(&self) {
        self.processed_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an update received from the replication server.
    pub fn record_received(&self) {
        self.received_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a published update.
    pub fn record_sent(&self) {
        self.sent_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an assured update sent in the given mode.
    pub fn record_assured_sent(&self, mode: AssuredMode) {
        match mode {
            AssuredMode::SafeRead => self.sr_sent.fetch_add(1, Ordering::Relaxed),
            AssuredMode::SafeData => self.sd_sent.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Records a clean acknowledgment.
    pub fn record_ack_success(&self, mode: AssuredMode) {
        match mode {
            AssuredMode::SafeRead => self.sr_acknowledged.fetch_add(1, Ordering::Relaxed),
            AssuredMode::SafeData => self.sd_acknowledged.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Records an acknowledgment carrying failure flags.
    pub fn record_ack_failure(
        &self,
        mode: AssuredMode,
        timeout: bool,
        replay_error: bool,
        wrong_status: bool,
        failed_servers: &[u32],
    ) {
        match mode {
            AssuredMode::SafeRead => {
                self.sr_not_acknowledged.fetch_add(1, Ordering::Relaxed);
                if timeout {
                    self.sr_timeout.fetch_add(1, Ordering::Relaxed);
                }
                if replay_error {
                    self.sr_replay_error.fetch_add(1, Ordering::Relaxed);
                }
                if wrong_status {
                    self.sr_wrong_status.fetch_add(1, Ordering::Relaxed);
                }
                let mut map = self.sr_server_errors.lock().expect("counter lock");
                for server in failed_servers {
                    *map.entry(*server).or_insert(0) += 1;
                }
            }
            AssuredMode::SafeData => {
                // Safe-data acks can only fail on timeout.
                if timeout {
                    self.sd_timeout.fetch_add(1, Ordering::Relaxed);
                }
                let mut map = self.sd_server_timeouts.lock().expect("counter lock");
                for server in failed_servers {
                    *map.entry(*server).or_insert(0) += 1;
                }
            }
        }
    }

    /// Records a local wait for an ack that timed out, charged to `server_id`.
    pub fn record_local_timeout(&self, mode: AssuredMode, server_id: u32) {
        match mode {
            AssuredMode::SafeRead => {
                self.sr_not_acknowledged.fetch_add(1, Ordering::Relaxed);
                self.sr_timeout.fetch_add(1, Ordering::Relaxed);
                let mut map = self.sr_server_errors.lock().expect("counter lock");
                *map.entry(server_id).or_insert(0) += 1;
            }
            AssuredMode::SafeData => {
                self.sd_timeout.fetch_add(1, Ordering::Relaxed);
                let mut map = self.sd_server_timeouts.lock().expect("counter lock");
                *map.entry(server_id).or_insert(0) += 1;
            }
        }
    }

    /// Records a safe-read update received from a peer.
    pub fn record_sr_received(&self) {
        self.sr_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the ack we sent back for a received safe-read update.
    pub fn record_sr_received_ack(&self, clean: bool) {
        if clean {
            self.sr_received_acked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sr_received_not_acked.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Takes a consistent-enough copy of all counters.
    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            processed_updates: self.processed_updates.load(Ordering::Relaxed),
            received_updates: self.received_updates.load(Ordering::Relaxed),
            sent_updates: self.sent_updates.load(Ordering::Relaxed),
            sr_sent: self.sr_sent.load(Ordering::Relaxed),
            sr_acknowledged: self.sr_acknowledged.load(Ordering::Relaxed),
            sr_not_acknowledged: self.sr_not_acknowledged.load(Ordering::Relaxed),
            sr_timeout: self.sr_timeout.load(Ordering::Relaxed),
            sr_wrong_status: self.sr_wrong_status.load(Ordering::Relaxed),
            sr_replay_error: self.sr_replay_error.load(Ordering::Relaxed),
            sr_received: self.sr_received.load(Ordering::Relaxed),
            sr_received_acked: self.sr_received_acked.load(Ordering::Relaxed),
            sr_received_not_acked: self.sr_received_not_acked.load(Ordering::Relaxed),
            sd_sent: self.sd_sent.load(Ordering::Relaxed),
            sd_acknowledged: self.sd_acknowledged.load(Ordering::Relaxed),
            sd_timeout: self.sd_timeout.load(Ordering::Relaxed),
            sr_server_errors: self.sr_server_errors.lock().expect("counter lock").clone(),
            sd_server_timeouts: self.sd_server_timeouts.lock().expect("counter lock").clone(),
        }
    }

    /// Zeroes every counter; called when the domain disconnects.
    pub fn reset(&self) {
        self.processed_updates.store(0, Ordering::Relaxed);
        self.received_updates.store(0, Ordering::Relaxed);
        self.sent_updates.store(0, Ordering::Relaxed);
        self.sr_sent.store(0, Ordering::Relaxed);
        self.sr_acknowledged.store(0, Ordering::Relaxed);
        self.sr_not_acknowledged.store(0, Ordering::Relaxed);
        self.sr_timeout.store(0, Ordering::Relaxed);
        self.sr_wrong_status.store(0, Ordering::Relaxed);
        self.sr_replay_error.store(0, Ordering::Relaxed);
        self.sr_received.store(0, Ordering::Relaxed);
        self.sr_received_acked.store(0, Ordering::Relaxed);
        self.sr_received_not_acked.store(0, Ordering::Relaxed);
        self.sd_sent.store(0, Ordering::Relaxed);
        self.sd_acknowledged.store(0, Ordering::Relaxed);
        self.sd_timeout.store(0, Ordering::Relaxed);
        self.sr_server_errors.lock().expect("counter lock").clear();
        self.sd_server_timeouts.lock().expect("counter lock").clear();
    }
}
