//! Heartbeat watchdogs for replication sessions.
//!
//! The monitor closes a session over which nothing (not even a heartbeat)
//! has been received for too long, forcing the owner to reconnect; the
//! publisher periodically emits heartbeats so the peer's monitor stays
//! quiet.

use crate::session::ReplicationSession;
use dirmesh_protocol::ReplicationMsg;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle on a spawned heartbeat task; aborts the task when stopped.
#[derive(Debug)]
pub struct HeartbeatHandle {
    handle: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stops the heartbeat task.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawns a monitor closing `session` when no message has been received for
/// two heartbeat intervals.
pub fn spawn_monitor(session: Arc<dyn ReplicationSession>, interval: Duration) -> HeartbeatHandle {
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if session.is_closed() {
                return;
            }
            let silence = session.last_receive_elapsed();
            if silence > interval * 2 {
                tracing::warn!(
                    peer = session.peer(),
                    silence_ms = silence.as_millis() as u64,
                    "heartbeat missed, closing session"
                );
                session.close();
                return;
            }
        }
    });
    HeartbeatHandle { handle }
}

/// Spawns a publisher sending a heartbeat on `session` every `interval`.
///
/// The publisher stops on the first failed send; the receive path of the
/// session owner is responsible for noticing the broken session.
pub fn spawn_publisher(
    session: Arc<dyn ReplicationSession>,
    interval: Duration,
) -> HeartbeatHandle {
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if session.publish(&ReplicationMsg::Heartbeat).await.is_err() {
                tracing::debug!(peer = session.peer(), "heartbeat publisher stopping");
                return;
            }
        }
    });
    HeartbeatHandle { handle }
}
