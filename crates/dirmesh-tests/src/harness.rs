//! In-process replication server used by the end-to-end scenarios.
//!
//! Implements the server side of the replication protocol faithfully enough
//! to drive replicas through both handshake phases, push topology updates,
//! fan updates out, credit windows back, and route total-update traffic.

use dirmesh_protocol::{
    PeerServerInfo, ReplServerStartMsg, ReplicaInfo, ReplicationMsg, ServerState, ServerStatus,
    StartSessionMsg, TopologyView, PROTOCOL_VERSION,
};
use dirmesh_repl::heartbeat::spawn_publisher;
use dirmesh_repl::{ReplicationSession, TcpSession};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Configuration of a test replication server.
#[derive(Debug, Clone)]
pub struct TestServerConfig {
    /// Server id announced in handshakes.
    pub server_id: u32,
    /// Group id announced in handshakes.
    pub group_id: u8,
    /// Data generation; `None` adopts the first connecting replica's.
    pub generation_id: Option<u64>,
    /// Send window granted to replicas.
    pub window_size: u32,
    /// Degraded-status threshold announced to replicas (0 disables).
    pub degraded_status_threshold: u64,
    /// Heartbeat publishing interval towards replicas (0 disables).
    pub heartbeat_interval_ms: u64,
    /// Whether received updates are credited back automatically at every
    /// half window, like a live server replaying promptly.
    pub auto_window_credit: bool,
}

impl Default for TestServerConfig {
    fn default() -> Self {
        Self {
            server_id: 101,
            group_id: 1,
            generation_id: None,
            window_size: 100,
            degraded_status_threshold: 0,
            heartbeat_interval_ms: 0,
            auto_window_credit: true,
        }
    }
}

struct ConnEntry {
    session: Arc<TcpSession>,
    replica_id: u32,
    group_id: u8,
    generation: Option<u64>,
    protocol_version: u8,
    referral_urls: Vec<String>,
    status: Mutex<ServerStatus>,
    update_credit: AtomicU64,
    epoch: u64,
}

struct ServerInner {
    cfg: TestServerConfig,
    addr: Mutex<String>,
    generation: Mutex<Option<u64>>,
    state: Mutex<ServerState>,
    conns: Mutex<BTreeMap<u32, Arc<ConnEntry>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_epoch: AtomicU64,
}

impl ServerInner {
    fn topology_for(&self, exclude_replica: u32) -> TopologyView {
        let conns = self.conns.lock().unwrap();
        let replicas = conns
            .values()
            .filter(|c| c.replica_id != exclude_replica)
            .map(|c| ReplicaInfo {
                replica_id: c.replica_id,
                server_id: self.cfg.server_id,
                status: *c.status.lock().unwrap(),
                generation_id: c.generation,
                group_id: c.group_id,
                protocol_version: c.protocol_version,
                referral_urls: c.referral_urls.clone(),
            })
            .collect();
        let servers = vec![PeerServerInfo {
            server_id: self.cfg.server_id,
            server_url: self.addr.lock().unwrap().clone(),
            generation_id: *self.generation.lock().unwrap(),
            group_id: self.cfg.group_id,
        }];
        TopologyView { replicas, servers }
    }

    fn peers(&self) -> Vec<Arc<ConnEntry>> {
        self.conns.lock().unwrap().values().cloned().collect()
    }

    async fn broadcast_topology(&self) {
        for conn in self.peers() {
            let view = self.topology_for(conn.replica_id);
            let _ = conn.session.publish(&ReplicationMsg::Topology(view)).await;
        }
    }

    async fn forward_to_others(&self, sender: u32, msg: &ReplicationMsg) {
        for conn in self.peers() {
            if conn.replica_id != sender {
                let _ = conn.session.publish(msg).await;
            }
        }
    }

    async fn route_to_target(
        &self,
        sender: u32,
        target: dirmesh_protocol::InitTarget,
        msg: &ReplicationMsg,
    ) {
        for conn in self.peers() {
            if conn.replica_id != sender && target.matches(conn.replica_id) {
                let _ = conn.session.publish(msg).await;
            }
        }
    }

    async fn route_to_replica(&self, replica_id: u32, msg: &ReplicationMsg) {
        let conn = self.conns.lock().unwrap().get(&replica_id).cloned();
        if let Some(conn) = conn {
            let _ = conn.session.publish(msg).await;
        }
    }

    async fn handle(&self, entry: &Arc<ConnEntry>, msg: ReplicationMsg) {
        match msg {
            ReplicationMsg::Update(ref update) => {
                self.state.lock().unwrap().update(update.csn);
                if self.cfg.auto_window_credit {
                    let half = u64::from(self.cfg.window_size / 2).max(1);
                    let credit = entry.update_credit.fetch_add(1, Ordering::AcqRel) + 1;
                    if credit >= half {
                        entry.update_credit.store(0, Ordering::Release);
                        let _ = entry
                            .session
                            .publish(&ReplicationMsg::Window {
                                num_ack: credit as u32,
                            })
                            .await;
                    }
                }
                self.forward_to_others(entry.replica_id, &msg).await;
            }
            ReplicationMsg::Ack(_) | ReplicationMsg::InitializeRcvAck { .. } => {
                self.forward_to_others(entry.replica_id, &msg).await;
            }
            ReplicationMsg::ChangeStatus(cs) => {
                if let Some(new_status) = cs.new_status {
                    *entry.status.lock().unwrap() = new_status;
                    self.broadcast_topology().await;
                }
            }
            ReplicationMsg::InitializeRequest(ref req) => {
                self.route_to_replica(req.source, &msg).await;
            }
            ReplicationMsg::InitializeTarget(ref init) => {
                self.route_to_target(entry.replica_id, init.target, &msg).await;
            }
            ReplicationMsg::Entry(ref e) => {
                self.route_to_target(entry.replica_id, e.target, &msg).await;
            }
            ReplicationMsg::Done { target, .. } => {
                self.route_to_target(entry.replica_id, target, &msg).await;
            }
            ReplicationMsg::Error(ref e) => {
                self.route_to_target(entry.replica_id, e.target, &msg).await;
            }
            ReplicationMsg::ResetGenerationId { generation_id } => {
                *self.generation.lock().unwrap() = generation_id;
                if generation_id.is_none() {
                    *self.state.lock().unwrap() = ServerState::new();
                }
                self.broadcast_topology().await;
            }
            ReplicationMsg::Heartbeat | ReplicationMsg::WindowProbe => {}
            other => {
                tracing::debug!(kind = other.kind(), "test server ignoring message");
            }
        }
    }
}

async fn serve_conn(inner: Arc<ServerInner>, session: Arc<TcpSession>) {
    // Handshake phase 1.
    let start = match session.receive(Duration::from_secs(5)).await {
        Ok(ReplicationMsg::ServerStart(start)) => start,
        _ => return,
    };
    {
        let mut generation = inner.generation.lock().unwrap();
        if generation.is_none() {
            *generation = start.generation_id;
        }
    }
    let reply = ReplServerStartMsg {
        domain: start.domain.clone(),
        server_id: inner.cfg.server_id,
        server_url: inner.addr.lock().unwrap().clone(),
        server_state: inner.state.lock().unwrap().clone(),
        window_size: inner.cfg.window_size,
        protocol_version: PROTOCOL_VERSION,
        generation_id: *inner.generation.lock().unwrap(),
        group_id: inner.cfg.group_id,
        degraded_status_threshold: inner.cfg.degraded_status_threshold,
    };
    if session
        .publish(&ReplicationMsg::ReplServerStart(reply))
        .await
        .is_err()
    {
        return;
    }

    // Phase 2; probe connections close here instead.
    let start_session: StartSessionMsg = match session.receive(Duration::from_secs(10)).await {
        Ok(ReplicationMsg::StartSession(ss)) => ss,
        _ => return,
    };

    let entry = Arc::new(ConnEntry {
        session: session.clone(),
        replica_id: start.replica_id,
        group_id: start.group_id,
        generation: start.generation_id,
        protocol_version: start.protocol_version,
        referral_urls: start_session.referral_urls.clone(),
        status: Mutex::new(start_session.status),
        update_credit: AtomicU64::new(0),
        epoch: inner.next_epoch.fetch_add(1, Ordering::AcqRel),
    });
    let replaced = inner
        .conns
        .lock()
        .unwrap()
        .insert(entry.replica_id, entry.clone());
    if let Some(replaced) = replaced {
        replaced.session.close();
    }
    inner.broadcast_topology().await;

    let _heartbeat = (inner.cfg.heartbeat_interval_ms > 0).then(|| {
        spawn_publisher(
            session.clone(),
            Duration::from_millis(inner.cfg.heartbeat_interval_ms),
        )
    });

    loop {
        match session.receive(Duration::from_secs(1)).await {
            Ok(msg) => inner.handle(&entry, msg).await,
            Err(dirmesh_repl::ReplError::Timeout(_)) => continue,
            Err(_) => break,
        }
    }

    // Unregister only if this connection is still the current one for the
    // replica (an import restart may have replaced it already).
    {
        let mut conns = inner.conns.lock().unwrap();
        if conns
            .get(&entry.replica_id)
            .map(|c| c.epoch == entry.epoch)
            .unwrap_or(false)
        {
            conns.remove(&entry.replica_id);
        }
    }
    inner.broadcast_topology().await;
}

/// An in-process replication server listening on a loopback TCP port.
pub struct TestReplicationServer {
    addr: String,
    inner: Arc<ServerInner>,
    accept: JoinHandle<()>,
}

impl TestReplicationServer {
    /// Starts a server with the given configuration.
    pub async fn start(cfg: TestServerConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let inner = Arc::new(ServerInner {
            cfg,
            addr: Mutex::new(addr.clone()),
            generation: Mutex::new(None),
            state: Mutex::new(ServerState::new()),
            conns: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(Vec::new()),
            next_epoch: AtomicU64::new(0),
        });
        {
            let mut generation = inner.generation.lock().unwrap();
            *generation = inner.cfg.generation_id;
        }
        let accept = {
            let inner = inner.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            let session = Arc::new(TcpSession::from_stream(stream));
                            let task = tokio::spawn(serve_conn(inner.clone(), session));
                            inner.tasks.lock().unwrap().push(task);
                        }
                        Err(_) => return,
                    }
                }
            })
        };
        Ok(Self {
            addr,
            inner,
            accept,
        })
    }

    /// The `host:port` the server listens on.
    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// The status last announced by a connected replica.
    pub fn replica_status(&self, replica_id: u32) -> Option<ServerStatus> {
        self.inner
            .conns
            .lock()
            .unwrap()
            .get(&replica_id)
            .map(|c| *c.status.lock().unwrap())
    }

    /// Ids of the currently connected replicas.
    pub fn connected_replicas(&self) -> Vec<u32> {
        self.inner.conns.lock().unwrap().keys().copied().collect()
    }

    /// The server's cumulative view of the domain state.
    pub fn server_state(&self) -> ServerState {
        self.inner.state.lock().unwrap().clone()
    }

    /// Stops the server and closes every connection.
    pub async fn stop(&self) {
        self.accept.abort();
        for conn in self.inner.peers() {
            conn.session.close();
        }
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for TestReplicationServer {
    fn drop(&mut self) {
        self.accept.abort();
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// A hand-driven replica connection, for scenarios that need precise
/// control over individual protocol messages.
pub struct RawReplica {
    /// The underlying session.
    pub session: Arc<TcpSession>,
    /// The replica id announced during the handshake.
    pub replica_id: u32,
}

impl RawReplica {
    /// Connects and completes both handshake phases with the given identity,
    /// starting in normal status.
    pub async fn connect(
        addr: &str,
        domain: &str,
        replica_id: u32,
        group_id: u8,
        generation_id: Option<u64>,
    ) -> anyhow::Result<Self> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let session = Arc::new(TcpSession::from_stream(stream));

        session
            .publish(&ReplicationMsg::ServerStart(
                dirmesh_protocol::ServerStartMsg {
                    domain: domain.to_string(),
                    replica_id,
                    server_state: ServerState::new(),
                    window_size: 100,
                    heartbeat_interval_ms: 0,
                    protocol_version: PROTOCOL_VERSION,
                    generation_id,
                    group_id,
                },
            ))
            .await?;
        match session.receive(Duration::from_secs(5)).await? {
            ReplicationMsg::ReplServerStart(_) => {}
            other => anyhow::bail!("expected repl-server-start, got {}", other.kind()),
        }

        session
            .publish(&ReplicationMsg::StartSession(StartSessionMsg {
                status: ServerStatus::Normal,
                referral_urls: vec![],
                assured: false,
                assured_mode: dirmesh_protocol::AssuredMode::SafeData,
                safe_data_level: 1,
            }))
            .await?;
        match session.receive(Duration::from_secs(5)).await? {
            ReplicationMsg::Topology(_) => {}
            other => anyhow::bail!("expected topology, got {}", other.kind()),
        }

        Ok(Self {
            session,
            replica_id,
        })
    }

    /// Announces a status transition to the server.
    pub async fn set_status(&self, status: ServerStatus) -> anyhow::Result<()> {
        self.session
            .publish(&ReplicationMsg::ChangeStatus(
                dirmesh_protocol::ChangeStatusMsg {
                    requested_status: None,
                    new_status: Some(status),
                },
            ))
            .await?;
        Ok(())
    }

    /// Sends one message as-is.
    pub async fn send(&self, msg: &ReplicationMsg) -> anyhow::Result<()> {
        self.session.publish(msg).await?;
        Ok(())
    }

    /// Receives the next message that is not topology or liveness noise.
    pub async fn recv_data(&self, timeout: Duration) -> anyhow::Result<ReplicationMsg> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow::anyhow!("timed out waiting for a data message"))?;
            match self.session.receive(remaining).await? {
                ReplicationMsg::Topology(_)
                | ReplicationMsg::Heartbeat
                | ReplicationMsg::Window { .. }
                | ReplicationMsg::WindowProbe => continue,
                msg => return Ok(msg),
            }
        }
    }
}
