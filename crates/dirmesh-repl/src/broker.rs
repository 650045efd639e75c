//! The replication broker: owns the one session a replica keeps to a
//! replication server, performs discovery and the two-phase handshake,
//! enforces bidirectional flow control and recovers from connection loss.

use crate::config::DomainConfig;
use crate::error::{ReplError, Result};
use crate::heartbeat::{spawn_monitor, HeartbeatHandle};
use crate::selection::{compute_initial_status, select_best_server, CandidateInfo};
use crate::session::{ReplicationSession, SessionConnector};
use dirmesh_protocol::{
    ChangeStatusMsg, ReplServerStartMsg, ReplicationMsg, ServerStartMsg, ServerState, ServerStatus,
    StartSessionMsg, TopologyView, PROTOCOL_VERSION,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

/// Maximum time granted to each handshake message exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);
/// Bounded wait for one send-window permit before probing the peer.
const WINDOW_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);
/// Backoff between reconnection attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
/// Pause between publish retries while the session is re-established.
const PUBLISH_RETRY_WAIT: Duration = Duration::from_millis(100);
/// Period of the same-group poller.
const GROUP_POLL_PERIOD: Duration = Duration::from_secs(5);

/// Callbacks into the owning domain, fired from the broker's connection
/// logic.
pub trait BrokerEvents: Send + Sync {
    /// A session has been established; the domain enters `init_status`.
    fn session_established(
        &self,
        init_status: ServerStatus,
        server_state: &ServerState,
        server_generation: Option<u64>,
    );

    /// The broker lost (or is replacing) its session.
    fn disconnected(&self);
}

/// Connection state guarded by one lock: a publisher captures the session,
/// the send window and the epoch together, so it can never pair a stale
/// session with a fresh semaphore.
struct ConnState {
    session: Option<Arc<dyn ReplicationSession>>,
    send_window: Arc<Semaphore>,
    epoch: u64,
    connected: bool,
    max_send_window: u32,
    server_id: Option<u32>,
    server_url: Option<String>,
    server_group_id: Option<u8>,
    protocol_version: u8,
}

impl ConnState {
    fn new() -> Self {
        Self {
            session: None,
            send_window: Arc::new(Semaphore::new(0)),
            epoch: 0,
            connected: false,
            max_send_window: 0,
            server_id: None,
            server_url: None,
            server_group_id: None,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    fn current(&self) -> Option<(Arc<dyn ReplicationSession>, Arc<Semaphore>, u64)> {
        if !self.connected {
            return None;
        }
        self.session
            .as_ref()
            .map(|s| (s.clone(), self.send_window.clone(), self.epoch))
    }
}

/// The broker for multi-master replication.
pub struct ReplicationBroker {
    cfg: Arc<StdMutex<DomainConfig>>,
    state: Arc<StdMutex<ServerState>>,
    generation: Arc<StdMutex<Option<u64>>>,
    connector: Arc<dyn SessionConnector>,
    events: StdMutex<Option<Weak<dyn BrokerEvents>>>,

    conn: StdMutex<ConnState>,
    /// Notified whenever a connection attempt concludes, waking publishers.
    connect_notify: Notify,
    /// Serializes connection attempts.
    connect_phase: tokio::sync::Mutex<()>,

    topology: StdMutex<TopologyView>,

    shutdown: AtomicBool,
    connection_error: AtomicBool,
    num_lost_connections: AtomicU32,

    rcv_window: AtomicI64,
    update_done_count: AtomicU64,

    heartbeat: StdMutex<Option<HeartbeatHandle>>,
    group_poller: StdMutex<Option<JoinHandle<()>>>,
}

impl ReplicationBroker {
    /// Creates a broker for the given domain configuration and state.
    ///
    /// The `state` and `generation` cells are shared with the owning domain,
    /// which keeps advancing them while the broker negotiates on their
    /// behalf.
    pub fn new(
        cfg: Arc<StdMutex<DomainConfig>>,
        state: Arc<StdMutex<ServerState>>,
        generation: Arc<StdMutex<Option<u64>>>,
        connector: Arc<dyn SessionConnector>,
    ) -> Arc<Self> {
        let window = cfg.lock().expect("config lock").window_size;
        Arc::new(Self {
            cfg,
            state,
            generation,
            connector,
            events: StdMutex::new(None),
            conn: StdMutex::new(ConnState::new()),
            connect_notify: Notify::new(),
            connect_phase: tokio::sync::Mutex::new(()),
            topology: StdMutex::new(TopologyView::default()),
            shutdown: AtomicBool::new(false),
            connection_error: AtomicBool::new(false),
            num_lost_connections: AtomicU32::new(0),
            rcv_window: AtomicI64::new(i64::from(window)),
            update_done_count: AtomicU64::new(0),
            heartbeat: StdMutex::new(None),
            group_poller: StdMutex::new(None),
        })
    }

    /// Registers the domain callbacks. Must be called before `start`.
    pub fn set_event_handler(&self, events: Weak<dyn BrokerEvents>) {
        *self.events.lock().expect("events lock") = Some(events);
    }

    fn events(&self) -> Option<Arc<dyn BrokerEvents>> {
        self.events
            .lock()
            .expect("events lock")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Starts the broker: performs one connection attempt and returns
    /// whether it succeeded. Callers relying on the receive loop will get
    /// automatic retries either way.
    pub async fn start(self: &Arc<Self>) -> bool {
        self.shutdown.store(false, Ordering::Release);
        let window = self.cfg.lock().expect("config lock").window_size;
        self.rcv_window.store(i64::from(window), Ordering::Release);
        self.update_done_count.store(0, Ordering::Release);
        self.connect().await
    }

    /// Stops the broker: closes the session and releases every waiter.
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.stop_group_poller();
        self.stop_heartbeat();
        let session = {
            let mut conn = self.conn.lock().expect("conn lock");
            conn.connected = false;
            conn.server_id = None;
            conn.server_url = None;
            conn.server_group_id = None;
            // Closing the semaphore fails pending acquires instead of
            // leaving publishers stuck during teardown.
            conn.send_window.close();
            conn.session.take()
        };
        if let Some(session) = session {
            session.close();
        }
        self.connect_notify.notify_waiters();
    }

    /// Returns true once `stop` has been requested.
    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Returns true while a healthy session is installed.
    pub fn is_connected(&self) -> bool {
        self.conn.lock().expect("conn lock").connected
    }

    /// Returns true while the broker is in its connection-error latch:
    /// no server was reachable and publishes are dropped until reconnection.
    pub fn has_connection_error(&self) -> bool {
        self.connection_error.load(Ordering::Acquire)
    }

    /// Number of sessions lost since the broker was created.
    pub fn num_lost_connections(&self) -> u32 {
        self.num_lost_connections.load(Ordering::Acquire)
    }

    /// Id of the connected replication server, when connected.
    pub fn connected_server_id(&self) -> Option<u32> {
        self.conn.lock().expect("conn lock").server_id
    }

    /// Address of the connected replication server, when connected.
    pub fn connected_server_url(&self) -> Option<String> {
        self.conn.lock().expect("conn lock").server_url.clone()
    }

    /// Group id of the connected replication server, when connected.
    pub fn connected_server_group_id(&self) -> Option<u8> {
        self.conn.lock().expect("conn lock").server_group_id
    }

    /// Protocol version negotiated with the connected server: the smaller of
    /// ours and the server's.
    pub fn negotiated_protocol_version(&self) -> u8 {
        self.conn.lock().expect("conn lock").protocol_version
    }

    /// Whether the current session negotiated transport encryption.
    pub fn is_session_encrypted(&self) -> bool {
        self.conn
            .lock()
            .expect("conn lock")
            .session
            .as_ref()
            .map(|s| s.is_encrypted())
            .unwrap_or(false)
    }

    /// The latest topology snapshot.
    pub fn topology(&self) -> TopologyView {
        self.topology.lock().expect("topology lock").clone()
    }

    /// Negotiated maximum send window.
    pub fn max_send_window(&self) -> u32 {
        self.conn.lock().expect("conn lock").max_send_window
    }

    /// Currently available send-window permits.
    pub fn current_send_window(&self) -> u32 {
        let conn = self.conn.lock().expect("conn lock");
        if conn.connected {
            conn.send_window.available_permits() as u32
        } else {
            0
        }
    }

    /// Configured maximum receive window.
    pub fn max_rcv_window(&self) -> u32 {
        self.cfg.lock().expect("config lock").window_size
    }

    /// Current receive window (configured window minus unreplayed updates).
    pub fn current_rcv_window(&self) -> i64 {
        self.rcv_window.load(Ordering::Acquire)
    }

    fn receive_timeout(&self) -> Duration {
        self.cfg.lock().expect("config lock").receive_timeout()
    }

    /// Publishes a message, retrying across reconnections until it is sent,
    /// the broker enters its connection-error latch, or shutdown.
    ///
    /// Returns true if the message was handed to a session.
    pub async fn publish(&self, msg: &ReplicationMsg) -> bool {
        self.publish_inner(msg, true).await
    }

    /// Publishes a message without retrying across failures; used by the
    /// total-update paths, which track connection loss themselves.
    pub async fn publish_once(&self, msg: &ReplicationMsg) -> bool {
        self.publish_inner(msg, false).await
    }

    async fn publish_inner(&self, msg: &ReplicationMsg, retry: bool) -> bool {
        loop {
            if self.shutting_down() {
                return false;
            }
            if self.connection_error.load(Ordering::Acquire) {
                // No server reachable: the update was already recorded
                // locally and will be resent after reconnection, so dropping
                // here is safe.
                tracing::trace!(kind = msg.kind(), "publish skipped during connection error");
                return false;
            }

            let captured = self.conn.lock().expect("conn lock").current();
            let (session, send_window, epoch) = match captured {
                Some(c) => c,
                None => {
                    if !retry {
                        return false;
                    }
                    self.wait_for_connect_attempt().await;
                    continue;
                }
            };

            let permit = if msg.is_update() {
                match tokio::time::timeout(
                    WINDOW_ACQUIRE_TIMEOUT,
                    send_window.clone().acquire_owned(),
                )
                .await
                {
                    Ok(Ok(permit)) => Some(permit),
                    // Semaphore closed: the session was replaced or shut down.
                    Ok(Err(_)) => {
                        if !retry {
                            return false;
                        }
                        continue;
                    }
                    Err(_) => {
                        if send_window.available_permits() == 0 {
                            // The window stayed shut for the whole wait: nudge
                            // the peer in case its credit message was lost.
                            let _ = session.publish(&ReplicationMsg::WindowProbe).await;
                        }
                        continue;
                    }
                }
            } else {
                None
            };

            // The permit was acquired outside the lock; make sure the
            // session it belongs to is still the current one.
            let still_current = {
                let conn = self.conn.lock().expect("conn lock");
                conn.connected && conn.epoch == epoch
            };
            if !still_current {
                drop(permit);
                if !retry {
                    return false;
                }
                continue;
            }

            match session.publish(msg).await {
                Ok(()) => {
                    if let Some(permit) = permit {
                        // The credit is consumed; it comes back through a
                        // window message from the peer.
                        permit.forget();
                    }
                    return true;
                }
                Err(e) => {
                    drop(permit);
                    tracing::debug!(kind = msg.kind(), error = %e, "publish failed");
                    if !retry {
                        return false;
                    }
                    // The receive loop drives reconnection; just wait a bit.
                    self.wait_for_connect_attempt().await;
                }
            }
        }
    }

    async fn wait_for_connect_attempt(&self) {
        let _ = tokio::time::timeout(PUBLISH_RETRY_WAIT, self.connect_notify.notified()).await;
    }

    /// Receives the next message for the domain.
    ///
    /// Control messages are consumed internally: window credits replenish
    /// the send semaphore, topology pushes replace the snapshot, heartbeats
    /// feed the session clock. Read timeouts are surfaced so callers can
    /// check for shutdown; connection failures trigger transparent
    /// reconnection.
    pub async fn receive(self: &Arc<Self>) -> Result<ReplicationMsg> {
        self.receive_opts(true, false).await
    }

    /// Receive variant for import streams: never reconnects and returns
    /// topology messages so the importer can watch its exporter.
    pub async fn receive_no_reconnect(self: &Arc<Self>) -> Result<ReplicationMsg> {
        self.receive_opts(false, true).await
    }

    async fn receive_opts(
        self: &Arc<Self>,
        reconnect: bool,
        return_topology: bool,
    ) -> Result<ReplicationMsg> {
        loop {
            if self.shutting_down() {
                return Err(ReplError::Shutdown);
            }

            let session = self
                .conn
                .lock()
                .expect("conn lock")
                .current()
                .map(|(s, _, _)| s);
            let session = match session {
                Some(s) => s,
                None => {
                    if !reconnect {
                        return Err(ReplError::NotConnected);
                    }
                    self.restart(None).await;
                    continue;
                }
            };

            match session.receive(self.receive_timeout()).await {
                Ok(msg) => match msg {
                    ReplicationMsg::Update(_) => {
                        self.rcv_window.fetch_sub(1, Ordering::AcqRel);
                        return Ok(msg);
                    }
                    ReplicationMsg::Window { num_ack } => {
                        let conn = self.conn.lock().expect("conn lock");
                        conn.send_window.add_permits(num_ack as usize);
                    }
                    ReplicationMsg::Topology(view) => {
                        self.receive_topo(view.clone());
                        if return_topology {
                            return Ok(ReplicationMsg::Topology(view));
                        }
                    }
                    ReplicationMsg::Heartbeat | ReplicationMsg::WindowProbe => {
                        // Liveness only; the session clock already advanced.
                    }
                    other => return Ok(other),
                },
                Err(ReplError::Timeout(what)) => return Err(ReplError::Timeout(what)),
                Err(e) => {
                    if self.shutting_down() {
                        return Err(ReplError::Shutdown);
                    }
                    if !session.is_closed() {
                        tracing::info!(
                            server = session.peer(),
                            error = %e,
                            "disconnected from replication server"
                        );
                    }
                    if !reconnect {
                        return Err(e);
                    }
                    self.restart(Some(session)).await;
                }
            }
        }
    }

    /// Replenishes the receive window after the domain replayed one update;
    /// sends a window credit once half the configured window has been
    /// replayed.
    pub async fn update_window_after_replay(&self) {
        let half = (self.max_rcv_window() / 2).max(1) as u64;
        let done = self.update_done_count.fetch_add(1, Ordering::AcqRel) + 1;
        if done >= half {
            self.update_done_count.store(0, Ordering::Release);
            let session = self
                .conn
                .lock()
                .expect("conn lock")
                .current()
                .map(|(s, _, _)| s);
            if let Some(session) = session {
                let num_ack = done as u32;
                // Socket errors here surface through the receive loop.
                if session
                    .publish(&ReplicationMsg::Window { num_ack })
                    .await
                    .is_ok()
                {
                    self.rcv_window
                        .fetch_add(i64::from(num_ack), Ordering::AcqRel);
                }
            }
        }
    }

    /// Announces to the replication server that the domain entered a new
    /// status.
    pub async fn signal_status_change(&self, new_status: ServerStatus) {
        let sent = self
            .publish_once(&ReplicationMsg::ChangeStatus(ChangeStatusMsg {
                requested_status: None,
                new_status: Some(new_status),
            }))
            .await;
        if !sent {
            tracing::warn!(status = %new_status, "could not signal status change");
        }
    }

    /// Closes the current session and reconnects; used after an import so
    /// the post-initialization state is renegotiated from scratch.
    pub async fn restart_current(self: &Arc<Self>) {
        let session = self
            .conn
            .lock()
            .expect("conn lock")
            .current()
            .map(|(s, _, _)| s);
        self.restart(session).await;
    }

    /// Closes the current session (if any) and reconnects, blocking the
    /// caller with fixed backoff until connected or shut down.
    pub async fn restart(self: &Arc<Self>, failing: Option<Arc<dyn ReplicationSession>>) {
        if let Some(failing) = failing {
            failing.close();
            self.num_lost_connections.fetch_add(1, Ordering::AcqRel);
            let mut conn = self.conn.lock().expect("conn lock");
            let is_current = conn
                .session
                .as_ref()
                .map(|s| Arc::ptr_eq(s, &failing))
                .unwrap_or(false);
            if is_current {
                conn.connected = false;
                conn.server_id = None;
                conn.server_url = None;
                conn.server_group_id = None;
            }
            // A stale session failing after replacement is ignored.
        }

        while !self.is_connected() && !self.shutting_down() {
            if self.connect().await {
                break;
            }
            if !self.shutting_down() {
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }

    /// Connects to the best available replication server.
    ///
    /// Runs handshake phase 1 against every configured server to gather
    /// comparison data, picks the best candidate, then completes phase 2 on
    /// the kept connection.
    async fn connect(self: &Arc<Self>) -> bool {
        let _phase = self.connect_phase.lock().await;

        if let Some(events) = self.events() {
            events.disconnected();
        }
        self.stop_group_poller();
        self.stop_heartbeat();

        let (servers, group_id) = {
            let cfg = self.cfg.lock().expect("config lock");
            (cfg.servers.clone(), cfg.group_id)
        };
        if servers.is_empty() {
            tracing::warn!("no replication server configured");
            self.note_connect_failure();
            return false;
        }

        let mut candidates: BTreeMap<String, CandidateInfo> = BTreeMap::new();
        for addr in &servers {
            if let Some((session, reply)) = self.phase_one(addr, false).await {
                session.close();
                candidates.insert(
                    addr.clone(),
                    CandidateInfo {
                        server_id: reply.server_id,
                        server_state: reply.server_state,
                        group_id: reply.group_id,
                        generation_id: reply.generation_id,
                        window_size: reply.window_size,
                        degraded_status_threshold: reply.degraded_status_threshold,
                        protocol_version: reply.protocol_version,
                    },
                );
            }
        }

        if candidates.is_empty() {
            self.note_connect_failure();
            return false;
        }

        let my_state = self.state.lock().expect("state lock").clone();
        let my_generation = *self.generation.lock().expect("generation lock");
        let replica_id = self.cfg.lock().expect("config lock").replica_id;

        let best = match select_best_server(&my_state, &candidates, replica_id, group_id) {
            Some(addr) => addr,
            None => {
                self.note_connect_failure();
                return false;
            }
        };

        let (session, reply) = match self.phase_one(&best, true).await {
            Some(pair) => pair,
            None => {
                self.note_connect_failure();
                return false;
            }
        };

        let init_status = compute_initial_status(
            reply.generation_id,
            my_generation,
            &reply.server_state,
            &my_state,
            reply.degraded_status_threshold,
        );

        let topology = match self.phase_two(&session, init_status).await {
            Some(t) => t,
            None => {
                self.note_connect_failure();
                return false;
            }
        };

        // If this server has a foreign group id but the topology shows a
        // server with ours, give up this connection: the retry will prefer
        // the same-group server.
        if reply.group_id != group_id && topology.has_server_with_group(group_id) {
            tracing::info!(
                group_id,
                server = %best,
                "a replication server with our group id is available, reconnecting"
            );
            session.close();
            return false;
        }

        self.install_session(session.clone(), &best, &reply);

        if let Some(events) = self.events() {
            events.session_established(init_status, &reply.server_state, reply.generation_id);
        }
        self.receive_topo(topology);

        if self.connection_error.swap(false, Ordering::AcqRel) {
            tracing::info!(server = %best, "replication server connection restored");
        }
        match (reply.generation_id, my_generation) {
            (None, _) => {}
            (Some(server_gen), Some(my_gen)) if server_gen == my_gen => {
                tracing::info!(server = %best, generation = server_gen,
                    "connected to replication server with our generation");
            }
            (Some(server_gen), _) => {
                tracing::warn!(server = %best, server_generation = server_gen,
                    "connected to replication server with a different generation");
            }
        }
        self.connect_notify.notify_waiters();

        if let Some(interval) = self.cfg.lock().expect("config lock").heartbeat_interval() {
            *self.heartbeat.lock().expect("heartbeat lock") =
                Some(spawn_monitor(session, interval));
        }
        if reply.group_id != group_id {
            tracing::warn!(
                server = %best,
                server_group = reply.group_id,
                group_id,
                "connected to replication server with a foreign group id"
            );
            self.start_group_poller();
        }
        true
    }

    fn install_session(
        &self,
        session: Arc<dyn ReplicationSession>,
        addr: &str,
        reply: &ReplServerStartMsg,
    ) {
        let window = self.cfg.lock().expect("config lock").window_size;
        let mut conn = self.conn.lock().expect("conn lock");
        // Fail every waiter still parked on the previous window.
        conn.send_window.close();
        conn.send_window = Arc::new(Semaphore::new(reply.window_size as usize));
        conn.max_send_window = reply.window_size;
        conn.session = Some(session);
        conn.epoch += 1;
        conn.connected = true;
        conn.server_id = Some(reply.server_id);
        conn.server_url = Some(addr.to_string());
        conn.server_group_id = Some(reply.group_id);
        conn.protocol_version = PROTOCOL_VERSION.min(reply.protocol_version);
        drop(conn);
        self.rcv_window.store(i64::from(window), Ordering::Release);
        self.update_done_count.store(0, Ordering::Release);
    }

    fn note_connect_failure(&self) {
        if !self.connection_error.swap(true, Ordering::AcqRel) {
            let domain = self.cfg.lock().expect("config lock").service_id.clone();
            tracing::warn!(domain = %domain, "could not connect to any replication server");
        }
        self.connect_notify.notify_waiters();
    }

    /// Runs handshake phase 1 against one server. With `keep` the session is
    /// returned open and becomes a candidate for phase 2; otherwise the
    /// caller closes it after harvesting the reply.
    async fn phase_one(
        &self,
        addr: &str,
        keep: bool,
    ) -> Option<(Arc<dyn ReplicationSession>, ReplServerStartMsg)> {
        let (start, connect_timeout, domain) = {
            let cfg = self.cfg.lock().expect("config lock");
            let state = self.state.lock().expect("state lock").clone();
            let generation = *self.generation.lock().expect("generation lock");
            (
                ServerStartMsg {
                    domain: cfg.service_id.clone(),
                    replica_id: cfg.replica_id,
                    server_state: state,
                    window_size: cfg.window_size,
                    heartbeat_interval_ms: cfg.heartbeat_interval_ms,
                    protocol_version: PROTOCOL_VERSION,
                    generation_id: generation,
                    group_id: cfg.group_id,
                },
                cfg.connect_timeout(),
                cfg.service_id.clone(),
            )
        };

        let session = match self.connector.connect(addr, connect_timeout).await {
            Ok(s) => s,
            Err(e) => {
                self.log_handshake_failure(addr, keep, 1, &e);
                return None;
            }
        };

        if let Err(e) = session
            .publish(&ReplicationMsg::ServerStart(start))
            .await
        {
            self.log_handshake_failure(addr, keep, 1, &e);
            session.close();
            return None;
        }

        match session.receive(HANDSHAKE_TIMEOUT).await {
            Ok(ReplicationMsg::ReplServerStart(reply)) => {
                if reply.domain != domain {
                    tracing::warn!(server = addr, got = %reply.domain, expected = %domain,
                        "replication server answered for a different domain");
                    session.close();
                    return None;
                }
                Some((session, reply))
            }
            Ok(other) => {
                tracing::warn!(server = addr, got = other.kind(),
                    "unexpected message during handshake phase 1");
                session.close();
                None
            }
            Err(e) => {
                self.log_handshake_failure(addr, keep, 1, &e);
                session.close();
                None
            }
        }
    }

    /// Runs handshake phase 2 on the chosen connection.
    async fn phase_two(
        &self,
        session: &Arc<dyn ReplicationSession>,
        init_status: ServerStatus,
    ) -> Option<TopologyView> {
        let start_session = {
            let cfg = self.cfg.lock().expect("config lock");
            StartSessionMsg {
                status: init_status,
                referral_urls: cfg.referral_urls.clone(),
                assured: cfg.assured.enabled,
                assured_mode: cfg.assured.mode,
                safe_data_level: cfg.assured.safe_data_level,
            }
        };

        if let Err(e) = session
            .publish(&ReplicationMsg::StartSession(start_session))
            .await
        {
            self.log_handshake_failure(session.peer(), true, 2, &e);
            session.close();
            return None;
        }

        match session.receive(HANDSHAKE_TIMEOUT).await {
            Ok(ReplicationMsg::Topology(view)) => Some(view),
            Ok(other) => {
                tracing::warn!(server = session.peer(), got = other.kind(),
                    "unexpected message during handshake phase 2");
                session.close();
                None
            }
            Err(e) => {
                self.log_handshake_failure(session.peer(), true, 2, &e);
                session.close();
                None
            }
        }
    }

    fn log_handshake_failure(&self, addr: &str, keep: bool, phase: u8, e: &ReplError) {
        // Only the chosen connection is worth a warning, and only once per
        // failure streak, so probing a dead server does not flood the log.
        if keep && !self.connection_error.load(Ordering::Acquire) {
            tracing::warn!(server = addr, phase, error = %e, "handshake failed");
        } else {
            tracing::debug!(server = addr, phase, error = %e, "handshake failed");
        }
    }

    /// Stores a freshly received topology snapshot, replacing both lists as
    /// one unit.
    pub fn receive_topo(&self, view: TopologyView) {
        tracing::debug!(
            replicas = view.replicas.len(),
            servers = view.servers.len(),
            "topology updated"
        );
        *self.topology.lock().expect("topology lock") = view;
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().expect("heartbeat lock").take() {
            handle.stop();
        }
    }

    fn start_group_poller(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(GROUP_POLL_PERIOD).await;
                let broker = match weak.upgrade() {
                    Some(b) => b,
                    None => return,
                };
                if broker.shutting_down() || !broker.is_connected() {
                    return;
                }
                let (servers, group_id) = {
                    let cfg = broker.cfg.lock().expect("config lock");
                    (cfg.servers.clone(), cfg.group_id)
                };
                let current_url = broker.connected_server_url();
                for addr in servers {
                    if Some(&addr) == current_url.as_ref() {
                        // The connected server is known to carry the wrong
                        // group id.
                        continue;
                    }
                    if let Some((session, reply)) = broker.phase_one(&addr, false).await {
                        session.close();
                        if reply.group_id == group_id {
                            tracing::info!(
                                server = %addr,
                                group_id,
                                "replication server with our group id appeared, reconnecting"
                            );
                            let current = broker
                                .conn
                                .lock()
                                .expect("conn lock")
                                .session
                                .clone();
                            if let Some(current) = current {
                                current.close();
                            }
                            return;
                        }
                    }
                }
            }
        });
        *self.group_poller.lock().expect("poller lock") = Some(handle);
    }

    fn stop_group_poller(&self) {
        if let Some(handle) = self.group_poller.lock().expect("poller lock").take() {
            handle.abort();
        }
    }
}

impl Drop for ReplicationBroker {
    fn drop(&mut self) {
        self.stop_group_poller();
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySession;
    use async_trait::async_trait;
    use dirmesh_protocol::{Csn, PeerServerInfo, UpdateMsg};
    use tokio::sync::mpsc;

    /// One scripted replication server behind an address.
    #[derive(Clone)]
    struct ServerScript {
        server_id: u32,
        group_id: u8,
        generation_id: Option<u64>,
        window_size: u32,
        server_state: ServerState,
        extra_servers: Vec<PeerServerInfo>,
    }

    impl ServerScript {
        fn new(server_id: u32, group_id: u8) -> Self {
            Self {
                server_id,
                group_id,
                generation_id: Some(1),
                window_size: 100,
                server_state: ServerState::new(),
                extra_servers: Vec::new(),
            }
        }
    }

    /// Connector resolving addresses to scripted in-memory servers. Every
    /// accepted session's inbound messages are forwarded to the test, and
    /// the test can push messages back through the returned sender.
    struct ScriptedConnector {
        scripts: StdMutex<BTreeMap<String, ServerScript>>,
        /// (addr, message) for every message a kept session receives.
        inbox: mpsc::UnboundedSender<(String, ReplicationMsg)>,
        /// Senders for pushing messages into the newest session per address.
        taps: StdMutex<BTreeMap<String, mpsc::UnboundedSender<ReplicationMsg>>>,
    }

    impl ScriptedConnector {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, ReplicationMsg)>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    scripts: StdMutex::new(BTreeMap::new()),
                    inbox: tx,
                    taps: StdMutex::new(BTreeMap::new()),
                }),
                rx,
            )
        }

        fn add_server(&self, addr: &str, script: ServerScript) {
            self.scripts
                .lock()
                .unwrap()
                .insert(addr.to_string(), script);
        }

        fn send_to_client(&self, addr: &str, msg: ReplicationMsg) {
            let taps = self.taps.lock().unwrap();
            taps.get(addr).unwrap().send(msg).unwrap();
        }
    }

    #[async_trait]
    impl SessionConnector for ScriptedConnector {
        async fn connect(
            &self,
            addr: &str,
            _timeout: Duration,
        ) -> Result<Arc<dyn ReplicationSession>> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(addr)
                .cloned()
                .ok_or(ReplError::Timeout("connect"))?;

            let (client_side, server_side) = MemorySession::pair("client", addr);
            let addr = addr.to_string();
            let inbox = self.inbox.clone();
            let (tap_tx, mut tap_rx) = mpsc::unbounded_channel();
            self.taps.lock().unwrap().insert(addr.clone(), tap_tx);

            tokio::spawn(async move {
                // Phase 1.
                let start = match server_side.receive(Duration::from_secs(5)).await {
                    Ok(ReplicationMsg::ServerStart(s)) => s,
                    _ => return,
                };
                let reply = ReplServerStartMsg {
                    domain: start.domain.clone(),
                    server_id: script.server_id,
                    server_url: addr.clone(),
                    server_state: script.server_state.clone(),
                    window_size: script.window_size,
                    protocol_version: PROTOCOL_VERSION,
                    generation_id: script.generation_id,
                    group_id: script.group_id,
                    degraded_status_threshold: 0,
                };
                if server_side
                    .publish(&ReplicationMsg::ReplServerStart(reply))
                    .await
                    .is_err()
                {
                    return;
                }
                // Phase 2, if the client keeps the connection.
                match server_side.receive(Duration::from_secs(5)).await {
                    Ok(ReplicationMsg::StartSession(_)) => {}
                    _ => return,
                }
                let topo = TopologyView {
                    replicas: vec![],
                    servers: script.extra_servers.clone(),
                };
                if server_side
                    .publish(&ReplicationMsg::Topology(topo))
                    .await
                    .is_err()
                {
                    return;
                }
                // Session phase: forward inbound to the test, relay pushes.
                loop {
                    tokio::select! {
                        received = server_side.receive(Duration::from_secs(30)) => {
                            match received {
                                Ok(msg) => {
                                    let _ = inbox.send((addr.clone(), msg));
                                }
                                Err(_) => return,
                            }
                        }
                        pushed = tap_rx.recv() => {
                            match pushed {
                                Some(msg) => {
                                    if server_side.publish(&msg).await.is_err() {
                                        return;
                                    }
                                }
                                None => return,
                            }
                        }
                    }
                }
            });

            Ok(client_side)
        }
    }

    struct NullEvents;
    impl BrokerEvents for NullEvents {
        fn session_established(&self, _: ServerStatus, _: &ServerState, _: Option<u64>) {}
        fn disconnected(&self) {}
    }

    fn test_broker(
        servers: Vec<String>,
        connector: Arc<dyn SessionConnector>,
    ) -> (Arc<ReplicationBroker>, Arc<NullEvents>) {
        let mut cfg = DomainConfig::new("dc=test", 1, servers);
        cfg.heartbeat_interval_ms = 0;
        let cfg = Arc::new(StdMutex::new(cfg));
        let state = Arc::new(StdMutex::new(ServerState::new()));
        let generation = Arc::new(StdMutex::new(Some(1u64)));
        let broker = ReplicationBroker::new(cfg, state, generation, connector);
        let events: Arc<NullEvents> = Arc::new(NullEvents);
        let events_dyn: Arc<dyn BrokerEvents> = events.clone();
        let weak: Weak<dyn BrokerEvents> = Arc::downgrade(&events_dyn);
        broker.set_event_handler(weak);
        (broker, events)
    }

    fn update(time: u64) -> ReplicationMsg {
        ReplicationMsg::Update(UpdateMsg::new(Csn::new(time, 0, 1), vec![]))
    }

    #[tokio::test]
    async fn connects_and_prefers_same_group_server() {
        let (connector, _inbox) = ScriptedConnector::new();
        connector.add_server("rs-a:1", ServerScript::new(11, 2));
        connector.add_server("rs-b:1", ServerScript::new(12, 1));
        let (broker, _events) =
            test_broker(vec!["rs-a:1".into(), "rs-b:1".into()], connector.clone());

        assert!(broker.start().await);
        assert!(broker.is_connected());
        assert_eq!(broker.connected_server_url().as_deref(), Some("rs-b:1"));
        assert_eq!(broker.connected_server_id(), Some(12));
        assert_eq!(broker.connected_server_group_id(), Some(1));
        broker.stop().await;
    }

    #[tokio::test]
    async fn send_window_is_consumed_by_updates_only() {
        let (connector, mut inbox) = ScriptedConnector::new();
        let mut script = ServerScript::new(11, 1);
        script.window_size = 2;
        connector.add_server("rs:1", script);
        let (broker, _events) = test_broker(vec!["rs:1".into()], connector.clone());
        assert!(broker.start().await);
        assert_eq!(broker.current_send_window(), 2);

        assert!(broker.publish(&update(1)).await);
        assert!(broker.publish(&ReplicationMsg::Heartbeat).await);
        assert!(broker.publish(&update(2)).await);
        assert_eq!(broker.current_send_window(), 0);

        // Drain what the server saw: two updates and one heartbeat.
        let mut kinds = vec![];
        for _ in 0..3 {
            let (_, msg) = inbox.recv().await.unwrap();
            kinds.push(msg.kind());
        }
        assert_eq!(
            kinds.iter().filter(|k| **k == "update").count(),
            2,
            "{kinds:?}"
        );
        broker.stop().await;
    }

    #[tokio::test]
    async fn exhausted_window_blocks_until_credit_arrives() {
        let (connector, _inbox) = ScriptedConnector::new();
        let mut script = ServerScript::new(11, 1);
        script.window_size = 1;
        connector.add_server("rs:1", script);
        let (broker, _events) = test_broker(vec!["rs:1".into()], connector.clone());
        assert!(broker.start().await);

        assert!(broker.publish(&update(1)).await);

        let blocked = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.publish(&update(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!blocked.is_finished(), "publish must block on a shut window");

        // Window credit from the peer releases the publisher.
        connector.send_to_client("rs:1", ReplicationMsg::Window { num_ack: 1 });
        // A receive call is needed to process the credit.
        let receiver = {
            let broker = broker.clone();
            tokio::spawn(async move {
                loop {
                    match broker.receive().await {
                        Ok(_) => continue,
                        Err(ReplError::Timeout(_)) => continue,
                        Err(_) => return,
                    }
                }
            })
        };
        assert!(tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .unwrap()
            .unwrap());
        broker.stop().await;
        let _ = receiver.await;
    }

    #[tokio::test]
    async fn receive_consumes_window_credits_internally() {
        let (connector, _inbox) = ScriptedConnector::new();
        let mut script = ServerScript::new(11, 1);
        script.window_size = 5;
        connector.add_server("rs:1", script);
        let (broker, _events) = test_broker(vec!["rs:1".into()], connector.clone());
        assert!(broker.start().await);

        connector.send_to_client("rs:1", ReplicationMsg::Window { num_ack: 3 });
        connector.send_to_client("rs:1", update(9));

        // The only message surfaced is the update; the credit was absorbed.
        let msg = loop {
            match broker.receive().await {
                Ok(msg) => break msg,
                Err(ReplError::Timeout(_)) => continue,
                Err(e) => panic!("receive failed: {e}"),
            }
        };
        assert_eq!(msg.kind(), "update");
        assert_eq!(broker.current_send_window(), 8);
        broker.stop().await;
    }

    #[tokio::test]
    async fn unreachable_servers_latch_connection_error() {
        let (connector, _inbox) = ScriptedConnector::new();
        // No scripts registered: every connect fails.
        let (broker, _events) = test_broker(vec!["rs:1".into()], connector.clone());
        assert!(!broker.start().await);
        assert!(!broker.is_connected());
        assert!(broker.has_connection_error());

        // Publishing during the latch silently drops, per the resend
        // contract.
        assert!(!broker.publish(&update(1)).await);
        broker.stop().await;
    }

    #[tokio::test]
    async fn update_window_after_replay_credits_at_half_window() {
        let (connector, mut inbox) = ScriptedConnector::new();
        connector.add_server("rs:1", ServerScript::new(11, 1));
        let (broker, _events) = test_broker(vec!["rs:1".into()], connector.clone());
        {
            // Shrink the receive window to 4 so half is 2.
            broker.cfg.lock().unwrap().window_size = 4;
        }
        assert!(broker.start().await);
        assert_eq!(broker.current_rcv_window(), 4);

        broker.update_window_after_replay().await;
        broker.update_window_after_replay().await;

        let (_, msg) = inbox.recv().await.unwrap();
        match msg {
            ReplicationMsg::Window { num_ack } => assert_eq!(num_ack, 2),
            other => panic!("expected window, got {}", other.kind()),
        }
        broker.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_blocked_publishers() {
        let (connector, _inbox) = ScriptedConnector::new();
        let mut script = ServerScript::new(11, 1);
        script.window_size = 1;
        connector.add_server("rs:1", script);
        let (broker, _events) = test_broker(vec!["rs:1".into()], connector.clone());
        assert!(broker.start().await);
        assert!(broker.publish(&update(1)).await);

        let blocked = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.publish(&update(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.stop().await;
        let sent = tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(!sent, "publish must abort on shutdown");
    }
}
