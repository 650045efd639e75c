//! The replicated-service facade: owns a broker, the status state machine,
//! assured-replication bookkeeping and the service lifecycle.

use crate::backend::ReplicaBackend;
use crate::broker::{BrokerEvents, ReplicationBroker};
use crate::config::DomainConfig;
use crate::error::{ReplError, Result};
use crate::monitor::{MonitorCounters, MonitorSnapshot};
use crate::session::SessionConnector;
use crate::total_update::ImportExportContext;
use dirmesh_protocol::status::is_valid_initial_status;
use dirmesh_protocol::{
    next_status, AckMsg, AssuredMode, ChangeStatusMsg, Csn, CsnGenerator, ReplicaId,
    ReplicationMsg, ServerState, ServerStatus, StatusEvent, TopologyView, UpdateMsg,
};
use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Status cell: the current status plus the instant it was entered.
struct StatusState {
    status: ServerStatus,
    last_change: Instant,
}

/// Shared core of a replicated domain. Holds every piece of protocol state;
/// the public [`ReplicationDomain`] facade wraps it together with the
/// listener task.
pub(crate) struct DomainCore {
    pub(crate) cfg: Arc<StdMutex<DomainConfig>>,
    pub(crate) broker: Arc<ReplicationBroker>,
    pub(crate) backend: Arc<dyn ReplicaBackend>,
    pub(crate) state: Arc<StdMutex<ServerState>>,
    pub(crate) generation: Arc<StdMutex<Option<u64>>>,
    generator: StdMutex<CsnGenerator>,
    status: StdMutex<StatusState>,
    /// Outgoing assured updates waiting for their ack, keyed by CSN.
    waiting_acks: StdMutex<BTreeMap<Csn, UpdateMsg>>,
    ack_notify: Notify,
    /// Keeps CSN order aligned with session send order.
    publish_lock: tokio::sync::Mutex<()>,
    /// The single import/export slot; test-and-set, never queued.
    pub(crate) ie: StdMutex<Option<Arc<ImportExportContext>>>,
    pub(crate) counters: MonitorCounters,
}

impl BrokerEvents for DomainCore {
    fn session_established(
        &self,
        init_status: ServerStatus,
        _server_state: &ServerState,
        _server_generation: Option<u64>,
    ) {
        if !is_valid_initial_status(init_status) {
            tracing::warn!(status = %init_status, "invalid initial status, keeping current");
            return;
        }
        let mut status = self.status.lock().expect("status lock");
        status.status = init_status;
        status.last_change = Instant::now();
        tracing::debug!(status = %init_status, "session established");
    }

    fn disconnected(&self) {
        self.apply_status_event_sync(StatusEvent::ToNotConnected);
    }
}

impl DomainCore {
    pub(crate) fn replica_id(&self) -> ReplicaId {
        self.cfg.lock().expect("config lock").replica_id
    }

    pub(crate) fn service_id(&self) -> String {
        self.cfg.lock().expect("config lock").service_id.clone()
    }

    pub(crate) fn status(&self) -> ServerStatus {
        self.status.lock().expect("status lock").status
    }

    /// Applies a status event that cannot enter full-update (and therefore
    /// needs no peer signaling).
    fn apply_status_event_sync(&self, event: StatusEvent) -> ServerStatus {
        let mut cell = self.status.lock().expect("status lock");
        let new_status = next_status(cell.status, event);
        if new_status == ServerStatus::Invalid {
            tracing::warn!(
                current = %cell.status,
                event = ?event,
                "illegal status transition ignored"
            );
            return cell.status;
        }
        if new_status != cell.status {
            cell.last_change = Instant::now();
            if new_status == ServerStatus::NotConnected {
                self.counters.reset();
            }
            tracing::debug!(from = %cell.status, to = %new_status, "status changed");
            cell.status = new_status;
        }
        cell.status
    }

    /// Applies a status event, signaling the replication server when the
    /// domain enters full update.
    pub(crate) async fn apply_status_event(&self, event: StatusEvent) {
        let before = self.status();
        let after = self.apply_status_event_sync(event);
        if after != before && after == ServerStatus::FullUpdate {
            self.broker.signal_status_change(after).await;
        }
    }

    /// Assigns a CSN to `payload` and publishes it, waiting for an
    /// acknowledgment when assured replication applies.
    pub(crate) async fn publish_payload(&self, payload: Vec<u8>) -> Csn {
        let (assured_cfg, group_id) = {
            let cfg = self.cfg.lock().expect("config lock");
            (cfg.assured.clone(), cfg.group_id)
        };
        // Assured mode only applies through a same-group server; a foreign
        // server would never gather the acks.
        let assured_active =
            assured_cfg.enabled && self.broker.connected_server_group_id() == Some(group_id);

        let update = {
            let _order = self.publish_lock.lock().await;
            let csn = self.generator.lock().expect("generator lock").next_csn();
            let mut update = UpdateMsg::new(csn, payload);
            if assured_active {
                update.assured = true;
                update.assured_mode = assured_cfg.mode;
                if assured_cfg.mode == AssuredMode::SafeData {
                    update.safe_data_level = assured_cfg.safe_data_level;
                }
                self.waiting_acks
                    .lock()
                    .expect("ack table lock")
                    .insert(csn, update.clone());
            }
            self.broker
                .publish(&ReplicationMsg::Update(update.clone()))
                .await;
            self.state.lock().expect("state lock").update(csn);
            self.counters.record_sent();
            update
        };

        if assured_active {
            self.counters.record_assured_sent(update.assured_mode);
            self.wait_for_ack(&update, assured_cfg.timeout_ms).await;
        }
        update.csn
    }

    /// Waits until the ack for `update` arrives or the assured timeout
    /// elapses. Timeouts are tallied and logged, never raised.
    async fn wait_for_ack(&self, update: &UpdateMsg, timeout_ms: u64) {
        let deadline = Instant::now() + std::time::Duration::from_millis(timeout_ms);
        loop {
            let mut notified = pin!(self.ack_notify.notified());
            notified.as_mut().enable();
            if !self
                .waiting_acks
                .lock()
                .expect("ack table lock")
                .contains_key(&update.csn)
            {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                let removed = self
                    .waiting_acks
                    .lock()
                    .expect("ack table lock")
                    .remove(&update.csn);
                if removed.is_some() {
                    let server = self.broker.connected_server_id().unwrap_or(0);
                    self.counters
                        .record_local_timeout(update.assured_mode, server);
                    tracing::warn!(
                        csn = %update.csn,
                        timeout_ms,
                        "no ack received for assured update"
                    );
                }
                // An ack racing in just before the deadline counts as a win.
                return;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    fn receive_ack(&self, ack: AckMsg) {
        let update = self
            .waiting_acks
            .lock()
            .expect("ack table lock")
            .remove(&ack.csn);
        let Some(update) = update else {
            // Late ack for an update that already timed out locally.
            return;
        };

        if ack.has_errors() {
            tracing::warn!(
                csn = %ack.csn,
                timeout = ack.timeout,
                replay_error = ack.replay_error,
                wrong_status = ack.wrong_status,
                failed_servers = ?ack.failed_servers,
                "assured update not fully acknowledged"
            );
            self.counters.record_ack_failure(
                update.assured_mode,
                ack.timeout,
                ack.replay_error,
                ack.wrong_status,
                &ack.failed_servers,
            );
        } else {
            self.counters.record_ack_success(update.assured_mode);
        }

        // Counters first, wake-up second: a publisher released here reads
        // the tallies right away.
        self.ack_notify.notify_waiters();
    }

    async fn receive_change_status(&self, msg: ChangeStatusMsg) {
        let Some(requested) = msg.requested_status else {
            tracing::warn!("change-status message without a requested status");
            return;
        };
        match StatusEvent::for_target(requested) {
            Some(event) => self.apply_status_event(event).await,
            None => {
                tracing::warn!(requested = %requested, "invalid requested status");
            }
        }
    }

    fn apply_reset_generation(&self, generation_id: Option<u64>) {
        tracing::info!(?generation_id, "generation id reset received");
        *self.generation.lock().expect("generation lock") = generation_id;
    }

    /// Receives the next application update, dispatching every control
    /// message internally. Returns `None` on shutdown.
    pub(crate) async fn receive_one(self: &Arc<Self>) -> Option<UpdateMsg> {
        loop {
            if self.broker.shutting_down() {
                return None;
            }
            let msg = match self.broker.receive().await {
                Ok(msg) => msg,
                // Bounded reads surface as timeouts so this loop can notice
                // shutdown; anything else ends the listener.
                Err(ReplError::Timeout(_)) => continue,
                Err(_) => return None,
            };
            match msg {
                ReplicationMsg::Ack(ack) => self.receive_ack(ack),
                ReplicationMsg::ChangeStatus(cs) => self.receive_change_status(cs).await,
                ReplicationMsg::InitializeRequest(req) => {
                    // Run the export on its own task so this loop keeps
                    // draining the session (window updates, acks) meanwhile.
                    let core = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = core.handle_initialize_request(&req).await {
                            tracing::debug!(
                                requester = req.sender_id,
                                error = %e,
                                "peer-requested export failed"
                            );
                        }
                    });
                }
                ReplicationMsg::InitializeTarget(init) => {
                    // The import must run on this task so the entry stream is
                    // consumed here and not dispatched as regular traffic.
                    self.initialize(init).await;
                }
                ReplicationMsg::Error(err) => self.receive_peer_error(err),
                ReplicationMsg::InitializeRcvAck { sender_id, num_ack } => {
                    if let Some(ctx) = self.current_ie_context() {
                        ctx.set_ack_val(sender_id, num_ack);
                    }
                }
                ReplicationMsg::ResetGenerationId { generation_id } => {
                    self.apply_reset_generation(generation_id);
                }
                ReplicationMsg::Update(update) => {
                    self.generator
                        .lock()
                        .expect("generator lock")
                        .adjust(&update.csn);
                    self.counters.record_received();
                    let group_id = self.cfg.lock().expect("config lock").group_id;
                    if update.assured
                        && update.assured_mode == AssuredMode::SafeRead
                        && self.broker.connected_server_group_id() == Some(group_id)
                    {
                        self.counters.record_sr_received();
                    }
                    return Some(update);
                }
                other => {
                    tracing::debug!(kind = other.kind(), "ignoring unexpected message");
                }
            }
        }
    }

    /// Acknowledges the completed replay of `msg`: credits the receive
    /// window and answers assured safe-read updates.
    pub(crate) async fn process_update_done(&self, msg: &UpdateMsg, replay_error: Option<&str>) {
        self.broker.update_window_after_replay().await;

        let (group_id, replica_id) = {
            let cfg = self.cfg.lock().expect("config lock");
            (cfg.group_id, cfg.replica_id)
        };
        if msg.assured && self.broker.negotiated_protocol_version() >= 2 {
            match msg.assured_mode {
                AssuredMode::SafeRead => {
                    if self.broker.connected_server_group_id() == Some(group_id) {
                        let mut ack = AckMsg::success(msg.csn);
                        if replay_error.is_some() {
                            ack.replay_error = true;
                            ack.failed_servers = vec![replica_id];
                        }
                        self.broker.publish(&ReplicationMsg::Ack(ack)).await;
                        self.counters.record_sr_received_ack(replay_error.is_none());
                    }
                }
                AssuredMode::SafeData => {
                    // Safe-data acks are produced by replication servers
                    // only; nothing to answer from a replica.
                }
            }
        }
        if let Some(detail) = replay_error {
            tracing::warn!(csn = %msg.csn, detail, "update replay reported an error");
        }
        self.counters.record_processed();
    }
}

/// A replicated domain: the entry point of the replication service for one
/// replicated data set.
///
/// Construct it with the storage backend and a session connector, then start
/// the publish service (broker) and the listen service (receive loop):
///
/// ```ignore
/// let domain = ReplicationDomain::new(config, backend, Arc::new(TcpConnector::default()));
/// domain.start_publish_service().await;
/// domain.start_listen_service();
/// let csn = domain.publish(change_bytes).await;
/// ```
pub struct ReplicationDomain {
    core: Arc<DomainCore>,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl ReplicationDomain {
    /// Creates a domain from its configuration, storage backend and session
    /// connector. Nothing connects until `start_publish_service`.
    pub fn new(
        cfg: DomainConfig,
        backend: Arc<dyn ReplicaBackend>,
        connector: Arc<dyn SessionConnector>,
    ) -> Arc<Self> {
        let replica_id = cfg.replica_id;
        let generation = Arc::new(StdMutex::new(cfg.generation_id));
        let state = Arc::new(StdMutex::new(ServerState::new()));
        let cfg = Arc::new(StdMutex::new(cfg));
        let broker =
            ReplicationBroker::new(cfg.clone(), state.clone(), generation.clone(), connector);
        let core = Arc::new(DomainCore {
            cfg,
            broker: broker.clone(),
            backend,
            state: state.clone(),
            generation,
            generator: StdMutex::new(CsnGenerator::new(replica_id)),
            status: StdMutex::new(StatusState {
                status: ServerStatus::NotConnected,
                last_change: Instant::now(),
            }),
            waiting_acks: StdMutex::new(BTreeMap::new()),
            ack_notify: Notify::new(),
            publish_lock: tokio::sync::Mutex::new(()),
            ie: StdMutex::new(None),
            counters: MonitorCounters::new(),
        });
        let core_dyn: Arc<dyn BrokerEvents> = core.clone();
        let events: std::sync::Weak<dyn BrokerEvents> = Arc::downgrade(&core_dyn);
        broker.set_event_handler(events);
        Arc::new(Self {
            core,
            listener: StdMutex::new(None),
        })
    }

    /// Seeds the server state with changes already applied to the backend,
    /// typically replayed from a local changelog at startup. Must be called
    /// before the services start.
    pub fn prime_server_state(&self, state: ServerState) {
        let mut generator = self.core.generator.lock().expect("generator lock");
        for (_, csn) in state.iter() {
            generator.adjust(csn);
        }
        *self.core.state.lock().expect("state lock") = state;
    }

    /// Starts the publish side: connects the broker to the best available
    /// replication server. Returns whether the first attempt succeeded; the
    /// listen service keeps retrying either way.
    pub async fn start_publish_service(&self) -> bool {
        self.core.broker.start().await
    }

    /// Starts the listen side: spawns the listener task that receives
    /// updates, replays them through the backend, and acknowledges them.
    pub fn start_listen_service(&self) {
        let core = self.core.clone();
        let handle = tokio::spawn(async move {
            while let Some(update) = core.receive_one().await {
                let done = core.backend.process_update(&update);
                if done {
                    core.process_update_done(&update, None).await;
                    core.state
                        .lock()
                        .expect("state lock")
                        .update(update.csn);
                }
            }
            tracing::debug!("listener stopped");
        });
        let previous = self
            .listener
            .lock()
            .expect("listener lock")
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Temporarily disables the replication service: stops the listener and
    /// tears the session down. Reversed by `enable_service`.
    pub async fn disable_service(&self) {
        self.core.broker.stop().await;
        let handle = self.listener.lock().expect("listener lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Re-enables the replication service after `disable_service`.
    pub async fn enable_service(&self) {
        self.core.broker.start().await;
        self.start_listen_service();
    }

    /// Definitively stops the replication service.
    pub async fn stop_domain(&self) {
        self.disable_service().await;
    }

    /// Applies a new configuration. Connection-relevant changes trigger a
    /// full disable/enable cycle; assured-mode changes apply in place.
    pub async fn change_config(&self, new_cfg: DomainConfig) {
        let restart = {
            let mut cfg = self.core.cfg.lock().expect("config lock");
            let restart = cfg.requires_restart(&new_cfg);
            *cfg = new_cfg;
            restart
        };
        if restart {
            tracing::info!("connection parameters changed, restarting session");
            self.disable_service().await;
            self.enable_service().await;
        }
    }

    /// Publishes one change to the domain and returns its CSN.
    ///
    /// With assured replication enabled (and a same-group server connected),
    /// this blocks until the acknowledgment arrives or the assured timeout
    /// elapses; timeouts are tallied in the monitoring counters, not raised.
    pub async fn publish(&self, payload: Vec<u8>) -> Csn {
        self.core.publish_payload(payload).await
    }

    /// Acknowledges the completed replay of an update the backend processed
    /// asynchronously.
    pub async fn process_update_done(&self, msg: &UpdateMsg, replay_error: Option<&str>) {
        self.core.process_update_done(msg, replay_error).await;
        self.core
            .state
            .lock()
            .expect("state lock")
            .update(msg.csn);
    }

    /// Current status of the domain.
    pub fn status(&self) -> ServerStatus {
        self.core.status()
    }

    /// Instant of the last status change.
    pub fn last_status_change(&self) -> Instant {
        self.core.status.lock().expect("status lock").last_change
    }

    /// True while the broker holds a healthy session.
    pub fn is_connected(&self) -> bool {
        self.core.broker.is_connected()
    }

    /// The domain's current server state.
    pub fn server_state(&self) -> ServerState {
        self.core.state.lock().expect("state lock").clone()
    }

    /// The latest topology snapshot.
    pub fn topology(&self) -> TopologyView {
        self.core.broker.topology()
    }

    /// Whether the session to the replication server is encrypted.
    pub fn is_session_encrypted(&self) -> bool {
        self.core.broker.is_session_encrypted()
    }

    /// Monitoring counters snapshot.
    pub fn monitor_snapshot(&self) -> MonitorSnapshot {
        self.core.counters.snapshot()
    }

    /// The data generation currently associated with this replica.
    pub fn generation_id(&self) -> Option<u64> {
        *self.core.generation.lock().expect("generation lock")
    }

    /// Records a newly computed data generation (e.g. after an import).
    pub fn set_generation_id(&self, generation_id: Option<u64>) {
        *self.core.generation.lock().expect("generation lock") = generation_id;
    }

    /// True while a total update (import or export) is running.
    pub fn ie_running(&self) -> bool {
        self.core.ie.lock().expect("ie lock").is_some()
    }

    /// Progress of a running total update as `(total, left)` entry counts;
    /// `None` while no operation is running.
    pub fn total_update_counts(&self) -> Option<(u64, u64)> {
        self.core
            .current_ie_context()
            .map(|ctx| (ctx.entry_count(), ctx.entries_left()))
    }

    /// Exports the full backend content to one peer replica.
    pub async fn initialize_remote(&self, target: ReplicaId) -> Result<()> {
        let init_window = self.core.cfg.lock().expect("config lock").init_window;
        let replica_id = self.core.replica_id();
        self.core
            .initialize_remote(
                dirmesh_protocol::InitTarget::Replica(target),
                replica_id,
                true,
                init_window,
            )
            .await
    }

    /// Exports the full backend content to every peer replica.
    pub async fn initialize_all(&self) -> Result<()> {
        let init_window = self.core.cfg.lock().expect("config lock").init_window;
        let replica_id = self.core.replica_id();
        self.core
            .initialize_remote(
                dirmesh_protocol::InitTarget::All,
                replica_id,
                true,
                init_window,
            )
            .await
    }

    /// Asks `source` to initialize this replica. The returned handle
    /// resolves once the import completed (or failed terminally).
    pub async fn initialize_from_remote(
        &self,
        source: ReplicaId,
    ) -> Result<crate::total_update::ImportHandle> {
        self.core.initialize_from_remote(source).await
    }

    /// Publishes a reset of the domain generation id to the topology.
    /// `None` clears the generation, detaching every server from its epoch.
    pub async fn reset_generation_id(&self, generation_id: Option<u64>) -> Result<()> {
        if !self.is_connected() {
            return Err(ReplError::NotConnected);
        }
        self.core
            .broker
            .publish(&ReplicationMsg::ResetGenerationId { generation_id })
            .await;
        Ok(())
    }

    /// Checks that at least one replication server in the topology carries
    /// the expected generation, polling with bounded retries.
    pub async fn check_generation_id(&self, expected: Option<u64>) -> Result<()> {
        for round in 0..10u32 {
            let topo = self.core.broker.topology();
            if topo.servers.iter().any(|s| s.generation_id == expected) {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(u64::from(round) * 100)).await;
        }
        Err(ReplError::Timeout("generation id convergence"))
    }

    /// Clears all replication metadata from the topology's servers, then
    /// reconnects so they adopt this replica's generation again.
    pub async fn reset_replication_log(&self) -> Result<()> {
        self.reset_generation_id(None).await?;
        self.check_generation_id(None).await?;

        self.disable_service().await;
        self.enable_service().await;

        let generation = self.generation_id();
        self.reset_generation_id(generation).await?;
        self.check_generation_id(generation).await
    }
}
