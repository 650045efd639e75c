//! Total update: full-content initialization of one replica from another,
//! with its own flow-controlled entry stream.
//!
//! A single [`ImportExportContext`] may exist per domain at a time; a second
//! acquisition fails immediately. The exporter streams size-delimited entry
//! chunks, pacing itself against the slowest acknowledging peer; the
//! importer validates the chunk sequence and feeds the backend import hook.

use crate::backend::{EntrySink, EntrySource};
use crate::domain::DomainCore;
use crate::error::{ReplError, Result};
use bytes::Bytes;
use dirmesh_protocol::{
    EntryMsg, ErrorMsg, InitTarget, InitializeRequestMsg, InitializeTargetMsg, ReplicaId,
    ReplicationMsg, ServerStatus, StatusEvent,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

/// Poll period while waiting for targets to enter full update.
const WAIT_START_POLL: Duration = Duration::from_millis(100);
/// Maximum polls while waiting for targets to enter full update (~2 min).
const WAIT_START_MAX_POLLS: u32 = 1200;
/// Poll period of the slowest-peer window loop.
const EXPORT_WINDOW_POLL: Duration = Duration::from_millis(100);
/// Poll period while waiting for targets to finish and reconnect.
const WAIT_END_POLL: Duration = Duration::from_secs(1);
/// Seconds granted to a disconnected target to reconnect after its import.
const WAIT_END_RECONNECT_SECS: u32 = 10;
/// Pause before a retry attempt, giving the peer time to reconnect.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Direction of a running total update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IeDirection {
    /// This replica receives content.
    Import,
    /// This replica sends content.
    Export,
}

#[derive(Debug)]
struct IeState {
    export_target: InitTarget,
    import_source: ReplicaId,
    entry_count: u64,
    entry_left: u64,
    msg_cnt: u64,
    init_window: u32,
    /// Highest entry message id each peer acknowledged.
    ack_vals: BTreeMap<ReplicaId, u64>,
    /// Replicas this operation targets.
    start_list: BTreeSet<ReplicaId>,
    /// Replicas that failed some stage of the operation.
    failure_list: BTreeSet<ReplicaId>,
    attempt_cnt: u32,
    init_lost_connections: u32,
    init_request: Option<InitializeRequestMsg>,
    local_task: bool,
    error: Option<String>,
}

/// Context of one running import or export. Mutated by the listener task
/// (acks, errors) and read by the exporting task (slowest-peer search), so
/// all state sits behind one lock.
pub(crate) struct ImportExportContext {
    direction: IeDirection,
    start_time_ms: u64,
    inner: StdMutex<IeState>,
    done_tx: StdMutex<Option<oneshot::Sender<Result<()>>>>,
}

impl ImportExportContext {
    fn new(direction: IeDirection) -> Arc<Self> {
        Arc::new(Self {
            direction,
            start_time_ms: now_ms(),
            inner: StdMutex::new(IeState {
                export_target: InitTarget::All,
                import_source: 0,
                entry_count: 0,
                entry_left: 0,
                msg_cnt: 0,
                init_window: 0,
                ack_vals: BTreeMap::new(),
                start_list: BTreeSet::new(),
                failure_list: BTreeSet::new(),
                attempt_cnt: 0,
                init_lost_connections: 0,
                init_request: None,
                local_task: false,
                error: None,
            }),
            done_tx: StdMutex::new(None),
        })
    }

    pub(crate) fn is_import(&self) -> bool {
        self.direction == IeDirection::Import
    }

    pub(crate) fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    fn state(&self) -> std::sync::MutexGuard<'_, IeState> {
        self.inner.lock().expect("ie state lock")
    }

    /// Stores the first failure; later ones only add log noise.
    pub(crate) fn set_error_if_none(&self, detail: impl Into<String>) {
        let mut state = self.state();
        if state.error.is_none() {
            state.error = Some(detail.into());
        }
    }

    pub(crate) fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    /// Records a flow-control ack from a peer. Acks carry the highest id
    /// received, so only forward movement is kept.
    pub(crate) fn set_ack_val(&self, replica_id: ReplicaId, num_ack: u64) {
        let mut state = self.state();
        let entry = state.ack_vals.entry(replica_id).or_insert(0);
        if num_ack > *entry {
            *entry = num_ack;
        }
    }

    /// The peer with the lowest acknowledged count, if flow control applies.
    fn slowest_peer(&self) -> Option<(ReplicaId, u64)> {
        let state = self.state();
        state
            .ack_vals
            .iter()
            .min_by_key(|(_, acked)| **acked)
            .map(|(id, acked)| (*id, *acked))
    }

    fn update_counters(&self, entries_done: u64) {
        let mut state = self.state();
        state.entry_left = state.entry_left.saturating_sub(entries_done);
    }

    /// Entries not yet processed by the running operation.
    pub(crate) fn entries_left(&self) -> u64 {
        self.state().entry_left
    }

    /// Total entries the running operation covers.
    pub(crate) fn entry_count(&self) -> u64 {
        self.state().entry_count
    }

    fn complete(&self, result: Result<()>) {
        if let Some(tx) = self.done_tx.lock().expect("ie done lock").take() {
            let _ = tx.send(result);
        }
    }
}

/// Completion handle of an import requested with `initialize_from_remote`.
pub struct ImportHandle {
    pub(crate) done: oneshot::Receiver<Result<()>>,
}

impl ImportHandle {
    /// Waits for the import to finish and returns its outcome.
    pub async fn wait(self) -> Result<()> {
        self.done.await.map_err(|_| ReplError::Shutdown)?
    }
}

/// Counts entries in a chunk by counting non-overlapping blank-line
/// (`\n\n`) delimiters, without parsing entry content.
pub fn count_entry_delimiters(bytes: &[u8]) -> u64 {
    let mut count = 0u64;
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
            count += 1;
            i += 2;
        } else {
            i += 1;
        }
    }
    count
}

impl DomainCore {
    pub(crate) fn acquire_ie_context(
        &self,
        direction: IeDirection,
    ) -> Result<Arc<ImportExportContext>> {
        let mut slot = self.ie.lock().expect("ie lock");
        if slot.is_some() {
            return Err(ReplError::SimultaneousImportExport);
        }
        let ctx = ImportExportContext::new(direction);
        *slot = Some(ctx.clone());
        Ok(ctx)
    }

    pub(crate) fn release_ie_context(&self) {
        *self.ie.lock().expect("ie lock") = None;
    }

    pub(crate) fn current_ie_context(&self) -> Option<Arc<ImportExportContext>> {
        self.ie.lock().expect("ie lock").clone()
    }

    /// Handles a peer's initialize request by exporting to it.
    pub(crate) async fn handle_initialize_request(
        self: &Arc<Self>,
        req: &InitializeRequestMsg,
    ) -> Result<()> {
        self.initialize_remote(
            InitTarget::Replica(req.sender_id),
            req.sender_id,
            false,
            req.init_window,
        )
        .await
    }

    /// Exports the full backend content to `target`.
    ///
    /// `requestor` is the replica on which the operation was requested;
    /// `local_task` marks operations driven by a task on this replica, which
    /// are the only ones eligible for a retry after connection loss.
    pub(crate) async fn initialize_remote(
        self: &Arc<Self>,
        target: InitTarget,
        requestor: ReplicaId,
        local_task: bool,
        init_window: u32,
    ) -> Result<()> {
        let ctx = self.acquire_ie_context(IeDirection::Export)?;
        tracing::info!(
            domain = %self.service_id(),
            ?target,
            requestor,
            "full update for remote replica starting"
        );
        let result = self
            .run_export(&ctx, target, requestor, local_task, init_window)
            .await;
        self.release_ie_context();
        match &result {
            Ok(()) => tracing::info!(domain = %self.service_id(), ?target,
                "full update for remote replica complete"),
            Err(e) => tracing::warn!(domain = %self.service_id(), ?target, error = %e,
                "full update for remote replica failed"),
        }
        result
    }

    async fn run_export(
        self: &Arc<Self>,
        ctx: &Arc<ImportExportContext>,
        target: InitTarget,
        requestor: ReplicaId,
        local_task: bool,
        init_window: u32,
    ) -> Result<()> {
        let replica_id = self.replica_id();
        let topo = self.broker.topology();

        // Build the target list up front: it decides both who must enter
        // full update and who must reconnect with the right generation.
        {
            let mut state = ctx.state();
            state.export_target = target;
            state.local_task = local_task;
            match target {
                InitTarget::All => {
                    if topo.replicas.is_empty() {
                        return Err(ReplError::NoReachablePeer("all replicas".to_string()));
                    }
                    for info in &topo.replicas {
                        state.start_list.insert(info.replica_id);
                        if info.protocol_version >= 4 {
                            state.ack_vals.insert(info.replica_id, 0);
                        }
                    }
                }
                InitTarget::Replica(id) => {
                    let info = topo
                        .replica(id)
                        .ok_or_else(|| ReplError::NoReachablePeer(format!("replica {id}")))?;
                    state.start_list.insert(id);
                    if info.protocol_version >= 4 {
                        state.ack_vals.insert(id, 0);
                    }
                }
            }
        }

        let max_attempts = if local_task && !matches!(target, InitTarget::All) {
            self.cfg.lock().expect("config lock").retry.export_attempts
        } else {
            1
        };

        let mut root_error: Option<ReplError> = None;
        let mut attempt = 0u32;
        'attempts: loop {
            attempt += 1;

            let entry_count = match self.backend.count_entries().await {
                Ok(count) => count,
                Err(e) => {
                    root_error = Some(e);
                    break 'attempts;
                }
            };
            {
                let mut state = ctx.state();
                state.entry_count = entry_count;
                state.entry_left = entry_count;
                state.msg_cnt = 0;
                state.init_window = init_window;
                state.init_lost_connections = self.broker.num_lost_connections();
                state.error = None;
                state.failure_list.clear();
            }

            let announce = InitializeTargetMsg {
                domain: self.service_id(),
                sender_id: replica_id,
                target,
                requestor_id: requestor,
                entry_count,
                init_window,
            };
            self.broker
                .publish(&ReplicationMsg::InitializeTarget(announce))
                .await;

            self.wait_for_remote_start(ctx).await;

            let start_failures: Vec<ReplicaId> = {
                let state = ctx.state();
                state.failure_list.iter().copied().collect()
            };
            if !start_failures.is_empty() {
                root_error = Some(ReplError::InitIncomplete(start_failures));
            } else {
                let mut sink = EntrySink { core: self.clone() };
                match self.backend.export_backend(&mut sink).await {
                    Ok(()) => {
                        self.broker
                            .publish(&ReplicationMsg::Done {
                                sender_id: replica_id,
                                target,
                            })
                            .await;
                        if let Some(detail) = ctx.error() {
                            root_error = Some(ReplError::ImportExportAborted(detail));
                        }
                    }
                    Err(e) => {
                        // A failure noticed by the listener has priority over
                        // the sink error it provoked.
                        root_error = Some(match ctx.error() {
                            Some(detail) => ReplError::ImportExportAborted(detail),
                            None => e,
                        });
                    }
                }
            }

            if root_error.is_some() {
                // The listener may already be reconnecting; give it a bounded
                // chance before deciding about a retry.
                if !self.broker.is_connected() {
                    for _ in 0..100 {
                        if self.broker.shutting_down() || self.broker.is_connected() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }

                let retry_eligible = local_task
                    && self.broker.is_connected()
                    && !matches!(target, InitTarget::All)
                    && attempt < max_attempts;
                if retry_eligible {
                    tokio::time::sleep(RETRY_PAUSE).await;
                    tracing::info!(attempt, "resending initialize-target after export failure");
                    root_error = None;
                    continue 'attempts;
                }

                if let Some(e) = &root_error {
                    self.broker
                        .publish(&ReplicationMsg::Error(ErrorMsg {
                            sender_id: replica_id,
                            target,
                            details: e.to_string(),
                            created_at_ms: now_ms(),
                        }))
                        .await;
                }
            }
            break 'attempts;
        }

        self.wait_for_remote_end(ctx).await;

        let end_failures: Vec<ReplicaId> = {
            let state = ctx.state();
            state.failure_list.iter().copied().collect()
        };
        if !end_failures.is_empty() && root_error.is_none() {
            root_error = Some(ReplError::InitIncomplete(end_failures));
        }

        match root_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Waits (bounded, ~2 minutes) for every targeted replica to report
    /// full-update status; stragglers join the failure list.
    async fn wait_for_remote_start(&self, ctx: &Arc<ImportExportContext>) {
        let start_list: BTreeSet<ReplicaId> = ctx.state().start_list.clone();
        let mut waiting = start_list.clone();
        let mut polls = 0u32;

        loop {
            let topo = self.broker.topology();
            let mut pending = false;
            for info in &topo.replicas {
                if !start_list.contains(&info.replica_id) {
                    continue;
                }
                if info.status == ServerStatus::FullUpdate {
                    waiting.remove(&info.replica_id);
                } else {
                    pending = true;
                }
            }
            // A replica missing from the topology stays in `waiting`.
            if (!pending && waiting.is_empty())
                || polls >= WAIT_START_MAX_POLLS
                || self.broker.shutting_down()
            {
                break;
            }
            polls += 1;
            tokio::time::sleep(WAIT_START_POLL).await;
        }

        let mut state = ctx.state();
        for replica in waiting {
            state.failure_list.insert(replica);
        }
    }

    /// Waits for every targeted replica to leave full update and reconnect
    /// with the expected generation: unbounded while an import is visibly in
    /// progress, bounded for disconnected replicas.
    async fn wait_for_remote_end(&self, ctx: &Arc<ImportExportContext>) {
        let expected_generation = *self.generation.lock().expect("generation lock");
        let mut waiting: BTreeSet<ReplicaId> = {
            let state = ctx.state();
            let mut waiting = state.start_list.clone();
            // Replicas that appeared during the operation are judged too.
            waiting.extend(self.broker.topology().replica_ids());
            waiting
                .difference(&state.failure_list)
                .copied()
                .collect()
        };
        let mut reconnect_waits: BTreeMap<ReplicaId, u32> = BTreeMap::new();

        loop {
            let topo = self.broker.topology();
            let mut pending = false;
            waiting.retain(|replica_id| match topo.replica(*replica_id) {
                None => {
                    let waited = reconnect_waits.entry(*replica_id).or_insert(0);
                    *waited += 1;
                    if *waited < WAIT_END_RECONNECT_SECS {
                        pending = true;
                        true
                    } else {
                        // Out of reconnection credit; counted as a failure.
                        true
                    }
                }
                Some(info) => {
                    if info.status == ServerStatus::FullUpdate {
                        // Still importing; reset its reconnection credit.
                        reconnect_waits.remove(replica_id);
                        pending = true;
                        true
                    } else if info.generation_id == expected_generation {
                        false
                    } else {
                        // Reconnected with a stale generation; keep it and
                        // let the bounded wait decide.
                        let waited = reconnect_waits.entry(*replica_id).or_insert(0);
                        *waited += 1;
                        if *waited < WAIT_END_RECONNECT_SECS {
                            pending = true;
                        }
                        true
                    }
                }
            });

            if !pending || self.broker.shutting_down() {
                break;
            }
            tokio::time::sleep(WAIT_END_POLL).await;
        }

        let mut state = ctx.state();
        for replica in waiting {
            state.failure_list.insert(replica);
        }
    }

    /// Sends one chunk of exported entries, pacing against the slowest
    /// acknowledging peer. Called through [`EntrySink`].
    pub(crate) async fn export_chunk(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        let ctx = self
            .current_ie_context()
            .ok_or_else(|| ReplError::ImportExportAborted("no export in progress".into()))?;

        let (target, msg_id, init_window, baseline_losses) = {
            let mut state = ctx.state();
            state.msg_cnt += 1;
            (
                state.export_target,
                state.msg_cnt,
                u64::from(state.init_window),
                state.init_lost_connections,
            )
        };

        loop {
            if self.broker.shutting_down() {
                return Err(ReplError::Shutdown);
            }
            if let Some(detail) = ctx.error() {
                return Err(ReplError::ImportExportAborted(detail));
            }
            let Some((slowest_id, slowest_acked)) = ctx.slowest_peer() else {
                // No flow-controlled peer; stream freely.
                break;
            };
            if self.broker.topology().replica(slowest_id).is_none() {
                let detail = format!("peer replica {slowest_id} disconnected during export");
                ctx.set_error_if_none(detail.clone());
                return Err(ReplError::ImportExportAborted(detail));
            }
            if msg_id.saturating_sub(slowest_acked) > init_window {
                tokio::time::sleep(EXPORT_WINDOW_POLL).await;
                if self.broker.has_connection_error()
                    || self.broker.num_lost_connections() != baseline_losses
                {
                    let detail = "replication server connection lost during export".to_string();
                    ctx.set_error_if_none(detail.clone());
                    return Err(ReplError::ImportExportAborted(detail));
                }
            } else {
                break;
            }
        }

        let sent = self
            .broker
            .publish_once(&ReplicationMsg::Entry(EntryMsg {
                sender_id: self.replica_id(),
                target,
                bytes: bytes.to_vec(),
                msg_id,
            }))
            .await;
        if !sent
            || self.broker.has_connection_error()
            || self.broker.num_lost_connections() != baseline_losses
        {
            let detail = "replication server connection lost during export".to_string();
            ctx.set_error_if_none(detail.clone());
            return Err(ReplError::ImportExportAborted(detail));
        }

        ctx.update_counters(count_entry_delimiters(bytes));
        Ok(())
    }

    /// Requests a full initialization of this replica from `source`.
    ///
    /// Returns a handle resolving when the import completes; the import
    /// itself runs on the listener task once the exporter announces itself.
    pub(crate) async fn initialize_from_remote(
        self: &Arc<Self>,
        source: ReplicaId,
    ) -> Result<ImportHandle> {
        if !self.broker.is_connected() {
            return Err(ReplError::NotConnected);
        }
        let ctx = self.acquire_ie_context(IeDirection::Import)?;
        let (tx, rx) = oneshot::channel();
        *ctx.done_tx.lock().expect("ie done lock") = Some(tx);

        let request = InitializeRequestMsg {
            domain: self.service_id(),
            sender_id: self.replica_id(),
            source,
            init_window: self.cfg.lock().expect("config lock").init_window,
        };
        {
            let mut state = ctx.state();
            state.local_task = true;
            state.import_source = source;
            state.init_request = Some(request.clone());
        }

        let sent = self
            .broker
            .publish(&ReplicationMsg::InitializeRequest(request))
            .await;
        if !sent {
            self.release_ie_context();
            return Err(ReplError::NotConnected);
        }
        Ok(ImportHandle { done: rx })
    }

    /// Runs an import announced by an exporter's initialize-target message.
    /// Called from the listener task, which then consumes the entry stream.
    pub(crate) async fn initialize(self: &Arc<Self>, announce: InitializeTargetMsg) {
        let replica_id = self.replica_id();
        if !announce.target.matches(replica_id) {
            return;
        }
        tracing::info!(
            domain = %self.service_id(),
            exporter = announce.sender_id,
            entries = announce.entry_count,
            "full update from remote replica starting"
        );

        self.apply_status_event(StatusEvent::ToFullUpdate).await;

        let ctx = if announce.requestor_id == replica_id {
            // We requested this import, so the context is already held.
            match self.current_ie_context() {
                Some(ctx) if ctx.is_import() => ctx,
                _ => {
                    tracing::warn!("initialize-target for a request we no longer hold");
                    return;
                }
            }
        } else {
            match self.acquire_ie_context(IeDirection::Import) {
                Ok(ctx) => ctx,
                Err(e) => {
                    self.broker
                        .publish(&ReplicationMsg::Error(ErrorMsg {
                            sender_id: replica_id,
                            target: InitTarget::Replica(announce.sender_id),
                            details: e.to_string(),
                            created_at_ms: now_ms(),
                        }))
                        .await;
                    return;
                }
            }
        };

        {
            let mut state = ctx.state();
            state.import_source = announce.sender_id;
            state.entry_count = announce.entry_count;
            state.entry_left = announce.entry_count;
            state.msg_cnt = 0;
            state.init_window = announce.init_window;
            state.error = None;
        }

        let mut source = EntrySource { core: self.clone() };
        let import_result = self.backend.import_backend(&mut source).await;

        // Renegotiate the session from the post-import state.
        self.broker.restart_current().await;

        let final_error = match ctx.error() {
            Some(detail) => Some(ReplError::ImportExportAborted(detail)),
            None => import_result.err(),
        };

        match final_error {
            Some(error) => {
                let (local_task, attempt_cnt, source_id, request) = {
                    let state = ctx.state();
                    (
                        state.local_task,
                        state.attempt_cnt,
                        state.import_source,
                        state.init_request.clone(),
                    )
                };
                let max_attempts = self.cfg.lock().expect("config lock").retry.import_attempts;
                let source_reachable = self.broker.topology().replica(source_id).is_some();
                if let (true, Some(request)) = (
                    local_task && attempt_cnt + 1 < max_attempts && source_reachable,
                    request,
                ) {
                    tracing::info!(
                        attempt = attempt_cnt + 1,
                        source = source_id,
                        error = %error,
                        "import failed, resending initialize request"
                    );
                    {
                        let mut state = ctx.state();
                        state.attempt_cnt += 1;
                        state.error = None;
                    }
                    // The context stays held; the exporter will answer with
                    // a fresh initialize-target.
                    self.broker
                        .publish(&ReplicationMsg::InitializeRequest(request))
                        .await;
                    return;
                }
                tracing::warn!(
                    domain = %self.service_id(),
                    exporter = announce.sender_id,
                    error = %error,
                    "full update from remote replica failed"
                );
                // Free the slot before resolving the caller's handle, so a
                // follow-up operation started from the completion is not
                // refused by our own stale context.
                self.release_ie_context();
                ctx.complete(Err(error));
            }
            None => {
                tracing::info!(
                    domain = %self.service_id(),
                    exporter = announce.sender_id,
                    "full update from remote replica complete"
                );
                self.release_ie_context();
                ctx.complete(Ok(()));
            }
        }
    }

    /// Receives the next entry chunk during an import. Called through
    /// [`EntrySource`]; `None` ends the stream (errors are kept in the
    /// context and surfaced by the import driver).
    pub(crate) async fn receive_entry_bytes(self: &Arc<Self>) -> Result<Option<Bytes>> {
        let Some(ctx) = self.current_ie_context() else {
            return Ok(None);
        };

        loop {
            let msg = match self.broker.receive_no_reconnect().await {
                Ok(msg) => msg,
                Err(ReplError::Timeout(_)) => continue,
                Err(_) => {
                    if !self.broker.shutting_down() {
                        ctx.set_error_if_none(
                            "replication server connection lost during import",
                        );
                    }
                    return Ok(None);
                }
            };
            match msg {
                ReplicationMsg::Entry(entry) => {
                    let (expected, half_window) = {
                        let mut state = ctx.state();
                        state.msg_cnt += 1;
                        (state.msg_cnt, (state.init_window / 2).max(1) as u64)
                    };
                    if expected != entry.msg_id {
                        ctx.set_error_if_none(
                            ReplError::BadMsgSequence {
                                expected,
                                got: entry.msg_id,
                            }
                            .to_string(),
                        );
                        return Ok(None);
                    }
                    ctx.update_counters(count_entry_delimiters(&entry.bytes));
                    if expected % half_window == 0 {
                        self.broker
                            .publish_once(&ReplicationMsg::InitializeRcvAck {
                                sender_id: self.replica_id(),
                                num_ack: expected,
                            })
                            .await;
                    }
                    return Ok(Some(Bytes::from(entry.bytes)));
                }
                ReplicationMsg::Done { .. } => return Ok(None),
                ReplicationMsg::Error(err) => {
                    // Stale reports from a previous attempt are ignored.
                    if err.created_at_ms >= ctx.start_time_ms() {
                        ctx.set_error_if_none(err.details);
                        return Ok(None);
                    }
                }
                ReplicationMsg::Topology(view) => {
                    let source = ctx.state().import_source;
                    if view.replica(source).is_none() {
                        ctx.set_error_if_none(format!(
                            "exporter replica {source} disconnected during import"
                        ));
                        return Ok(None);
                    }
                }
                other => {
                    tracing::trace!(kind = other.kind(), "discarding message during import");
                }
            }
        }
    }

    /// Routes a peer failure report into the running operation, if any.
    pub(crate) fn receive_peer_error(&self, err: ErrorMsg) {
        match self.current_ie_context() {
            Some(ctx) => {
                if err.created_at_ms < ctx.start_time_ms() {
                    tracing::warn!(details = %err.details, "stale failure report ignored");
                    return;
                }
                let is_broadcast_export =
                    !ctx.is_import() && matches!(ctx.state().export_target, InitTarget::All);
                if is_broadcast_export {
                    // One failing peer must not abort an export to all; its
                    // absence is caught by the wait-for-end phase.
                    tracing::warn!(
                        sender = err.sender_id,
                        details = %err.details,
                        "peer failed during broadcast export"
                    );
                    return;
                }
                ctx.set_error_if_none(err.details.clone());
                if ctx.is_import() && ctx.state().local_task {
                    // The import never started (e.g. the source is unknown);
                    // resolve the caller's handle now.
                    ctx.complete(Err(ReplError::ImportExportAborted(err.details)));
                    self.release_ie_context();
                }
            }
            None => {
                tracing::warn!(sender = err.sender_id, details = %err.details,
                    "failure report received outside any initialization");
            }
        }
    }
}
