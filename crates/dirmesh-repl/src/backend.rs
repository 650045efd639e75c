//! Storage collaborator hooks.
//!
//! The domain core owns all protocol state; everything touching the actual
//! replicated data goes through [`ReplicaBackend`], implemented by the
//! storage layer. Entry streams for total updates are connected through
//! [`EntrySink`] and [`EntrySource`], which plug into the replication
//! session behind the scenes.

use crate::domain::DomainCore;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dirmesh_protocol::UpdateMsg;
use std::sync::Arc;

/// Capability hooks implemented by the storage layer of a replica.
#[async_trait]
pub trait ReplicaBackend: Send + Sync {
    /// Total number of entries held, used to seed export progress counters.
    async fn count_entries(&self) -> Result<u64>;

    /// Streams the full backend content into `sink`, entry by entry (or in
    /// multi-entry chunks), with entries separated by a blank line.
    async fn export_backend(&self, sink: &mut EntrySink) -> Result<()>;

    /// Replaces the backend content with the entries read from `source`
    /// until it is exhausted.
    async fn import_backend(&self, source: &mut EntrySource) -> Result<()>;

    /// Replays one received update.
    ///
    /// Must not block; returns true if the replay completed synchronously
    /// (the domain then acknowledges on the caller's behalf), false if the
    /// backend will call `process_update_done` itself later.
    fn process_update(&self, update: &UpdateMsg) -> bool;
}

/// Write side of a total-update stream, handed to
/// [`ReplicaBackend::export_backend`].
///
/// Every write is flow-controlled against the slowest acknowledging peer.
pub struct EntrySink {
    pub(crate) core: Arc<DomainCore>,
}

impl EntrySink {
    /// Sends a chunk of entries to the import target(s), blocking while the
    /// exporter is a full window ahead of the slowest peer.
    pub async fn write_entries(&mut self, bytes: &[u8]) -> Result<()> {
        self.core.export_chunk(bytes).await
    }
}

/// Read side of a total-update stream, handed to
/// [`ReplicaBackend::import_backend`].
pub struct EntrySource {
    pub(crate) core: Arc<DomainCore>,
}

impl EntrySource {
    /// Returns the next chunk of entries, or `None` once the stream ended.
    ///
    /// A stream ended by a failure also returns `None`; the failure is kept
    /// by the domain and surfaced once the import completes.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.core.receive_entry_bytes().await
    }
}
