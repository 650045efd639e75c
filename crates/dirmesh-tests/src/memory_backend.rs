//! Memory-backed storage collaborator for tests.

use async_trait::async_trait;
use dirmesh_protocol::{Csn, UpdateMsg};
use dirmesh_repl::{EntrySink, EntrySource, ReplicaBackend, Result};
use std::sync::Mutex;

/// A [`ReplicaBackend`] holding its entries and replayed updates in memory.
///
/// Exports stream one chunk per stored entry; imports concatenate every
/// received chunk. Updates are replayed synchronously by recording them.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<Vec<Vec<u8>>>,
    applied: Mutex<Vec<UpdateMsg>>,
    imported: Mutex<Vec<u8>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding `count` generated entries, each terminated
    /// by the blank-line delimiter.
    pub fn with_generated_entries(count: usize) -> Self {
        let backend = Self::new();
        {
            let mut entries = backend.entries.lock().unwrap();
            for i in 0..count {
                entries.push(format!("dn: cn=entry-{i}\ncn: entry-{i}\n\n").into_bytes());
            }
        }
        backend
    }

    /// The updates replayed so far.
    pub fn applied(&self) -> Vec<UpdateMsg> {
        self.applied.lock().unwrap().clone()
    }

    /// The CSNs of replayed updates, in replay order.
    pub fn applied_csns(&self) -> Vec<Csn> {
        self.applied.lock().unwrap().iter().map(|u| u.csn).collect()
    }

    /// Everything received through imports, concatenated.
    pub fn imported_bytes(&self) -> Vec<u8> {
        self.imported.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplicaBackend for MemoryBackend {
    async fn count_entries(&self) -> Result<u64> {
        Ok(self.entries.lock().unwrap().len() as u64)
    }

    async fn export_backend(&self, sink: &mut EntrySink) -> Result<()> {
        let entries = self.entries.lock().unwrap().clone();
        for entry in entries {
            sink.write_entries(&entry).await?;
        }
        Ok(())
    }

    async fn import_backend(&self, source: &mut EntrySource) -> Result<()> {
        while let Some(chunk) = source.next_chunk().await? {
            self.imported.lock().unwrap().extend_from_slice(&chunk);
        }
        Ok(())
    }

    fn process_update(&self, update: &UpdateMsg) -> bool {
        self.applied.lock().unwrap().push(update.clone());
        true
    }
}
