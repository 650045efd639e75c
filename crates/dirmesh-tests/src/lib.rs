//! DirMesh test and validation infrastructure.
//!
//! Provides an in-process replication server good enough to drive the whole
//! replica-side protocol (handshakes, topology pushes, window credits,
//! update fan-out, total-update routing), plus a memory-backed storage
//! collaborator. End-to-end scenarios live under `tests/`.

pub mod harness;
pub mod memory_backend;

pub use harness::{TestReplicationServer, TestServerConfig};
pub use memory_backend::MemoryBackend;
