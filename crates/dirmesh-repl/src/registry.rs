//! Explicit registry of replicated domains.
//!
//! The process composition root constructs one registry and hands it to
//! whatever needs domain lookups; there is no global state.

use crate::domain::ReplicationDomain;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Maps service identifiers to their replication domains.
#[derive(Default)]
pub struct DomainRegistry {
    domains: Mutex<HashMap<String, Arc<ReplicationDomain>>>,
}

impl DomainRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a domain under `service_id`, returning the previously
    /// registered domain if any.
    pub fn register(
        &self,
        service_id: impl Into<String>,
        domain: Arc<ReplicationDomain>,
    ) -> Option<Arc<ReplicationDomain>> {
        self.domains
            .lock()
            .expect("registry lock")
            .insert(service_id.into(), domain)
    }

    /// Looks up the domain registered under `service_id`.
    pub fn get(&self, service_id: &str) -> Option<Arc<ReplicationDomain>> {
        self.domains
            .lock()
            .expect("registry lock")
            .get(service_id)
            .cloned()
    }

    /// Removes and returns the domain registered under `service_id`.
    pub fn remove(&self, service_id: &str) -> Option<Arc<ReplicationDomain>> {
        self.domains
            .lock()
            .expect("registry lock")
            .remove(service_id)
    }

    /// The registered service identifiers, sorted.
    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .domains
            .lock()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
