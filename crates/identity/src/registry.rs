//! Registration entries: entry id to workload identity mapping.
//!
//! Entries are provisioned out of band and only ever read here.

use sovereign_core::EntryConfig;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationEntry {
    pub id: String,
    /// Workload identity URI placed in the credential.
    pub spiffe_id: String,
    pub parent_id: String,
    pub selectors: Vec<String>,
    /// Overrides the service default TTL.
    pub ttl: Option<Duration>,
}

impl From<&EntryConfig> for RegistrationEntry {
    fn from(config: &EntryConfig) -> Self {
        Self {
            id: config.id.clone(),
            spiffe_id: config.spiffe_id.clone(),
            parent_id: config.parent_id.clone(),
            selectors: config.selectors.clone(),
            ttl: config.ttl_secs.map(Duration::from_secs),
        }
    }
}

/// Read-only lookup of registration entries.
pub trait EntryStore: Send + Sync {
    fn fetch(&self, entry_id: &str) -> Option<RegistrationEntry>;
}

/// Entries fixed at startup.
#[derive(Debug, Default, Clone)]
pub struct StaticEntryStore {
    entries: HashMap<String, RegistrationEntry>,
}

impl StaticEntryStore {
    pub fn new(entries: impl IntoIterator<Item = RegistrationEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }

    pub fn from_config(entries: &[EntryConfig]) -> Self {
        Self::new(entries.iter().map(RegistrationEntry::from))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl EntryStore for StaticEntryStore {
    fn fetch(&self, entry_id: &str) -> Option<RegistrationEntry> {
        self.entries.get(entry_id).cloned()
    }
}
