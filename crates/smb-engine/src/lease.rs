//! Process-wide table of granted leases.
//!
//! Lease break notifications carry only a lease key; the registry maps it back to
//! the filesystem node and the open that holds the lease. The table is guarded by a
//! plain mutex that is never held across an await point: every method copies what
//! it needs out before returning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, Weak};

use smb_dtyp::Guid;
use smb_msg::FileId;

use crate::durable::DurableHandle;
use crate::{Error, Result};

/// Opaque identifier of a node in the caller's filesystem view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct LeaseEntry {
    pub node: NodeId,
    pub file_id: FileId,
    pub handle: Weak<DurableHandle>,
}

#[derive(Debug, Default)]
pub struct LeaseRegistry {
    entries: Mutex<HashMap<Guid, LeaseEntry>>,
    closed: AtomicBool,
}

impl LeaseRegistry {
    pub fn new() -> LeaseRegistry {
        LeaseRegistry::default()
    }

    /// Reopens a registry after [`close`](Self::close).
    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Drops every entry; inserts fail until reopened.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.lock().clear();
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Adds the entry for a newly granted lease. A key maps to at most one entry.
    pub fn insert(&self, lease_key: Guid, entry: LeaseEntry) -> Result<()> {
        if !self.is_open() {
            return Err(Error::InvalidState("lease registry is closed".into()));
        }
        let mut entries = self.lock();
        if entries.contains_key(&lease_key) {
            return Err(Error::LeaseInconsistency(format!(
                "lease key {lease_key} is already registered"
            )));
        }
        log::trace!("Registering lease {lease_key} for {}", entry.node);
        entries.insert(lease_key, entry);
        Ok(())
    }

    pub fn lookup(&self, lease_key: &Guid) -> Option<LeaseEntry> {
        self.lock().get(lease_key).cloned()
    }

    /// Points an entry at the file id a durable reconnect returned, keeping the
    /// entry itself. Returns false if no entry exists.
    pub fn update_file_id(&self, lease_key: &Guid, file_id: FileId) -> bool {
        match self.lock().get_mut(lease_key) {
            Some(entry) => {
                entry.file_id = file_id;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, lease_key: &Guid) -> Option<LeaseEntry> {
        self.lock().remove(lease_key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Guid, LeaseEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
