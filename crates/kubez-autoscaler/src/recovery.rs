//! Recovery path bookkeeping
//!
//! Recreating a deleted autoscaler is plain creation: the reconciler notices
//! the object is missing while the source still carries a valid policy. The
//! only thing recovery adds is attribution. Ingestion records keys whose
//! managed autoscaler was deleted, and the reconciler consumes the mark when
//! it creates the replacement so the Event reads "Recovered" instead of
//! "Created". Hints never change what gets written.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::workload::WorkloadKey;

/// Keys whose managed autoscaler was observed deleted
#[derive(Default)]
pub struct RecoveryHints {
    deleted: Mutex<HashSet<WorkloadKey>>,
}

impl RecoveryHints {
    /// Create an empty hint set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the autoscaler for `key` was deleted
    pub fn mark_deleted(&self, key: &WorkloadKey) {
        self.deleted.lock().insert(key.clone());
    }

    /// Consume the hint for `key`, returning whether one was present
    pub fn take(&self, key: &WorkloadKey) -> bool {
        self.deleted.lock().remove(key)
    }

    /// Drop a hint without acting on it
    pub fn clear(&self, key: &WorkloadKey) {
        self.deleted.lock().remove(key);
    }

    /// Number of outstanding hints
    pub fn len(&self) -> usize {
        self.deleted.lock().len()
    }

    /// Whether there are no outstanding hints
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
