//! Catalog changes not yet observed in the persisted Secret
//!
//! A cross-cluster API key is only usable once its encoded value is saved in
//! the client's catalog. The Secret cache may lag behind our own writes, so
//! every change is also kept in memory until a later load shows it. Without
//! this, a pass reading a stale Secret would create the key a second time or
//! bring back an alias that was just deleted.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::crd::ClusterKey;

/// Intent recorded for one alias
#[derive(Clone, PartialEq, Eq)]
pub enum PendingChange {
    Add {
        remote: ClusterKey,
        alias: String,
        key_id: String,
        encoded: String,
    },
    Delete {
        alias: String,
    },
}

impl PendingChange {
    pub fn alias(&self) -> &str {
        match self {
            PendingChange::Add { alias, .. } | PendingChange::Delete { alias } => alias,
        }
    }
}

impl std::fmt::Debug for PendingChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingChange::Add {
                remote,
                alias,
                key_id,
                ..
            } => f
                .debug_struct("Add")
                .field("remote", &remote.to_string())
                .field("alias", alias)
                .field("key_id", key_id)
                .finish_non_exhaustive(),
            PendingChange::Delete { alias } => {
                f.debug_struct("Delete").field("alias", alias).finish()
            }
        }
    }
}

/// Pending changes of one client cluster, kept in insertion order with at
/// most one change per alias
#[derive(Debug, Default)]
pub struct PendingChanges {
    changes: Mutex<Vec<PendingChange>>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, change: PendingChange) {
        let mut changes = self.changes.lock();
        changes.retain(|c| c.alias() != change.alias());
        changes.push(change);
    }

    pub fn add_key(&self, remote: &ClusterKey, alias: &str, key_id: &str, encoded: &str) {
        self.record(PendingChange::Add {
            remote: remote.clone(),
            alias: alias.to_string(),
            key_id: key_id.to_string(),
            encoded: encoded.to_string(),
        });
    }

    pub fn delete_alias(&self, alias: &str) {
        self.record(PendingChange::Delete {
            alias: alias.to_string(),
        });
    }

    /// Drop the pending `Add` for `alias` once `key_id` has been observed
    pub fn forget_add_key(&self, alias: &str, key_id: &str) {
        self.changes.lock().retain(|c| {
            !matches!(c, PendingChange::Add { alias: a, key_id: k, .. } if a == alias && k == key_id)
        });
    }

    /// Drop the pending `Delete` for `alias` once its absence has been observed
    pub fn forget_delete_alias(&self, alias: &str) {
        self.changes
            .lock()
            .retain(|c| !matches!(c, PendingChange::Delete { alias: a } if a == alias));
    }

    /// Snapshot of the changes, oldest first
    pub fn get(&self) -> Vec<PendingChange> {
        self.changes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.changes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.lock().is_empty()
    }
}

/// Pending changes of every client cluster known to this process
#[derive(Debug, Default)]
pub struct PendingChangesRegistry {
    clusters: RwLock<HashMap<ClusterKey, Arc<PendingChanges>>>,
}

impl PendingChangesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending changes of `cluster`, created on first use.
    ///
    /// Concurrent callers for the same cluster always get the same instance.
    pub fn get_or_create(&self, cluster: &ClusterKey) -> Arc<PendingChanges> {
        if let Some(existing) = self.clusters.read().get(cluster) {
            return existing.clone();
        }
        let mut clusters = self.clusters.write();
        // another writer may have won the race since the read lock was released
        clusters
            .entry(cluster.clone())
            .or_insert_with(|| {
                debug!("Tracking pending API key changes for {}", cluster);
                Arc::new(PendingChanges::new())
            })
            .clone()
    }

    pub fn get(&self, cluster: &ClusterKey) -> Option<Arc<PendingChanges>> {
        self.clusters.read().get(cluster).cloned()
    }

    /// Stop tracking a deleted cluster
    pub fn forget_cluster(&self, cluster: &ClusterKey) {
        if self.clusters.write().remove(cluster).is_some() {
            debug!("Forgot pending API key changes for {}", cluster);
        }
    }

    pub fn len(&self) -> usize {
        self.clusters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.read().is_empty()
    }
}
