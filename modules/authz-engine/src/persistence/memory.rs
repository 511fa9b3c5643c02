//! In-memory store for tests and mock mode.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    AuditRecord, ChangeRecord, EntityRow, PermissionRow, PersistOp, Snapshot, StoreError,
    TenantStore,
};
use crate::domain::model::EntityId;

#[derive(Default)]
struct Inner {
    entities: BTreeMap<EntityId, EntityRow>,
    edges: BTreeSet<(EntityId, EntityId)>,
    permissions: BTreeMap<u64, PermissionRow>,
    audit: Vec<AuditRecord>,
    applied: BTreeSet<u64>,
}

/// A [`TenantStore`] backed by plain maps. Used by tests and `--mock`
/// mode; supports injecting a number of upcoming failures to exercise the
/// retry and degradation paths.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_next: AtomicU32,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the store so hydration has something to load.
    #[must_use]
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            for row in snapshot.entities {
                inner.entities.insert(row.id, row);
            }
            for edge in snapshot.edges {
                inner.edges.insert(edge);
            }
            for row in snapshot.permissions {
                inner.permissions.insert(row.id, row);
            }
        }
        store
    }

    /// Make the next `n` write operations fail.
    pub fn inject_failures(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<(), StoreError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(StoreError::Unavailable("injected failure".to_owned()));
        }
        Ok(())
    }

    #[must_use]
    pub fn audit_len(&self) -> usize {
        self.inner.lock().audit.len()
    }

    #[must_use]
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.inner.lock().audit.clone()
    }

    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.inner.lock().entities.len()
    }

    #[must_use]
    pub fn permission_count(&self) -> usize {
        self.inner.lock().permissions.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.inner.lock().edges.len()
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn load_snapshot(&self) -> Result<Snapshot, StoreError> {
        let inner = self.inner.lock();
        Ok(Snapshot {
            entities: inner.entities.values().cloned().collect(),
            edges: inner.edges.iter().copied().collect(),
            permissions: inner.permissions.values().cloned().collect(),
        })
    }

    async fn last_sequence(&self) -> Result<u64, StoreError> {
        let inner = self.inner.lock();
        let applied = inner.applied.iter().next_back().copied().unwrap_or(0);
        let audited = inner.audit.iter().map(|r| r.seq).max().unwrap_or(0);
        Ok(applied.max(audited))
    }

    async fn persist_mutation(&self, record: &ChangeRecord) -> Result<(), StoreError> {
        self.maybe_fail()?;
        let mut inner = self.inner.lock();
        if !inner.applied.insert(record.change_id) {
            return Ok(());
        }
        for op in &record.ops {
            match op {
                PersistOp::UpsertEntity(row) => {
                    inner.entities.insert(row.id, row.clone());
                }
                PersistOp::DeleteEntity(id) => {
                    inner.entities.remove(id);
                }
                PersistOp::InsertEdge {
                    parent_id,
                    child_id,
                } => {
                    inner.edges.insert((*parent_id, *child_id));
                }
                PersistOp::DeleteEdge {
                    parent_id,
                    child_id,
                } => {
                    inner.edges.remove(&(*parent_id, *child_id));
                }
                PersistOp::UpsertPermission(row) => {
                    inner.permissions.insert(row.id, row.clone());
                }
                PersistOp::DeletePermission(id) => {
                    inner.permissions.remove(id);
                }
            }
        }
        Ok(())
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.maybe_fail()?;
        self.inner.lock().audit.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::EntityKind;

    fn entity_row(id: u64, name: &str) -> EntityRow {
        EntityRow {
            id,
            kind: EntityKind::User,
            name: name.to_owned(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn persist_is_idempotent_by_change_id() {
        let store = MemoryStore::new();
        let record = ChangeRecord {
            change_id: 7,
            ops: vec![PersistOp::UpsertEntity(entity_row(1, "alice"))],
        };
        store.persist_mutation(&record).await.unwrap();

        // Replaying the same change id after the entity was deleted must
        // not resurrect it.
        let delete = ChangeRecord {
            change_id: 8,
            ops: vec![PersistOp::DeleteEntity(1)],
        };
        store.persist_mutation(&delete).await.unwrap();
        store.persist_mutation(&record).await.unwrap();
        assert_eq!(store.entity_count(), 0);
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let store = MemoryStore::new();
        store
            .persist_mutation(&ChangeRecord {
                change_id: 1,
                ops: vec![
                    PersistOp::UpsertEntity(entity_row(1, "alice")),
                    PersistOp::UpsertEntity(entity_row(2, "staff")),
                    PersistOp::InsertEdge {
                        parent_id: 2,
                        child_id: 1,
                    },
                ],
            })
            .await
            .unwrap();

        let snapshot = store.load_snapshot().await.unwrap();
        assert_eq!(snapshot.entities.len(), 2);
        assert_eq!(snapshot.edges, vec![(2, 1)]);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_unavailable() {
        let store = MemoryStore::new();
        store.inject_failures(1);
        let record = ChangeRecord {
            change_id: 1,
            ops: vec![],
        };
        assert!(store.persist_mutation(&record).await.is_err());
        assert!(store.persist_mutation(&record).await.is_ok());
    }
}
