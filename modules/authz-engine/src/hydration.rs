//! Loading a tenant graph from durable storage at process start.
//!
//! Hydration runs once, before the command processor starts consuming.
//! Entities keep their stored ids and the id counter resumes above the
//! highest of them. A cycle or capacity violation in durable data means
//! the store is corrupt, which is fatal: the backend exits with a distinct
//! code so the supervisor can tell corruption from transient failures.

use thiserror::Error;

use crate::domain::error::DomainError;
use crate::domain::graph::TenantGraph;
use crate::domain::model::Entity;
use crate::persistence::{Snapshot, StoreError, TenantStore};

#[derive(Debug, Error)]
pub enum HydrationError {
    /// The store could not be read at all.
    #[error("store unavailable during hydration: {0}")]
    Store(#[from] StoreError),

    /// The durable data violates a graph invariant.
    #[error("corrupt tenant snapshot: {0}")]
    Corrupt(String),
}

/// Build a graph from a snapshot. Exposed separately from [`hydrate`] so
/// tests can drive it without a store.
///
/// # Errors
/// `Corrupt` for duplicate ids, dangling references, invalid relations,
/// capacity violations or cycles in the snapshot.
pub fn build_graph(snapshot: Snapshot) -> Result<TenantGraph, HydrationError> {
    let mut graph = TenantGraph::new();

    for row in snapshot.entities {
        let mut entity = Entity::new(row.id, row.kind, row.name);
        entity.metadata = row.metadata;
        graph
            .insert_hydrated(entity)
            .map_err(|e| HydrationError::Corrupt(e.to_string()))?;
    }

    for (parent_id, child_id) in snapshot.edges {
        graph.link(parent_id, child_id).map_err(|e| match e {
            DomainError::CyclicHierarchy { .. }
            | DomainError::CapacityExceeded { .. }
            | DomainError::InvalidRelation(_)
            | DomainError::NotFound(_) => {
                HydrationError::Corrupt(format!("edge {parent_id} -> {child_id}: {e}"))
            }
            other => HydrationError::Corrupt(other.to_string()),
        })?;
    }

    for row in snapshot.permissions {
        graph
            .attach_hydrated(row.into())
            .map_err(|e| HydrationError::Corrupt(e.to_string()))?;
    }

    graph.rebuild_views();
    graph
        .check_invariants()
        .map_err(HydrationError::Corrupt)?;
    Ok(graph)
}

/// Load the tenant snapshot and build the graph, returning the store's
/// last used sequence alongside it.
///
/// # Errors
/// `Store` when the snapshot cannot be read, `Corrupt` when it violates a
/// graph invariant.
pub async fn hydrate(store: &dyn TenantStore) -> Result<(TenantGraph, u64), HydrationError> {
    let snapshot = store.load_snapshot().await?;
    let entities = snapshot.entities.len();
    let edges = snapshot.edges.len();
    let permissions = snapshot.permissions.len();

    let graph = build_graph(snapshot)?;
    let last_seq = store.last_sequence().await?;

    tracing::info!(
        entities,
        edges,
        permissions,
        next_id = graph.next_id(),
        last_seq,
        "tenant graph hydrated"
    );
    Ok((graph, last_seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{EntityKind, Polarity, Scheme, Verb};
    use crate::persistence::{EntityRow, MemoryStore, PermissionRow};
    use std::collections::BTreeMap;

    fn entity_row(id: u64, kind: EntityKind, name: &str) -> EntityRow {
        EntityRow {
            id,
            kind,
            name: name.to_owned(),
            metadata: BTreeMap::new(),
        }
    }

    fn permission_row(id: u64, entity_id: u64, uri: &str) -> PermissionRow {
        PermissionRow {
            id,
            entity_id,
            uri: uri.to_owned(),
            verb: Verb::Get,
            polarity: Polarity::Grant,
            scheme: Scheme::Explicit,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn hydrates_entities_edges_and_permissions() {
        let store = MemoryStore::with_snapshot(Snapshot {
            entities: vec![
                entity_row(1, EntityKind::User, "alice"),
                entity_row(2, EntityKind::Group, "staff"),
            ],
            edges: vec![(2, 1)],
            permissions: vec![permission_row(3, 2, "/api/orders")],
        });

        let (graph, last_seq) = hydrate(&store).await.unwrap();
        assert_eq!(last_seq, 0);
        assert_eq!(graph.next_id(), 4);
        assert!(graph.entity(1).unwrap().parents.contains(&2));
        assert_eq!(graph.entity(2).unwrap().permissions, vec![3]);
        assert_eq!(
            graph.views().resource("/api/orders").unwrap().ref_count(),
            1
        );
        graph.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn cyclic_snapshot_is_corrupt() {
        let store = MemoryStore::with_snapshot(Snapshot {
            entities: vec![
                entity_row(1, EntityKind::Group, "g1"),
                entity_row(2, EntityKind::Group, "g2"),
            ],
            edges: vec![(1, 2), (2, 1)],
            permissions: vec![],
        });

        let err = hydrate(&store).await.unwrap_err();
        assert!(matches!(err, HydrationError::Corrupt(_)));
    }

    #[tokio::test]
    async fn dangling_edge_is_corrupt() {
        let store = MemoryStore::with_snapshot(Snapshot {
            entities: vec![entity_row(1, EntityKind::Group, "g1")],
            edges: vec![(1, 99)],
            permissions: vec![],
        });

        assert!(matches!(
            hydrate(&store).await.unwrap_err(),
            HydrationError::Corrupt(_)
        ));
    }

    #[tokio::test]
    async fn dangling_permission_is_corrupt() {
        let store = MemoryStore::with_snapshot(Snapshot {
            entities: vec![],
            edges: vec![],
            permissions: vec![permission_row(1, 42, "/x")],
        });

        assert!(matches!(
            hydrate(&store).await.unwrap_err(),
            HydrationError::Corrupt(_)
        ));
    }

    #[test]
    fn duplicate_entity_id_is_corrupt() {
        let snapshot = Snapshot {
            entities: vec![
                entity_row(1, EntityKind::User, "a"),
                entity_row(1, EntityKind::User, "b"),
            ],
            edges: vec![],
            permissions: vec![],
        };
        assert!(matches!(
            build_graph(snapshot).unwrap_err(),
            HydrationError::Corrupt(_)
        ));
    }

    #[test]
    fn fresh_ids_start_above_hydrated_ones() {
        let snapshot = Snapshot {
            entities: vec![entity_row(10, EntityKind::Group, "staff")],
            edges: vec![],
            permissions: vec![permission_row(25, 10, "/api/**")],
        };
        let mut graph = build_graph(snapshot).unwrap();
        let id = graph.add_entity(EntityKind::User, "alice").unwrap();
        assert_eq!(id, 26);
    }
}
