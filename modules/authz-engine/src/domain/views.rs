//! Denormalized lookup views over the tenant graph.
//!
//! The views are owned by [`crate::domain::graph::TenantGraph`] and updated
//! in the same step as every graph mutation; they are never process-global
//! and never touched outside the single-writer loop. After a bulk load,
//! [`NormalizerViews::rebuild`] recomputes everything from the graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::model::{Entity, EntityId, EntityKind, Permission, PermissionId};

/// A URI that at least one permission references.
///
/// Created when the first permission for the URI is attached and dropped
/// when the last one is detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub uri: String,
    pub permission_ids: BTreeSet<PermissionId>,
}

impl ResourceRecord {
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.permission_ids.len()
    }
}

/// Variant-partitioned id sets, URI-indexed resources and per-entity
/// permission lists.
#[derive(Debug, Default, Clone)]
pub struct NormalizerViews {
    users: BTreeSet<EntityId>,
    groups: BTreeSet<EntityId>,
    roles: BTreeSet<EntityId>,
    resource_by_uri: HashMap<String, ResourceRecord>,
    entity_permissions: HashMap<EntityId, Vec<PermissionId>>,
}

impl NormalizerViews {
    fn partition_mut(&mut self, kind: EntityKind) -> &mut BTreeSet<EntityId> {
        match kind {
            EntityKind::User => &mut self.users,
            EntityKind::Group => &mut self.groups,
            EntityKind::Role => &mut self.roles,
        }
    }

    /// Ids of all entities of one kind, in ascending id order.
    #[must_use]
    pub fn partition(&self, kind: EntityKind) -> &BTreeSet<EntityId> {
        match kind {
            EntityKind::User => &self.users,
            EntityKind::Group => &self.groups,
            EntityKind::Role => &self.roles,
        }
    }

    #[must_use]
    pub fn resource(&self, uri: &str) -> Option<&ResourceRecord> {
        self.resource_by_uri.get(uri)
    }

    /// Permissions attached to an entity, in attachment order.
    #[must_use]
    pub fn permissions_of(&self, entity_id: EntityId) -> &[PermissionId] {
        self.entity_permissions
            .get(&entity_id)
            .map_or(&[], Vec::as_slice)
    }

    pub(crate) fn on_entity_added(&mut self, id: EntityId, kind: EntityKind) {
        self.partition_mut(kind).insert(id);
    }

    pub(crate) fn on_entity_removed(&mut self, id: EntityId, kind: EntityKind) {
        self.partition_mut(kind).remove(&id);
        self.entity_permissions.remove(&id);
    }

    pub(crate) fn on_permission_attached(&mut self, permission: &Permission) {
        self.entity_permissions
            .entry(permission.entity_id)
            .or_default()
            .push(permission.id);
        self.resource_by_uri
            .entry(permission.uri.clone())
            .or_insert_with(|| ResourceRecord {
                uri: permission.uri.clone(),
                permission_ids: BTreeSet::new(),
            })
            .permission_ids
            .insert(permission.id);
    }

    pub(crate) fn on_permission_detached(&mut self, permission: &Permission) {
        if let Some(list) = self.entity_permissions.get_mut(&permission.entity_id) {
            list.retain(|id| *id != permission.id);
            if list.is_empty() {
                self.entity_permissions.remove(&permission.entity_id);
            }
        }
        if let Some(record) = self.resource_by_uri.get_mut(&permission.uri) {
            record.permission_ids.remove(&permission.id);
            if record.permission_ids.is_empty() {
                self.resource_by_uri.remove(&permission.uri);
            }
        }
    }

    /// Recompute every view from the domain graph. Used after hydration.
    pub fn rebuild(
        &mut self,
        entities: &BTreeMap<EntityId, Entity>,
        permissions: &BTreeMap<PermissionId, Permission>,
    ) {
        self.users.clear();
        self.groups.clear();
        self.roles.clear();
        self.resource_by_uri.clear();
        self.entity_permissions.clear();

        for entity in entities.values() {
            self.on_entity_added(entity.id, entity.kind);
            for pid in &entity.permissions {
                if let Some(permission) = permissions.get(pid) {
                    self.on_permission_attached(permission);
                }
            }
        }
    }

    /// Verify congruence with the domain graph: the union of the variant
    /// partitions equals the entity map and no view references a missing
    /// entity or permission.
    ///
    /// # Errors
    /// Returns a description of the first violation found.
    pub fn check_congruence(
        &self,
        entities: &BTreeMap<EntityId, Entity>,
        permissions: &BTreeMap<PermissionId, Permission>,
    ) -> Result<(), String> {
        let partitioned: usize = self.users.len() + self.groups.len() + self.roles.len();
        if partitioned != entities.len() {
            return Err(format!(
                "partition union has {partitioned} ids, graph has {} entities",
                entities.len()
            ));
        }
        for id in self.users.iter().chain(&self.groups).chain(&self.roles) {
            if !entities.contains_key(id) {
                return Err(format!("view references missing entity {id}"));
            }
        }
        for (entity_id, list) in &self.entity_permissions {
            let entity = entities
                .get(entity_id)
                .ok_or_else(|| format!("permission view references missing entity {entity_id}"))?;
            if &entity.permissions != list {
                return Err(format!("permission list for entity {entity_id} diverged"));
            }
        }
        for record in self.resource_by_uri.values() {
            if record.permission_ids.is_empty() {
                return Err(format!("resource {} has zero references", record.uri));
            }
            for pid in &record.permission_ids {
                if !permissions.contains_key(pid) {
                    return Err(format!(
                        "resource {} references missing permission {pid}",
                        record.uri
                    ));
                }
            }
        }
        Ok(())
    }
}
