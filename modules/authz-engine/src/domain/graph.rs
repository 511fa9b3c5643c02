//! The per-tenant graph store.
//!
//! Owns every entity, edge and permission for one tenant together with the
//! denormalized views. All operations are synchronous and must only be
//! invoked from the tenant's single-writer loop; nothing here is `Sync`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::error::DomainError;
use super::model::{
    Entity, EntityId, EntityKind, MAX_CHILDREN, MAX_NAME_LEN, Permission, PermissionId, Polarity,
    Scheme, Verb,
};
use super::pattern::UriPattern;
use super::views::NormalizerViews;

/// Everything that was detached while removing an entity. The processor
/// turns this into row-level persistence operations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemovalReport {
    /// `(parent_id, child_id)` pairs removed.
    pub edges: Vec<(EntityId, EntityId)>,
    pub permissions: Vec<Permission>,
}

/// Parameters for attaching a permission.
#[derive(Debug, Clone)]
pub struct PermissionSpec {
    pub uri: String,
    pub verb: Verb,
    pub polarity: Polarity,
    pub scheme: Scheme,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct TenantGraph {
    entities: BTreeMap<EntityId, Entity>,
    permissions: BTreeMap<PermissionId, Permission>,
    next_id: u64,
    views: NormalizerViews,
}

fn validate_name(name: &str) -> Result<(), DomainError> {
    if name.is_empty() {
        return Err(DomainError::InvalidArgument(
            "entity name must not be empty".to_owned(),
        ));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(DomainError::InvalidArgument(format!(
            "entity name exceeds {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

impl TenantGraph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            permissions: BTreeMap::new(),
            next_id: 1,
            views: NormalizerViews::default(),
        }
    }

    /// Next id the graph will allocate. Strictly greater than every live id.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    #[must_use]
    pub fn permission(&self, id: PermissionId) -> Option<&Permission> {
        self.permissions.get(&id)
    }

    #[must_use]
    pub fn entities(&self) -> &BTreeMap<EntityId, Entity> {
        &self.entities
    }

    #[must_use]
    pub fn permissions(&self) -> &BTreeMap<PermissionId, Permission> {
        &self.permissions
    }

    #[must_use]
    pub fn views(&self) -> &NormalizerViews {
        &self.views
    }

    fn require(&self, id: EntityId) -> Result<&Entity, DomainError> {
        self.entities
            .get(&id)
            .ok_or_else(|| DomainError::not_found_entity(id))
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Insert a new entity and register it in the views.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty or oversized name.
    pub fn add_entity(&mut self, kind: EntityKind, name: &str) -> Result<EntityId, DomainError> {
        validate_name(name)?;
        let id = self.alloc_id();
        self.entities
            .insert(id, Entity::new(id, kind, name.to_owned()));
        self.views.on_entity_added(id, kind);
        Ok(id)
    }

    /// Insert an entity loaded from durable storage, preserving its id.
    /// Used only by hydration, before the engine starts.
    ///
    /// # Errors
    /// `InvalidArgument` if the id is zero or already present.
    pub fn insert_hydrated(&mut self, entity: Entity) -> Result<(), DomainError> {
        if entity.id == 0 {
            return Err(DomainError::InvalidArgument(
                "entity id 0 is reserved".to_owned(),
            ));
        }
        validate_name(&entity.name)?;
        if self.entities.contains_key(&entity.id) {
            return Err(DomainError::InvalidArgument(format!(
                "duplicate entity id {} in snapshot",
                entity.id
            )));
        }
        self.next_id = self.next_id.max(entity.id + 1);
        self.views.on_entity_added(entity.id, entity.kind);
        self.entities.insert(entity.id, entity);
        Ok(())
    }

    /// Rename an entity.
    ///
    /// # Errors
    /// `NotFound` or `InvalidArgument`.
    pub fn update_name(&mut self, id: EntityId, name: &str) -> Result<(), DomainError> {
        validate_name(name)?;
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or_else(|| DomainError::not_found_entity(id))?;
        entity.name.clear();
        entity.name.push_str(name);
        Ok(())
    }

    /// Remove an entity, detaching every incoming and outgoing edge and
    /// every attached permission first.
    ///
    /// # Errors
    /// `NotFound` if the entity does not exist.
    pub fn remove_entity(&mut self, id: EntityId) -> Result<RemovalReport, DomainError> {
        let entity = self.require(id)?.clone();
        let mut report = RemovalReport::default();

        for parent_id in &entity.parents {
            if let Some(parent) = self.entities.get_mut(parent_id) {
                parent.children.remove(&id);
            }
            report.edges.push((*parent_id, id));
        }
        for child_id in &entity.children {
            if let Some(child) = self.entities.get_mut(child_id) {
                child.parents.remove(&id);
            }
            report.edges.push((id, *child_id));
        }

        for pid in &entity.permissions {
            if let Some(permission) = self.permissions.remove(pid) {
                self.views.on_permission_detached(&permission);
                report.permissions.push(permission);
            }
        }

        self.views.on_entity_removed(id, entity.kind);
        self.entities.remove(&id);
        Ok(report)
    }

    fn check_relation(parent: &Entity, child: &Entity) -> Result<(), DomainError> {
        match (parent.kind, child.kind) {
            (EntityKind::User, _) => Err(DomainError::InvalidRelation(format!(
                "user {} cannot have children",
                parent.id
            ))),
            (EntityKind::Role, EntityKind::User) | (EntityKind::Group, _) => Ok(()),
            (EntityKind::Role, other) => Err(DomainError::InvalidRelation(format!(
                "role {} cannot be a parent of a {other}",
                parent.id
            ))),
        }
    }

    /// Whether `needle` is reachable from `start` by walking child edges.
    fn reachable_via_children(&self, start: EntityId, needle: EntityId) -> bool {
        let mut stack = vec![start];
        let mut visited = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            if id == needle {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(entity) = self.entities.get(&id) {
                stack.extend(entity.children.iter().copied());
            }
        }
        false
    }

    /// Add a parent/child edge, updating both sides. Linking an existing
    /// edge is a no-op.
    ///
    /// # Errors
    /// `NotFound`, `InvalidRelation`, `CapacityExceeded` or
    /// `CyclicHierarchy`; the graph is unchanged on every failure.
    pub fn link(&mut self, parent_id: EntityId, child_id: EntityId) -> Result<(), DomainError> {
        let parent = self.require(parent_id)?;
        let child = self.require(child_id)?;
        Self::check_relation(parent, child)?;

        if parent.children.contains(&child_id) {
            return Ok(());
        }
        if parent.children.len() >= MAX_CHILDREN {
            return Err(DomainError::CapacityExceeded { parent_id });
        }
        if parent_id == child_id || self.reachable_via_children(child_id, parent_id) {
            return Err(DomainError::CyclicHierarchy {
                parent_id,
                child_id,
            });
        }

        if let Some(parent) = self.entities.get_mut(&parent_id) {
            parent.children.insert(child_id);
        }
        if let Some(child) = self.entities.get_mut(&child_id) {
            child.parents.insert(parent_id);
        }
        Ok(())
    }

    /// Remove a parent/child edge from both sides.
    ///
    /// # Errors
    /// `NotFound` or `EdgeMissing`.
    pub fn unlink(&mut self, parent_id: EntityId, child_id: EntityId) -> Result<(), DomainError> {
        self.require(parent_id)?;
        self.require(child_id)?;

        let present = self
            .entities
            .get(&parent_id)
            .is_some_and(|p| p.children.contains(&child_id));
        if !present {
            return Err(DomainError::EdgeMissing {
                parent_id,
                child_id,
            });
        }

        if let Some(parent) = self.entities.get_mut(&parent_id) {
            parent.children.remove(&child_id);
        }
        if let Some(child) = self.entities.get_mut(&child_id) {
            child.parents.remove(&parent_id);
        }
        Ok(())
    }

    /// Attach a permission to an entity and index it in the views.
    ///
    /// Attaching an identical explicit permission (same URI, verb and
    /// polarity) returns the existing id instead of creating a duplicate,
    /// which keeps the one-per-polarity invariant.
    ///
    /// # Errors
    /// `NotFound`, `InvalidArgument` (bad pattern) or
    /// `ConflictingPolarity`.
    pub fn attach_permission(
        &mut self,
        entity_id: EntityId,
        spec: &PermissionSpec,
    ) -> Result<PermissionId, DomainError> {
        UriPattern::parse(&spec.uri)?;
        let entity = self.require(entity_id)?;

        if spec.scheme == Scheme::Explicit {
            for pid in &entity.permissions {
                let Some(existing) = self.permissions.get(pid) else {
                    continue;
                };
                if existing.scheme != Scheme::Explicit
                    || existing.uri != spec.uri
                    || existing.verb != spec.verb
                {
                    continue;
                }
                if existing.polarity == spec.polarity {
                    return Ok(existing.id);
                }
                return Err(DomainError::ConflictingPolarity {
                    entity_id,
                    uri: spec.uri.clone(),
                    verb: spec.verb.as_str().to_owned(),
                });
            }
        }

        let id = self.alloc_id();
        let permission = Permission {
            id,
            entity_id,
            uri: spec.uri.clone(),
            verb: spec.verb,
            polarity: spec.polarity,
            scheme: spec.scheme,
            expires_at: spec.expires_at,
        };
        self.views.on_permission_attached(&permission);
        self.permissions.insert(id, permission);
        if let Some(entity) = self.entities.get_mut(&entity_id) {
            entity.permissions.push(id);
        }
        Ok(id)
    }

    /// Attach a permission loaded from durable storage, preserving its id.
    /// Used only by hydration.
    ///
    /// # Errors
    /// `NotFound` for the owning entity, `InvalidArgument` for a duplicate
    /// id or malformed pattern.
    pub fn attach_hydrated(&mut self, permission: Permission) -> Result<(), DomainError> {
        UriPattern::parse(&permission.uri)?;
        self.require(permission.entity_id)?;
        if permission.id == 0 || self.permissions.contains_key(&permission.id) {
            return Err(DomainError::InvalidArgument(format!(
                "invalid permission id {} in snapshot",
                permission.id
            )));
        }
        self.next_id = self.next_id.max(permission.id + 1);
        if let Some(entity) = self.entities.get_mut(&permission.entity_id) {
            entity.permissions.push(permission.id);
        }
        self.views.on_permission_attached(&permission);
        self.permissions.insert(permission.id, permission);
        Ok(())
    }

    /// Detach a permission from its entity and drop it from the views.
    ///
    /// # Errors
    /// `NotFound` if no such permission exists.
    pub fn detach_permission(&mut self, id: PermissionId) -> Result<Permission, DomainError> {
        let permission = self
            .permissions
            .remove(&id)
            .ok_or_else(|| DomainError::not_found_permission(id))?;
        if let Some(entity) = self.entities.get_mut(&permission.entity_id) {
            entity.permissions.retain(|pid| *pid != id);
        }
        self.views.on_permission_detached(&permission);
        Ok(permission)
    }

    /// Rebuild the normalizer views from the domain graph.
    pub fn rebuild_views(&mut self) {
        let mut views = std::mem::take(&mut self.views);
        views.rebuild(&self.entities, &self.permissions);
        self.views = views;
    }

    /// Verify every structural invariant: edge symmetry, acyclicity, id
    /// headroom, permission back-references and view congruence.
    ///
    /// # Errors
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        for entity in self.entities.values() {
            for child_id in &entity.children {
                let child = self
                    .entities
                    .get(child_id)
                    .ok_or_else(|| format!("dangling child edge {} -> {child_id}", entity.id))?;
                if !child.parents.contains(&entity.id) {
                    return Err(format!(
                        "edge {} -> {child_id} missing on the child side",
                        entity.id
                    ));
                }
            }
            for parent_id in &entity.parents {
                let parent = self
                    .entities
                    .get(parent_id)
                    .ok_or_else(|| format!("dangling parent edge {parent_id} -> {}", entity.id))?;
                if !parent.children.contains(&entity.id) {
                    return Err(format!(
                        "edge {parent_id} -> {} missing on the parent side",
                        entity.id
                    ));
                }
            }
            if entity.id >= self.next_id {
                return Err(format!("entity id {} >= next_id {}", entity.id, self.next_id));
            }
            if self.reachable_via_children_strict(entity.id) {
                return Err(format!("cycle through entity {}", entity.id));
            }
            for pid in &entity.permissions {
                let perm = self
                    .permissions
                    .get(pid)
                    .ok_or_else(|| format!("entity {} references missing permission {pid}", entity.id))?;
                if perm.entity_id != entity.id {
                    return Err(format!(
                        "permission {pid} attached to {} but owned by {}",
                        entity.id, perm.entity_id
                    ));
                }
            }
        }
        for permission in self.permissions.values() {
            if permission.id >= self.next_id {
                return Err(format!(
                    "permission id {} >= next_id {}",
                    permission.id, self.next_id
                ));
            }
        }
        self.views.check_congruence(&self.entities, &self.permissions)
    }

    /// Whether `start` can reach itself through one or more child edges.
    fn reachable_via_children_strict(&self, start: EntityId) -> bool {
        let Some(entity) = self.entities.get(&start) else {
            return false;
        };
        entity
            .children
            .iter()
            .any(|child| self.reachable_via_children(*child, start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant_spec(uri: &str, verb: Verb) -> PermissionSpec {
        PermissionSpec {
            uri: uri.to_owned(),
            verb,
            polarity: Polarity::Grant,
            scheme: Scheme::Explicit,
            expires_at: None,
        }
    }

    fn deny_spec(uri: &str, verb: Verb) -> PermissionSpec {
        PermissionSpec {
            polarity: Polarity::Deny,
            ..grant_spec(uri, verb)
        }
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut graph = TenantGraph::new();
        let a = graph.add_entity(EntityKind::User, "alice").unwrap();
        let b = graph.add_entity(EntityKind::Group, "staff").unwrap();
        assert!(b > a);

        graph.remove_entity(a).unwrap();
        let c = graph.add_entity(EntityKind::User, "carol").unwrap();
        assert!(c > b, "removed ids must not be reused");
        assert!(graph.next_id() > c);
    }

    #[test]
    fn name_validation() {
        let mut graph = TenantGraph::new();
        assert!(matches!(
            graph.add_entity(EntityKind::User, ""),
            Err(DomainError::InvalidArgument(_))
        ));
        let long = "x".repeat(256);
        assert!(graph.add_entity(EntityKind::User, &long).is_err());
        let ok = "x".repeat(255);
        assert!(graph.add_entity(EntityKind::User, &ok).is_ok());
    }

    #[test]
    fn link_maintains_edge_symmetry() {
        let mut graph = TenantGraph::new();
        let user = graph.add_entity(EntityKind::User, "alice").unwrap();
        let group = graph.add_entity(EntityKind::Group, "staff").unwrap();

        graph.link(group, user).unwrap();
        assert!(graph.entity(group).unwrap().children.contains(&user));
        assert!(graph.entity(user).unwrap().parents.contains(&group));
        graph.check_invariants().unwrap();

        // idempotent
        graph.link(group, user).unwrap();
        assert_eq!(graph.entity(group).unwrap().children.len(), 1);
    }

    #[test]
    fn users_cannot_be_parents() {
        let mut graph = TenantGraph::new();
        let user = graph.add_entity(EntityKind::User, "alice").unwrap();
        let group = graph.add_entity(EntityKind::Group, "staff").unwrap();
        assert!(matches!(
            graph.link(user, group),
            Err(DomainError::InvalidRelation(_))
        ));
    }

    #[test]
    fn roles_may_only_parent_users() {
        let mut graph = TenantGraph::new();
        let role = graph.add_entity(EntityKind::Role, "admin").unwrap();
        let user = graph.add_entity(EntityKind::User, "alice").unwrap();
        let group = graph.add_entity(EntityKind::Group, "staff").unwrap();

        graph.link(role, user).unwrap();
        assert!(matches!(
            graph.link(role, group),
            Err(DomainError::InvalidRelation(_))
        ));
    }

    #[test]
    fn cycle_is_rejected_and_graph_unchanged() {
        let mut graph = TenantGraph::new();
        let g1 = graph.add_entity(EntityKind::Group, "g1").unwrap();
        let g2 = graph.add_entity(EntityKind::Group, "g2").unwrap();
        let g3 = graph.add_entity(EntityKind::Group, "g3").unwrap();
        graph.link(g1, g2).unwrap();
        graph.link(g2, g3).unwrap();

        let err = graph.link(g3, g1).unwrap_err();
        assert!(matches!(err, DomainError::CyclicHierarchy { .. }));
        assert!(!graph.entity(g3).unwrap().children.contains(&g1));
        assert!(graph.entity(g1).unwrap().parents.is_empty());
        graph.check_invariants().unwrap();
    }

    #[test]
    fn self_link_is_a_cycle() {
        let mut graph = TenantGraph::new();
        let g = graph.add_entity(EntityKind::Group, "g").unwrap();
        assert!(matches!(
            graph.link(g, g),
            Err(DomainError::CyclicHierarchy { .. })
        ));
    }

    #[test]
    fn capacity_is_bounded_at_max_children() {
        let mut graph = TenantGraph::new();
        let parent = graph.add_entity(EntityKind::Group, "parent").unwrap();
        for i in 0..MAX_CHILDREN {
            let child = graph
                .add_entity(EntityKind::User, &format!("u{i}"))
                .unwrap();
            graph.link(parent, child).unwrap();
        }
        let extra = graph.add_entity(EntityKind::User, "extra").unwrap();
        assert!(matches!(
            graph.link(parent, extra),
            Err(DomainError::CapacityExceeded { .. })
        ));
        assert_eq!(graph.entity(parent).unwrap().children.len(), MAX_CHILDREN);
    }

    #[test]
    fn unlink_requires_existing_edge() {
        let mut graph = TenantGraph::new();
        let user = graph.add_entity(EntityKind::User, "alice").unwrap();
        let group = graph.add_entity(EntityKind::Group, "staff").unwrap();

        assert!(matches!(
            graph.unlink(group, user),
            Err(DomainError::EdgeMissing { .. })
        ));

        graph.link(group, user).unwrap();
        graph.unlink(group, user).unwrap();
        assert!(graph.entity(group).unwrap().children.is_empty());
        assert!(graph.entity(user).unwrap().parents.is_empty());
    }

    #[test]
    fn link_unlink_roundtrip_restores_prior_state() {
        let mut graph = TenantGraph::new();
        let user = graph.add_entity(EntityKind::User, "alice").unwrap();
        let group = graph.add_entity(EntityKind::Group, "staff").unwrap();

        let before = (
            graph.entity(user).unwrap().clone(),
            graph.entity(group).unwrap().clone(),
        );
        graph.link(group, user).unwrap();
        graph.unlink(group, user).unwrap();
        let after = (
            graph.entity(user).unwrap().clone(),
            graph.entity(group).unwrap().clone(),
        );
        assert_eq!(before, after);
    }

    #[test]
    fn conflicting_polarity_is_rejected() {
        let mut graph = TenantGraph::new();
        let group = graph.add_entity(EntityKind::Group, "staff").unwrap();
        graph
            .attach_permission(group, &grant_spec("/api/orders", Verb::Get))
            .unwrap();

        let err = graph
            .attach_permission(group, &deny_spec("/api/orders", Verb::Get))
            .unwrap_err();
        assert!(matches!(err, DomainError::ConflictingPolarity { .. }));

        // Different verb is fine.
        graph
            .attach_permission(group, &deny_spec("/api/orders", Verb::Post))
            .unwrap();
    }

    #[test]
    fn duplicate_attach_is_idempotent() {
        let mut graph = TenantGraph::new();
        let group = graph.add_entity(EntityKind::Group, "staff").unwrap();
        let first = graph
            .attach_permission(group, &grant_spec("/api/orders", Verb::Get))
            .unwrap();
        let second = graph
            .attach_permission(group, &grant_spec("/api/orders", Verb::Get))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(graph.entity(group).unwrap().permissions.len(), 1);
    }

    #[test]
    fn grant_revoke_leaves_no_trace() {
        let mut graph = TenantGraph::new();
        let group = graph.add_entity(EntityKind::Group, "staff").unwrap();
        let pid = graph
            .attach_permission(group, &grant_spec("/api/orders", Verb::Get))
            .unwrap();

        graph.detach_permission(pid).unwrap();
        assert!(graph.permission(pid).is_none());
        assert!(graph.entity(group).unwrap().permissions.is_empty());
        assert!(graph.views().resource("/api/orders").is_none());
        assert!(graph.views().permissions_of(group).is_empty());
        graph.check_invariants().unwrap();
    }

    #[test]
    fn remove_entity_detaches_everything() {
        let mut graph = TenantGraph::new();
        let user = graph.add_entity(EntityKind::User, "alice").unwrap();
        let group = graph.add_entity(EntityKind::Group, "staff").unwrap();
        let parent = graph.add_entity(EntityKind::Group, "org").unwrap();
        graph.link(parent, group).unwrap();
        graph.link(group, user).unwrap();
        graph
            .attach_permission(group, &grant_spec("/api/orders", Verb::Get))
            .unwrap();

        let report = graph.remove_entity(group).unwrap();
        assert_eq!(report.edges.len(), 2);
        assert_eq!(report.permissions.len(), 1);

        assert!(graph.entity(group).is_none());
        assert!(graph.entity(user).unwrap().parents.is_empty());
        assert!(graph.entity(parent).unwrap().children.is_empty());
        assert!(graph.views().resource("/api/orders").is_none());
        graph.check_invariants().unwrap();
    }

    #[test]
    fn invalid_pattern_is_rejected_on_attach() {
        let mut graph = TenantGraph::new();
        let group = graph.add_entity(EntityKind::Group, "staff").unwrap();
        assert!(graph
            .attach_permission(group, &grant_spec("/a/**/b", Verb::Get))
            .is_err());
    }

    #[test]
    fn hydration_preserves_ids_and_bumps_counter() {
        let mut graph = TenantGraph::new();
        let mut entity = Entity::new(41, EntityKind::Group, "staff".to_owned());
        entity.permissions.clear();
        graph.insert_hydrated(entity).unwrap();
        assert_eq!(graph.next_id(), 42);

        let fresh = graph.add_entity(EntityKind::User, "alice").unwrap();
        assert_eq!(fresh, 42);
    }
}
