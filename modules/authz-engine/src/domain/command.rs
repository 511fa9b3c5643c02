//! The command vocabulary of the single-writer loop.
//!
//! Commands are the only way to mutate or query a tenant graph. The RPC
//! layer decodes wire envelopes into [`Command`] values and encodes
//! [`CommandOutcome`] values back; the engine itself never sees bytes.

use chrono::{DateTime, Utc};

use super::error::DomainError;
use super::model::{Entity, EntityId, EntityKind, Permission, PermissionId, Scheme, Verb};
use super::resolver::{EffectivePermission, Evaluation};

/// Parameters shared by grant and deny commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionGrant {
    pub entity_id: EntityId,
    pub uri: String,
    pub verb: Verb,
    pub scheme: Scheme,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One operation inside a [`Command::BulkPermissionUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOp {
    Grant(PermissionGrant),
    Deny(PermissionGrant),
    Revoke { permission_id: PermissionId },
}

/// Every command the engine supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // Mutations
    CreateUser {
        name: String,
    },
    CreateGroup {
        name: String,
        parent_group_id: Option<EntityId>,
    },
    CreateRole {
        name: String,
        group_id: Option<EntityId>,
    },
    UpdateEntityName {
        entity_id: EntityId,
        name: String,
    },
    DeleteEntity {
        entity_id: EntityId,
    },
    AddUserToGroup {
        user_id: EntityId,
        group_id: EntityId,
    },
    RemoveUserFromGroup {
        user_id: EntityId,
        group_id: EntityId,
    },
    AddGroupToGroup {
        child_id: EntityId,
        parent_id: EntityId,
    },
    RemoveGroupFromGroup {
        child_id: EntityId,
        parent_id: EntityId,
    },
    AssignUserToRole {
        user_id: EntityId,
        role_id: EntityId,
    },
    UnassignUserFromRole {
        user_id: EntityId,
        role_id: EntityId,
    },
    AddRoleToGroup {
        role_id: EntityId,
        group_id: EntityId,
    },
    RemoveRoleFromGroup {
        role_id: EntityId,
        group_id: EntityId,
    },
    GrantPermission(PermissionGrant),
    DenyPermission(PermissionGrant),
    RevokePermission {
        permission_id: PermissionId,
    },
    BulkPermissionUpdate {
        operations: Vec<BulkOp>,
        transactional: bool,
        stop_on_first_error: bool,
    },

    // Queries
    GetEntity {
        entity_id: EntityId,
    },
    ListEntities {
        kind: EntityKind,
        page: u32,
        page_size: u32,
    },
    ListEntityPermissions {
        entity_id: EntityId,
    },
    EvaluatePermission {
        entity_id: EntityId,
        uri: String,
        verb: Verb,
    },
    GetEffectivePermissions {
        entity_id: EntityId,
    },
    ListResourcePermissions {
        uri: String,
    },

    // Control
    HealthCheck,
    Shutdown,
}

impl Command {
    /// Stable discriminator carried as `command_type` on the wire and in
    /// audit records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateUser { .. } => "create_user",
            Self::CreateGroup { .. } => "create_group",
            Self::CreateRole { .. } => "create_role",
            Self::UpdateEntityName { .. } => "update_entity_name",
            Self::DeleteEntity { .. } => "delete_entity",
            Self::AddUserToGroup { .. } => "add_user_to_group",
            Self::RemoveUserFromGroup { .. } => "remove_user_from_group",
            Self::AddGroupToGroup { .. } => "add_group_to_group",
            Self::RemoveGroupFromGroup { .. } => "remove_group_from_group",
            Self::AssignUserToRole { .. } => "assign_user_to_role",
            Self::UnassignUserFromRole { .. } => "unassign_user_from_role",
            Self::AddRoleToGroup { .. } => "add_role_to_group",
            Self::RemoveRoleFromGroup { .. } => "remove_role_from_group",
            Self::GrantPermission(_) => "grant_permission",
            Self::DenyPermission(_) => "deny_permission",
            Self::RevokePermission { .. } => "revoke_permission",
            Self::BulkPermissionUpdate { .. } => "bulk_permission_update",
            Self::GetEntity { .. } => "get_entity",
            Self::ListEntities { .. } => "list_entities",
            Self::ListEntityPermissions { .. } => "list_entity_permissions",
            Self::EvaluatePermission { .. } => "evaluate_permission",
            Self::GetEffectivePermissions { .. } => "get_effective_permissions",
            Self::ListResourcePermissions { .. } => "list_resource_permissions",
            Self::HealthCheck => "health_check",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the command can change graph state (and therefore must be
    /// persisted and audited).
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::GetEntity { .. }
                | Self::ListEntities { .. }
                | Self::ListEntityPermissions { .. }
                | Self::EvaluatePermission { .. }
                | Self::GetEffectivePermissions { .. }
                | Self::ListResourcePermissions { .. }
                | Self::HealthCheck
                | Self::Shutdown
        )
    }
}

/// One page of a [`Command::ListEntities`] result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityPage {
    pub entities: Vec<Entity>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

/// Per-operation result of a bulk update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkEntryOutcome {
    pub index: u32,
    pub result: Result<Option<PermissionId>, DomainError>,
}

/// Snapshot returned by the `HealthCheck` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub uptime_seconds: u64,
    pub commands_processed: u64,
    pub persistence_degraded: bool,
}

/// Every result shape a command can produce.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Unit,
    EntityId(EntityId),
    Entity(Entity),
    EntityPage(EntityPage),
    Permission(Permission),
    Permissions(Vec<Permission>),
    Evaluation(Evaluation),
    Effective(Vec<EffectivePermission>),
    Bulk(Vec<BulkEntryOutcome>),
    Health(HealthSnapshot),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_snake_case_and_unique() {
        let commands = [
            Command::CreateUser {
                name: "a".to_owned(),
            },
            Command::HealthCheck,
            Command::Shutdown,
            Command::RevokePermission { permission_id: 1 },
        ];
        let kinds: Vec<&str> = commands.iter().map(Command::kind).collect();
        assert_eq!(
            kinds,
            vec!["create_user", "health_check", "shutdown", "revoke_permission"]
        );
    }

    #[test]
    fn mutation_classification() {
        assert!(Command::CreateUser {
            name: "a".to_owned()
        }
        .is_mutation());
        assert!(Command::RevokePermission { permission_id: 1 }.is_mutation());
        assert!(!Command::HealthCheck.is_mutation());
        assert!(!Command::EvaluatePermission {
            entity_id: 1,
            uri: "/x".to_owned(),
            verb: Verb::Get
        }
        .is_mutation());
    }
}
