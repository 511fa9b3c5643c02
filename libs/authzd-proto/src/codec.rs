//! Domain <-> wire conversions.
//!
//! The gateway encodes [`Command`] values into per-variant payload
//! messages; the backend decodes them, and encodes [`CommandOutcome`]
//! values back. Every command variant has a fixed wire schema selected by
//! the `command_type` discriminator.

use chrono::{DateTime, Utc};
use prost::Message;
use thiserror::Error;

use authz_engine::domain::command::{
    BulkEntryOutcome, BulkOp, Command, CommandOutcome, PermissionGrant,
};
use authz_engine::domain::error::DomainError;
use authz_engine::domain::model::{
    Entity, EntityKind, Permission, Polarity, Scheme, Verb,
};
use authz_engine::domain::resolver::{Decision, Evaluation};

use crate::pb;

/// Errors produced while decoding wire payloads.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown command type: {0}")]
    UnknownCommandType(String),

    #[error("malformed payload: {0}")]
    Malformed(#[from] prost::DecodeError),

    #[error("bad enum value {value} for {field}")]
    BadEnum { field: &'static str, value: i32 },

    #[error("bad timestamp {0} ms")]
    BadTimestamp(i64),
}

impl From<DecodeError> for DomainError {
    fn from(e: DecodeError) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Enum conversions
// ---------------------------------------------------------------------------

fn verb_to_pb(verb: Verb) -> pb::Verb {
    match verb {
        Verb::Get => pb::Verb::Get,
        Verb::Post => pb::Verb::Post,
        Verb::Put => pb::Verb::Put,
        Verb::Delete => pb::Verb::Delete,
        Verb::Patch => pb::Verb::Patch,
        Verb::Head => pb::Verb::Head,
        Verb::Options => pb::Verb::Options,
        Verb::Any => pb::Verb::Any,
    }
}

fn verb_from_raw(raw: i32) -> Result<Verb, DecodeError> {
    match pb::Verb::try_from(raw) {
        Ok(pb::Verb::Get) => Ok(Verb::Get),
        Ok(pb::Verb::Post) => Ok(Verb::Post),
        Ok(pb::Verb::Put) => Ok(Verb::Put),
        Ok(pb::Verb::Delete) => Ok(Verb::Delete),
        Ok(pb::Verb::Patch) => Ok(Verb::Patch),
        Ok(pb::Verb::Head) => Ok(Verb::Head),
        Ok(pb::Verb::Options) => Ok(Verb::Options),
        Ok(pb::Verb::Any) => Ok(Verb::Any),
        Ok(pb::Verb::Unspecified) | Err(_) => Err(DecodeError::BadEnum {
            field: "verb",
            value: raw,
        }),
    }
}

fn kind_to_pb(kind: EntityKind) -> pb::EntityKind {
    match kind {
        EntityKind::User => pb::EntityKind::User,
        EntityKind::Group => pb::EntityKind::Group,
        EntityKind::Role => pb::EntityKind::Role,
    }
}

fn kind_from_raw(raw: i32) -> Result<EntityKind, DecodeError> {
    match pb::EntityKind::try_from(raw) {
        Ok(pb::EntityKind::User) => Ok(EntityKind::User),
        Ok(pb::EntityKind::Group) => Ok(EntityKind::Group),
        Ok(pb::EntityKind::Role) => Ok(EntityKind::Role),
        Ok(pb::EntityKind::Unspecified) | Err(_) => Err(DecodeError::BadEnum {
            field: "kind",
            value: raw,
        }),
    }
}

fn polarity_to_pb(polarity: Polarity) -> pb::Polarity {
    match polarity {
        Polarity::Grant => pb::Polarity::Grant,
        Polarity::Deny => pb::Polarity::Deny,
    }
}

fn scheme_to_pb(scheme: Scheme) -> pb::Scheme {
    match scheme {
        Scheme::Explicit => pb::Scheme::Explicit,
        Scheme::Inherited => pb::Scheme::Inherited,
        Scheme::Pattern => pb::Scheme::Pattern,
    }
}

fn scheme_from_raw(raw: i32) -> Result<Scheme, DecodeError> {
    match pb::Scheme::try_from(raw) {
        Ok(pb::Scheme::Explicit) => Ok(Scheme::Explicit),
        Ok(pb::Scheme::Inherited) => Ok(Scheme::Inherited),
        Ok(pb::Scheme::Pattern) => Ok(Scheme::Pattern),
        Ok(pb::Scheme::Unspecified) | Err(_) => Err(DecodeError::BadEnum {
            field: "scheme",
            value: raw,
        }),
    }
}

fn expiry_to_ms(expires_at: Option<DateTime<Utc>>) -> Option<i64> {
    expires_at.map(|t| t.timestamp_millis())
}

fn expiry_from_ms(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, DecodeError> {
    ms.map(|ms| {
        DateTime::<Utc>::from_timestamp_millis(ms).ok_or(DecodeError::BadTimestamp(ms))
    })
    .transpose()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn grant_to_pb(grant: &PermissionGrant) -> pb::GrantPermissionCmd {
    pb::GrantPermissionCmd {
        entity_id: grant.entity_id,
        uri: grant.uri.clone(),
        verb: verb_to_pb(grant.verb) as i32,
        scheme: scheme_to_pb(grant.scheme) as i32,
        expires_at_ms: expiry_to_ms(grant.expires_at),
    }
}

fn grant_from_pb(cmd: &pb::GrantPermissionCmd) -> Result<PermissionGrant, DecodeError> {
    Ok(PermissionGrant {
        entity_id: cmd.entity_id,
        uri: cmd.uri.clone(),
        verb: verb_from_raw(cmd.verb)?,
        scheme: scheme_from_raw(cmd.scheme)?,
        expires_at: expiry_from_ms(cmd.expires_at_ms)?,
    })
}

fn edge(child_id: u64, parent_id: u64) -> Vec<u8> {
    pb::EdgeCmd {
        child_id,
        parent_id,
    }
    .encode_to_vec()
}

/// Encode a command into its `(command_type, command_data)` wire form.
#[must_use]
pub fn encode_command(command: &Command) -> (&'static str, Vec<u8>) {
    let kind = command.kind();
    let data = match command {
        Command::CreateUser { name } => pb::CreateUserCmd { name: name.clone() }.encode_to_vec(),
        Command::CreateGroup {
            name,
            parent_group_id,
        } => pb::CreateGroupCmd {
            name: name.clone(),
            parent_group_id: *parent_group_id,
        }
        .encode_to_vec(),
        Command::CreateRole { name, group_id } => pb::CreateRoleCmd {
            name: name.clone(),
            group_id: *group_id,
        }
        .encode_to_vec(),
        Command::UpdateEntityName { entity_id, name } => pb::UpdateEntityNameCmd {
            entity_id: *entity_id,
            name: name.clone(),
        }
        .encode_to_vec(),
        Command::DeleteEntity { entity_id } => pb::DeleteEntityCmd {
            entity_id: *entity_id,
        }
        .encode_to_vec(),
        Command::AddUserToGroup { user_id, group_id }
        | Command::RemoveUserFromGroup { user_id, group_id } => edge(*user_id, *group_id),
        Command::AddGroupToGroup {
            child_id,
            parent_id,
        }
        | Command::RemoveGroupFromGroup {
            child_id,
            parent_id,
        } => edge(*child_id, *parent_id),
        Command::AssignUserToRole { user_id, role_id }
        | Command::UnassignUserFromRole { user_id, role_id } => edge(*user_id, *role_id),
        Command::AddRoleToGroup { role_id, group_id }
        | Command::RemoveRoleFromGroup { role_id, group_id } => edge(*role_id, *group_id),
        Command::GrantPermission(grant) | Command::DenyPermission(grant) => {
            grant_to_pb(grant).encode_to_vec()
        }
        Command::RevokePermission { permission_id } => pb::RevokePermissionCmd {
            permission_id: *permission_id,
        }
        .encode_to_vec(),
        Command::BulkPermissionUpdate {
            operations,
            transactional,
            stop_on_first_error,
        } => pb::BulkPermissionUpdateCmd {
            operations: operations
                .iter()
                .map(|op| pb::BulkOperation {
                    op: Some(match op {
                        BulkOp::Grant(g) => pb::bulk_operation::Op::Grant(grant_to_pb(g)),
                        BulkOp::Deny(g) => pb::bulk_operation::Op::Deny(grant_to_pb(g)),
                        BulkOp::Revoke { permission_id } => {
                            pb::bulk_operation::Op::Revoke(pb::RevokePermissionCmd {
                                permission_id: *permission_id,
                            })
                        }
                    }),
                })
                .collect(),
            transactional: *transactional,
            stop_on_first_error: *stop_on_first_error,
        }
        .encode_to_vec(),
        Command::GetEntity { entity_id } => pb::GetEntityCmd {
            entity_id: *entity_id,
        }
        .encode_to_vec(),
        Command::ListEntities {
            kind,
            page,
            page_size,
        } => pb::ListEntitiesCmd {
            kind: kind_to_pb(*kind) as i32,
            page: *page,
            page_size: *page_size,
        }
        .encode_to_vec(),
        Command::ListEntityPermissions { entity_id } => pb::ListEntityPermissionsCmd {
            entity_id: *entity_id,
        }
        .encode_to_vec(),
        Command::EvaluatePermission {
            entity_id,
            uri,
            verb,
        } => pb::EvaluatePermissionCmd {
            entity_id: *entity_id,
            uri: uri.clone(),
            verb: verb_to_pb(*verb) as i32,
        }
        .encode_to_vec(),
        Command::GetEffectivePermissions { entity_id } => pb::GetEffectivePermissionsCmd {
            entity_id: *entity_id,
        }
        .encode_to_vec(),
        Command::ListResourcePermissions { uri } => pb::ListResourcePermissionsCmd {
            uri: uri.clone(),
        }
        .encode_to_vec(),
        Command::HealthCheck => pb::HealthRequest {}.encode_to_vec(),
        Command::Shutdown => pb::ShutdownCmd {}.encode_to_vec(),
    };
    (kind, data)
}

/// Decode a `(command_type, command_data)` pair back into a command.
///
/// # Errors
/// [`DecodeError`] for unknown discriminators, malformed payloads, or
/// out-of-range enum/timestamp values.
pub fn decode_command(command_type: &str, data: &[u8]) -> Result<Command, DecodeError> {
    let command = match command_type {
        "create_user" => {
            let cmd = pb::CreateUserCmd::decode(data)?;
            Command::CreateUser { name: cmd.name }
        }
        "create_group" => {
            let cmd = pb::CreateGroupCmd::decode(data)?;
            Command::CreateGroup {
                name: cmd.name,
                parent_group_id: cmd.parent_group_id,
            }
        }
        "create_role" => {
            let cmd = pb::CreateRoleCmd::decode(data)?;
            Command::CreateRole {
                name: cmd.name,
                group_id: cmd.group_id,
            }
        }
        "update_entity_name" => {
            let cmd = pb::UpdateEntityNameCmd::decode(data)?;
            Command::UpdateEntityName {
                entity_id: cmd.entity_id,
                name: cmd.name,
            }
        }
        "delete_entity" => {
            let cmd = pb::DeleteEntityCmd::decode(data)?;
            Command::DeleteEntity {
                entity_id: cmd.entity_id,
            }
        }
        "add_user_to_group" => {
            let cmd = pb::EdgeCmd::decode(data)?;
            Command::AddUserToGroup {
                user_id: cmd.child_id,
                group_id: cmd.parent_id,
            }
        }
        "remove_user_from_group" => {
            let cmd = pb::EdgeCmd::decode(data)?;
            Command::RemoveUserFromGroup {
                user_id: cmd.child_id,
                group_id: cmd.parent_id,
            }
        }
        "add_group_to_group" => {
            let cmd = pb::EdgeCmd::decode(data)?;
            Command::AddGroupToGroup {
                child_id: cmd.child_id,
                parent_id: cmd.parent_id,
            }
        }
        "remove_group_from_group" => {
            let cmd = pb::EdgeCmd::decode(data)?;
            Command::RemoveGroupFromGroup {
                child_id: cmd.child_id,
                parent_id: cmd.parent_id,
            }
        }
        "assign_user_to_role" => {
            let cmd = pb::EdgeCmd::decode(data)?;
            Command::AssignUserToRole {
                user_id: cmd.child_id,
                role_id: cmd.parent_id,
            }
        }
        "unassign_user_from_role" => {
            let cmd = pb::EdgeCmd::decode(data)?;
            Command::UnassignUserFromRole {
                user_id: cmd.child_id,
                role_id: cmd.parent_id,
            }
        }
        "add_role_to_group" => {
            let cmd = pb::EdgeCmd::decode(data)?;
            Command::AddRoleToGroup {
                role_id: cmd.child_id,
                group_id: cmd.parent_id,
            }
        }
        "remove_role_from_group" => {
            let cmd = pb::EdgeCmd::decode(data)?;
            Command::RemoveRoleFromGroup {
                role_id: cmd.child_id,
                group_id: cmd.parent_id,
            }
        }
        "grant_permission" => {
            let cmd = pb::GrantPermissionCmd::decode(data)?;
            Command::GrantPermission(grant_from_pb(&cmd)?)
        }
        "deny_permission" => {
            let cmd = pb::GrantPermissionCmd::decode(data)?;
            Command::DenyPermission(grant_from_pb(&cmd)?)
        }
        "revoke_permission" => {
            let cmd = pb::RevokePermissionCmd::decode(data)?;
            Command::RevokePermission {
                permission_id: cmd.permission_id,
            }
        }
        "bulk_permission_update" => {
            let cmd = pb::BulkPermissionUpdateCmd::decode(data)?;
            let mut operations = Vec::with_capacity(cmd.operations.len());
            for op in &cmd.operations {
                let op = match &op.op {
                    Some(pb::bulk_operation::Op::Grant(g)) => BulkOp::Grant(grant_from_pb(g)?),
                    Some(pb::bulk_operation::Op::Deny(g)) => BulkOp::Deny(grant_from_pb(g)?),
                    Some(pb::bulk_operation::Op::Revoke(r)) => BulkOp::Revoke {
                        permission_id: r.permission_id,
                    },
                    None => {
                        return Err(DecodeError::BadEnum {
                            field: "bulk_operation.op",
                            value: -1,
                        });
                    }
                };
                operations.push(op);
            }
            Command::BulkPermissionUpdate {
                operations,
                transactional: cmd.transactional,
                stop_on_first_error: cmd.stop_on_first_error,
            }
        }
        "get_entity" => {
            let cmd = pb::GetEntityCmd::decode(data)?;
            Command::GetEntity {
                entity_id: cmd.entity_id,
            }
        }
        "list_entities" => {
            let cmd = pb::ListEntitiesCmd::decode(data)?;
            Command::ListEntities {
                kind: kind_from_raw(cmd.kind)?,
                page: cmd.page,
                page_size: cmd.page_size,
            }
        }
        "list_entity_permissions" => {
            let cmd = pb::ListEntityPermissionsCmd::decode(data)?;
            Command::ListEntityPermissions {
                entity_id: cmd.entity_id,
            }
        }
        "evaluate_permission" => {
            let cmd = pb::EvaluatePermissionCmd::decode(data)?;
            Command::EvaluatePermission {
                entity_id: cmd.entity_id,
                uri: cmd.uri,
                verb: verb_from_raw(cmd.verb)?,
            }
        }
        "get_effective_permissions" => {
            let cmd = pb::GetEffectivePermissionsCmd::decode(data)?;
            Command::GetEffectivePermissions {
                entity_id: cmd.entity_id,
            }
        }
        "list_resource_permissions" => {
            let cmd = pb::ListResourcePermissionsCmd::decode(data)?;
            Command::ListResourcePermissions { uri: cmd.uri }
        }
        "health_check" => Command::HealthCheck,
        "shutdown" => Command::Shutdown,
        other => return Err(DecodeError::UnknownCommandType(other.to_owned())),
    };
    Ok(command)
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

fn permission_to_pb(permission: &Permission) -> pb::PermissionResult {
    pb::PermissionResult {
        id: permission.id,
        entity_id: permission.entity_id,
        uri: permission.uri.clone(),
        verb: verb_to_pb(permission.verb) as i32,
        polarity: polarity_to_pb(permission.polarity) as i32,
        scheme: scheme_to_pb(permission.scheme) as i32,
        expires_at_ms: expiry_to_ms(permission.expires_at),
    }
}

fn entity_to_pb(entity: &Entity) -> pb::EntityResult {
    pb::EntityResult {
        id: entity.id,
        kind: kind_to_pb(entity.kind) as i32,
        name: entity.name.clone(),
        parent_ids: entity.parents.iter().copied().collect(),
        child_ids: entity.children.iter().copied().collect(),
        metadata: entity
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

fn evaluation_to_pb(evaluation: &Evaluation) -> pb::EvaluationResult {
    pb::EvaluationResult {
        decision: match evaluation.decision {
            Decision::Allowed => pb::Decision::Allowed as i32,
            Decision::Denied => pb::Decision::Denied as i32,
        },
        reason: evaluation.reason.as_str().to_owned(),
        trace: evaluation
            .trace
            .iter()
            .map(|entry| pb::TraceEntry {
                entity_id: entry.entity_id,
                permission: Some(permission_to_pb(&entry.permission)),
                specificity: entry.specificity.score(),
                distance: entry.distance,
                selected: entry.selected,
                bindings: entry
                    .bindings
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })
            .collect(),
    }
}

fn bulk_to_pb(results: &[BulkEntryOutcome]) -> pb::BulkResult {
    pb::BulkResult {
        results: results
            .iter()
            .map(|entry| match &entry.result {
                Ok(permission_id) => pb::BulkEntryResult {
                    index: entry.index,
                    success: true,
                    error_kind: String::new(),
                    error_message: String::new(),
                    permission_id: *permission_id,
                },
                Err(e) => pb::BulkEntryResult {
                    index: entry.index,
                    success: false,
                    error_kind: e.wire_kind().to_owned(),
                    error_message: e.to_string(),
                    permission_id: None,
                },
            })
            .collect(),
    }
}

/// Encode a command outcome into `result_data` bytes.
#[must_use]
pub fn encode_outcome(outcome: &CommandOutcome) -> Vec<u8> {
    match outcome {
        CommandOutcome::Unit => pb::UnitResult {}.encode_to_vec(),
        CommandOutcome::EntityId(id) => pb::EntityIdResult { id: *id }.encode_to_vec(),
        CommandOutcome::Entity(entity) => entity_to_pb(entity).encode_to_vec(),
        CommandOutcome::EntityPage(page) => pb::EntityPageResult {
            entities: page.entities.iter().map(entity_to_pb).collect(),
            page: page.page,
            page_size: page.page_size,
            total: page.total,
        }
        .encode_to_vec(),
        CommandOutcome::Permission(permission) => permission_to_pb(permission).encode_to_vec(),
        CommandOutcome::Permissions(permissions) => pb::PermissionListResult {
            permissions: permissions.iter().map(permission_to_pb).collect(),
        }
        .encode_to_vec(),
        CommandOutcome::Evaluation(evaluation) => evaluation_to_pb(evaluation).encode_to_vec(),
        CommandOutcome::Effective(effective) => pb::EffectivePermissionsResult {
            permissions: effective
                .iter()
                .map(|p| pb::EffectivePermission {
                    uri: p.uri.clone(),
                    verb: verb_to_pb(p.verb) as i32,
                    polarity: polarity_to_pb(p.polarity) as i32,
                    source_entity_id: p.source_entity_id,
                    distance: p.distance,
                })
                .collect(),
        }
        .encode_to_vec(),
        CommandOutcome::Bulk(results) => bulk_to_pb(results).encode_to_vec(),
        CommandOutcome::Health(health) => pb::HealthResponse {
            healthy: health.healthy,
            uptime_seconds: health.uptime_seconds,
            commands_processed: health.commands_processed,
            persistence_degraded: health.persistence_degraded,
        }
        .encode_to_vec(),
    }
}

/// A decoded result payload, still in wire representation. The gateway
/// maps these to HTTP response bodies without round-tripping through the
/// domain types.
#[derive(Debug, Clone)]
pub enum WireOutcome {
    Unit,
    EntityId(pb::EntityIdResult),
    Entity(pb::EntityResult),
    EntityPage(pb::EntityPageResult),
    Permission(pb::PermissionResult),
    Permissions(pb::PermissionListResult),
    Evaluation(pb::EvaluationResult),
    Effective(pb::EffectivePermissionsResult),
    Bulk(pb::BulkResult),
    Health(pb::HealthResponse),
}

/// Decode `result_data` for a command, using the `command_type` to select
/// the result schema.
///
/// # Errors
/// [`DecodeError`] for unknown discriminators or malformed payloads.
pub fn decode_outcome(command_type: &str, data: &[u8]) -> Result<WireOutcome, DecodeError> {
    let outcome = match command_type {
        "create_user" | "create_group" | "create_role" => {
            WireOutcome::EntityId(pb::EntityIdResult::decode(data)?)
        }
        "update_entity_name" | "delete_entity" | "add_user_to_group" | "remove_user_from_group"
        | "add_group_to_group" | "remove_group_from_group" | "assign_user_to_role"
        | "unassign_user_from_role" | "add_role_to_group" | "remove_role_from_group"
        | "revoke_permission" | "shutdown" => {
            pb::UnitResult::decode(data)?;
            WireOutcome::Unit
        }
        "grant_permission" | "deny_permission" => {
            WireOutcome::Permission(pb::PermissionResult::decode(data)?)
        }
        "bulk_permission_update" => WireOutcome::Bulk(pb::BulkResult::decode(data)?),
        "get_entity" => WireOutcome::Entity(pb::EntityResult::decode(data)?),
        "list_entities" => WireOutcome::EntityPage(pb::EntityPageResult::decode(data)?),
        "list_entity_permissions" | "list_resource_permissions" => {
            WireOutcome::Permissions(pb::PermissionListResult::decode(data)?)
        }
        "evaluate_permission" => WireOutcome::Evaluation(pb::EvaluationResult::decode(data)?),
        "get_effective_permissions" => {
            WireOutcome::Effective(pb::EffectivePermissionsResult::decode(data)?)
        }
        "health_check" => WireOutcome::Health(pb::HealthResponse::decode(data)?),
        other => return Err(DecodeError::UnknownCommandType(other.to_owned())),
    };
    Ok(outcome)
}
