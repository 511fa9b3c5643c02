//! REST routes and their command translations.
//!
//! Handlers are thin: resolve the tenant, parse the body into a command,
//! forward it through the router, map the wire outcome to a response
//! body. Domain and transport failures surface through `GatewayError`'s
//! status mapping.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};

use authz_engine::domain::command::Command;
use authz_engine::domain::model::EntityKind;
use authzd_proto::WireOutcome;

use crate::error::GatewayError;
use crate::router::TenantRouter;
use crate::router::tenant::TenantId;

use super::dto::{
    BulkRequest, BulkResponse, CreateGroupRequest, CreateRoleRequest, CreateUserRequest,
    EffectiveResponse, EntityIdResponse, EntityResponse, EvaluateRequest, EvaluationResponse,
    GrantRequest, HealthBody, ListQuery, PageResponse, PermissionResponse, RenameRequest,
    ResourceQuery, parse_verb,
};

pub struct AppState {
    pub router: TenantRouter,
}

/// Acting user propagated to backend audit records.
#[derive(Debug, Clone)]
pub struct Actor(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .headers
                .get("x-actor-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
        ))
    }
}

impl AppState {
    async fn exec(
        &self,
        tenant: &str,
        actor: Option<String>,
        command: Command,
    ) -> Result<WireOutcome, GatewayError> {
        self.router.execute(tenant, &command, actor, None).await
    }
}

fn unexpected(outcome: &WireOutcome) -> GatewayError {
    GatewayError::Decode(format!("unexpected result shape: {outcome:?}"))
}

// --- entity CRUD -----------------------------------------------------------

async fn create_user(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Json(body): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<EntityIdResponse>), GatewayError> {
    let outcome = state
        .exec(&tenant, actor, Command::CreateUser { name: body.name })
        .await?;
    match outcome {
        WireOutcome::EntityId(r) => Ok((StatusCode::CREATED, Json(EntityIdResponse { id: r.id }))),
        other => Err(unexpected(&other)),
    }
}

async fn create_group(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Json(body): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<EntityIdResponse>), GatewayError> {
    let outcome = state
        .exec(
            &tenant,
            actor,
            Command::CreateGroup {
                name: body.name,
                parent_group_id: body.parent_group_id,
            },
        )
        .await?;
    match outcome {
        WireOutcome::EntityId(r) => Ok((StatusCode::CREATED, Json(EntityIdResponse { id: r.id }))),
        other => Err(unexpected(&other)),
    }
}

async fn create_role(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Json(body): Json<CreateRoleRequest>,
) -> Result<(StatusCode, Json<EntityIdResponse>), GatewayError> {
    let outcome = state
        .exec(
            &tenant,
            actor,
            Command::CreateRole {
                name: body.name,
                group_id: body.group_id,
            },
        )
        .await?;
    match outcome {
        WireOutcome::EntityId(r) => Ok((StatusCode::CREATED, Json(EntityIdResponse { id: r.id }))),
        other => Err(unexpected(&other)),
    }
}

async fn get_entity(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, entity_id)): Path<(String, u64)>,
) -> Result<Json<EntityResponse>, GatewayError> {
    let outcome = state
        .exec(&tenant, actor, Command::GetEntity { entity_id })
        .await?;
    match outcome {
        WireOutcome::Entity(e) => Ok(Json(e.into())),
        other => Err(unexpected(&other)),
    }
}

async fn rename_entity(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, entity_id)): Path<(String, u64)>,
    Json(body): Json<RenameRequest>,
) -> Result<StatusCode, GatewayError> {
    let outcome = state
        .exec(
            &tenant,
            actor,
            Command::UpdateEntityName {
                entity_id,
                name: body.name,
            },
        )
        .await?;
    match outcome {
        WireOutcome::Unit => Ok(StatusCode::NO_CONTENT),
        other => Err(unexpected(&other)),
    }
}

async fn delete_entity(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, entity_id)): Path<(String, u64)>,
) -> Result<StatusCode, GatewayError> {
    let outcome = state
        .exec(&tenant, actor, Command::DeleteEntity { entity_id })
        .await?;
    match outcome {
        WireOutcome::Unit => Ok(StatusCode::NO_CONTENT),
        other => Err(unexpected(&other)),
    }
}

async fn list_entities(
    state: &AppState,
    tenant: &str,
    actor: Option<String>,
    kind: EntityKind,
    query: ListQuery,
) -> Result<Json<PageResponse>, GatewayError> {
    let outcome = state
        .exec(
            tenant,
            actor,
            Command::ListEntities {
                kind,
                page: query.page,
                page_size: query.page_size,
            },
        )
        .await?;
    match outcome {
        WireOutcome::EntityPage(p) => Ok(Json(p.into())),
        other => Err(unexpected(&other)),
    }
}

async fn list_users(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Query(query): Query<ListQuery>,
) -> Result<Json<PageResponse>, GatewayError> {
    list_entities(&state, &tenant, actor, EntityKind::User, query).await
}

async fn list_groups(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Query(query): Query<ListQuery>,
) -> Result<Json<PageResponse>, GatewayError> {
    list_entities(&state, &tenant, actor, EntityKind::Group, query).await
}

async fn list_roles(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Query(query): Query<ListQuery>,
) -> Result<Json<PageResponse>, GatewayError> {
    list_entities(&state, &tenant, actor, EntityKind::Role, query).await
}

// --- edges -----------------------------------------------------------------

async fn edge_handler(
    state: &AppState,
    tenant: &str,
    actor: Option<String>,
    command: Command,
) -> Result<StatusCode, GatewayError> {
    let outcome = state.exec(tenant, actor, command).await?;
    match outcome {
        WireOutcome::Unit => Ok(StatusCode::NO_CONTENT),
        other => Err(unexpected(&other)),
    }
}

async fn add_user_to_group(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, user_id, group_id)): Path<(String, u64, u64)>,
) -> Result<StatusCode, GatewayError> {
    edge_handler(
        &state,
        &tenant,
        actor,
        Command::AddUserToGroup { user_id, group_id },
    )
    .await
}

async fn remove_user_from_group(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, user_id, group_id)): Path<(String, u64, u64)>,
) -> Result<StatusCode, GatewayError> {
    edge_handler(
        &state,
        &tenant,
        actor,
        Command::RemoveUserFromGroup { user_id, group_id },
    )
    .await
}

async fn assign_user_to_role(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, user_id, role_id)): Path<(String, u64, u64)>,
) -> Result<StatusCode, GatewayError> {
    edge_handler(
        &state,
        &tenant,
        actor,
        Command::AssignUserToRole { user_id, role_id },
    )
    .await
}

async fn unassign_user_from_role(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, user_id, role_id)): Path<(String, u64, u64)>,
) -> Result<StatusCode, GatewayError> {
    edge_handler(
        &state,
        &tenant,
        actor,
        Command::UnassignUserFromRole { user_id, role_id },
    )
    .await
}

async fn add_group_to_group(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, child_id, parent_id)): Path<(String, u64, u64)>,
) -> Result<StatusCode, GatewayError> {
    edge_handler(
        &state,
        &tenant,
        actor,
        Command::AddGroupToGroup {
            child_id,
            parent_id,
        },
    )
    .await
}

async fn remove_group_from_group(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, child_id, parent_id)): Path<(String, u64, u64)>,
) -> Result<StatusCode, GatewayError> {
    edge_handler(
        &state,
        &tenant,
        actor,
        Command::RemoveGroupFromGroup {
            child_id,
            parent_id,
        },
    )
    .await
}

async fn add_role_to_group(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, role_id, group_id)): Path<(String, u64, u64)>,
) -> Result<StatusCode, GatewayError> {
    edge_handler(
        &state,
        &tenant,
        actor,
        Command::AddRoleToGroup { role_id, group_id },
    )
    .await
}

async fn remove_role_from_group(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, role_id, group_id)): Path<(String, u64, u64)>,
) -> Result<StatusCode, GatewayError> {
    edge_handler(
        &state,
        &tenant,
        actor,
        Command::RemoveRoleFromGroup { role_id, group_id },
    )
    .await
}

// --- permissions -----------------------------------------------------------

async fn grant_permission(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, _entity_type, entity_id)): Path<(String, String, u64)>,
    Json(body): Json<GrantRequest>,
) -> Result<(StatusCode, Json<PermissionResponse>), GatewayError> {
    let grant = body.into_grant(entity_id)?;
    let outcome = state
        .exec(&tenant, actor, Command::GrantPermission(grant))
        .await?;
    match outcome {
        WireOutcome::Permission(p) => Ok((StatusCode::CREATED, Json(p.into()))),
        other => Err(unexpected(&other)),
    }
}

async fn deny_permission(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, _entity_type, entity_id)): Path<(String, String, u64)>,
    Json(body): Json<GrantRequest>,
) -> Result<(StatusCode, Json<PermissionResponse>), GatewayError> {
    let grant = body.into_grant(entity_id)?;
    let outcome = state
        .exec(&tenant, actor, Command::DenyPermission(grant))
        .await?;
    match outcome {
        WireOutcome::Permission(p) => Ok((StatusCode::CREATED, Json(p.into()))),
        other => Err(unexpected(&other)),
    }
}

async fn revoke_permission(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, permission_id)): Path<(String, u64)>,
) -> Result<StatusCode, GatewayError> {
    let outcome = state
        .exec(&tenant, actor, Command::RevokePermission { permission_id })
        .await?;
    match outcome {
        WireOutcome::Unit => Ok(StatusCode::NO_CONTENT),
        other => Err(unexpected(&other)),
    }
}

async fn bulk_permissions(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Json(body): Json<BulkRequest>,
) -> Result<Json<BulkResponse>, GatewayError> {
    let operations = body
        .operations
        .into_iter()
        .map(super::dto::BulkOpRequest::into_op)
        .collect::<Result<Vec<_>, _>>()?;
    let outcome = state
        .exec(
            &tenant,
            actor,
            Command::BulkPermissionUpdate {
                operations,
                transactional: body.transactional,
                stop_on_first_error: body.stop_on_first_error,
            },
        )
        .await?;
    match outcome {
        WireOutcome::Bulk(b) => Ok(Json(b.into())),
        other => Err(unexpected(&other)),
    }
}

async fn list_entity_permissions(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, entity_id)): Path<(String, u64)>,
) -> Result<Json<Vec<PermissionResponse>>, GatewayError> {
    let outcome = state
        .exec(&tenant, actor, Command::ListEntityPermissions { entity_id })
        .await?;
    match outcome {
        WireOutcome::Permissions(p) => {
            Ok(Json(p.permissions.into_iter().map(Into::into).collect()))
        }
        other => Err(unexpected(&other)),
    }
}

async fn list_resource_permissions(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Query(query): Query<ResourceQuery>,
) -> Result<Json<Vec<PermissionResponse>>, GatewayError> {
    let outcome = state
        .exec(
            &tenant,
            actor,
            Command::ListResourcePermissions { uri: query.uri },
        )
        .await?;
    match outcome {
        WireOutcome::Permissions(p) => {
            Ok(Json(p.permissions.into_iter().map(Into::into).collect()))
        }
        other => Err(unexpected(&other)),
    }
}

// --- evaluation ------------------------------------------------------------

async fn effective_permissions(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, entity_id)): Path<(String, u64)>,
) -> Result<Json<EffectiveResponse>, GatewayError> {
    let outcome = state
        .exec(&tenant, actor, Command::GetEffectivePermissions { entity_id })
        .await?;
    match outcome {
        WireOutcome::Effective(e) => Ok(Json(e.into())),
        other => Err(unexpected(&other)),
    }
}

async fn evaluate_permission(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
    Actor(actor): Actor,
    Path((_t, entity_id)): Path<(String, u64)>,
    Json(body): Json<EvaluateRequest>,
) -> Result<Json<EvaluationResponse>, GatewayError> {
    let verb = parse_verb(&body.verb)?;
    let outcome = state
        .exec(
            &tenant,
            actor,
            Command::EvaluatePermission {
                entity_id,
                uri: body.uri,
                verb,
            },
        )
        .await?;
    match outcome {
        WireOutcome::Evaluation(e) => Ok(Json(e.into())),
        other => Err(unexpected(&other)),
    }
}

// --- health ----------------------------------------------------------------

async fn tenant_health(
    State(state): State<Arc<AppState>>,
    TenantId(tenant): TenantId,
) -> Result<Json<HealthBody>, GatewayError> {
    let health = state.router.health(&tenant).await?;
    Ok(Json(health.into()))
}

/// Assemble the full HTTP surface.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // entities
        .route("/tenants/{t}/users", post(create_user).get(list_users))
        .route("/tenants/{t}/groups", post(create_group).get(list_groups))
        .route("/tenants/{t}/roles", post(create_role).get(list_roles))
        .route(
            "/tenants/{t}/entities/{id}",
            get(get_entity).delete(delete_entity),
        )
        .route("/tenants/{t}/entities/{id}/name", put(rename_entity))
        .route(
            "/tenants/{t}/entities/{id}/permissions",
            get(list_entity_permissions),
        )
        // edges
        .route(
            "/tenants/{t}/users/{u}/groups/{g}",
            post(add_user_to_group).delete(remove_user_from_group),
        )
        .route(
            "/tenants/{t}/users/{u}/roles/{r}",
            post(assign_user_to_role).delete(unassign_user_from_role),
        )
        .route(
            "/tenants/{t}/groups/{c}/groups/{p}",
            post(add_group_to_group).delete(remove_group_from_group),
        )
        .route(
            "/tenants/{t}/roles/{r}/groups/{g}",
            post(add_role_to_group).delete(remove_role_from_group),
        )
        // permissions
        .route(
            "/tenants/{t}/{entity_type}/{id}/permissions/grant",
            post(grant_permission),
        )
        .route(
            "/tenants/{t}/{entity_type}/{id}/permissions/deny",
            post(deny_permission),
        )
        .route("/tenants/{t}/permissions/{pid}", delete(revoke_permission))
        .route("/tenants/{t}/permissions/bulk", post(bulk_permissions))
        .route(
            "/tenants/{t}/resources/permissions",
            get(list_resource_permissions),
        )
        // evaluation
        .route(
            "/tenants/{t}/users/{u}/permissions",
            get(effective_permissions),
        )
        .route(
            "/tenants/{t}/users/{u}/permissions/evaluate",
            post(evaluate_permission),
        )
        // health
        .route("/tenants/{t}/health", get(tenant_health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
