//! Request and response bodies of the HTTP surface.
//!
//! Requests parse into domain command parts; responses are built straight
//! from the wire result messages without a detour through domain types.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use authz_engine::domain::command::{BulkOp, PermissionGrant};
use authz_engine::domain::model::{Scheme, Verb};
use authzd_proto::pb;

use crate::error::GatewayError;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateUserRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub parent_group_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRoleRequest {
    pub name: String,
    #[serde(default)]
    pub group_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluateRequest {
    pub uri: String,
    pub verb: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrantRequest {
    pub uri: String,
    pub verb: String,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkOpRequest {
    pub action: String,
    #[serde(default)]
    pub entity_id: Option<u64>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub verb: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
    #[serde(default)]
    pub permission_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkRequest {
    pub operations: Vec<BulkOpRequest>,
    #[serde(default)]
    pub transactional: bool,
    #[serde(default)]
    pub stop_on_first_error: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct ResourceQuery {
    pub uri: String,
}

pub fn parse_verb(raw: &str) -> Result<Verb, GatewayError> {
    Verb::from_str(raw).map_err(GatewayError::BadRequest)
}

pub fn parse_scheme(raw: Option<&str>) -> Result<Scheme, GatewayError> {
    raw.map_or(Ok(Scheme::Explicit), |raw| {
        Scheme::from_str(raw).map_err(GatewayError::BadRequest)
    })
}

pub fn parse_expiry(
    ms: Option<i64>,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, GatewayError> {
    ms.map(|ms| {
        chrono::DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| GatewayError::BadRequest(format!("bad expiry timestamp {ms}")))
    })
    .transpose()
}

impl GrantRequest {
    /// Build the grant parameters for `entity_id`.
    ///
    /// # Errors
    /// `BadRequest` for unknown verbs/schemes or invalid expiry.
    pub fn into_grant(self, entity_id: u64) -> Result<PermissionGrant, GatewayError> {
        Ok(PermissionGrant {
            entity_id,
            uri: self.uri,
            verb: parse_verb(&self.verb)?,
            scheme: parse_scheme(self.scheme.as_deref())?,
            expires_at: parse_expiry(self.expires_at_ms)?,
        })
    }
}

impl BulkOpRequest {
    /// Convert one bulk entry to a domain operation.
    ///
    /// # Errors
    /// `BadRequest` when required fields for the action are missing.
    pub fn into_op(self) -> Result<BulkOp, GatewayError> {
        let action = self.action.clone();
        match action.as_str() {
            "grant" | "deny" => {
                let entity_id = self
                    .entity_id
                    .ok_or_else(|| GatewayError::BadRequest("entity_id required".to_owned()))?;
                let uri = self
                    .uri
                    .ok_or_else(|| GatewayError::BadRequest("uri required".to_owned()))?;
                let verb = self
                    .verb
                    .ok_or_else(|| GatewayError::BadRequest("verb required".to_owned()))?;
                let grant = PermissionGrant {
                    entity_id,
                    uri,
                    verb: parse_verb(&verb)?,
                    scheme: parse_scheme(self.scheme.as_deref())?,
                    expires_at: parse_expiry(self.expires_at_ms)?,
                };
                if action == "grant" {
                    Ok(BulkOp::Grant(grant))
                } else {
                    Ok(BulkOp::Deny(grant))
                }
            }
            "revoke" => {
                let permission_id = self.permission_id.ok_or_else(|| {
                    GatewayError::BadRequest("permission_id required".to_owned())
                })?;
                Ok(BulkOp::Revoke { permission_id })
            }
            other => Err(GatewayError::BadRequest(format!(
                "unknown bulk action: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

fn verb_name(raw: i32) -> String {
    match pb::Verb::try_from(raw) {
        Ok(pb::Verb::Get) => "GET",
        Ok(pb::Verb::Post) => "POST",
        Ok(pb::Verb::Put) => "PUT",
        Ok(pb::Verb::Delete) => "DELETE",
        Ok(pb::Verb::Patch) => "PATCH",
        Ok(pb::Verb::Head) => "HEAD",
        Ok(pb::Verb::Options) => "OPTIONS",
        Ok(pb::Verb::Any) => "ANY",
        Ok(pb::Verb::Unspecified) | Err(_) => "UNKNOWN",
    }
    .to_owned()
}

fn kind_name(raw: i32) -> String {
    match pb::EntityKind::try_from(raw) {
        Ok(pb::EntityKind::User) => "user",
        Ok(pb::EntityKind::Group) => "group",
        Ok(pb::EntityKind::Role) => "role",
        Ok(pb::EntityKind::Unspecified) | Err(_) => "unknown",
    }
    .to_owned()
}

fn polarity_name(raw: i32) -> String {
    match pb::Polarity::try_from(raw) {
        Ok(pb::Polarity::Grant) => "grant",
        Ok(pb::Polarity::Deny) => "deny",
        Ok(pb::Polarity::Unspecified) | Err(_) => "unknown",
    }
    .to_owned()
}

fn scheme_name(raw: i32) -> String {
    match pb::Scheme::try_from(raw) {
        Ok(pb::Scheme::Explicit) => "explicit",
        Ok(pb::Scheme::Inherited) => "inherited",
        Ok(pb::Scheme::Pattern) => "pattern",
        Ok(pb::Scheme::Unspecified) | Err(_) => "unknown",
    }
    .to_owned()
}

#[derive(Debug, Serialize)]
pub struct EntityIdResponse {
    pub id: u64,
}

#[derive(Debug, Serialize)]
pub struct EntityResponse {
    pub id: u64,
    pub kind: String,
    pub name: String,
    pub parent_ids: Vec<u64>,
    pub child_ids: Vec<u64>,
    pub metadata: std::collections::BTreeMap<String, String>,
}

impl From<pb::EntityResult> for EntityResponse {
    fn from(e: pb::EntityResult) -> Self {
        Self {
            id: e.id,
            kind: kind_name(e.kind),
            name: e.name,
            parent_ids: e.parent_ids,
            child_ids: e.child_ids,
            metadata: e.metadata.into_iter().collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PageResponse {
    pub entities: Vec<EntityResponse>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

impl From<pb::EntityPageResult> for PageResponse {
    fn from(p: pb::EntityPageResult) -> Self {
        Self {
            entities: p.entities.into_iter().map(Into::into).collect(),
            page: p.page,
            page_size: p.page_size,
            total: p.total,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PermissionResponse {
    pub id: u64,
    pub entity_id: u64,
    pub uri: String,
    pub verb: String,
    pub polarity: String,
    pub scheme: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
}

impl From<pb::PermissionResult> for PermissionResponse {
    fn from(p: pb::PermissionResult) -> Self {
        Self {
            id: p.id,
            entity_id: p.entity_id,
            uri: p.uri,
            verb: verb_name(p.verb),
            polarity: polarity_name(p.polarity),
            scheme: scheme_name(p.scheme),
            expires_at_ms: p.expires_at_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TraceEntryResponse {
    pub entity_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<PermissionResponse>,
    pub specificity: u64,
    pub distance: u32,
    pub selected: bool,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub bindings: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct EvaluationResponse {
    pub decision: String,
    pub reason: String,
    pub trace: Vec<TraceEntryResponse>,
}

impl From<pb::EvaluationResult> for EvaluationResponse {
    fn from(e: pb::EvaluationResult) -> Self {
        let decision = match pb::Decision::try_from(e.decision) {
            Ok(pb::Decision::Allowed) => "allowed",
            _ => "denied",
        };
        Self {
            decision: decision.to_owned(),
            reason: e.reason,
            trace: e
                .trace
                .into_iter()
                .map(|t| TraceEntryResponse {
                    entity_id: t.entity_id,
                    permission: t.permission.map(Into::into),
                    specificity: t.specificity,
                    distance: t.distance,
                    selected: t.selected,
                    bindings: t.bindings.into_iter().collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EffectivePermissionResponse {
    pub uri: String,
    pub verb: String,
    pub polarity: String,
    pub source_entity_id: u64,
    pub distance: u32,
}

#[derive(Debug, Serialize)]
pub struct EffectiveResponse {
    pub permissions: Vec<EffectivePermissionResponse>,
}

impl From<pb::EffectivePermissionsResult> for EffectiveResponse {
    fn from(e: pb::EffectivePermissionsResult) -> Self {
        Self {
            permissions: e
                .permissions
                .into_iter()
                .map(|p| EffectivePermissionResponse {
                    uri: p.uri,
                    verb: verb_name(p.verb),
                    polarity: polarity_name(p.polarity),
                    source_entity_id: p.source_entity_id,
                    distance: p.distance,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BulkEntryResponse {
    pub index: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_id: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct BulkResponse {
    pub results: Vec<BulkEntryResponse>,
}

impl From<pb::BulkResult> for BulkResponse {
    fn from(b: pb::BulkResult) -> Self {
        Self {
            results: b
                .results
                .into_iter()
                .map(|r| BulkEntryResponse {
                    index: r.index,
                    success: r.success,
                    error_kind: (!r.error_kind.is_empty()).then_some(r.error_kind),
                    error_message: (!r.error_message.is_empty()).then_some(r.error_message),
                    permission_id: r.permission_id,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub healthy: bool,
    pub uptime_seconds: u64,
    pub commands_processed: u64,
    pub persistence_degraded: bool,
}

impl From<pb::HealthResponse> for HealthBody {
    fn from(h: pb::HealthResponse) -> Self {
        Self {
            healthy: h.healthy,
            uptime_seconds: h.uptime_seconds,
            commands_processed: h.commands_processed,
            persistence_degraded: h.persistence_degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_op_requires_fields_per_action() {
        let op = BulkOpRequest {
            action: "grant".to_owned(),
            entity_id: Some(1),
            uri: Some("/a".to_owned()),
            verb: Some("GET".to_owned()),
            scheme: None,
            expires_at_ms: None,
            permission_id: None,
        };
        assert!(matches!(op.into_op().unwrap(), BulkOp::Grant(_)));

        let op = BulkOpRequest {
            action: "revoke".to_owned(),
            entity_id: None,
            uri: None,
            verb: None,
            scheme: None,
            expires_at_ms: None,
            permission_id: None,
        };
        assert!(op.into_op().is_err());

        let op = BulkOpRequest {
            action: "explode".to_owned(),
            entity_id: None,
            uri: None,
            verb: None,
            scheme: None,
            expires_at_ms: None,
            permission_id: None,
        };
        assert!(op.into_op().is_err());
    }

    #[test]
    fn enum_names_for_responses() {
        assert_eq!(verb_name(pb::Verb::Get as i32), "GET");
        assert_eq!(verb_name(pb::Verb::Any as i32), "ANY");
        assert_eq!(kind_name(pb::EntityKind::Group as i32), "group");
        assert_eq!(polarity_name(pb::Polarity::Deny as i32), "deny");
        assert_eq!(scheme_name(pb::Scheme::Explicit as i32), "explicit");
        assert_eq!(verb_name(999), "UNKNOWN");
    }

    #[test]
    fn grant_request_parses_domain_types() {
        let req = GrantRequest {
            uri: "/api/orders".to_owned(),
            verb: "get".to_owned(),
            scheme: None,
            expires_at_ms: Some(1_700_000_000_000),
        };
        let grant = req.into_grant(3).unwrap();
        assert_eq!(grant.entity_id, 3);
        assert_eq!(grant.verb, Verb::Get);
        assert_eq!(grant.scheme, Scheme::Explicit);
        assert!(grant.expires_at.is_some());
    }
}
