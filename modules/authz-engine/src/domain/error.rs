//! Error taxonomy for the engine.
//!
//! Every failure a command can produce is a tagged variant here; the RPC
//! layer converts them to stable wire kind strings and the gateway maps
//! those to HTTP statuses.

use thiserror::Error;

use super::model::EntityId;

/// Errors produced while applying commands against the tenant graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    /// The referenced entity or permission does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input; the caller's fault.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Linking the two entities would create a cycle in the hierarchy.
    #[error("linking {child_id} under {parent_id} would create a cycle")]
    CyclicHierarchy {
        parent_id: EntityId,
        child_id: EntityId,
    },

    /// The parent already has the maximum number of children.
    #[error("entity {parent_id} already has the maximum number of children")]
    CapacityExceeded { parent_id: EntityId },

    /// The entity kinds cannot be related (e.g. a user as a parent).
    #[error("invalid relation: {0}")]
    InvalidRelation(String),

    /// An explicit permission with the opposite polarity already exists for
    /// the same URI and verb on this entity.
    #[error("conflicting polarity for {uri} {verb} on entity {entity_id}")]
    ConflictingPolarity {
        entity_id: EntityId,
        uri: String,
        verb: String,
    },

    /// The edge to remove does not exist.
    #[error("no edge between {parent_id} and {child_id}")]
    EdgeMissing {
        parent_id: EntityId,
        child_id: EntityId,
    },

    /// The command was dropped before it began executing.
    #[error("cancelled")]
    Cancelled,

    /// The caller's deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The engine is shutting down; the command was not processed.
    #[error("engine shut down")]
    Shutdown,

    /// Evaluation considered more matches than the trace bound allows.
    #[error("evaluation trace overflow (more than {limit} matches)")]
    TraceOverflow { limit: usize },

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DomainError {
    #[must_use]
    pub fn not_found_entity(id: EntityId) -> Self {
        Self::NotFound(format!("entity {id}"))
    }

    #[must_use]
    pub fn not_found_permission(id: u64) -> Self {
        Self::NotFound(format!("permission {id}"))
    }

    /// Stable identifier used on the wire and in audit records.
    #[must_use]
    pub fn wire_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::CyclicHierarchy { .. } => "CyclicHierarchy",
            Self::CapacityExceeded { .. } => "CapacityExceeded",
            Self::InvalidRelation(_) => "InvalidArgument",
            Self::ConflictingPolarity { .. } => "ConflictingPolarity",
            Self::EdgeMissing { .. } => "EdgeMissing",
            Self::Cancelled => "Cancelled",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::Shutdown => "Shutdown",
            Self::TraceOverflow { .. } => "TraceOverflow",
            Self::Internal(_) => "Internal",
        }
    }
}
