//! Hierarchical permission resolution.
//!
//! Evaluation walks the ancestor closure of the query entity, collects
//! every non-expired permission whose URI pattern and verb match, ranks
//! the matches by specificity with a distance tie-break, and lets the
//! best-ranked match decide. Denies win over grants at equal rank.
//! Evaluation never mutates the graph.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::error::DomainError;
use super::graph::TenantGraph;
use super::model::{EntityId, Permission, Polarity, Verb};
use super::pattern::{Bindings, Specificity, UriPattern};

/// Upper bound on matches considered in a single evaluation.
pub const MAX_TRACE_MATCHES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
}

/// Why the decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalReason {
    Granted,
    ExplicitDeny,
    NoPermission,
}

impl EvalReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Granted => "Granted",
            Self::ExplicitDeny => "ExplicitDeny",
            Self::NoPermission => "NoPermission",
        }
    }
}

/// One considered match, retained for observability and conflict
/// diagnosis.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub entity_id: EntityId,
    pub permission: Permission,
    pub specificity: Specificity,
    pub distance: u32,
    /// Whether this match decided the outcome.
    pub selected: bool,
    pub bindings: Bindings,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub decision: Decision,
    pub reason: EvalReason,
    pub trace: Vec<TraceEntry>,
}

/// A flattened `(uri, verb)` entry from the ancestor closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePermission {
    pub uri: String,
    pub verb: Verb,
    pub polarity: Polarity,
    pub source_entity_id: EntityId,
    pub distance: u32,
}

/// The entity itself plus every transitive parent, each with its minimal
/// edge distance from the start entity.
#[must_use]
pub fn ancestor_closure(graph: &TenantGraph, start: EntityId) -> Vec<(EntityId, u32)> {
    let mut distances: HashMap<EntityId, u32> = HashMap::new();
    let mut queue = std::collections::VecDeque::new();
    distances.insert(start, 0);
    queue.push_back(start);

    while let Some(id) = queue.pop_front() {
        let Some(entity) = graph.entity(id) else {
            continue;
        };
        let next = distances[&id] + 1;
        for parent_id in &entity.parents {
            if !distances.contains_key(parent_id) {
                distances.insert(*parent_id, next);
                queue.push_back(*parent_id);
            }
        }
    }

    let mut closure: Vec<(EntityId, u32)> = distances.into_iter().collect();
    closure.sort_by_key(|(id, distance)| (*distance, *id));
    closure
}

fn rank(entry: &TraceEntry) -> (Specificity, std::cmp::Reverse<u32>, bool) {
    // Higher tuple wins: specificity first, then smaller distance, then
    // deny over grant at a fully equal rank.
    (
        entry.specificity,
        std::cmp::Reverse(entry.distance),
        entry.permission.polarity == Polarity::Deny,
    )
}

/// Evaluate `(entity, uri, verb)` against the graph at time `now`.
///
/// # Errors
/// `NotFound` for an unknown entity, `TraceOverflow` when more than
/// [`MAX_TRACE_MATCHES`] matches would be considered.
pub fn evaluate(
    graph: &TenantGraph,
    entity_id: EntityId,
    uri: &str,
    verb: Verb,
    now: DateTime<Utc>,
) -> Result<Evaluation, DomainError> {
    if graph.entity(entity_id).is_none() {
        return Err(DomainError::not_found_entity(entity_id));
    }

    let mut trace: Vec<TraceEntry> = Vec::new();
    for (ancestor_id, distance) in ancestor_closure(graph, entity_id) {
        let Some(ancestor) = graph.entity(ancestor_id) else {
            continue;
        };
        for pid in &ancestor.permissions {
            let Some(permission) = graph.permission(*pid) else {
                continue;
            };
            if permission.is_expired(now) || !permission.verb.covers(verb) {
                continue;
            }
            let Ok(pattern) = UriPattern::parse(&permission.uri) else {
                continue;
            };
            let Some((specificity, bindings)) = pattern.matches(uri) else {
                continue;
            };
            if trace.len() >= MAX_TRACE_MATCHES {
                return Err(DomainError::TraceOverflow {
                    limit: MAX_TRACE_MATCHES,
                });
            }
            trace.push(TraceEntry {
                entity_id: ancestor_id,
                permission: permission.clone(),
                specificity,
                distance,
                selected: false,
                bindings,
            });
        }
    }

    let Some(winner) = trace
        .iter()
        .enumerate()
        .max_by_key(|(_, entry)| rank(entry))
        .map(|(idx, _)| idx)
    else {
        return Ok(Evaluation {
            decision: Decision::Denied,
            reason: EvalReason::NoPermission,
            trace,
        });
    };

    trace[winner].selected = true;
    let (decision, reason) = match trace[winner].permission.polarity {
        Polarity::Grant => (Decision::Allowed, EvalReason::Granted),
        Polarity::Deny => (Decision::Denied, EvalReason::ExplicitDeny),
    };

    Ok(Evaluation {
        decision,
        reason,
        trace,
    })
}

/// All ancestor-closure permissions flattened to one entry per
/// `(uri, verb)` pair, deny winning within each pair.
///
/// # Errors
/// `NotFound` for an unknown entity.
pub fn effective_permissions(
    graph: &TenantGraph,
    entity_id: EntityId,
    now: DateTime<Utc>,
) -> Result<Vec<EffectivePermission>, DomainError> {
    if graph.entity(entity_id).is_none() {
        return Err(DomainError::not_found_entity(entity_id));
    }

    let mut flattened: HashMap<(String, Verb), EffectivePermission> = HashMap::new();
    for (ancestor_id, distance) in ancestor_closure(graph, entity_id) {
        let Some(ancestor) = graph.entity(ancestor_id) else {
            continue;
        };
        for pid in &ancestor.permissions {
            let Some(permission) = graph.permission(*pid) else {
                continue;
            };
            if permission.is_expired(now) {
                continue;
            }
            let key = (permission.uri.clone(), permission.verb);
            let candidate = EffectivePermission {
                uri: permission.uri.clone(),
                verb: permission.verb,
                polarity: permission.polarity,
                source_entity_id: ancestor_id,
                distance,
            };
            match flattened.get_mut(&key) {
                None => {
                    flattened.insert(key, candidate);
                }
                Some(existing) => {
                    let deny_upgrade = existing.polarity == Polarity::Grant
                        && candidate.polarity == Polarity::Deny;
                    let closer_same_polarity = existing.polarity == candidate.polarity
                        && candidate.distance < existing.distance;
                    if deny_upgrade || closer_same_polarity {
                        *existing = candidate;
                    }
                }
            }
        }
    }

    let mut result: Vec<EffectivePermission> = flattened.into_values().collect();
    result.sort_by(|a, b| a.uri.cmp(&b.uri).then(a.verb.cmp(&b.verb)));
    Ok(result)
}
