//! Core value types of the authorization graph.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tenant-scoped entity identifier. Allocated from a per-tenant counter and
/// never reused within a process lifetime.
pub type EntityId = u64;

/// Tenant-scoped permission identifier, drawn from the same counter.
pub type PermissionId = u64;

/// Maximum number of direct children any entity may have.
pub const MAX_CHILDREN: usize = 100;

/// Maximum length of an entity display name.
pub const MAX_NAME_LEN: usize = 255;

/// The three node variants of the authorization graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Group,
    Role,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Role => "role",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" | "users" => Ok(Self::User),
            "group" | "groups" => Ok(Self::Group),
            "role" | "roles" => Ok(Self::Role),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// HTTP verb a permission applies to. `Any` is the wildcard verb and
/// matches every request verb during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Any,
}

impl Verb {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Any => "ANY",
        }
    }

    /// Whether a stored permission verb covers a request verb.
    #[must_use]
    pub fn covers(self, requested: Verb) -> bool {
        self == Verb::Any || self == requested
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "ANY" | "*" => Ok(Self::Any),
            other => Err(format!("unknown verb: {other}")),
        }
    }
}

/// Grant or deny. Exactly one per permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Grant,
    Deny,
}

impl Polarity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Deny => "deny",
        }
    }

    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Grant => Self::Deny,
            Self::Deny => Self::Grant,
        }
    }
}

impl FromStr for Polarity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant" => Ok(Self::Grant),
            "deny" => Ok(Self::Deny),
            other => Err(format!("unknown polarity: {other}")),
        }
    }
}

/// Classification of a permission's origin. Only `Explicit` permissions are
/// ever stored; inherited access is computed by the resolver at evaluation
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    Explicit,
    Inherited,
    Pattern,
}

impl Scheme {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Inherited => "inherited",
            Self::Pattern => "pattern",
        }
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explicit" => Ok(Self::Explicit),
            "inherited" => Ok(Self::Inherited),
            "pattern" => Ok(Self::Pattern),
            other => Err(format!("unknown scheme: {other}")),
        }
    }
}

/// A permission attached to exactly one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub entity_id: EntityId,
    /// URI pattern; may contain `*`, trailing `**` and `{param}` segments.
    pub uri: String,
    pub verb: Verb,
    pub polarity: Polarity,
    pub scheme: Scheme,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Permission {
    /// Whether the permission is expired at `now`. Permissions without an
    /// expiry never expire.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// A node in the authorization graph.
///
/// Edge symmetry invariant: for every edge `p -> c`, `c` is in
/// `p.children` exactly when `p` is in `c.parents`. The graph store is the
/// only writer and maintains both sides on every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: String,
    pub parents: BTreeSet<EntityId>,
    pub children: BTreeSet<EntityId>,
    /// Ids of permissions attached to this entity, in attachment order.
    pub permissions: Vec<PermissionId>,
    pub metadata: BTreeMap<String, String>,
}

impl Entity {
    #[must_use]
    pub fn new(id: EntityId, kind: EntityKind, name: String) -> Self {
        Self {
            id,
            kind,
            name,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            permissions: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_roundtrip_and_wildcard() {
        assert_eq!("GET".parse::<Verb>().unwrap(), Verb::Get);
        assert_eq!("any".parse::<Verb>().unwrap(), Verb::Any);
        assert!(Verb::Any.covers(Verb::Delete));
        assert!(Verb::Get.covers(Verb::Get));
        assert!(!Verb::Get.covers(Verb::Post));
    }

    #[test]
    fn entity_kind_parses_plural_forms() {
        assert_eq!("groups".parse::<EntityKind>().unwrap(), EntityKind::Group);
        assert!("widget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn permission_expiry() {
        let now = Utc::now();
        let perm = Permission {
            id: 1,
            entity_id: 1,
            uri: "/api/orders".to_owned(),
            verb: Verb::Get,
            polarity: Polarity::Grant,
            scheme: Scheme::Explicit,
            expires_at: Some(now - chrono::Duration::seconds(1)),
        };
        assert!(perm.is_expired(now));

        let open_ended = Permission {
            expires_at: None,
            ..perm
        };
        assert!(!open_ended.is_expired(now));
    }
}
