//! Core identifier and reference types for the lyph graph.
//!
//! Resources and relationships share one id space: every id handed out by the
//! allocator is unique across the whole graph.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Identifiers ───────────────────────────────────────────────────

/// Globally unique identifier of a resource (node) or relationship (edge).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A resource identified by concrete class and id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub id: EntityId,
    pub class: String,
}

impl ResourceKey {
    pub fn new(class: impl Into<String>, id: EntityId) -> Self {
        Self {
            id,
            class: class.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class, self.id)
    }
}

// ── References ────────────────────────────────────────────────────

/// The id half of a reference: either already persisted, or a batch-local
/// placeholder that is resolved when the batch commits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RefId {
    Assigned(EntityId),
    Placeholder(String),
}

impl RefId {
    /// The persisted id, if any.
    pub fn assigned(&self) -> Option<EntityId> {
        match self {
            Self::Assigned(id) => Some(*id),
            Self::Placeholder(_) => None,
        }
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assigned(id) => write!(f, "{id}"),
            Self::Placeholder(name) => write!(f, "#{name}"),
        }
    }
}

/// A normalized reference to another resource, as supplied in a relationship field.
///
/// `class` is `None` when the caller gave a bare id and the field's codomain is
/// abstract; such a reference is rejected by relationship validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub id: RefId,
    pub class: Option<String>,
}

impl ResourceRef {
    pub fn assigned(class: impl Into<String>, id: EntityId) -> Self {
        Self {
            id: RefId::Assigned(id),
            class: Some(class.into()),
        }
    }

    pub fn placeholder(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: RefId::Placeholder(name.into()),
            class: Some(class.into()),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.class {
            Some(class) => write!(f, "{class}/{}", self.id),
            None => write!(f, "?/{}", self.id),
        }
    }
}

// ── Hrefs ─────────────────────────────────────────────────────────

/// Build the canonical href of an entity: `{host}/{class}/{id}`.
pub fn href(host: &str, class: &str, id: EntityId) -> String {
    format!("{}/{class}/{id}", host.trim_end_matches('/'))
}

/// Split an href into its class and id (the last two path segments).
pub fn parse_href(href: &str) -> Option<(String, EntityId)> {
    let mut segments = href.trim_end_matches('/').rsplit('/');
    let id = segments.next()?.parse::<i64>().ok()?;
    let class = segments.next()?;
    if class.is_empty() {
        return None;
    }
    Some((class.to_string(), EntityId(id)))
}
