//! Backend-neutral graph statements and result rows.

use serde::Serialize;
use serde_json::Value;

use lyph_core::EntityId;

use crate::client::GraphError;

/// Property map of a node or edge.
pub type Properties = serde_json::Map<String, Value>;

/// Restricts the ids a statement applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdFilter {
    Any,
    In(Vec<EntityId>),
    NotIn(Vec<EntityId>),
}

impl IdFilter {
    pub fn matches(&self, id: EntityId) -> bool {
        match self {
            Self::Any => true,
            Self::In(ids) => ids.contains(&id),
            Self::NotIn(ids) => !ids.contains(&id),
        }
    }
}

/// Edge direction as seen from the near node.
///
/// Edges point from relationship end one to end two, so `Outgoing` means the
/// near node sits at end one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Either,
}

/// "Edges of these relationship classes in this direction", with id filters
/// on the near endpoint, the far endpoint, and the edge itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgePattern {
    pub classes: Vec<String>,
    pub direction: Direction,
    pub near: IdFilter,
    pub far: IdFilter,
    pub ids: IdFilter,
}

impl EdgePattern {
    pub fn new(classes: Vec<String>, direction: Direction) -> Self {
        Self {
            classes,
            direction,
            near: IdFilter::Any,
            far: IdFilter::Any,
            ids: IdFilter::Any,
        }
    }

    pub fn near(mut self, filter: IdFilter) -> Self {
        self.near = filter;
        self
    }

    pub fn far(mut self, filter: IdFilter) -> Self {
        self.far = filter;
        self
    }

    pub fn ids(mut self, filter: IdFilter) -> Self {
        self.ids = filter;
        self
    }
}

/// How a property write treats properties that are not supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyMode {
    /// Supplied properties are set (`null` removes); others are kept.
    Merge,
    /// The supplied map becomes the full property set.
    Replace,
}

/// One graph operation. Result columns are listed per variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Create the singleton id counter if it does not exist. No rows.
    EnsureIdCounter,
    /// Set the counter lock flag. One row: `acquired`. Fails with
    /// [`GraphError::LockHeld`](crate::GraphError::LockHeld) if already set.
    AcquireIdLock,
    /// Advance the counter by `count`. One row: `first` reserved id.
    ReserveIds { count: u32 },
    /// Make sure the next reserved id is at least `at_least`. No rows.
    RaiseIdFloor { at_least: EntityId },
    /// Clear the counter lock flag. No rows.
    ReleaseIdLock,
    /// One row: `id`. Fails if the id is taken.
    CreateNode {
        labels: Vec<String>,
        class: String,
        id: EntityId,
        properties: Properties,
    },
    /// One row: `id`. Fails if no node with that label and id exists.
    SetNodeProperties {
        label: String,
        id: EntityId,
        properties: Properties,
        mode: PropertyMode,
    },
    /// Rows: `id`, `class`, `properties`, ordered by id.
    FetchNodes { label: String, ids: IdFilter },
    /// One row: `count` of nodes carrying `label` among `ids`.
    CountNodes { label: String, ids: Vec<EntityId> },
    /// Delete nodes and every incident edge. Rows: `id`, `class` per deleted node.
    DeleteNodes { ids: Vec<EntityId> },
    /// Rows: `id`, `class`, `near_id`, `near_class`, `far_id`, `far_class`, `properties`.
    MatchEdges(EdgePattern),
    /// One row: `count` of deleted edges.
    DeleteEdges(EdgePattern),
    /// Edge from `from` to `to`. One row: `id`. Fails if an endpoint is absent.
    CreateEdge {
        class: String,
        id: EntityId,
        from: EntityId,
        to: EntityId,
        properties: Properties,
    },
    /// One row: `id`. Fails if no edge with that class and id exists.
    SetEdgeProperties {
        class: String,
        id: EntityId,
        properties: Properties,
        mode: PropertyMode,
    },
}

impl Statement {
    /// Short name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EnsureIdCounter => "ensure_id_counter",
            Self::AcquireIdLock => "acquire_id_lock",
            Self::ReserveIds { .. } => "reserve_ids",
            Self::RaiseIdFloor { .. } => "raise_id_floor",
            Self::ReleaseIdLock => "release_id_lock",
            Self::CreateNode { .. } => "create_node",
            Self::SetNodeProperties { .. } => "set_node_properties",
            Self::FetchNodes { .. } => "fetch_nodes",
            Self::CountNodes { .. } => "count_nodes",
            Self::DeleteNodes { .. } => "delete_nodes",
            Self::MatchEdges(_) => "match_edges",
            Self::DeleteEdges(_) => "delete_edges",
            Self::CreateEdge { .. } => "create_edge",
            Self::SetEdgeProperties { .. } => "set_edge_properties",
        }
    }
}

// ── Rows ──────────────────────────────────────────────────────────

/// A result row: column name → value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row(serde_json::Map<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column insert.
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.0.insert(column.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, column: &str, value: impl Into<Value>) {
        self.0.insert(column.to_string(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn int(&self, column: &str) -> Result<i64, GraphError> {
        self.get(column)
            .and_then(Value::as_i64)
            .ok_or_else(|| missing(column, "integer"))
    }

    pub fn id(&self, column: &str) -> Result<EntityId, GraphError> {
        self.int(column).map(EntityId)
    }

    pub fn text(&self, column: &str) -> Result<String, GraphError> {
        self.get(column)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| missing(column, "string"))
    }

    pub fn boolean(&self, column: &str) -> Result<bool, GraphError> {
        self.get(column)
            .and_then(Value::as_bool)
            .ok_or_else(|| missing(column, "boolean"))
    }

    /// An object column; `null` or absent reads as an empty map.
    pub fn properties(&self, column: &str) -> Result<Properties, GraphError> {
        match self.get(column) {
            None | Some(Value::Null) => Ok(Properties::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(_) => Err(missing(column, "object")),
        }
    }
}

fn missing(column: &str, expected: &str) -> GraphError {
    GraphError::Serialization(format!("Column {column} missing or not a {expected}"))
}
