//! Compiles [`Statement`]s into parameterized Cypher.
//!
//! Labels and relationship types come from the validated manifest (plain
//! identifiers) and are spliced into the text; every value travels as a
//! parameter. Array and object properties are stored as JSON strings, and
//! property maps are read back through `apoc.convert.toJson`.

use neo4rs::{query, Query};
use serde_json::Value;

use lyph_core::manifest::ID_COUNTER_LABEL;
use lyph_core::EntityId;

use crate::statement::{Direction, EdgePattern, IdFilter, Properties, PropertyMode, Statement};

/// A parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Int(i64),
    IntList(Vec<i64>),
    Text(String),
    TextList(Vec<String>),
}

/// How a result column is decoded into a row value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Text,
    Bool,
    /// JSON-encoded property map; `id` and `class` are stripped.
    PropertyMap,
}

/// What zero result rows mean for a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyResult {
    Allowed,
    /// The statement's target was missing; the batch fails.
    NotFound,
    /// The id counter lock was already set; the batch fails.
    LockHeld,
}

/// A compiled statement: Cypher text, parameters, and result columns.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub text: String,
    pub params: Vec<(String, Param)>,
    pub columns: Vec<(&'static str, ColumnKind)>,
    pub on_empty: EmptyResult,
}

impl CompiledStatement {
    fn new(text: String) -> Self {
        Self {
            text,
            params: Vec::new(),
            columns: Vec::new(),
            on_empty: EmptyResult::Allowed,
        }
    }

    fn param(mut self, name: &str, value: Param) -> Self {
        self.params.push((name.to_string(), value));
        self
    }

    fn columns(mut self, columns: &[(&'static str, ColumnKind)]) -> Self {
        self.columns = columns.to_vec();
        self
    }

    fn requires_row(self) -> Self {
        self.on_empty(EmptyResult::NotFound)
    }

    fn on_empty(mut self, on_empty: EmptyResult) -> Self {
        self.on_empty = on_empty;
        self
    }

    /// Build the neo4rs query.
    pub fn to_query(&self) -> Query {
        let mut q = query(&self.text);
        for (name, value) in &self.params {
            q = match value {
                Param::Int(v) => q.param(name, *v),
                Param::IntList(v) => q.param(name, v.clone()),
                Param::Text(v) => q.param(name, v.clone()),
                Param::TextList(v) => q.param(name, v.clone()),
            };
        }
        q
    }
}

const NODE_COLUMNS: [(&str, ColumnKind); 3] = [
    ("id", ColumnKind::Int),
    ("class", ColumnKind::Text),
    ("properties", ColumnKind::PropertyMap),
];

const EDGE_COLUMNS: [(&str, ColumnKind); 7] = [
    ("id", ColumnKind::Int),
    ("class", ColumnKind::Text),
    ("near_id", ColumnKind::Int),
    ("near_class", ColumnKind::Text),
    ("far_id", ColumnKind::Int),
    ("far_class", ColumnKind::Text),
    ("properties", ColumnKind::PropertyMap),
];

/// Compile one statement.
pub fn compile(statement: &Statement) -> CompiledStatement {
    match statement {
        Statement::EnsureIdCounter => CompiledStatement::new(format!(
            "MERGE (c:{ID_COUNTER_LABEL})
             ON CREATE SET c.next = 1, c.locked = false"
        )),

        // The throwaway write takes the node's write lock before `locked` is
        // read, so two transactions cannot both see the flag clear. No row
        // comes back when the flag is already set.
        Statement::AcquireIdLock => CompiledStatement::new(format!(
            "MATCH (c:{ID_COUNTER_LABEL})
             SET c.touched = true
             REMOVE c.touched
             WITH c
             WHERE NOT coalesce(c.locked, false)
             SET c.locked = true
             RETURN true AS acquired"
        ))
        .columns(&[("acquired", ColumnKind::Bool)])
        .on_empty(EmptyResult::LockHeld),

        Statement::ReserveIds { count } => CompiledStatement::new(format!(
            "MATCH (c:{ID_COUNTER_LABEL})
             WITH c, c.next AS first
             SET c.next = first + $count
             RETURN first"
        ))
        .param("count", Param::Int(i64::from(*count)))
        .columns(&[("first", ColumnKind::Int)])
        .requires_row(),

        Statement::RaiseIdFloor { at_least } => CompiledStatement::new(format!(
            "MATCH (c:{ID_COUNTER_LABEL})
             SET c.next = CASE WHEN c.next >= $at_least THEN c.next ELSE $at_least END"
        ))
        .param("at_least", Param::Int(at_least.0)),

        Statement::ReleaseIdLock => CompiledStatement::new(format!(
            "MATCH (c:{ID_COUNTER_LABEL})
             SET c.locked = false"
        )),

        Statement::CreateNode {
            labels,
            class,
            id,
            properties,
        } => CompiledStatement::new(format!(
            "CREATE (n{})
             SET n = apoc.convert.fromJsonMap($props)
             RETURN n.id AS id",
            label_chain(labels)
        ))
        .param("props", Param::Text(encode_properties(properties, Some((class, *id)))))
        .columns(&[("id", ColumnKind::Int)])
        .requires_row(),

        Statement::SetNodeProperties {
            label,
            id,
            properties,
            mode,
        } => {
            let text = match mode {
                PropertyMode::Merge => format!(
                    "MATCH (n:{label} {{id: $id}})
                     SET n += apoc.convert.fromJsonMap($props)
                     RETURN n.id AS id"
                ),
                // Replace keeps identity: id and class are re-set from the node itself.
                PropertyMode::Replace => format!(
                    "MATCH (n:{label} {{id: $id}})
                     WITH n, n.class AS class
                     SET n = apoc.convert.fromJsonMap($props)
                     SET n.id = $id, n.class = class
                     RETURN n.id AS id"
                ),
            };
            CompiledStatement::new(text)
                .param("id", Param::Int(id.0))
                .param("props", Param::Text(encode_properties(properties, None)))
                .columns(&[("id", ColumnKind::Int)])
                .requires_row()
        }

        Statement::FetchNodes { label, ids } => {
            let (clause, params) = id_clause("n.id", "ids", ids);
            let mut compiled = CompiledStatement::new(format!(
                "MATCH (n:{label})
                 WHERE {clause}
                 RETURN n.id AS id, n.class AS class,
                        apoc.convert.toJson(properties(n)) AS properties
                 ORDER BY n.id"
            ))
            .columns(&NODE_COLUMNS);
            compiled.params.extend(params);
            compiled
        }

        Statement::CountNodes { label, ids } => CompiledStatement::new(format!(
            "MATCH (n:{label})
             WHERE n.id IN $ids
             RETURN count(n) AS count"
        ))
        .param("ids", Param::IntList(raw_ids(ids)))
        .columns(&[("count", ColumnKind::Int)]),

        Statement::DeleteNodes { ids } => CompiledStatement::new(
            "MATCH (n)
             WHERE n.id IN $ids AND n.class IS NOT NULL
             WITH n, n.id AS id, n.class AS class
             DETACH DELETE n
             RETURN id, class"
                .to_string(),
        )
        .param("ids", Param::IntList(raw_ids(ids)))
        .columns(&[("id", ColumnKind::Int), ("class", ColumnKind::Text)]),

        Statement::MatchEdges(pattern) => {
            let (text, params) = edge_match(pattern);
            let mut compiled = CompiledStatement::new(format!(
                "{text}
                 RETURN r.id AS id, type(r) AS class,
                        near.id AS near_id, near.class AS near_class,
                        far.id AS far_id, far.class AS far_class,
                        apoc.convert.toJson(properties(r)) AS properties
                 ORDER BY r.id"
            ))
            .columns(&EDGE_COLUMNS);
            compiled.params.extend(params);
            compiled
        }

        Statement::DeleteEdges(pattern) => {
            let (text, params) = edge_match(pattern);
            let mut compiled = CompiledStatement::new(format!(
                "{text}
                 WITH DISTINCT r
                 DELETE r
                 RETURN count(*) AS count"
            ))
            .columns(&[("count", ColumnKind::Int)]);
            compiled.params.extend(params);
            compiled
        }

        Statement::CreateEdge {
            class,
            id,
            from,
            to,
            properties,
        } => CompiledStatement::new(format!(
            "MATCH (a {{id: $from}}) WHERE a.class IS NOT NULL
             MATCH (b {{id: $to}}) WHERE b.class IS NOT NULL
             CREATE (a)-[r:{class}]->(b)
             SET r = apoc.convert.fromJsonMap($props)
             RETURN r.id AS id"
        ))
        .param("from", Param::Int(from.0))
        .param("to", Param::Int(to.0))
        .param("props", Param::Text(encode_properties(properties, Some((class, *id)))))
        .columns(&[("id", ColumnKind::Int)])
        .requires_row(),

        Statement::SetEdgeProperties {
            class,
            id,
            properties,
            mode,
        } => {
            let text = match mode {
                PropertyMode::Merge => format!(
                    "MATCH ()-[r:{class} {{id: $id}}]->()
                     SET r += apoc.convert.fromJsonMap($props)
                     RETURN r.id AS id"
                ),
                PropertyMode::Replace => format!(
                    "MATCH ()-[r:{class} {{id: $id}}]->()
                     SET r = apoc.convert.fromJsonMap($props)
                     RETURN r.id AS id"
                ),
            };
            let keep = match mode {
                PropertyMode::Merge => None,
                PropertyMode::Replace => Some((class, *id)),
            };
            CompiledStatement::new(text)
                .param("id", Param::Int(id.0))
                .param("props", Param::Text(encode_properties(properties, keep)))
                .columns(&[("id", ColumnKind::Int)])
                .requires_row()
        }
    }
}

/// Shared `MATCH ... WHERE ...` part of edge statements.
fn edge_match(pattern: &EdgePattern) -> (String, Vec<(String, Param)>) {
    let arrow = match pattern.direction {
        Direction::Outgoing => "(near)-[r]->(far)",
        Direction::Incoming => "(near)<-[r]-(far)",
        Direction::Either => "(near)-[r]-(far)",
    };

    let mut params = vec![(
        "classes".to_string(),
        Param::TextList(pattern.classes.clone()),
    )];
    let mut clauses = vec!["type(r) IN $classes".to_string()];
    for (expr, name, filter) in [
        ("near.id", "near_ids", &pattern.near),
        ("far.id", "far_ids", &pattern.far),
        ("r.id", "edge_ids", &pattern.ids),
    ] {
        let (clause, extra) = id_clause(expr, name, filter);
        if !extra.is_empty() {
            clauses.push(clause);
            params.extend(extra);
        }
    }

    let text = format!("MATCH {arrow}\n WHERE {}", clauses.join(" AND "));
    (text, params)
}

fn id_clause(expr: &str, name: &str, filter: &IdFilter) -> (String, Vec<(String, Param)>) {
    match filter {
        IdFilter::Any => ("true".to_string(), Vec::new()),
        IdFilter::In(ids) => (
            format!("{expr} IN ${name}"),
            vec![(name.to_string(), Param::IntList(raw_ids(ids)))],
        ),
        IdFilter::NotIn(ids) => (
            format!("NOT {expr} IN ${name}"),
            vec![(name.to_string(), Param::IntList(raw_ids(ids)))],
        ),
    }
}

fn label_chain(labels: &[String]) -> String {
    labels.iter().map(|l| format!(":{l}")).collect()
}

fn raw_ids(ids: &[EntityId]) -> Vec<i64> {
    ids.iter().map(|id| id.0).collect()
}

/// Encode a property map for `apoc.convert.fromJsonMap`, JSON-encoding arrays
/// and objects and optionally stamping identity.
fn encode_properties(properties: &Properties, identity: Option<(&String, EntityId)>) -> String {
    let mut out = Properties::new();
    for (key, value) in properties {
        let stored = match value {
            Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
            other => other.clone(),
        };
        out.insert(key.clone(), stored);
    }
    if let Some((class, id)) = identity {
        out.insert("id".to_string(), Value::from(id.0));
        out.insert("class".to_string(), Value::String(class.clone()));
    }
    Value::Object(out).to_string()
}
