//! In-process graph backend.
//!
//! Evaluates the same [`Statement`]s as the Cypher executor against an
//! in-memory property graph. Each batch runs against a copy of the current
//! state that replaces it only if every statement succeeds, which gives the
//! same all-or-nothing behavior as a Neo4j transaction.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use lyph_core::EntityId;

use crate::client::GraphError;
use crate::executor::StatementExecutor;
use crate::statement::{Direction, EdgePattern, Properties, PropertyMode, Row, Statement};

#[derive(Debug, Clone)]
struct MemoryNode {
    labels: Vec<String>,
    class: String,
    properties: Properties,
}

#[derive(Debug, Clone)]
struct MemoryEdge {
    class: String,
    from: EntityId,
    to: EntityId,
    properties: Properties,
}

#[derive(Debug, Clone)]
struct IdCounter {
    next: i64,
    locked: bool,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    nodes: BTreeMap<EntityId, MemoryNode>,
    edges: BTreeMap<EntityId, MemoryEdge>,
    counter: Option<IdCounter>,
}

/// In-memory property graph implementing [`StatementExecutor`].
#[derive(Debug)]
pub struct MemoryGraph {
    state: Mutex<MemoryState>,
    /// Statement kinds that fail the next time they run.
    failures: Mutex<Vec<&'static str>>,
}

impl MemoryGraph {
    /// An empty graph with an initialized id counter.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                counter: Some(IdCounter {
                    next: 1,
                    locked: false,
                }),
                ..MemoryState::default()
            }),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Make the next statement of the given kind fail (see [`Statement::kind`]).
    pub async fn fail_next(&self, kind: &'static str) {
        self.failures.lock().await.push(kind);
    }

    pub async fn node_count(&self) -> usize {
        self.state.lock().await.nodes.len()
    }

    pub async fn edge_count(&self) -> usize {
        self.state.lock().await.edges.len()
    }

    pub async fn contains_node(&self, id: EntityId) -> bool {
        self.state.lock().await.nodes.contains_key(&id)
    }

    pub async fn contains_edge(&self, id: EntityId) -> bool {
        self.state.lock().await.edges.contains_key(&id)
    }

    /// Whether the id counter lock flag is currently set.
    pub async fn id_lock_held(&self) -> bool {
        self.state
            .lock()
            .await
            .counter
            .as_ref()
            .is_some_and(|c| c.locked)
    }

    /// Ids of the edges of `class` from `from` to `to`.
    pub async fn edges_between(&self, class: &str, from: EntityId, to: EntityId) -> Vec<EntityId> {
        self.state
            .lock()
            .await
            .edges
            .iter()
            .filter(|(_, e)| e.class == class && e.from == from && e.to == to)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatementExecutor for MemoryGraph {
    async fn execute(&self, statements: Vec<Statement>) -> Result<Vec<Vec<Row>>, GraphError> {
        let mut state = self.state.lock().await;
        let mut failures = self.failures.lock().await;
        let mut working = state.clone();
        let mut results = Vec::with_capacity(statements.len());

        for statement in &statements {
            if let Some(pos) = failures.iter().position(|k| *k == statement.kind()) {
                failures.remove(pos);
                return Err(GraphError::Injected(statement.kind()));
            }
            results.push(working.apply(statement)?);
        }

        *state = working;
        Ok(results)
    }
}

impl MemoryState {
    fn apply(&mut self, statement: &Statement) -> Result<Vec<Row>, GraphError> {
        let kind = statement.kind();
        match statement {
            Statement::EnsureIdCounter => {
                self.counter.get_or_insert(IdCounter {
                    next: 1,
                    locked: false,
                });
                Ok(Vec::new())
            }

            Statement::AcquireIdLock => {
                let counter = self.counter_mut(kind)?;
                if counter.locked {
                    return Err(GraphError::LockHeld);
                }
                counter.locked = true;
                Ok(vec![Row::new().with("acquired", true)])
            }

            Statement::ReserveIds { count } => {
                let counter = self.counter_mut(kind)?;
                let first = counter.next;
                counter.next += i64::from(*count);
                Ok(vec![Row::new().with("first", first)])
            }

            Statement::RaiseIdFloor { at_least } => {
                let counter = self.counter_mut(kind)?;
                counter.next = counter.next.max(at_least.0);
                Ok(Vec::new())
            }

            Statement::ReleaseIdLock => {
                self.counter_mut(kind)?.locked = false;
                Ok(Vec::new())
            }

            Statement::CreateNode {
                labels,
                class,
                id,
                properties,
            } => {
                self.check_id_free(*id)?;
                self.nodes.insert(
                    *id,
                    MemoryNode {
                        labels: labels.clone(),
                        class: class.clone(),
                        properties: without_nulls(properties),
                    },
                );
                Ok(vec![Row::new().with("id", id.0)])
            }

            Statement::SetNodeProperties {
                label,
                id,
                properties,
                mode,
            } => {
                let node = self
                    .nodes
                    .get_mut(id)
                    .filter(|n| n.labels.contains(label))
                    .ok_or_else(|| GraphError::NotFound {
                        statement: kind,
                        detail: format!("no {label} node with id {id}"),
                    })?;
                write_properties(&mut node.properties, properties, *mode);
                Ok(vec![Row::new().with("id", id.0)])
            }

            Statement::FetchNodes { label, ids } => Ok(self
                .nodes
                .iter()
                .filter(|(id, n)| n.labels.contains(label) && ids.matches(**id))
                .map(|(id, n)| {
                    Row::new()
                        .with("id", id.0)
                        .with("class", n.class.clone())
                        .with("properties", Value::Object(n.properties.clone()))
                })
                .collect()),

            Statement::CountNodes { label, ids } => {
                let wanted: BTreeSet<EntityId> = ids.iter().copied().collect();
                let count = wanted
                    .iter()
                    .filter(|id| {
                        self.nodes
                            .get(*id)
                            .is_some_and(|n| n.labels.contains(label))
                    })
                    .count();
                Ok(vec![Row::new().with("count", count as i64)])
            }

            Statement::DeleteNodes { ids } => {
                let mut rows = Vec::new();
                for id in ids {
                    if let Some(node) = self.nodes.remove(id) {
                        rows.push(Row::new().with("id", id.0).with("class", node.class));
                    }
                }
                self.edges
                    .retain(|_, e| !ids.contains(&e.from) && !ids.contains(&e.to));
                Ok(rows)
            }

            Statement::MatchEdges(pattern) => Ok(self
                .matching_edges(pattern)
                .into_iter()
                .map(|(id, near, far)| {
                    let edge = &self.edges[&id];
                    Row::new()
                        .with("id", id.0)
                        .with("class", edge.class.clone())
                        .with("near_id", near.0)
                        .with("near_class", self.class_of(near))
                        .with("far_id", far.0)
                        .with("far_class", self.class_of(far))
                        .with("properties", Value::Object(edge.properties.clone()))
                })
                .collect()),

            Statement::DeleteEdges(pattern) => {
                let doomed: BTreeSet<EntityId> = self
                    .matching_edges(pattern)
                    .into_iter()
                    .map(|(id, _, _)| id)
                    .collect();
                self.edges.retain(|id, _| !doomed.contains(id));
                Ok(vec![Row::new().with("count", doomed.len() as i64)])
            }

            Statement::CreateEdge {
                class,
                id,
                from,
                to,
                properties,
            } => {
                for endpoint in [from, to] {
                    if !self.nodes.contains_key(endpoint) {
                        return Err(GraphError::NotFound {
                            statement: kind,
                            detail: format!("edge endpoint {endpoint} does not exist"),
                        });
                    }
                }
                self.check_id_free(*id)?;
                self.edges.insert(
                    *id,
                    MemoryEdge {
                        class: class.clone(),
                        from: *from,
                        to: *to,
                        properties: without_nulls(properties),
                    },
                );
                Ok(vec![Row::new().with("id", id.0)])
            }

            Statement::SetEdgeProperties {
                class,
                id,
                properties,
                mode,
            } => {
                let edge = self
                    .edges
                    .get_mut(id)
                    .filter(|e| &e.class == class)
                    .ok_or_else(|| GraphError::NotFound {
                        statement: kind,
                        detail: format!("no {class} edge with id {id}"),
                    })?;
                write_properties(&mut edge.properties, properties, *mode);
                Ok(vec![Row::new().with("id", id.0)])
            }
        }
    }

    fn counter_mut(&mut self, kind: &'static str) -> Result<&mut IdCounter, GraphError> {
        self.counter.as_mut().ok_or_else(|| GraphError::NotFound {
            statement: kind,
            detail: "id counter is not initialized".to_string(),
        })
    }

    fn check_id_free(&self, id: EntityId) -> Result<(), GraphError> {
        if self.nodes.contains_key(&id) || self.edges.contains_key(&id) {
            return Err(GraphError::Constraint(format!("id {id} is already in use")));
        }
        Ok(())
    }

    fn class_of(&self, id: EntityId) -> String {
        self.nodes
            .get(&id)
            .map(|n| n.class.clone())
            .unwrap_or_default()
    }

    /// `(edge id, near id, far id)` for every edge matching the pattern.
    fn matching_edges(&self, pattern: &EdgePattern) -> Vec<(EntityId, EntityId, EntityId)> {
        let mut out = Vec::new();
        for (id, edge) in &self.edges {
            if !pattern.classes.contains(&edge.class) || !pattern.ids.matches(*id) {
                continue;
            }
            let orientations = match pattern.direction {
                Direction::Outgoing => vec![(edge.from, edge.to)],
                Direction::Incoming => vec![(edge.to, edge.from)],
                Direction::Either if edge.from == edge.to => vec![(edge.from, edge.to)],
                Direction::Either => vec![(edge.from, edge.to), (edge.to, edge.from)],
            };
            for (near, far) in orientations {
                if pattern.near.matches(near) && pattern.far.matches(far) {
                    out.push((*id, near, far));
                }
            }
        }
        out
    }
}

fn without_nulls(properties: &Properties) -> Properties {
    properties
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Merge writes supplied keys (`null` removes); replace swaps the whole map.
fn write_properties(target: &mut Properties, properties: &Properties, mode: PropertyMode) {
    match mode {
        PropertyMode::Merge => {
            for (key, value) in properties {
                if value.is_null() {
                    target.remove(key);
                } else {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        PropertyMode::Replace => *target = without_nulls(properties),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::IdFilter;

    fn node(id: i64, class: &str) -> Statement {
        Statement::CreateNode {
            labels: vec![class.to_string(), "Template".to_string()],
            class: class.to_string(),
            id: EntityId(id),
            properties: Properties::new(),
        }
    }

    fn edge(id: i64, class: &str, from: i64, to: i64) -> Statement {
        Statement::CreateEdge {
            class: class.to_string(),
            id: EntityId(id),
            from: EntityId(from),
            to: EntityId(to),
            properties: Properties::new(),
        }
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_graph_unchanged() {
        let graph = MemoryGraph::new();
        graph.execute(vec![node(1, "LyphTemplate")]).await.unwrap();

        // Second edge endpoint does not exist: the whole batch is rejected.
        let result = graph
            .execute(vec![
                node(2, "LayerTemplate"),
                edge(10, "HasLayer", 1, 2),
                edge(11, "HasLayer", 1, 99),
            ])
            .await;
        assert!(matches!(result, Err(GraphError::NotFound { .. })));

        assert_eq!(graph.node_count().await, 1);
        assert_eq!(graph.edge_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_a_constraint_violation() {
        let graph = MemoryGraph::new();
        graph.execute(vec![node(1, "LyphTemplate")]).await.unwrap();
        let err = graph.execute(vec![node(1, "LayerTemplate")]).await.unwrap_err();
        assert!(matches!(err, GraphError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_edge_directions() {
        let graph = MemoryGraph::new();
        graph
            .execute(vec![
                node(1, "LyphTemplate"),
                node(2, "LayerTemplate"),
                node(3, "LayerTemplate"),
                edge(10, "HasLayer", 1, 2),
                edge(11, "HasLayer", 1, 3),
            ])
            .await
            .unwrap();

        let outgoing = graph
            .execute_one(Statement::MatchEdges(
                EdgePattern::new(vec!["HasLayer".into()], Direction::Outgoing)
                    .near(IdFilter::In(vec![EntityId(1)]))
                    .far(IdFilter::NotIn(vec![EntityId(3)])),
            ))
            .await
            .unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].id("far_id").unwrap(), EntityId(2));
        assert_eq!(outgoing[0].text("far_class").unwrap(), "LayerTemplate");

        let incoming = graph
            .execute_one(Statement::MatchEdges(
                EdgePattern::new(vec!["HasLayer".into()], Direction::Incoming)
                    .near(IdFilter::In(vec![EntityId(3)])),
            ))
            .await
            .unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].id("far_id").unwrap(), EntityId(1));

        let either = graph
            .execute_one(Statement::MatchEdges(
                EdgePattern::new(vec!["HasLayer".into()], Direction::Either)
                    .near(IdFilter::In(vec![EntityId(1), EntityId(2)])),
            ))
            .await
            .unwrap();
        // Edge 10 is seen from both of its ends, edge 11 from node 1 only.
        assert_eq!(either.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_nodes_detaches_edges() {
        let graph = MemoryGraph::new();
        graph
            .execute(vec![
                node(1, "LyphTemplate"),
                node(2, "LayerTemplate"),
                edge(10, "HasLayer", 1, 2),
            ])
            .await
            .unwrap();

        let rows = graph
            .execute_one(Statement::DeleteNodes {
                ids: vec![EntityId(2)],
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("class").unwrap(), "LayerTemplate");
        assert!(graph.contains_node(EntityId(1)).await);
        assert!(!graph.contains_edge(EntityId(10)).await);
    }

    #[tokio::test]
    async fn test_label_matching_includes_superclass_labels() {
        let graph = MemoryGraph::new();
        graph
            .execute(vec![node(1, "LyphTemplate"), node(2, "LayerTemplate")])
            .await
            .unwrap();

        let rows = graph
            .execute_one(Statement::CountNodes {
                label: "Template".into(),
                ids: vec![EntityId(1), EntityId(2), EntityId(3)],
            })
            .await
            .unwrap();
        assert_eq!(rows[0].int("count").unwrap(), 2);

        let rows = graph
            .execute_one(Statement::FetchNodes {
                label: "LyphTemplate".into(),
                ids: IdFilter::Any,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_id_lock_and_reservation() {
        let graph = MemoryGraph::new();
        let rows = graph.execute_one(Statement::AcquireIdLock).await.unwrap();
        assert!(rows[0].boolean("acquired").unwrap());
        let err = graph.execute_one(Statement::AcquireIdLock).await.unwrap_err();
        assert!(matches!(err, GraphError::LockHeld));
        assert!(graph.id_lock_held().await);

        let rows = graph
            .execute_one(Statement::ReserveIds { count: 3 })
            .await
            .unwrap();
        assert_eq!(rows[0].int("first").unwrap(), 1);
        graph
            .execute_one(Statement::RaiseIdFloor {
                at_least: EntityId(50),
            })
            .await
            .unwrap();
        let rows = graph
            .execute_one(Statement::ReserveIds { count: 1 })
            .await
            .unwrap();
        assert_eq!(rows[0].int("first").unwrap(), 50);

        graph.execute_one(Statement::ReleaseIdLock).await.unwrap();
        assert!(!graph.id_lock_held().await);
    }

    #[tokio::test]
    async fn test_failed_lock_batch_leaves_flag_clear() {
        let graph = MemoryGraph::new();
        graph.fail_next("release_id_lock").await;
        let err = graph
            .execute(vec![
                Statement::AcquireIdLock,
                Statement::ReserveIds { count: 2 },
                Statement::ReleaseIdLock,
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Injected("release_id_lock")));
        assert!(!graph.id_lock_held().await);

        let rows = graph
            .execute(vec![
                Statement::AcquireIdLock,
                Statement::ReserveIds { count: 1 },
                Statement::ReleaseIdLock,
            ])
            .await
            .unwrap();
        assert_eq!(rows[1][0].int("first").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_merge_and_replace_properties() {
        let graph = MemoryGraph::new();
        let mut props = Properties::new();
        props.insert("name".into(), "Heart".into());
        props.insert("species".into(), "human".into());
        graph
            .execute(vec![Statement::CreateNode {
                labels: vec!["LyphTemplate".into()],
                class: "LyphTemplate".into(),
                id: EntityId(1),
                properties: props,
            }])
            .await
            .unwrap();

        let mut merge = Properties::new();
        merge.insert("species".into(), Value::Null);
        merge.insert("length".into(), serde_json::json!({ "min": 1 }));
        graph
            .execute_one(Statement::SetNodeProperties {
                label: "LyphTemplate".into(),
                id: EntityId(1),
                properties: merge,
                mode: PropertyMode::Merge,
            })
            .await
            .unwrap();

        let rows = graph
            .execute_one(Statement::FetchNodes {
                label: "LyphTemplate".into(),
                ids: IdFilter::In(vec![EntityId(1)]),
            })
            .await
            .unwrap();
        let props = rows[0].properties("properties").unwrap();
        assert_eq!(props["name"], "Heart");
        assert!(!props.contains_key("species"));
        assert_eq!(props["length"]["min"], 1);

        graph
            .execute_one(Statement::SetNodeProperties {
                label: "LyphTemplate".into(),
                id: EntityId(1),
                properties: Properties::new(),
                mode: PropertyMode::Replace,
            })
            .await
            .unwrap();
        let rows = graph
            .execute_one(Statement::FetchNodes {
                label: "LyphTemplate".into(),
                ids: IdFilter::Any,
            })
            .await
            .unwrap();
        assert!(rows[0].properties("properties").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let graph = MemoryGraph::new();
        graph.fail_next("create_node").await;
        assert!(matches!(
            graph.execute(vec![node(1, "LyphTemplate")]).await,
            Err(GraphError::Injected("create_node"))
        ));
        graph.execute(vec![node(1, "LyphTemplate")]).await.unwrap();
        assert_eq!(graph.node_count().await, 1);
    }
}
