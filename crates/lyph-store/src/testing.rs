//! Fixtures shared by the unit tests.

use lyph_core::{EntityId, Metamodel};
use lyph_graph::{MemoryGraph, Properties, Statement, StatementExecutor};

pub(crate) const MANIFEST: &str = include_str!("../../../manifests/lyph-templates.json");

pub(crate) fn model() -> Metamodel {
    Metamodel::from_json_str(MANIFEST).unwrap()
}

pub(crate) fn node(id: i64, class: &str) -> Statement {
    Statement::CreateNode {
        labels: model().resource_ancestry(class),
        class: class.to_string(),
        id: EntityId(id),
        properties: Properties::new(),
    }
}

pub(crate) fn edge(id: i64, class: &str, from: i64, to: i64) -> Statement {
    Statement::CreateEdge {
        class: class.to_string(),
        id: EntityId(id),
        from: EntityId(from),
        to: EntityId(to),
        properties: Properties::new(),
    }
}

/// A memory graph holding `statements`, with the id counter past every id used.
pub(crate) async fn graph_with(statements: Vec<Statement>) -> MemoryGraph {
    let graph = MemoryGraph::new();
    graph.execute(statements).await.unwrap();
    graph
        .execute_one(Statement::RaiseIdFloor {
            at_least: EntityId(1000),
        })
        .await
        .unwrap();
    graph
}
