//! Existence checks run before an operation references ids.

use std::collections::BTreeSet;

use lyph_core::{EntityId, Metamodel};
use lyph_graph::{Direction, EdgePattern, IdFilter, Statement, StatementExecutor};

use crate::error::{Result, StoreError};

/// Fail with `NotFound` naming every id in `ids` that is not a resource of
/// `class` (or a subclass).
pub async fn assert_resources_exist(
    executor: &dyn StatementExecutor,
    class: &str,
    ids: &[EntityId],
) -> Result<()> {
    let wanted: Vec<EntityId> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    if wanted.is_empty() {
        return Ok(());
    }

    let rows = executor
        .execute_one(Statement::CountNodes {
            label: class.to_string(),
            ids: wanted.clone(),
        })
        .await?;
    let count = match rows.first() {
        Some(row) => row.int("count")?,
        None => 0,
    };
    if count as usize == wanted.len() {
        return Ok(());
    }

    let found = executor
        .execute_one(Statement::FetchNodes {
            label: class.to_string(),
            ids: IdFilter::In(wanted.clone()),
        })
        .await?
        .iter()
        .map(|row| row.id("id"))
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;
    let missing: Vec<EntityId> = wanted.into_iter().filter(|id| !found.contains(id)).collect();
    tracing::debug!(class, missing = ?missing, "Referenced resources missing");
    Err(StoreError::not_found(class, missing))
}

/// Fail with `NotFound` naming every id in `ids` that is not a relationship
/// of `class` (or a subclass).
pub async fn assert_relationships_exist(
    executor: &dyn StatementExecutor,
    model: &Metamodel,
    class: &str,
    ids: &[EntityId],
) -> Result<()> {
    let wanted: BTreeSet<EntityId> = ids.iter().copied().collect();
    if wanted.is_empty() {
        return Ok(());
    }
    let classes = model.concrete_relationships_under(class);
    let found: BTreeSet<EntityId> = if classes.is_empty() {
        BTreeSet::new()
    } else {
        executor
            .execute_one(Statement::MatchEdges(
                EdgePattern::new(classes, Direction::Outgoing)
                    .ids(IdFilter::In(wanted.iter().copied().collect())),
            ))
            .await?
            .iter()
            .map(|row| row.id("id"))
            .collect::<std::result::Result<BTreeSet<_>, _>>()?
    };

    let missing: Vec<EntityId> = wanted.into_iter().filter(|id| !found.contains(id)).collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StoreError::not_found(class, missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{edge, graph_with, model, node};
    use lyph_graph::MemoryGraph;

    async fn seeded() -> MemoryGraph {
        graph_with(vec![
            node(1, "LyphTemplate"),
            node(2, "LayerTemplate"),
            edge(10, "HasLayer", 1, 2),
        ])
        .await
    }

    #[tokio::test]
    async fn test_resources_exist_with_duplicates_and_superclass() {
        let graph = seeded().await;
        assert_resources_exist(&graph, "Template", &[EntityId(1), EntityId(2), EntityId(1)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_resources_are_named() {
        let graph = seeded().await;
        let ids = [EntityId(1), EntityId(2), EntityId(7)];
        let err = assert_resources_exist(&graph, "LyphTemplate", &ids)
            .await
            .unwrap_err();
        match err {
            StoreError::NotFound { class, ids } => {
                assert_eq!(class, "LyphTemplate");
                assert_eq!(ids, vec![EntityId(2), EntityId(7)]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_relationships_exist() {
        let graph = seeded().await;
        let model = model();
        assert_relationships_exist(&graph, &model, "HasPart", &[EntityId(10)])
            .await
            .unwrap();
        let err = assert_relationships_exist(&graph, &model, "Materials", &[EntityId(10)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { ids, .. } if ids == vec![EntityId(10)]));
    }
}
