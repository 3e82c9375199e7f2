//! Cascade deletion planning.
//!
//! Deleting a resource also deletes everything it sustains, transitively.
//! The planner walks sustaining edges breadth-first, one statement batch per
//! frontier level, and returns the closed deletion set.

use std::collections::BTreeSet;

use lyph_core::{EntityId, Metamodel, ResourceKey, Side};
use lyph_graph::{Direction, EdgePattern, IdFilter, Statement, StatementExecutor};

use crate::error::{Result, StoreError};

/// Compute the set of resources removed when `(class, id)` is deleted.
///
/// The seed comes first, followed by sustained resources in breadth-first
/// order. Fails with `NotFound` if the seed does not exist.
pub async fn compute_deletion_set(
    executor: &dyn StatementExecutor,
    model: &Metamodel,
    class: &str,
    id: EntityId,
) -> Result<Vec<ResourceKey>> {
    let rows = executor
        .execute_one(Statement::FetchNodes {
            label: class.to_string(),
            ids: IdFilter::In(vec![id]),
        })
        .await?;
    let seed = match rows.first() {
        Some(row) => ResourceKey::new(row.text("class")?, id),
        None => return Err(StoreError::not_found(class, vec![id])),
    };

    // Edges point from end one to end two: end-one sustainers reach their
    // dependents outgoing, end-two sustainers incoming.
    let sustaining = [
        (model.sustaining_relationships(Side::One), Direction::Outgoing),
        (model.sustaining_relationships(Side::Two), Direction::Incoming),
    ];

    let mut visited: BTreeSet<EntityId> = BTreeSet::from([id]);
    let mut order = vec![seed];
    let mut frontier = vec![id];
    let mut level = 0usize;

    while !frontier.is_empty() {
        let statements: Vec<Statement> = sustaining
            .iter()
            .filter(|(classes, _)| !classes.is_empty())
            .map(|(classes, direction)| {
                Statement::MatchEdges(
                    EdgePattern::new(classes.clone(), *direction)
                        .near(IdFilter::In(frontier.clone())),
                )
            })
            .collect();
        if statements.is_empty() {
            break;
        }

        let mut next = Vec::new();
        for row in executor.execute(statements).await?.iter().flatten() {
            let far = row.id("far_id")?;
            if visited.insert(far) {
                order.push(ResourceKey::new(row.text("far_class")?, far));
                next.push(far);
            }
        }

        level += 1;
        tracing::trace!(level, reached = next.len(), "Cascade frontier expanded");
        frontier = next;
    }

    tracing::debug!(
        seed = %order[0],
        size = order.len(),
        levels = level,
        "Deletion set computed"
    );
    Ok(order)
}
