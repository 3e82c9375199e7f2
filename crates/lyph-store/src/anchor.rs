//! Anchor guard: refuses deletions that would pull anchored nodes out from
//! under a resource that survives the deletion.

use lyph_core::{EntityId, Metamodel, ResourceKey, Side};
use lyph_graph::{Direction, EdgePattern, IdFilter, Statement, StatementExecutor};

use crate::error::{AnchorPair, Result};

/// Every anchoring edge whose anchoring end lies outside `candidates` and
/// whose anchored end lies inside.
pub async fn find_external_anchors(
    executor: &dyn StatementExecutor,
    model: &Metamodel,
    candidates: &[EntityId],
) -> Result<Vec<AnchorPair>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    // Matching from the anchored (near) node: an end-one anchor sits at the
    // edge's source, so the anchored end sees it incoming.
    let statements: Vec<Statement> = [
        (model.anchoring_relationships(Side::One), Direction::Incoming),
        (model.anchoring_relationships(Side::Two), Direction::Outgoing),
    ]
    .into_iter()
    .filter(|(classes, _)| !classes.is_empty())
    .map(|(classes, direction)| {
        Statement::MatchEdges(
            EdgePattern::new(classes, direction)
                .near(IdFilter::In(candidates.to_vec()))
                .far(IdFilter::NotIn(candidates.to_vec())),
        )
    })
    .collect();
    if statements.is_empty() {
        return Ok(Vec::new());
    }

    let mut pairs = Vec::new();
    for row in executor.execute(statements).await?.iter().flatten() {
        pairs.push(AnchorPair {
            anchoring: ResourceKey::new(row.text("far_class")?, row.id("far_id")?),
            anchored: ResourceKey::new(row.text("near_class")?, row.id("near_id")?),
        });
    }
    pairs.sort();
    pairs.dedup();

    if !pairs.is_empty() {
        tracing::info!(anchors = pairs.len(), "External anchors found");
    }
    Ok(pairs)
}
