//! Relationship field synchronization.
//!
//! Makes the edges behind a resource's relationship fields match the values
//! supplied in a write. Planning is pure and validates everything up front.
//! Applying submits the resource's own write, the removal pass and the
//! creation pass as one statement batch; edges that already exist are
//! skipped, so syncing the same values twice is a no-op.

use std::collections::{BTreeMap, BTreeSet};

use lyph_core::{
    Cardinality, EntityId, Metamodel, RefId, RelationshipField, ResourceKey, ResourceRef, Side,
};
use lyph_graph::{Direction, EdgePattern, IdFilter, Properties, Statement, StatementExecutor};

use crate::batch::{PendingEdge, PendingEdges};
use crate::error::{Result, StoreError};
use crate::fields::Reference;
use crate::identity::IdentityAllocator;

/// Which relationship fields a sync covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Fresh resource: supplied fields only, nothing to remove.
    Create,
    /// Supplied fields only; others keep their edges.
    Update,
    /// Every field; fields not supplied are emptied.
    Replace,
}

/// Direction of a field's edges as seen from the resource owning the field.
pub fn field_direction(field: &RelationshipField) -> Direction {
    match (field.symmetric, field.side) {
        (true, _) => Direction::Either,
        (false, Side::One) => Direction::Outgoing,
        (false, Side::Two) => Direction::Incoming,
    }
}

/// An edge a field asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEdge {
    pub field: String,
    pub relationship: String,
    /// End at which the synced resource sits.
    pub side: Side,
    pub direction: Direction,
    pub far: ResourceRef,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq)]
struct FieldRemoval {
    field: String,
    relationship: String,
    direction: Direction,
    keep: Vec<EntityId>,
}

/// Validated edge changes for one resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    removals: Vec<FieldRemoval>,
    creations: Vec<PlannedEdge>,
    /// The resource is being created and has no edges yet.
    fresh: bool,
}

/// What applying a plan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub removed: i64,
    pub created: Vec<EntityId>,
    pub deferred: usize,
}

impl SyncPlan {
    pub fn creations(&self) -> &[PlannedEdge] {
        &self.creations
    }

    /// Persisted far endpoints grouped by class, for existence checks.
    pub fn assigned_targets(&self) -> BTreeMap<String, Vec<EntityId>> {
        let mut out: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
        for edge in &self.creations {
            if let (RefId::Assigned(id), Some(class)) = (&edge.far.id, &edge.far.class) {
                out.entry(class.clone()).or_default().push(*id);
            }
        }
        out
    }

    /// First placeholder reference, if any.
    pub fn first_placeholder(&self) -> Option<(&str, &str)> {
        self.creations.iter().find_map(|edge| match &edge.far.id {
            RefId::Placeholder(name) => Some((edge.field.as_str(), name.as_str())),
            RefId::Assigned(_) => None,
        })
    }
}

/// Validate supplied relationship values for a resource of `class`.
pub fn plan_sync(
    model: &Metamodel,
    class: &str,
    supplied: &BTreeMap<String, Vec<Reference>>,
    mode: SyncMode,
) -> Result<SyncPlan> {
    let fields = model.relationship_fields(class);
    for name in supplied.keys() {
        if !fields.contains_key(name) {
            return Err(StoreError::validation(format!(
                "{class} has no relationship field named '{name}'"
            )));
        }
    }

    let empty = Vec::new();
    let mut plan = SyncPlan {
        fresh: mode == SyncMode::Create,
        ..SyncPlan::default()
    };
    for field in fields.values() {
        let values = match (supplied.get(&field.name), mode) {
            (Some(values), _) => values,
            (None, SyncMode::Replace) => &empty,
            (None, _) => continue,
        };
        if field.is_alias {
            if !values.is_empty() {
                tracing::debug!(field = %field.name, "Alias field supplied; edges left untouched");
            }
            continue;
        }

        let mut seen = BTreeSet::new();
        let mut targets = Vec::new();
        for value in values {
            check_target(model, field, value)?;
            if seen.insert(value.target.id.clone()) {
                targets.push(value);
            }
        }
        if field.cardinality == Cardinality::One && targets.len() > 1 {
            return Err(StoreError::validation(format!(
                "field '{}' holds at most one reference, got {}",
                field.name,
                targets.len()
            )));
        }

        let direction = field_direction(field);
        if mode != SyncMode::Create {
            plan.removals.push(FieldRemoval {
                field: field.name.clone(),
                relationship: field.relationship.clone(),
                direction,
                keep: targets.iter().filter_map(|v| v.target.id.assigned()).collect(),
            });
        }
        plan.creations.extend(targets.into_iter().map(|value| PlannedEdge {
            field: field.name.clone(),
            relationship: field.relationship.clone(),
            side: field.side,
            direction,
            far: value.target.clone(),
            properties: value.properties.clone(),
        }));
    }
    Ok(plan)
}

/// The far endpoint must name a concrete class within the field's codomain.
/// Placeholders without a class are checked when the batch commits.
fn check_target(model: &Metamodel, field: &RelationshipField, value: &Reference) -> Result<()> {
    let malformed = |why: &str| {
        StoreError::validation(format!(
            "field '{}' has an invalid reference {}: {why}",
            field.name, value.target
        ))
    };
    match (&value.target.class, &value.target.id) {
        (None, RefId::Placeholder(_)) => {}
        (None, RefId::Assigned(_)) => return Err(malformed("class is unknown")),
        (Some(class), _) => {
            if !model.is_concrete_resource(class) {
                return Err(malformed("not a concrete resource class"));
            }
            if !model.is_resource_subclass(class, &field.codomain) {
                return Err(malformed(&format!("expected a {}", field.codomain)));
            }
        }
    }

    let allowed = model.relationship_properties(&field.relationship);
    if let Some(name) = value.properties.keys().find(|k| !allowed.contains_key(*k)) {
        return Err(malformed(&format!("unknown relationship property '{name}'")));
    }
    Ok(())
}

/// Apply a plan to the resource `near`.
///
/// `write` holds the statements that create or update `near` itself. They
/// run in the same batch as the edge removals and creations, so a failure
/// anywhere leaves the resource as it was.
///
/// Edges to placeholders are registered on `pending`; without a pending set
/// they are a validation error. A pending set also loses the edges earlier
/// batch operations registered for every field the plan rewrites.
pub async fn apply_sync(
    executor: &dyn StatementExecutor,
    allocator: &IdentityAllocator,
    plan: SyncPlan,
    near: &ResourceKey,
    write: Vec<Statement>,
    pending: Option<&mut PendingEdges>,
) -> Result<SyncOutcome> {
    let (deferred, immediate): (Vec<_>, Vec<_>) = plan
        .creations
        .into_iter()
        .partition(|edge| edge.far.id.assigned().is_none());
    if !deferred.is_empty() && pending.is_none() {
        return Err(StoreError::validation(
            "placeholder references are only allowed inside a batch",
        ));
    }

    // Kept targets are never removed, so matching before the write is safe.
    let missing: Vec<PlannedEdge> = if plan.fresh || immediate.is_empty() {
        immediate
    } else {
        let lookups: Vec<Statement> = immediate
            .iter()
            .map(|edge| {
                Statement::MatchEdges(
                    EdgePattern::new(vec![edge.relationship.clone()], edge.direction)
                        .near(IdFilter::In(vec![near.id]))
                        .far(IdFilter::In(edge.far.id.assigned().into_iter().collect())),
                )
            })
            .collect();
        let existing = executor.execute(lookups).await?;
        immediate
            .into_iter()
            .zip(existing)
            .filter(|(_, rows)| rows.is_empty())
            .map(|(edge, _)| edge)
            .collect()
    };
    let ids = allocator.reserve(executor, missing.len() as u32).await?;

    let mut batch = write;
    let removals_at = batch.len();
    batch.extend(plan.removals.iter().map(|r| {
        Statement::DeleteEdges(
            EdgePattern::new(vec![r.relationship.clone()], r.direction)
                .near(IdFilter::In(vec![near.id]))
                .far(IdFilter::NotIn(r.keep.clone())),
        )
    }));
    batch.extend(missing.into_iter().zip(&ids).filter_map(|(edge, id)| {
        let far = edge.far.id.assigned()?;
        let (from, to) = match edge.side {
            Side::One => (near.id, far),
            Side::Two => (far, near.id),
        };
        Some(Statement::CreateEdge {
            class: edge.relationship,
            id: *id,
            from,
            to,
            properties: edge.properties,
        })
    }));
    let results = if batch.is_empty() {
        Vec::new()
    } else {
        executor.execute(batch).await?
    };

    let mut outcome = SyncOutcome::default();
    for (removal, rows) in plan.removals.iter().zip(results.iter().skip(removals_at)) {
        let count = rows.first().map(|r| r.int("count")).transpose()?.unwrap_or(0);
        if count > 0 {
            tracing::debug!(field = %removal.field, count, "Removed stale edges");
        }
        outcome.removed += count;
    }
    if !ids.is_empty() {
        tracing::debug!(resource = %near, created = ids.len(), "Created edges");
    }
    outcome.created = ids;

    let Some(pending) = pending else {
        return Ok(outcome);
    };
    for removal in &plan.removals {
        let dropped = pending.retract(&removal.relationship, removal.direction, near.id);
        if dropped > 0 {
            tracing::debug!(field = %removal.field, dropped, "Dropped superseded pending edges");
        }
    }
    outcome.deferred = deferred.len();
    for edge in deferred {
        let here = ResourceRef::assigned(near.class.clone(), near.id);
        let (from, to) = match edge.side {
            Side::One => (here, edge.far),
            Side::Two => (edge.far, here),
        };
        pending.register(PendingEdge {
            relationship: edge.relationship,
            from,
            to,
            properties: edge.properties,
        });
    }
    Ok(outcome)
}
