//! Batches of store operations with batch-local placeholders.
//!
//! A batch runs its operations in order within one queue turn. Creates may
//! name a placeholder; any reference to `#name` becomes a pending edge. When
//! every operation has run, the pending edges are resolved against the ids
//! the creates were given and materialized in one statement batch.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lyph_core::{EntityId, RefId, ResourceKey, ResourceRef, Side};
use lyph_graph::{Direction, EdgePattern, IdFilter, Properties, Statement, StatementExecutor};

use crate::error::{Result, StoreError};
use crate::existence;
use crate::fields::{self, Intent};
use crate::store::ResourceGraphStore;
use crate::sync::SyncMode;

/// One operation of a batch, as read from JSON (`{"op": "create", ...}`).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOperation {
    Create {
        class: String,
        #[serde(default)]
        placeholder: Option<String>,
        #[serde(default)]
        fields: Properties,
    },
    /// `id` is an integer or `#placeholder` bound earlier in the batch.
    Update {
        class: String,
        id: Value,
        #[serde(default)]
        fields: Properties,
    },
    Replace {
        class: String,
        id: Value,
        #[serde(default)]
        fields: Properties,
    },
    Delete {
        class: String,
        id: Value,
    },
    /// Endpoints take any reference form, placeholders included.
    Relate {
        class: String,
        from: Value,
        to: Value,
        #[serde(default)]
        fields: Properties,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOutcome {
    Created {
        id: EntityId,
        #[serde(skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
    },
    Updated {
        id: EntityId,
    },
    Replaced {
        id: EntityId,
    },
    Deleted {
        deleted: Vec<ResourceKey>,
    },
    /// `id` is `None` when the edge waits for a placeholder.
    Related {
        id: Option<EntityId>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub results: Vec<BatchOutcome>,
    pub placeholders: BTreeMap<String, EntityId>,
    /// Ids of the edges materialized at commit.
    pub deferred_edges: Vec<EntityId>,
}

/// An edge with at least one endpoint still unassigned. Points from end one
/// to end two.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEdge {
    pub relationship: String,
    pub from: ResourceRef,
    pub to: ResourceRef,
    pub properties: Properties,
}

/// Pending edges and placeholder bindings of a running batch.
#[derive(Debug, Default)]
pub struct PendingEdges {
    edges: Vec<PendingEdge>,
    placeholders: BTreeMap<String, ResourceKey>,
}

impl PendingEdges {
    pub fn register(&mut self, edge: PendingEdge) {
        tracing::trace!(
            relationship = %edge.relationship,
            from = %edge.from,
            to = %edge.to,
            "Edge deferred"
        );
        self.edges.push(edge);
    }

    /// Drop the `relationship` edges whose end on the `direction` side of
    /// the resource `near` is that resource. Returns how many were dropped.
    pub fn retract(&mut self, relationship: &str, direction: Direction, near: EntityId) -> usize {
        let before = self.edges.len();
        let placeholders = &self.placeholders;
        self.edges.retain(|edge| {
            if edge.relationship != relationship {
                return true;
            }
            let from = refers_to(placeholders, &edge.from, near);
            let to = refers_to(placeholders, &edge.to, near);
            let hit = match direction {
                Direction::Outgoing => from,
                Direction::Incoming => to,
                Direction::Either => from || to,
            };
            !hit
        });
        before - self.edges.len()
    }

    /// Drop every edge with an end among the deleted `ids`.
    pub fn purge(&mut self, ids: &[EntityId]) -> usize {
        let before = self.edges.len();
        let placeholders = &self.placeholders;
        self.edges.retain(|edge| {
            !ids.iter().any(|id| {
                refers_to(placeholders, &edge.from, *id) || refers_to(placeholders, &edge.to, *id)
            })
        });
        before - self.edges.len()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.placeholders.contains_key(name)
    }

    pub fn bind(&mut self, name: &str, key: ResourceKey) -> Result<()> {
        if self.placeholders.contains_key(name) {
            return Err(StoreError::validation(format!("placeholder #{name} is defined twice")));
        }
        self.placeholders.insert(name.to_string(), key);
        Ok(())
    }

    /// The persisted resource a reference stands for.
    pub fn resolve(&self, reference: &ResourceRef) -> Result<ResourceKey> {
        match &reference.id {
            RefId::Placeholder(name) => {
                let key = self.placeholders.get(name).ok_or_else(|| {
                    StoreError::validation(format!("unknown placeholder #{name}"))
                })?;
                Ok(key.clone())
            }
            RefId::Assigned(id) => match &reference.class {
                Some(class) => Ok(ResourceKey::new(class.clone(), *id)),
                None => Err(StoreError::validation(format!(
                    "reference {id} needs a class"
                ))),
            },
        }
    }
}

impl<E: StatementExecutor> ResourceGraphStore<E> {
    /// Run `operations` in order within one queue turn, then materialize the
    /// edges that referenced placeholders.
    ///
    /// The first failing operation stops the batch; operations before it
    /// stay applied and no pending edge is created.
    pub async fn execute_batch(&self, operations: Vec<BatchOperation>) -> Result<BatchReport> {
        let turn = self.queue().enter("execute_batch").await;
        let total = operations.len();
        let mut pending = PendingEdges::default();
        let mut report = BatchReport::default();

        for (index, operation) in operations.into_iter().enumerate() {
            match self.run_operation(operation, &mut pending).await {
                Ok(outcome) => report.results.push(outcome),
                Err(e) => {
                    tracing::warn!(op_id = %turn.id(), index, error = %e, "Batch operation failed");
                    return Err(e);
                }
            }
        }

        report.deferred_edges = self.commit_pending(&pending).await?;
        report.placeholders = pending
            .placeholders
            .iter()
            .map(|(name, key)| (name.clone(), key.id))
            .collect();
        tracing::info!(
            op_id = %turn.id(),
            operations = total,
            deferred_edges = report.deferred_edges.len(),
            "Batch committed"
        );
        Ok(report)
    }

    async fn run_operation(
        &self,
        operation: BatchOperation,
        pending: &mut PendingEdges,
    ) -> Result<BatchOutcome> {
        match operation {
            BatchOperation::Create {
                class,
                placeholder,
                fields,
            } => {
                if let Some(name) = &placeholder {
                    if pending.is_bound(name) {
                        return Err(StoreError::validation(format!(
                            "placeholder #{name} is defined twice"
                        )));
                    }
                }
                let id = self.create_resource_in(&class, &fields, Some(&mut *pending)).await?;
                if let Some(name) = &placeholder {
                    pending.bind(name, ResourceKey::new(class, id))?;
                }
                Ok(BatchOutcome::Created { id, placeholder })
            }
            BatchOperation::Update { class, id, fields } => {
                let id = target_id(&id, pending)?;
                self.modify_resource_in(&class, id, &fields, SyncMode::Update, Some(&mut *pending))
                    .await?;
                Ok(BatchOutcome::Updated { id })
            }
            BatchOperation::Replace { class, id, fields } => {
                let id = target_id(&id, pending)?;
                self.modify_resource_in(&class, id, &fields, SyncMode::Replace, Some(&mut *pending))
                    .await?;
                Ok(BatchOutcome::Replaced { id })
            }
            BatchOperation::Delete { class, id } => {
                let id = target_id(&id, pending)?;
                let deleted = self
                    .delete_resource_in(&class, id, Some(&mut *pending))
                    .await?;
                Ok(BatchOutcome::Deleted { deleted })
            }
            BatchOperation::Relate {
                class,
                from,
                to,
                fields,
            } => self.relate(&class, &from, &to, &fields, pending).await,
        }
    }

    async fn relate(
        &self,
        class: &str,
        from: &Value,
        to: &Value,
        fields: &Properties,
        pending: &mut PendingEdges,
    ) -> Result<BatchOutcome> {
        let spec = self
            .model()
            .relationship_class(class)
            .ok_or_else(|| StoreError::validation(format!("unknown relationship class {class}")))?;
        let mut ends = Vec::with_capacity(2);
        for (side, value) in Side::BOTH.into_iter().zip([from, to]) {
            let end_class = &spec.end(side).class;
            let default_class = self
                .model()
                .is_concrete_resource(end_class)
                .then_some(end_class.as_str());
            let reference = fields::parse_reference(value, default_class).ok_or_else(|| {
                let end = side.index() + 1;
                StoreError::validation(format!("{class} end {end} is malformed: {value}"))
            })?;
            ends.push(reference.target);
        }
        let (to_ref, from_ref) = (ends.pop(), ends.pop());
        let (Some(from_ref), Some(to_ref)) = (from_ref, to_ref) else {
            return Err(StoreError::validation("relationship needs two ends"));
        };

        match (&from_ref.id, &to_ref.id, &from_ref.class, &to_ref.class) {
            (RefId::Assigned(a), RefId::Assigned(b), Some(class_a), Some(class_b)) => {
                let id = self
                    .create_relationship_in(class, class_a, class_b, *a, *b, fields)
                    .await?;
                Ok(BatchOutcome::Related { id: Some(id) })
            }
            (RefId::Assigned(_), RefId::Assigned(_), _, _) => Err(StoreError::validation(format!(
                "{class} ends need a class when the declared end is abstract"
            ))),
            _ => {
                if spec.is_abstract {
                    return Err(StoreError::validation(format!("{class} is abstract")));
                }
                let parsed =
                    fields::parse_relationship_fields(self.model(), class, fields, Intent::Modify)?;
                pending.register(PendingEdge {
                    relationship: class.to_string(),
                    from: from_ref,
                    to: to_ref,
                    properties: parsed.properties,
                });
                Ok(BatchOutcome::Related { id: None })
            }
        }
    }

    /// Resolve, validate, deduplicate, and create every pending edge.
    async fn commit_pending(&self, pending: &PendingEdges) -> Result<Vec<EntityId>> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = BTreeSet::new();
        let mut edges: Vec<(String, ResourceKey, ResourceKey, Properties, bool)> = Vec::new();
        for edge in &pending.edges {
            let from = pending.resolve(&edge.from)?;
            let to = pending.resolve(&edge.to)?;
            let spec = self.model().relationship_class(&edge.relationship).ok_or_else(|| {
                StoreError::validation(format!("unknown relationship class {}", edge.relationship))
            })?;

            let ends = [(&edge.from, &from, Side::One), (&edge.to, &to, Side::Two)];
            for (reference, key, side) in ends {
                let declared = &spec.end(side).class;
                let requested = reference.class.as_deref().unwrap_or(declared);
                if !self.model().is_resource_subclass(&key.class, requested)
                    || !self.model().is_resource_subclass(&key.class, declared)
                {
                    return Err(StoreError::validation(format!(
                        "{} end {} expects a {requested}, but {} is a {}",
                        edge.relationship,
                        side.index() + 1,
                        reference.id,
                        key.class
                    )));
                }
            }

            let pair = if spec.symmetric && to.id < from.id {
                (to.id, from.id)
            } else {
                (from.id, to.id)
            };
            if seen.insert((edge.relationship.clone(), pair)) {
                edges.push((
                    edge.relationship.clone(),
                    from,
                    to,
                    edge.properties.clone(),
                    spec.symmetric,
                ));
            }
        }

        let mut by_class: BTreeMap<&str, Vec<EntityId>> = BTreeMap::new();
        for (_, from, to, _, _) in &edges {
            by_class.entry(&from.class).or_default().push(from.id);
            by_class.entry(&to.class).or_default().push(to.id);
        }
        for (class, ids) in by_class {
            existence::assert_resources_exist(self.exec(), class, &ids).await?;
        }

        let lookups: Vec<Statement> = edges
            .iter()
            .map(|(relationship, from, to, _, symmetric)| {
                let direction = if *symmetric {
                    Direction::Either
                } else {
                    Direction::Outgoing
                };
                Statement::MatchEdges(
                    EdgePattern::new(vec![relationship.clone()], direction)
                        .near(IdFilter::In(vec![from.id]))
                        .far(IdFilter::In(vec![to.id])),
                )
            })
            .collect();
        let existing = self.exec().execute(lookups).await?;
        let missing: Vec<_> = edges
            .into_iter()
            .zip(existing)
            .filter(|(_, rows)| rows.is_empty())
            .map(|(edge, _)| edge)
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let ids = self
            .allocator()
            .reserve(self.exec(), missing.len() as u32)
            .await?;
        let creates = missing
            .into_iter()
            .zip(&ids)
            .map(|((relationship, from, to, properties, _), id)| Statement::CreateEdge {
                class: relationship,
                id: *id,
                from: from.id,
                to: to.id,
                properties,
            })
            .collect();
        self.exec().execute(creates).await?;

        tracing::debug!(
            created = ids.len(),
            registered = pending.len(),
            "Pending edges materialized"
        );
        Ok(ids)
    }
}

/// Whether `reference` stands for the resource `id`. Unbound placeholders
/// stand for nothing yet.
fn refers_to(
    placeholders: &BTreeMap<String, ResourceKey>,
    reference: &ResourceRef,
    id: EntityId,
) -> bool {
    match &reference.id {
        RefId::Assigned(assigned) => *assigned == id,
        RefId::Placeholder(name) => placeholders.get(name).is_some_and(|key| key.id == id),
    }
}

/// An operation target: a persisted id or an already bound placeholder.
fn target_id(value: &Value, pending: &PendingEdges) -> Result<EntityId> {
    let reference = fields::parse_reference(value, None)
        .ok_or_else(|| StoreError::validation(format!("malformed target id: {value}")))?;
    match reference.target.id {
        RefId::Assigned(id) => Ok(id),
        RefId::Placeholder(_) => Ok(pending.resolve(&reference.target)?.id),
    }
}
