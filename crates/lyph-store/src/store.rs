//! The resource graph store: manifest-driven CRUD over a statement executor.
//!
//! Every public method takes a turn on the store's [`OperationQueue`] for its
//! whole duration. The `*_in` methods do the work and assume the caller holds
//! a turn; batches call them directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use lyph_core::types::href;
use lyph_core::{EntityId, Metamodel, RefId, ResourceKey, StoreConfig};
use lyph_graph::{
    Direction, EdgePattern, GraphClient, IdFilter, Properties, PropertyMode, Row, Statement,
    StatementExecutor,
};

use crate::anchor::find_external_anchors;
use crate::batch::PendingEdges;
use crate::cascade::compute_deletion_set;
use crate::error::{Result, StoreError};
use crate::existence;
use crate::fields::{self, decode_properties, Intent, Reference};
use crate::identity::IdentityAllocator;
use crate::queue::OperationQueue;
use crate::sync::{apply_sync, field_direction, plan_sync, SyncMode, SyncPlan};

/// Resource/relationship store over a graph backend.
pub struct ResourceGraphStore<E = GraphClient> {
    executor: E,
    model: Arc<Metamodel>,
    host: String,
    allocator: IdentityAllocator,
    queue: OperationQueue,
}

impl<E: StatementExecutor> ResourceGraphStore<E> {
    pub fn new(executor: E, model: Arc<Metamodel>, config: &StoreConfig) -> Self {
        Self {
            executor,
            model,
            host: config.host.clone(),
            allocator: IdentityAllocator::new(config),
            queue: OperationQueue::new(),
        }
    }

    pub fn model(&self) -> &Metamodel {
        &self.model
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub(crate) fn exec(&self) -> &dyn StatementExecutor {
        &self.executor
    }

    pub(crate) fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    // ── Resources ────────────────────────────────────────────────

    /// Create a resource of a concrete class and return its id.
    pub async fn create_resource(&self, class: &str, fields: &Properties) -> Result<EntityId> {
        let _turn = self.queue.enter("create_resource").await;
        self.create_resource_in(class, fields, None).await
    }

    /// Merge the given fields into a resource; unmentioned fields are kept.
    pub async fn update_resource(
        &self,
        class: &str,
        id: EntityId,
        fields: &Properties,
    ) -> Result<()> {
        let _turn = self.queue.enter("update_resource").await;
        self.modify_resource_in(class, id, fields, SyncMode::Update, None).await
    }

    /// Replace a resource's fields; unmentioned fields are cleared.
    pub async fn replace_resource(
        &self,
        class: &str,
        id: EntityId,
        fields: &Properties,
    ) -> Result<()> {
        let _turn = self.queue.enter("replace_resource").await;
        self.modify_resource_in(class, id, fields, SyncMode::Replace, None).await
    }

    /// Delete a resource and everything it sustains. Returns the deleted resources.
    pub async fn delete_resource(&self, class: &str, id: EntityId) -> Result<Vec<ResourceKey>> {
        let _turn = self.queue.enter("delete_resource").await;
        self.delete_resource_in(class, id, None).await
    }

    pub async fn get_resource(&self, class: &str, id: EntityId) -> Result<Value> {
        let _turn = self.queue.enter("get_resource").await;
        self.check_resource_class(class)?;
        let rows = self.fetch_nodes(class, IdFilter::In(vec![id])).await?;
        if rows.is_empty() {
            return Err(StoreError::not_found(class, vec![id]));
        }
        self.project_resources(rows)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::not_found(class, vec![id]))
    }

    /// Resources in the order of `ids`; fails naming every missing id.
    pub async fn get_resources(&self, class: &str, ids: &[EntityId]) -> Result<Vec<Value>> {
        let _turn = self.queue.enter("get_resources").await;
        self.check_resource_class(class)?;
        existence::assert_resources_exist(self.exec(), class, ids).await?;
        let rows = self.fetch_nodes(class, IdFilter::In(ids.to_vec())).await?;
        let projected = self.project_resources(rows).await?;

        let by_id: BTreeMap<i64, Value> = projected
            .into_iter()
            .filter_map(|v| Some((v.get("id")?.as_i64()?, v)))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.get(&id.0).cloned()).collect())
    }

    /// Every resource of `class` or a subclass, ordered by id.
    pub async fn get_all_resources(&self, class: &str) -> Result<Vec<Value>> {
        let _turn = self.queue.enter("get_all_resources").await;
        self.check_resource_class(class)?;
        let rows = self.fetch_nodes(class, IdFilter::Any).await?;
        self.project_resources(rows).await
    }

    pub async fn assert_resources_exist(&self, class: &str, ids: &[EntityId]) -> Result<()> {
        let _turn = self.queue.enter("assert_resources_exist").await;
        self.check_resource_class(class)?;
        existence::assert_resources_exist(self.exec(), class, ids).await
    }

    // ── Relationships ────────────────────────────────────────────

    /// Create an edge of a concrete relationship class from `(class_a, id_a)`
    /// (end one) to `(class_b, id_b)` (end two).
    pub async fn create_relationship(
        &self,
        class: &str,
        class_a: &str,
        class_b: &str,
        id_a: EntityId,
        id_b: EntityId,
        fields: &Properties,
    ) -> Result<EntityId> {
        let _turn = self.queue.enter("create_relationship").await;
        self.create_relationship_in(class, class_a, class_b, id_a, id_b, fields)
            .await
    }

    pub async fn update_relationship(
        &self,
        class: &str,
        id: EntityId,
        fields: &Properties,
    ) -> Result<()> {
        let _turn = self.queue.enter("update_relationship").await;
        self.modify_relationship_in(class, id, fields, PropertyMode::Merge)
            .await
    }

    pub async fn replace_relationship(
        &self,
        class: &str,
        id: EntityId,
        fields: &Properties,
    ) -> Result<()> {
        let _turn = self.queue.enter("replace_relationship").await;
        self.modify_relationship_in(class, id, fields, PropertyMode::Replace)
            .await
    }

    pub async fn delete_relationship(&self, class: &str, id: EntityId) -> Result<()> {
        let _turn = self.queue.enter("delete_relationship").await;
        let row = self.find_edge(class, id).await?;
        let actual = row.text("class")?;
        self.exec()
            .execute_one(Statement::DeleteEdges(
                EdgePattern::new(vec![actual.clone()], Direction::Outgoing)
                    .ids(IdFilter::In(vec![id])),
            ))
            .await?;
        tracing::info!(class = %actual, id = %id, "Relationship deleted");
        Ok(())
    }

    pub async fn get_relationship(&self, class: &str, id: EntityId) -> Result<Value> {
        let _turn = self.queue.enter("get_relationship").await;
        let row = self.find_edge(class, id).await?;
        self.project_relationship(&row)
    }

    /// Every relationship of `class` or a subclass, ordered by id.
    pub async fn get_all_relationships(&self, class: &str) -> Result<Vec<Value>> {
        let _turn = self.queue.enter("get_all_relationships").await;
        self.check_relationship_class(class)?;
        let classes = self.model.concrete_relationships_under(class);
        if classes.is_empty() {
            return Ok(Vec::new());
        }
        let mut rows = self
            .exec()
            .execute_one(Statement::MatchEdges(EdgePattern::new(classes, Direction::Outgoing)))
            .await?;
        rows.sort_by_key(|row| row.int("id").unwrap_or_default());
        rows.iter().map(|row| self.project_relationship(row)).collect()
    }

    pub async fn assert_relationships_exist(&self, class: &str, ids: &[EntityId]) -> Result<()> {
        let _turn = self.queue.enter("assert_relationships_exist").await;
        self.check_relationship_class(class)?;
        existence::assert_relationships_exist(self.exec(), &self.model, class, ids).await
    }

    // ── Operation bodies ─────────────────────────────────────────

    pub(crate) async fn create_resource_in(
        &self,
        class: &str,
        fields: &Properties,
        pending: Option<&mut PendingEdges>,
    ) -> Result<EntityId> {
        self.check_resource_class(class)?;
        if !self.model.is_concrete_resource(class) {
            return Err(StoreError::validation(format!("{class} is abstract")));
        }

        let mut parsed = fields::parse_resource_fields(&self.model, class, fields, Intent::Create)?;
        self.resolve_reference_classes(class, &mut parsed.relationships)
            .await?;
        let plan = plan_sync(&self.model, class, &parsed.relationships, SyncMode::Create)?;
        self.check_plan(&plan, pending.is_some()).await?;

        let id = match parsed.id {
            Some(id) => {
                self.allocator.claim(self.exec(), id).await?;
                id
            }
            None => self.allocate_one().await?,
        };

        let properties: Properties = parsed
            .properties
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .collect();
        let write = vec![Statement::CreateNode {
            labels: self.model.resource_ancestry(class),
            class: class.to_string(),
            id,
            properties,
        }];

        let key = ResourceKey::new(class, id);
        let outcome = apply_sync(self.exec(), &self.allocator, plan, &key, write, pending).await?;
        tracing::info!(
            class,
            id = %id,
            edges = outcome.created.len(),
            deferred = outcome.deferred,
            "Resource created"
        );
        Ok(id)
    }

    pub(crate) async fn modify_resource_in(
        &self,
        class: &str,
        id: EntityId,
        fields: &Properties,
        mode: SyncMode,
        pending: Option<&mut PendingEdges>,
    ) -> Result<()> {
        self.check_resource_class(class)?;
        let rows = self.fetch_nodes(class, IdFilter::In(vec![id])).await?;
        let current = rows
            .first()
            .ok_or_else(|| StoreError::not_found(class, vec![id]))?;
        let actual = current.text("class")?;
        let before = decode_properties(
            current.properties("properties")?,
            &self.model.properties(&actual),
        );

        let mut parsed =
            fields::parse_resource_fields(&self.model, &actual, fields, Intent::Modify)?;
        self.resolve_reference_classes(&actual, &mut parsed.relationships)
            .await?;
        let plan = plan_sync(&self.model, &actual, &parsed.relationships, mode)?;
        self.check_plan(&plan, pending.is_some()).await?;

        let mut changed: Vec<&str> = parsed
            .properties
            .iter()
            .filter(|(name, value)| before.get(name.as_str()) != Some(*value))
            .map(|(name, _)| name.as_str())
            .collect();
        let property_mode = match mode {
            SyncMode::Replace => {
                changed.extend(
                    before
                        .keys()
                        .filter(|name| !parsed.properties.contains_key(*name))
                        .map(String::as_str),
                );
                PropertyMode::Replace
            }
            _ => PropertyMode::Merge,
        };
        tracing::info!(class = %actual, id = %id, changed = ?changed, "Updating resource");

        let write = vec![Statement::SetNodeProperties {
            label: actual.clone(),
            id,
            properties: parsed.properties,
            mode: property_mode,
        }];

        let key = ResourceKey::new(actual, id);
        let outcome = apply_sync(self.exec(), &self.allocator, plan, &key, write, pending).await?;
        tracing::debug!(
            resource = %key,
            removed = outcome.removed,
            created = outcome.created.len(),
            deferred = outcome.deferred,
            "Relationships synced"
        );
        Ok(())
    }

    /// Pending edges touching a deleted resource are dropped from `pending`.
    pub(crate) async fn delete_resource_in(
        &self,
        class: &str,
        id: EntityId,
        pending: Option<&mut PendingEdges>,
    ) -> Result<Vec<ResourceKey>> {
        self.check_resource_class(class)?;
        let doomed = compute_deletion_set(self.exec(), &self.model, class, id).await?;
        let ids: Vec<EntityId> = doomed.iter().map(|k| k.id).collect();

        let anchors = find_external_anchors(self.exec(), &self.model, &ids).await?;
        if !anchors.is_empty() {
            tracing::warn!(
                class,
                id = %id,
                anchors = anchors.len(),
                "Deletion refused: resources are anchored from outside"
            );
            return Err(StoreError::Conflict { anchors });
        }

        self.exec()
            .execute_one(Statement::DeleteNodes { ids: ids.clone() })
            .await?;
        if let Some(pending) = pending {
            let dropped = pending.purge(&ids);
            if dropped > 0 {
                tracing::debug!(
                    class,
                    id = %id,
                    dropped,
                    "Dropped pending edges of deleted resources"
                );
            }
        }
        tracing::info!(class, id = %id, deleted = doomed.len(), "Resource deleted");
        Ok(doomed)
    }

    pub(crate) async fn create_relationship_in(
        &self,
        class: &str,
        class_a: &str,
        class_b: &str,
        id_a: EntityId,
        id_b: EntityId,
        fields: &Properties,
    ) -> Result<EntityId> {
        self.check_relationship_ends(class, class_a, class_b)?;
        let parsed = fields::parse_relationship_fields(&self.model, class, fields, Intent::Create)?;

        existence::assert_resources_exist(self.exec(), class_a, &[id_a]).await?;
        existence::assert_resources_exist(self.exec(), class_b, &[id_b]).await?;

        let id = match parsed.id {
            Some(id) => {
                self.allocator.claim(self.exec(), id).await?;
                id
            }
            None => self.allocate_one().await?,
        };
        self.exec()
            .execute_one(Statement::CreateEdge {
                class: class.to_string(),
                id,
                from: id_a,
                to: id_b,
                properties: parsed.properties,
            })
            .await?;
        tracing::info!(class, id = %id, from = %id_a, to = %id_b, "Relationship created");
        Ok(id)
    }

    async fn modify_relationship_in(
        &self,
        class: &str,
        id: EntityId,
        fields: &Properties,
        mode: PropertyMode,
    ) -> Result<()> {
        let row = self.find_edge(class, id).await?;
        let actual = row.text("class")?;
        let parsed =
            fields::parse_relationship_fields(&self.model, &actual, fields, Intent::Modify)?;
        self.exec()
            .execute_one(Statement::SetEdgeProperties {
                class: actual.clone(),
                id,
                properties: parsed.properties,
                mode,
            })
            .await?;
        tracing::info!(class = %actual, id = %id, mode = ?mode, "Relationship updated");
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────

    pub(crate) fn check_resource_class(&self, class: &str) -> Result<()> {
        if self.model.resource_class(class).is_none() {
            return Err(StoreError::validation(format!("unknown resource class {class}")));
        }
        Ok(())
    }

    fn check_relationship_class(&self, class: &str) -> Result<()> {
        if self.model.relationship_class(class).is_none() {
            return Err(StoreError::validation(format!("unknown relationship class {class}")));
        }
        Ok(())
    }

    /// The relationship class must be concrete and each end class must fit
    /// the declared end.
    pub(crate) fn check_relationship_ends(
        &self,
        class: &str,
        class_a: &str,
        class_b: &str,
    ) -> Result<()> {
        let spec = self
            .model
            .relationship_class(class)
            .ok_or_else(|| StoreError::validation(format!("unknown relationship class {class}")))?;
        if spec.is_abstract {
            return Err(StoreError::validation(format!("{class} is abstract")));
        }
        for (side, end_class) in lyph_core::Side::BOTH.into_iter().zip([class_a, class_b]) {
            let declared = &spec.end(side).class;
            if self.model.resource_class(end_class).is_none() {
                return Err(StoreError::validation(format!("unknown resource class {end_class}")));
            }
            if !self.model.is_resource_subclass(end_class, declared) {
                return Err(StoreError::validation(format!(
                    "{class} end {} expects a {declared}, got {end_class}",
                    side.index() + 1
                )));
            }
        }
        Ok(())
    }

    async fn allocate_one(&self) -> Result<EntityId> {
        self.allocator
            .reserve(self.exec(), 1)
            .await?
            .pop()
            .ok_or_else(|| StoreError::validation("id allocation returned nothing"))
    }

    pub(crate) fn allocator(&self) -> &IdentityAllocator {
        &self.allocator
    }

    async fn fetch_nodes(&self, label: &str, ids: IdFilter) -> Result<Vec<Row>> {
        Ok(self
            .exec()
            .execute_one(Statement::FetchNodes {
                label: label.to_string(),
                ids,
            })
            .await?)
    }

    /// The edge row for `id` among relationships of `class` or a subclass.
    async fn find_edge(&self, class: &str, id: EntityId) -> Result<Row> {
        self.check_relationship_class(class)?;
        let classes = self.model.concrete_relationships_under(class);
        if classes.is_empty() {
            return Err(StoreError::not_found(class, vec![id]));
        }
        self.exec()
            .execute_one(Statement::MatchEdges(
                EdgePattern::new(classes, Direction::Outgoing).ids(IdFilter::In(vec![id])),
            ))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::not_found(class, vec![id]))
    }

    /// Fill in the class of bare-id references from the graph.
    async fn resolve_reference_classes(
        &self,
        class: &str,
        supplied: &mut BTreeMap<String, Vec<Reference>>,
    ) -> Result<()> {
        let fields = self.model.relationship_fields(class);
        let mut wanted: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
        for (name, refs) in supplied.iter() {
            let Some(field) = fields.get(name) else { continue };
            for r in refs {
                if let (RefId::Assigned(id), None) = (&r.target.id, &r.target.class) {
                    wanted.entry(field.codomain.clone()).or_default().push(*id);
                }
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let mut classes: BTreeMap<EntityId, String> = BTreeMap::new();
        for (codomain, ids) in &wanted {
            existence::assert_resources_exist(self.exec(), codomain, ids).await?;
            for row in self.fetch_nodes(codomain, IdFilter::In(ids.clone())).await? {
                classes.insert(row.id("id")?, row.text("class")?);
            }
        }
        for refs in supplied.values_mut() {
            for r in refs.iter_mut() {
                if let (RefId::Assigned(id), None) = (&r.target.id, &r.target.class) {
                    r.target.class = classes.get(id).cloned();
                }
            }
        }
        Ok(())
    }

    /// Placeholders need a batch; persisted targets must exist.
    async fn check_plan(&self, plan: &SyncPlan, in_batch: bool) -> Result<()> {
        if !in_batch {
            if let Some((field, name)) = plan.first_placeholder() {
                return Err(StoreError::validation(format!(
                    "field '{field}' references placeholder #{name} outside a batch"
                )));
            }
        }
        for (class, ids) in plan.assigned_targets() {
            existence::assert_resources_exist(self.exec(), &class, &ids).await?;
        }
        Ok(())
    }

    fn reference(&self, class: &str, id: EntityId) -> Value {
        json!({ "id": id, "href": href(&self.host, class, id), "class": class })
    }

    /// Project node rows into resource documents, relationship fields included.
    async fn project_resources(&self, rows: Vec<Row>) -> Result<Vec<Value>> {
        let mut nodes = Vec::with_capacity(rows.len());
        let mut by_class: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
        for row in &rows {
            let key = ResourceKey::new(row.text("class")?, row.id("id")?);
            by_class.entry(key.class.clone()).or_default().push(key.id);
            nodes.push((key, row.properties("properties")?));
        }

        // One edge query per (class, field), all in one batch.
        let mut slots = Vec::new();
        let mut statements = Vec::new();
        for (class, ids) in &by_class {
            for field in self.model.relationship_fields(class).into_values() {
                let classes = self.model.concrete_relationships_under(&field.relationship);
                if classes.is_empty() {
                    continue;
                }
                statements.push(Statement::MatchEdges(
                    EdgePattern::new(classes, field_direction(&field))
                        .near(IdFilter::In(ids.clone())),
                ));
                slots.push(field);
            }
        }
        let results = if statements.is_empty() {
            Vec::new()
        } else {
            self.exec().execute(statements).await?
        };

        // (near id, field name) -> far endpoints
        let mut links: BTreeMap<(EntityId, String), Vec<(EntityId, String)>> = BTreeMap::new();
        for (field, rows) in slots.iter().zip(results) {
            for row in rows {
                links
                    .entry((row.id("near_id")?, field.name.clone()))
                    .or_default()
                    .push((row.id("far_id")?, row.text("far_class")?));
            }
        }

        let mut out = Vec::with_capacity(nodes.len());
        for (key, properties) in nodes {
            let mut doc = serde_json::Map::new();
            doc.insert("id".into(), json!(key.id));
            doc.insert("href".into(), json!(href(&self.host, &key.class, key.id)));
            doc.insert("class".into(), json!(key.class));
            doc.extend(decode_properties(properties, &self.model.properties(&key.class)));

            for field in self.model.relationship_fields(&key.class).into_values() {
                let mut far = links
                    .remove(&(key.id, field.name.clone()))
                    .unwrap_or_default();
                far.sort();
                far.dedup();
                let refs: Vec<Value> =
                    far.iter().map(|(id, class)| self.reference(class, *id)).collect();
                let value = match field.cardinality {
                    lyph_core::Cardinality::One => refs.into_iter().next().unwrap_or(Value::Null),
                    lyph_core::Cardinality::Many => Value::Array(refs),
                };
                doc.insert(field.name, value);
            }
            out.push(Value::Object(doc));
        }
        Ok(out)
    }

    /// Project an outgoing edge row: near is end one, far is end two.
    fn project_relationship(&self, row: &Row) -> Result<Value> {
        let class = row.text("class")?;
        let id = row.id("id")?;
        let mut doc = serde_json::Map::new();
        doc.insert("id".into(), json!(id));
        doc.insert("href".into(), json!(href(&self.host, &class, id)));
        doc.insert("class".into(), json!(class));
        doc.extend(decode_properties(
            row.properties("properties")?,
            &self.model.relationship_properties(&class),
        ));
        doc.insert("1".into(), self.reference(&row.text("near_class")?, row.id("near_id")?));
        doc.insert("2".into(), self.reference(&row.text("far_class")?, row.id("far_id")?));
        Ok(Value::Object(doc))
    }
}
