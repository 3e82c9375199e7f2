//! End-to-end store behavior over the in-memory graph backend.
//!
//! Run with: cargo test --package lyph-store --test lifecycle

use std::sync::Arc;

use serde_json::{json, Value};

use lyph_core::{EntityId, Metamodel, ResourceKey, StoreConfig};
use lyph_graph::{GraphError, MemoryGraph, Properties};
use lyph_store::{AnchorPair, BatchOperation, BatchOutcome, ResourceGraphStore, StoreError};

const MANIFEST: &str = include_str!("../../../manifests/lyph-templates.json");

type Store = ResourceGraphStore<Arc<MemoryGraph>>;

fn store() -> (Store, Arc<MemoryGraph>) {
    let model = Metamodel::from_json_str(MANIFEST).unwrap();
    let graph = Arc::new(MemoryGraph::new());
    let config = StoreConfig {
        id_lock_attempts: 3,
        id_lock_backoff_ms: 1,
        ..StoreConfig::default()
    };
    (
        ResourceGraphStore::new(graph.clone(), Arc::new(model), &config),
        graph,
    )
}

fn fields(value: Value) -> Properties {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn ref_ids(value: &Value) -> Vec<i64> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect()
}

/// A lyph with one layer, plus a second lyph pointing at the first through a
/// non-sustaining relationship.
async fn heart_with_wall(store: &Store) -> (EntityId, EntityId, EntityId) {
    let wall = store
        .create_resource("LayerTemplate", &fields(json!({ "name": "wall" })))
        .await
        .unwrap();
    let heart = store
        .create_resource(
            "LyphTemplate",
            &fields(json!({ "name": "heart", "layers": [wall.0] })),
        )
        .await
        .unwrap();
    let blood = store
        .create_resource(
            "LyphTemplate",
            &fields(json!({ "name": "blood", "materials": [heart.0] })),
        )
        .await
        .unwrap();
    (heart, wall, blood)
}

#[tokio::test]
async fn test_delete_cascades_along_sustaining_edges() {
    let (store, graph) = store();
    let (heart, wall, blood) = heart_with_wall(&store).await;

    let deleted = store.delete_resource("LyphTemplate", heart).await.unwrap();
    let mut ids: Vec<EntityId> = deleted.iter().map(|k| k.id).collect();
    ids.sort();
    let mut expected = vec![heart, wall];
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(deleted[0], ResourceKey::new("LyphTemplate", heart));

    assert!(!graph.contains_node(heart).await);
    assert!(!graph.contains_node(wall).await);
    assert!(graph.contains_node(blood).await);
    assert_eq!(graph.edge_count().await, 0);

    let survivor = store.get_resource("LyphTemplate", blood).await.unwrap();
    assert_eq!(survivor["materials"], json!([]));
}

#[tokio::test]
async fn test_anchored_layer_vetoes_deletion() {
    let (store, graph) = store();
    let (heart, wall, _) = heart_with_wall(&store).await;
    let shape = store
        .create_resource(
            "LyphTemplate",
            &fields(json!({ "name": "shape", "constrainedLayers": [wall.0] })),
        )
        .await
        .unwrap();
    let (nodes, edges) = (graph.node_count().await, graph.edge_count().await);

    let err = store.delete_resource("LyphTemplate", heart).await.unwrap_err();
    match err {
        StoreError::Conflict { anchors } => assert_eq!(
            anchors,
            vec![AnchorPair {
                anchoring: ResourceKey::new("LyphTemplate", shape),
                anchored: ResourceKey::new("LayerTemplate", wall),
            }]
        ),
        other => panic!("expected conflict, got {other}"),
    }
    assert_eq!(graph.node_count().await, nodes);
    assert_eq!(graph.edge_count().await, edges);

    // Once the anchoring lyph is gone the deletion goes through.
    store.delete_resource("LyphTemplate", shape).await.unwrap();
    let deleted = store.delete_resource("LyphTemplate", heart).await.unwrap();
    assert_eq!(deleted.len(), 2);
}

#[tokio::test]
async fn test_sync_is_idempotent() {
    let (store, graph) = store();
    let (heart, wall, _) = heart_with_wall(&store).await;
    let original = graph.edges_between("HasLayer", heart, wall).await;
    assert_eq!(original.len(), 1);

    for _ in 0..2 {
        store
            .update_resource("LyphTemplate", heart, &fields(json!({ "layers": [wall.0] })))
            .await
            .unwrap();
    }
    assert_eq!(graph.edges_between("HasLayer", heart, wall).await, original);

    store
        .update_resource("LyphTemplate", heart, &fields(json!({ "layers": [] })))
        .await
        .unwrap();
    assert!(graph.edges_between("HasLayer", heart, wall).await.is_empty());
    assert!(graph.contains_node(wall).await);
}

#[tokio::test]
async fn test_replace_clears_what_update_keeps() {
    let (store, graph) = store();
    let (heart, wall, _) = heart_with_wall(&store).await;

    store
        .update_resource("LyphTemplate", heart, &fields(json!({ "species": "human" })))
        .await
        .unwrap();
    let doc = store.get_resource("LyphTemplate", heart).await.unwrap();
    assert_eq!(doc["name"], json!("heart"));
    assert_eq!(doc["species"], json!("human"));
    assert_eq!(ref_ids(&doc["layers"]), vec![wall.0]);

    store
        .replace_resource("LyphTemplate", heart, &fields(json!({ "name": "heart v2" })))
        .await
        .unwrap();
    let doc = store.get_resource("LyphTemplate", heart).await.unwrap();
    assert_eq!(doc["name"], json!("heart v2"));
    assert!(doc.get("species").is_none());
    assert_eq!(doc["layers"], json!([]));
    assert!(graph.edges_between("HasLayer", heart, wall).await.is_empty());
}

#[tokio::test]
async fn test_missing_reference_fails_before_any_write() {
    let (store, graph) = store();
    let err = store
        .create_resource(
            "LyphTemplate",
            &fields(json!({ "name": "heart", "layers": [999] })),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(
            &err,
            StoreError::NotFound { class, ids }
                if class == "LayerTemplate" && ids == &vec![EntityId(999)]
        ),
        "unexpected error: {err}"
    );
    assert_eq!(graph.node_count().await, 0);
    assert_eq!(graph.edge_count().await, 0);
}

#[tokio::test]
async fn test_invalid_input_is_rejected() {
    let (store, _) = store();
    let err = store
        .create_resource("Template", &fields(json!({ "name": "abstract" })))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));

    let err = store
        .create_resource("LyphTemplate", &fields(json!({ "colour": "red" })))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));

    let err = store
        .get_resource("LyphTemplate", EntityId(42))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn test_lock_released_after_failed_reservation() {
    let (store, graph) = store();
    graph.fail_next("reserve_ids").await;

    let err = store
        .create_resource("LyphTemplate", &fields(json!({ "name": "heart" })))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Transport(GraphError::Injected("reserve_ids"))
    ));
    assert!(!graph.id_lock_held().await);
    assert_eq!(graph.node_count().await, 0);

    let id = store
        .create_resource("LyphTemplate", &fields(json!({ "name": "heart" })))
        .await
        .unwrap();
    assert!(graph.contains_node(id).await);
}

#[tokio::test]
async fn test_supplied_id_raises_counter() {
    let (store, _) = store();
    let id = store
        .create_resource("LyphTemplate", &fields(json!({ "id": 500, "name": "heart" })))
        .await
        .unwrap();
    assert_eq!(id, EntityId(500));

    let next = store
        .create_resource("LyphTemplate", &fields(json!({ "name": "lung" })))
        .await
        .unwrap();
    assert_eq!(next, EntityId(501));
}

#[tokio::test]
async fn test_read_projection() {
    let (store, _) = store();
    let (heart, wall, blood) = heart_with_wall(&store).await;
    store
        .update_resource(
            "LyphTemplate",
            heart,
            &fields(json!({
                "tags": ["cardiac", "organ"],
                "length": { "value": 12, "unit": "cm" }
            })),
        )
        .await
        .unwrap();

    let doc = store.get_resource("LyphTemplate", heart).await.unwrap();
    assert_eq!(doc["id"], json!(heart.0));
    assert_eq!(doc["class"], json!("LyphTemplate"));
    assert_eq!(
        doc["href"],
        json!(format!("http://localhost:8888/LyphTemplate/{heart}"))
    );
    assert_eq!(doc["tags"], json!(["cardiac", "organ"]));
    assert_eq!(doc["length"]["unit"], json!("cm"));
    assert_eq!(doc["materialIn"][0]["id"], json!(blood.0));
    // Alias fields show the edges of their concrete subclasses.
    assert_eq!(ref_ids(&doc["parts"]), vec![wall.0]);

    let layer = store.get_resource("LayerTemplate", wall).await.unwrap();
    assert_eq!(layer["lyphTemplate"]["id"], json!(heart.0));
    assert_eq!(layer["lyphTemplate"]["class"], json!("LyphTemplate"));

    let all = store.get_all_resources("Template").await.unwrap();
    assert_eq!(all.len(), 3);

    let some = store
        .get_resources("LyphTemplate", &[blood, heart])
        .await
        .unwrap();
    assert_eq!(some[0]["id"], json!(blood.0));
    assert_eq!(some[1]["id"], json!(heart.0));

    let err = store
        .get_resources("LyphTemplate", &[heart, wall])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { ids, .. } if ids == vec![wall]));
}

#[tokio::test]
async fn test_symmetric_field_reads_from_both_ends() {
    let (store, graph) = store();
    let left = store
        .create_resource("LyphTemplate", &fields(json!({ "name": "left" })))
        .await
        .unwrap();
    let right = store
        .create_resource(
            "LyphTemplate",
            &fields(json!({ "name": "right", "coalescences": [left.0] })),
        )
        .await
        .unwrap();

    let doc = store.get_resource("LyphTemplate", left).await.unwrap();
    assert_eq!(ref_ids(&doc["coalescences"]), vec![right.0]);
    let doc = store.get_resource("LyphTemplate", right).await.unwrap();
    assert_eq!(ref_ids(&doc["coalescences"]), vec![left.0]);

    // Naming the pair from the other side does not add a second edge.
    store
        .update_resource("LyphTemplate", left, &fields(json!({ "coalescences": [right.0] })))
        .await
        .unwrap();
    assert_eq!(graph.edge_count().await, 1);
}

#[tokio::test]
async fn test_relationship_lifecycle() {
    let (store, _) = store();
    let (heart, wall, _) = heart_with_wall(&store).await;

    let id = store
        .create_relationship(
            "Constrains",
            "LyphTemplate",
            "LayerTemplate",
            heart,
            wall,
            &fields(json!({ "reason": "thickness" })),
        )
        .await
        .unwrap();

    let rel = store.get_relationship("Constrains", id).await.unwrap();
    assert_eq!(rel["class"], json!("Constrains"));
    assert_eq!(rel["reason"], json!("thickness"));
    assert_eq!(rel["1"]["id"], json!(heart.0));
    assert_eq!(rel["2"]["id"], json!(wall.0));
    assert_eq!(rel["2"]["class"], json!("LayerTemplate"));

    store
        .update_relationship("Constrains", id, &fields(json!({ "reason": "shape" })))
        .await
        .unwrap();
    let rel = store.get_relationship("Constrains", id).await.unwrap();
    assert_eq!(rel["reason"], json!("shape"));

    store
        .replace_relationship("Constrains", id, &Properties::new())
        .await
        .unwrap();
    let rel = store.get_relationship("Constrains", id).await.unwrap();
    assert!(rel.get("reason").is_none());

    assert_eq!(store.get_all_relationships("Constrains").await.unwrap().len(), 1);
    // HasLayer is the only concrete HasPart.
    assert_eq!(store.get_all_relationships("HasPart").await.unwrap().len(), 1);
    store
        .assert_relationships_exist("Constrains", &[id])
        .await
        .unwrap();

    store.delete_relationship("Constrains", id).await.unwrap();
    assert!(matches!(
        store.get_relationship("Constrains", id).await,
        Err(StoreError::NotFound { .. })
    ));
    assert!(matches!(
        store.assert_relationships_exist("Constrains", &[id]).await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_relationship_ends_are_checked() {
    let (store, _) = store();
    let (heart, wall, _) = heart_with_wall(&store).await;

    let err = store
        .create_relationship(
            "Constrains",
            "LayerTemplate",
            "LyphTemplate",
            wall,
            heart,
            &Properties::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));

    let err = store
        .create_relationship(
            "Constrains",
            "LyphTemplate",
            "LayerTemplate",
            heart,
            EntityId(999),
            &Properties::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn test_batch_materializes_placeholder_edges() {
    let (store, graph) = store();
    let operations: Vec<BatchOperation> = serde_json::from_value(json!([
        { "op": "create", "class": "LyphTemplate", "placeholder": "heart",
          "fields": { "name": "heart", "layers": ["#wall"] } },
        { "op": "create", "class": "LayerTemplate", "placeholder": "wall",
          "fields": { "name": "wall" } },
        { "op": "relate", "class": "Constrains", "from": "#heart", "to": "#wall",
          "fields": { "reason": "shape" } },
        { "op": "update", "class": "LyphTemplate", "id": "#heart",
          "fields": { "species": "human" } }
    ]))
    .unwrap();

    let report = store.execute_batch(operations).await.unwrap();
    assert_eq!(report.results.len(), 4);
    assert_eq!(report.deferred_edges.len(), 2);
    let heart = report.placeholders["heart"];
    let wall = report.placeholders["wall"];

    assert_eq!(graph.edges_between("HasLayer", heart, wall).await.len(), 1);
    assert_eq!(graph.edges_between("Constrains", heart, wall).await.len(), 1);
    assert!(!graph.id_lock_held().await);

    let doc = store.get_resource("LyphTemplate", heart).await.unwrap();
    assert_eq!(ref_ids(&doc["layers"]), vec![wall.0]);
    assert_eq!(doc["species"], json!("human"));
}

#[tokio::test]
async fn test_failed_batch_leaves_pending_edges_uncreated() {
    let (store, graph) = store();
    let operations: Vec<BatchOperation> = serde_json::from_value(json!([
        { "op": "create", "class": "LayerTemplate", "placeholder": "wall",
          "fields": { "name": "wall" } },
        { "op": "create", "class": "LyphTemplate",
          "fields": { "name": "heart", "layers": ["#wall"] } },
        { "op": "update", "class": "LyphTemplate", "id": 999, "fields": {} }
    ]))
    .unwrap();

    let err = store.execute_batch(operations).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
    // Earlier operations stay applied; the deferred edge was never created.
    assert_eq!(graph.node_count().await, 2);
    assert_eq!(graph.edge_count().await, 0);
}

#[tokio::test]
async fn test_later_batch_writes_revise_pending_edges() {
    let (store, graph) = store();
    let operations: Vec<BatchOperation> = serde_json::from_value(json!([
        { "op": "create", "class": "LayerTemplate", "placeholder": "wall",
          "fields": { "name": "wall" } },
        { "op": "create", "class": "LyphTemplate", "placeholder": "heart",
          "fields": { "name": "heart", "layers": ["#wall"] } },
        { "op": "update", "class": "LyphTemplate", "id": "#heart",
          "fields": { "layers": [] } }
    ]))
    .unwrap();
    let report = store.execute_batch(operations).await.unwrap();
    assert!(report.deferred_edges.is_empty());
    assert_eq!(graph.edge_count().await, 0);
    let doc = store
        .get_resource("LyphTemplate", report.placeholders["heart"])
        .await
        .unwrap();
    assert_eq!(doc["layers"], json!([]));

    // Replace without the field empties it too, while a rewritten value stays.
    let operations: Vec<BatchOperation> = serde_json::from_value(json!([
        { "op": "create", "class": "LayerTemplate", "placeholder": "wall",
          "fields": { "name": "wall" } },
        { "op": "create", "class": "LayerTemplate", "placeholder": "lining",
          "fields": { "name": "lining" } },
        { "op": "create", "class": "LyphTemplate", "placeholder": "heart",
          "fields": { "name": "heart", "layers": ["#wall"] } },
        { "op": "replace", "class": "LyphTemplate", "id": "#heart",
          "fields": { "name": "heart" } },
        { "op": "create", "class": "LyphTemplate", "placeholder": "lung",
          "fields": { "name": "lung", "layers": ["#wall"] } },
        { "op": "update", "class": "LyphTemplate", "id": "#lung",
          "fields": { "layers": ["#lining"] } }
    ]))
    .unwrap();
    let report = store.execute_batch(operations).await.unwrap();
    assert_eq!(report.deferred_edges.len(), 1);
    let heart = report.placeholders["heart"];
    let lung = report.placeholders["lung"];
    assert!(graph.edges_between("HasLayer", heart, report.placeholders["wall"]).await.is_empty());
    assert!(graph.edges_between("HasLayer", lung, report.placeholders["wall"]).await.is_empty());
    assert_eq!(
        graph.edges_between("HasLayer", lung, report.placeholders["lining"]).await.len(),
        1
    );
}

#[tokio::test]
async fn test_batch_delete_drops_pending_edges_of_deleted_resources() {
    let (store, graph) = store();
    let operations: Vec<BatchOperation> = serde_json::from_value(json!([
        { "op": "create", "class": "LayerTemplate", "placeholder": "wall",
          "fields": { "name": "wall" } },
        { "op": "create", "class": "LyphTemplate", "placeholder": "heart",
          "fields": { "name": "heart", "layers": ["#wall"] } },
        { "op": "relate", "class": "Constrains", "from": "#heart", "to": "#wall" },
        { "op": "delete", "class": "LayerTemplate", "id": "#wall" }
    ]))
    .unwrap();

    let report = store.execute_batch(operations).await.unwrap();
    assert!(report.deferred_edges.is_empty());
    assert!(matches!(
        &report.results[3],
        BatchOutcome::Deleted { deleted } if deleted.len() == 1
    ));
    assert_eq!(graph.node_count().await, 1);
    assert_eq!(graph.edge_count().await, 0);
    assert!(graph.contains_node(report.placeholders["heart"]).await);
}

#[tokio::test]
async fn test_failed_edge_write_leaves_resource_untouched() {
    let (store, graph) = store();
    let wall = store
        .create_resource("LayerTemplate", &fields(json!({ "name": "wall" })))
        .await
        .unwrap();

    graph.fail_next("create_edge").await;
    let err = store
        .create_resource(
            "LyphTemplate",
            &fields(json!({ "name": "heart", "layers": [wall.0] })),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Transport(GraphError::Injected("create_edge"))
    ));
    assert_eq!(graph.node_count().await, 1);
    assert_eq!(graph.edge_count().await, 0);

    let heart = store
        .create_resource(
            "LyphTemplate",
            &fields(json!({ "name": "heart", "layers": [wall.0] })),
        )
        .await
        .unwrap();
    let lining = store
        .create_resource("LayerTemplate", &fields(json!({ "name": "lining" })))
        .await
        .unwrap();

    graph.fail_next("create_edge").await;
    let err = store
        .update_resource(
            "LyphTemplate",
            heart,
            &fields(json!({ "species": "human", "layers": [lining.0] })),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Transport(GraphError::Injected("create_edge"))
    ));

    let doc = store.get_resource("LyphTemplate", heart).await.unwrap();
    assert_eq!(ref_ids(&doc["layers"]), vec![wall.0]);
    assert!(doc.get("species").map_or(true, Value::is_null));
}

#[tokio::test]
async fn test_placeholder_outside_batch_is_rejected() {
    let (store, graph) = store();
    let err = store
        .create_resource(
            "LyphTemplate",
            &fields(json!({ "name": "heart", "layers": ["#wall"] })),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert_eq!(graph.node_count().await, 0);
}

#[tokio::test]
async fn test_concurrent_calls_get_distinct_ids() {
    let (store, graph) = store();
    let store = Arc::new(store);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                let name = format!("lyph {i}");
                store
                    .create_resource("LyphTemplate", &fields(json!({ "name": name })))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(graph.node_count().await, 8);
    assert!(!graph.id_lock_held().await);
}
