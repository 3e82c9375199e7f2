//! Neo4j connection management and the Cypher-backed statement executor.

use async_trait::async_trait;
use neo4rs::{query, ConfigBuilder, Graph, Txn};
use serde::Deserialize;
use serde_json::Value;

use lyph_core::manifest::ID_COUNTER_LABEL;

use crate::cypher::{self, ColumnKind, CompiledStatement, EmptyResult};
use crate::executor::StatementExecutor;
use crate::statement::{Row, Statement};

/// Errors from graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Neo4j connection error: {0}")]
    Connection(String),

    #[error("Neo4j query error: {0}")]
    Query(#[from] neo4rs::Error),

    #[error("Statement {statement} matched nothing: {detail}")]
    NotFound {
        statement: &'static str,
        detail: String,
    },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Id counter lock is held by another writer")]
    LockHeld,

    #[error("Injected failure in statement {0}")]
    Injected(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Configuration for connecting to Neo4j.
///
/// Loaded from the `[neo4j]` section of `lyph.toml` or `LYPH__NEO4J__*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
}

fn default_uri() -> String {
    "bolt://localhost:7687".to_string()
}

fn default_user() -> String {
    "neo4j".to_string()
}

fn default_password() -> String {
    "lyph-dev".to_string()
}

fn default_max_connections() -> u32 {
    16
}

fn default_fetch_size() -> usize {
    256
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            user: default_user(),
            password: default_password(),
            max_connections: default_max_connections(),
            fetch_size: default_fetch_size(),
        }
    }
}

/// Thread-safe Neo4j graph client with connection pooling.
///
/// Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct GraphClient {
    graph: Graph,
}

impl GraphClient {
    /// Connect to Neo4j with the given configuration.
    pub async fn connect(config: &GraphConfig) -> Result<Self, GraphError> {
        let neo_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .max_connections(config.max_connections as usize)
            .fetch_size(config.fetch_size)
            .build()
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        let graph = Graph::connect(neo_config)
            .await
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        tracing::info!(uri = %config.uri, "Connected to Neo4j");
        Ok(Self { graph })
    }

    /// Get a reference to the underlying neo4rs Graph for direct operations.
    pub fn inner(&self) -> &Graph {
        &self.graph
    }

    /// Create id uniqueness constraints for the given root labels and the
    /// singleton id counter.
    pub async fn ensure_schema(&self, root_labels: &[String]) -> Result<(), GraphError> {
        for label in root_labels {
            let cypher = format!(
                "CREATE CONSTRAINT {label}_id_unique IF NOT EXISTS
                 FOR (n:{label}) REQUIRE n.id IS UNIQUE"
            );
            self.graph.run(query(&cypher)).await?;
        }
        self.execute(vec![Statement::EnsureIdCounter]).await?;
        tracing::info!(labels = root_labels.len(), counter = ID_COUNTER_LABEL, "Schema ensured");
        Ok(())
    }

    async fn run_compiled(
        txn: &mut Txn,
        kind: &'static str,
        compiled: &CompiledStatement,
    ) -> Result<Vec<Row>, GraphError> {
        let mut stream = txn.execute(compiled.to_query()).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next(txn.handle()).await? {
            rows.push(decode_row(&row, &compiled.columns)?);
        }
        if !rows.is_empty() {
            return Ok(rows);
        }
        match compiled.on_empty {
            EmptyResult::Allowed => Ok(rows),
            EmptyResult::NotFound => Err(GraphError::NotFound {
                statement: kind,
                detail: "target node, edge, or id counter is missing".to_string(),
            }),
            EmptyResult::LockHeld => Err(GraphError::LockHeld),
        }
    }
}

#[async_trait]
impl StatementExecutor for GraphClient {
    async fn execute(&self, statements: Vec<Statement>) -> Result<Vec<Vec<Row>>, GraphError> {
        let mut txn = self.graph.start_txn().await?;
        let mut results = Vec::with_capacity(statements.len());

        for statement in &statements {
            let compiled = cypher::compile(statement);
            match Self::run_compiled(&mut txn, statement.kind(), &compiled).await {
                Ok(rows) => results.push(rows),
                Err(e) => {
                    tracing::warn!(
                        statement = statement.kind(),
                        error = %e,
                        "Statement failed, rolling back batch"
                    );
                    if let Err(rollback) = txn.rollback().await {
                        tracing::error!(error = %rollback, "Rollback failed");
                    }
                    return Err(e);
                }
            }
        }

        txn.commit().await?;
        tracing::debug!(statements = statements.len(), "Batch committed");
        Ok(results)
    }
}

/// Convert a neo4rs row into a [`Row`] using the compiled column list.
fn decode_row(
    row: &neo4rs::Row,
    columns: &[(&'static str, ColumnKind)],
) -> Result<Row, GraphError> {
    let mut out = Row::new();
    for (name, kind) in columns {
        let value = match kind {
            ColumnKind::Int => Value::from(row.get::<i64>(name).map_err(|e| {
                GraphError::Serialization(format!("Failed to read column {name}: {e}"))
            })?),
            ColumnKind::Bool => Value::from(row.get::<bool>(name).map_err(|e| {
                GraphError::Serialization(format!("Failed to read column {name}: {e}"))
            })?),
            ColumnKind::Text => row
                .get::<String>(name)
                .map(Value::String)
                .unwrap_or(Value::Null),
            ColumnKind::PropertyMap => {
                let raw: String = row.get(name).unwrap_or_default();
                decode_property_map(&raw)?
            }
        };
        out.insert(name, value);
    }
    Ok(out)
}

/// Parse an `apoc.convert.toJson(properties(x))` string, dropping identity keys.
fn decode_property_map(raw: &str) -> Result<Value, GraphError> {
    if raw.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let mut value: Value = serde_json::from_str(raw)
        .map_err(|e| GraphError::Serialization(format!("Failed to decode properties: {e}")))?;
    if let Value::Object(map) = &mut value {
        map.remove("id");
        map.remove("class");
    }
    Ok(value)
}
