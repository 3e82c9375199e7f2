//! CLI entry point for the lyph resource graph store.
//!
//! Field maps and batches are read as JSON from stdin; results are written as
//! JSON to stdout. Logs go to stderr.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use lyph_core::{EntityId, LogConfig, Metamodel};
use lyph_graph::{GraphClient, Properties};
use lyph_store::{BatchOperation, ResourceGraphStore};

#[derive(Parser)]
#[command(name = "lyph")]
#[command(about = "Manifest-driven resource/relationship store over Neo4j")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file prefix (default: lyph).
    #[arg(short, long, default_value = "lyph", global = true)]
    config: String,

    /// Manifest path, overriding `store.manifest` from config.
    #[arg(long, global = true)]
    manifest: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Create id constraints and the id counter node.
    Init,
    /// Create a resource (field map JSON on stdin).
    Create { class: String },
    /// Print one resource, or every resource of the class when no id is given.
    Get { class: String, id: Option<i64> },
    /// Merge fields into a resource (field map JSON on stdin).
    Update { class: String, id: i64 },
    /// Replace a resource's fields (field map JSON on stdin).
    Replace { class: String, id: i64 },
    /// Delete a resource and everything it sustains.
    Delete { class: String, id: i64 },
    /// Create a relationship from end one to end two (optional property map on stdin).
    Relate {
        class: String,
        /// Class of the end-one resource.
        #[arg(long)]
        from_class: String,
        #[arg(long)]
        from: i64,
        /// Class of the end-two resource.
        #[arg(long)]
        to_class: String,
        #[arg(long)]
        to: i64,
    },
    /// Fail unless every id is a resource of the class.
    Check { class: String, ids: Vec<i64> },
    /// Run a batch of operations (JSON array on stdin).
    Batch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = lyph_store::config::load(&cli.config)?;
    init_tracing(&config.log);

    let manifest_path = cli.manifest.as_deref().unwrap_or(&config.store.manifest);
    let model = Arc::new(Metamodel::from_path(manifest_path)?);
    tracing::info!(manifest = %manifest_path, "Manifest loaded");

    let graph = GraphClient::connect(&config.neo4j).await?;

    if let Command::Init = cli.command {
        let roots: Vec<String> = model
            .resource_classes()
            .filter(|c| c.extends.is_none())
            .map(|c| c.name.clone())
            .collect();
        graph.ensure_schema(&roots).await?;
        println!("{}", json!({ "initialized": roots }));
        return Ok(());
    }

    let store = ResourceGraphStore::new(graph, model, &config.store);

    match cli.command {
        Command::Init => {}
        Command::Create { ref class } => {
            let id = store.create_resource(class, &read_fields()?).await?;
            println!("{}", store.get_resource(class, id).await?);
        }
        Command::Get { ref class, id } => {
            let value = match id {
                Some(id) => store.get_resource(class, EntityId(id)).await?,
                None => serde_json::Value::Array(store.get_all_resources(class).await?),
            };
            println!("{}", serde_json::to_string(&value)?);
        }
        Command::Update { ref class, id } => {
            store.update_resource(class, EntityId(id), &read_fields()?).await?;
            println!("{}", store.get_resource(class, EntityId(id)).await?);
        }
        Command::Replace { ref class, id } => {
            store.replace_resource(class, EntityId(id), &read_fields()?).await?;
            println!("{}", store.get_resource(class, EntityId(id)).await?);
        }
        Command::Delete { ref class, id } => {
            let deleted = store.delete_resource(class, EntityId(id)).await?;
            println!("{}", serde_json::to_string(&deleted)?);
        }
        Command::Relate {
            ref class,
            ref from_class,
            from,
            ref to_class,
            to,
        } => {
            let id = store
                .create_relationship(
                    class,
                    from_class,
                    to_class,
                    EntityId(from),
                    EntityId(to),
                    &read_fields()?,
                )
                .await?;
            println!("{}", store.get_relationship(class, id).await?);
        }
        Command::Check { ref class, ref ids } => {
            let ids: Vec<EntityId> = ids.iter().copied().map(EntityId).collect();
            store.assert_resources_exist(class, &ids).await?;
            println!("{}", json!({ "exists": true, "count": ids.len() }));
        }
        Command::Batch => {
            let input = std::io::read_to_string(std::io::stdin())?;
            let operations: Vec<BatchOperation> = serde_json::from_str(&input)?;
            let report = store.execute_batch(operations).await?;
            println!("{}", serde_json::to_string(&report)?);
        }
    }

    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    if log.json {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }
}

/// A JSON object from stdin; empty input is an empty map.
fn read_fields() -> anyhow::Result<Properties> {
    let input = std::io::read_to_string(std::io::stdin())?;
    if input.trim().is_empty() {
        return Ok(Properties::new());
    }
    match serde_json::from_str(&input)? {
        serde_json::Value::Object(map) => Ok(map),
        other => anyhow::bail!("Expected a JSON object on stdin, got {other}"),
    }
}
