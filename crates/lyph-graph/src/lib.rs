//! Lyph Graph — statement algebra and executors for the lyph graph store.
//!
//! Graph-consistency logic never builds query text. It describes what it
//! needs as [`Statement`]s ("match edges of these relationship classes in
//! this direction") and hands batches of them to a [`StatementExecutor`].
//! Two executors are provided: [`GraphClient`] compiles statements to Cypher
//! and runs each batch in one Neo4j transaction, and [`MemoryGraph`]
//! evaluates them in process.

pub mod client;
pub mod cypher;
pub mod executor;
pub mod memory;
pub mod statement;

pub use client::{GraphClient, GraphConfig, GraphError};
pub use executor::StatementExecutor;
pub use memory::MemoryGraph;
pub use statement::{Direction, EdgePattern, IdFilter, Properties, PropertyMode, Row, Statement};
