//! lyph-core: Shared types, manifest metamodel, and configuration for the lyph graph store.
//!
//! This crate provides the foundational types used by the graph and store crates:
//! - Entity identifiers and resource references
//! - The declarative resource/relationship manifest and its validated `Metamodel`
//! - Store and logging configuration
//! - Common error types

pub mod config;
pub mod error;
pub mod manifest;
pub mod types;

pub use config::{LogConfig, StoreConfig};
pub use error::ManifestError;
pub use manifest::{Cardinality, Manifest, Metamodel, PropertyKind, RelationshipField, Side};
pub use types::{EntityId, RefId, ResourceKey, ResourceRef};
