//! lyph-store: Manifest-driven resource/relationship store over a property graph.
//!
//! Exposes the classes of a resource/relationship manifest as CRUD operations
//! and keeps the graph consistent while doing so: relationship fields are
//! synchronized with edges, deletions cascade along sustaining relationships,
//! and anchoring relationships veto deletions that would orphan anchored
//! resources.

pub mod anchor;
pub mod batch;
pub mod cascade;
pub mod config;
pub mod error;
pub mod existence;
pub mod fields;
pub mod identity;
pub mod queue;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchOperation, BatchOutcome, BatchReport, PendingEdge, PendingEdges};
pub use config::LyphConfig;
pub use error::{AnchorPair, StoreError};
pub use identity::IdentityAllocator;
pub use queue::OperationQueue;
pub use store::ResourceGraphStore;
pub use sync::{SyncMode, SyncOutcome, SyncPlan};
