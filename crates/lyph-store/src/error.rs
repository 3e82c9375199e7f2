//! Error types for the lyph-store crate.

use serde::Serialize;
use thiserror::Error;

use lyph_core::{EntityId, ManifestError, ResourceKey};
use lyph_graph::GraphError;

/// An edge from outside a deletion set into it that vetoes the deletion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct AnchorPair {
    pub anchoring: ResourceKey,
    pub anchored: ResourceKey,
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed or disallowed input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{class} not found: {}", join_ids(.ids))]
    NotFound { class: String, ids: Vec<EntityId> },

    /// Deletion refused; nothing was mutated.
    #[error("Deletion refused: {} node(s) anchored from outside the deletion set", .anchors.len())]
    Conflict { anchors: Vec<AnchorPair> },

    #[error("Graph error: {0}")]
    Transport(#[from] GraphError),

    #[error("Id counter lock still held after {attempts} attempts")]
    IdLockContended { attempts: u32 },

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

impl StoreError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn not_found(class: &str, ids: Vec<EntityId>) -> Self {
        Self::NotFound {
            class: class.to_string(),
            ids,
        }
    }
}

fn join_ids(ids: &[EntityId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = StoreError::not_found("LyphTemplate", vec![EntityId(4), EntityId(9)]);
        assert_eq!(err.to_string(), "LyphTemplate not found: 4, 9");

        let err = StoreError::Conflict {
            anchors: vec![AnchorPair {
                anchoring: ResourceKey::new("LyphTemplate", EntityId(3)),
                anchored: ResourceKey::new("LayerTemplate", EntityId(2)),
            }],
        };
        assert!(err.to_string().contains("1 node(s)"));
    }
}
