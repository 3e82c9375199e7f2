use thiserror::Error;

/// Errors raised while loading or validating a resource/relationship manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Manifest I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid identifier in manifest: {0:?}")]
    InvalidIdentifier(String),

    #[error("Reserved name used in manifest: {0}")]
    ReservedName(String),

    #[error("Class declared more than once: {0}")]
    DuplicateClass(String),

    #[error("Unknown class {name} referenced by {referenced_by}")]
    UnknownClass { name: String, referenced_by: String },

    #[error("Inheritance cycle through class {0}")]
    InheritanceCycle(String),

    #[error("Field {field} is declared more than once on class {class}")]
    FieldCollision { class: String, field: String },
}
