//! The declarative resource/relationship manifest and its validated form.
//!
//! A [`Manifest`] is plain data (usually loaded from JSON). [`Metamodel`]
//! validates it once and answers the structural questions the store needs:
//! class ancestry, inherited properties, relationship fields, and which
//! relationship classes sustain or anchor across which end.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// Field names every resource exposes; not available to manifests.
pub const RESERVED_FIELDS: [&str; 3] = ["id", "href", "class"];

/// Label of the singleton id counter node; not available to manifests.
pub const ID_COUNTER_LABEL: &str = "IdCounter";

// ── Manifest (input) ──────────────────────────────────────────────

/// Declarative description of every resource and relationship class.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub resources: Vec<ResourceClassSpec>,
    #[serde(default)]
    pub relationships: Vec<RelationshipClassSpec>,
}

/// A resource (node) class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceClassSpec {
    pub name: String,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyKind>,
}

/// How a property value is shaped. Arrays and objects are stored JSON-encoded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    Scalar,
    Array,
    Object,
}

/// A relationship (edge) class. Edges point from end one to end two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipClassSpec {
    pub name: String,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub symmetric: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyKind>,
    pub ends: [EndSpec; 2],
}

impl RelationshipClassSpec {
    pub fn end(&self, side: Side) -> &EndSpec {
        &self.ends[side.index()]
    }

    /// A symmetric relationship exposing the same key on both ends declares
    /// the field once, through end one.
    fn is_mirrored(&self, side: Side) -> bool {
        side == Side::Two && self.symmetric && self.ends[0].key == self.ends[1].key
    }
}

/// One end of a relationship class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndSpec {
    /// Resource class sitting at this end.
    pub class: String,
    /// How many edges of this class a resource at this end may have.
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Name of the relationship field exposed on the resource at this end.
    #[serde(default)]
    pub key: Option<String>,
    /// The node at this end keeps the node at the other end alive.
    #[serde(default)]
    pub sustains: bool,
    /// The node at this end anchors the node at the other end.
    #[serde(default)]
    pub anchors: bool,
    #[serde(default)]
    pub shortcut_key: Option<String>,
    #[serde(default)]
    pub index_field_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    #[default]
    Many,
}

/// Relationship end number.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    One,
    Two,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::One, Side::Two];

    pub fn index(self) -> usize {
        match self {
            Side::One => 0,
            Side::Two => 1,
        }
    }

    pub fn other(self) -> Side {
        match self {
            Side::One => Side::Two,
            Side::Two => Side::One,
        }
    }
}

// ── Metamodel (validated) ─────────────────────────────────────────

/// A relationship-typed field of a resource class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipField {
    pub name: String,
    /// Relationship class bound by the field (possibly abstract).
    pub relationship: String,
    /// End at which the owning resource sits.
    pub side: Side,
    pub cardinality: Cardinality,
    /// Resource class at the other end.
    pub codomain: String,
    /// Bound to an abstract relationship: an alias of a broader relationship,
    /// projected on reads but never used to mutate edges.
    pub is_alias: bool,
    pub symmetric: bool,
}

/// Validated manifest with lookup helpers.
#[derive(Debug, Clone)]
pub struct Metamodel {
    resources: BTreeMap<String, ResourceClassSpec>,
    relationships: BTreeMap<String, RelationshipClassSpec>,
}

impl Metamodel {
    /// Validate a manifest.
    pub fn from_manifest(manifest: Manifest) -> Result<Self, ManifestError> {
        let mut resources = BTreeMap::new();
        for class in manifest.resources {
            check_class_name(&class.name)?;
            for prop in class.properties.keys() {
                check_field_name(prop)?;
            }
            let name = class.name.clone();
            if resources.insert(name.clone(), class).is_some() {
                return Err(ManifestError::DuplicateClass(name));
            }
        }

        let mut relationships = BTreeMap::new();
        for class in manifest.relationships {
            check_class_name(&class.name)?;
            if resources.contains_key(&class.name) {
                return Err(ManifestError::DuplicateClass(class.name));
            }
            for prop in class.properties.keys() {
                check_field_name(prop)?;
            }
            for end in &class.ends {
                if !resources.contains_key(&end.class) {
                    return Err(ManifestError::UnknownClass {
                        name: end.class.clone(),
                        referenced_by: class.name.clone(),
                    });
                }
                if let Some(key) = &end.key {
                    check_field_name(key)?;
                }
            }
            let name = class.name.clone();
            if relationships.insert(name.clone(), class).is_some() {
                return Err(ManifestError::DuplicateClass(name));
            }
        }

        let model = Self {
            resources,
            relationships,
        };
        model.check_hierarchy()?;
        model.check_field_collisions()?;

        tracing::debug!(
            resources = model.resources.len(),
            relationships = model.relationships.len(),
            "Manifest validated"
        );
        Ok(model)
    }

    /// Parse and validate a JSON manifest.
    pub fn from_json_str(json: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_str(json)?;
        Self::from_manifest(manifest)
    }

    /// Read, parse, and validate a JSON manifest file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    // ── Classes ──────────────────────────────────────────────────

    pub fn resource_class(&self, name: &str) -> Option<&ResourceClassSpec> {
        self.resources.get(name)
    }

    pub fn relationship_class(&self, name: &str) -> Option<&RelationshipClassSpec> {
        self.relationships.get(name)
    }

    pub fn resource_classes(&self) -> impl Iterator<Item = &ResourceClassSpec> {
        self.resources.values()
    }

    pub fn relationship_classes(&self) -> impl Iterator<Item = &RelationshipClassSpec> {
        self.relationships.values()
    }

    /// The class followed by all of its superclasses, nearest first.
    ///
    /// These are the labels carried by a node of that class.
    pub fn resource_ancestry(&self, name: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = self.resources.get(name);
        while let Some(class) = current {
            chain.push(class.name.clone());
            current = class
                .extends
                .as_deref()
                .and_then(|parent| self.resources.get(parent));
        }
        chain
    }

    /// Whether `sub` is `sup` or one of its (transitive) subclasses.
    pub fn is_resource_subclass(&self, sub: &str, sup: &str) -> bool {
        self.resource_ancestry(sub).iter().any(|c| c == sup)
    }

    pub fn is_relationship_subclass(&self, sub: &str, sup: &str) -> bool {
        let mut current = self.relationships.get(sub);
        while let Some(class) = current {
            if class.name == sup {
                return true;
            }
            current = class
                .extends
                .as_deref()
                .and_then(|parent| self.relationships.get(parent));
        }
        false
    }

    pub fn is_concrete_resource(&self, name: &str) -> bool {
        self.resources.get(name).is_some_and(|c| !c.is_abstract)
    }

    /// Concrete relationship classes that are `name` or one of its subclasses.
    ///
    /// Edges only ever carry concrete classes, so this is the set of edge
    /// classes a field bound to `name` can see.
    pub fn concrete_relationships_under(&self, name: &str) -> Vec<String> {
        self.relationships
            .values()
            .filter(|r| !r.is_abstract && self.is_relationship_subclass(&r.name, name))
            .map(|r| r.name.clone())
            .collect()
    }

    // ── Fields ───────────────────────────────────────────────────

    /// Scalar/array/object properties of a class, including inherited ones.
    pub fn properties(&self, class: &str) -> BTreeMap<String, PropertyKind> {
        let mut props = BTreeMap::new();
        for name in self.resource_ancestry(class).iter().rev() {
            if let Some(spec) = self.resources.get(name) {
                props.extend(spec.properties.iter().map(|(k, v)| (k.clone(), *v)));
            }
        }
        props
    }

    /// Properties of a relationship class, including inherited ones.
    pub fn relationship_properties(&self, name: &str) -> BTreeMap<String, PropertyKind> {
        let mut chain = Vec::new();
        let mut current = self.relationships.get(name);
        while let Some(class) = current {
            chain.push(class);
            current = class
                .extends
                .as_deref()
                .and_then(|parent| self.relationships.get(parent));
        }
        let mut props = BTreeMap::new();
        for class in chain.into_iter().rev() {
            props.extend(class.properties.iter().map(|(k, v)| (k.clone(), *v)));
        }
        props
    }

    /// Relationship fields of a class, including those inherited from superclasses.
    pub fn relationship_fields(&self, class: &str) -> BTreeMap<String, RelationshipField> {
        let mut fields = BTreeMap::new();
        for rel in self.relationships.values() {
            for side in Side::BOTH {
                if rel.is_mirrored(side) {
                    continue;
                }
                let end = rel.end(side);
                let Some(key) = &end.key else { continue };
                if !self.is_resource_subclass(class, &end.class) {
                    continue;
                }
                fields.insert(
                    key.clone(),
                    RelationshipField {
                        name: key.clone(),
                        relationship: rel.name.clone(),
                        side,
                        cardinality: end.cardinality,
                        codomain: rel.end(side.other()).class.clone(),
                        is_alias: rel.is_abstract,
                        symmetric: rel.symmetric,
                    },
                );
            }
        }
        fields
    }

    // ── Lifecycle flags ──────────────────────────────────────────

    /// Concrete relationship classes whose end `side` sustains the other end.
    pub fn sustaining_relationships(&self, side: Side) -> Vec<String> {
        self.relationships
            .values()
            .filter(|r| !r.is_abstract && r.end(side).sustains)
            .map(|r| r.name.clone())
            .collect()
    }

    /// Concrete relationship classes whose end `side` anchors the other end.
    pub fn anchoring_relationships(&self, side: Side) -> Vec<String> {
        self.relationships
            .values()
            .filter(|r| !r.is_abstract && r.end(side).anchors)
            .map(|r| r.name.clone())
            .collect()
    }

    // ── Validation ───────────────────────────────────────────────

    fn check_hierarchy(&self) -> Result<(), ManifestError> {
        for class in self.resources.values() {
            let mut seen = BTreeSet::new();
            let mut current = Some(class);
            while let Some(c) = current {
                if !seen.insert(c.name.as_str()) {
                    return Err(ManifestError::InheritanceCycle(class.name.clone()));
                }
                current = match &c.extends {
                    Some(parent) => Some(self.resources.get(parent).ok_or_else(|| {
                        ManifestError::UnknownClass {
                            name: parent.clone(),
                            referenced_by: c.name.clone(),
                        }
                    })?),
                    None => None,
                };
            }
        }

        for class in self.relationships.values() {
            let mut seen = BTreeSet::new();
            let mut current = Some(class);
            while let Some(c) = current {
                if !seen.insert(c.name.as_str()) {
                    return Err(ManifestError::InheritanceCycle(class.name.clone()));
                }
                current = match &c.extends {
                    Some(parent) => Some(self.relationships.get(parent).ok_or_else(|| {
                        ManifestError::UnknownClass {
                            name: parent.clone(),
                            referenced_by: c.name.clone(),
                        }
                    })?),
                    None => None,
                };
            }
        }
        Ok(())
    }

    fn check_field_collisions(&self) -> Result<(), ManifestError> {
        for class in self.resources.keys() {
            let props = self.properties(class);
            let mut seen: BTreeSet<String> = props.keys().cloned().collect();
            for rel in self.relationships.values() {
                for side in Side::BOTH {
                    if rel.is_mirrored(side) {
                        continue;
                    }
                    let end = rel.end(side);
                    let Some(key) = &end.key else { continue };
                    if !self.is_resource_subclass(class, &end.class) {
                        continue;
                    }
                    if !seen.insert(key.clone()) {
                        return Err(ManifestError::FieldCollision {
                            class: class.clone(),
                            field: key.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Class names end up as Cypher labels and relationship types.
fn check_class_name(name: &str) -> Result<(), ManifestError> {
    if !is_identifier(name) {
        return Err(ManifestError::InvalidIdentifier(name.to_string()));
    }
    if name == ID_COUNTER_LABEL {
        return Err(ManifestError::ReservedName(name.to_string()));
    }
    Ok(())
}

fn check_field_name(name: &str) -> Result<(), ManifestError> {
    if !is_identifier(name) {
        return Err(ManifestError::InvalidIdentifier(name.to_string()));
    }
    if RESERVED_FIELDS.contains(&name) {
        return Err(ManifestError::ReservedName(name.to_string()));
    }
    Ok(())
}
