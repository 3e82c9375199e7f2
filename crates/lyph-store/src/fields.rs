//! Normalization of raw JSON field maps at the store boundary.
//!
//! Callers hand the store a JSON object per write. This module splits it into
//! property values (checked against the declared [`PropertyKind`]) and
//! relationship references ([`Reference`]), so the algorithms never see
//! untyped values.

use std::collections::BTreeMap;

use serde_json::Value;

use lyph_core::types::parse_href;
use lyph_core::{EntityId, Metamodel, PropertyKind, RefId, ResourceRef};
use lyph_graph::Properties;

use crate::error::{Result, StoreError};

/// A reference supplied in a relationship field, with the properties of the
/// edge it asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub target: ResourceRef,
    pub properties: Properties,
}

/// A normalized resource field map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceFields {
    /// Caller-supplied id (create only).
    pub id: Option<EntityId>,
    /// Declared properties; `null` clears.
    pub properties: Properties,
    /// Relationship field name → supplied references, nulls dropped.
    pub relationships: BTreeMap<String, Vec<Reference>>,
}

/// A normalized relationship field map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationshipFields {
    pub id: Option<EntityId>,
    pub properties: Properties,
}

/// Whether the write creates the entity; only creates honour `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Create,
    Modify,
}

pub fn parse_resource_fields(
    model: &Metamodel,
    class: &str,
    raw: &Properties,
    intent: Intent,
) -> Result<ResourceFields> {
    let kinds = model.properties(class);
    let rel_fields = model.relationship_fields(class);
    let mut out = ResourceFields::default();

    for (name, value) in raw {
        match name.as_str() {
            "id" => out.id = reserved_id(value, intent)?,
            "href" | "class" => {}
            _ => {
                if let Some(kind) = kinds.get(name) {
                    check_kind(name, *kind, value)?;
                    out.properties.insert(name.clone(), value.clone());
                } else if let Some(field) = rel_fields.get(name) {
                    let default_class = model
                        .is_concrete_resource(&field.codomain)
                        .then_some(field.codomain.as_str());
                    let refs = parse_references(name, value, default_class)?;
                    out.relationships.insert(name.clone(), refs);
                } else {
                    return Err(StoreError::validation(format!(
                        "{class} has no field named '{name}'"
                    )));
                }
            }
        }
    }
    Ok(out)
}

pub fn parse_relationship_fields(
    model: &Metamodel,
    class: &str,
    raw: &Properties,
    intent: Intent,
) -> Result<RelationshipFields> {
    let kinds = model.relationship_properties(class);
    let mut out = RelationshipFields::default();

    for (name, value) in raw {
        match name.as_str() {
            "id" => out.id = reserved_id(value, intent)?,
            "href" | "class" | "1" | "2" => {}
            _ => {
                let kind = kinds.get(name).ok_or_else(|| {
                    StoreError::validation(format!("{class} has no property named '{name}'"))
                })?;
                check_kind(name, *kind, value)?;
                out.properties.insert(name.clone(), value.clone());
            }
        }
    }
    Ok(out)
}

/// Parse every value supplied for one relationship field.
///
/// A single value and an array are both accepted; `null` entries are skipped.
pub fn parse_references(
    field: &str,
    value: &Value,
    default_class: Option<&str>,
) -> Result<Vec<Reference>> {
    let values: Vec<&Value> = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().filter(|v| !v.is_null()).collect(),
        other => vec![other],
    };
    values
        .into_iter()
        .map(|v| {
            parse_reference(v, default_class).ok_or_else(|| {
                StoreError::validation(format!("field '{field}' has a malformed reference: {v}"))
            })
        })
        .collect()
}

/// Accepted forms: an integer id, a numeric string, an href
/// (`.../{Class}/{id}`), `#name` for a batch placeholder, or an object with
/// `id`, `href`, `class`, `placeholder` and `properties` keys.
pub fn parse_reference(value: &Value, default_class: Option<&str>) -> Option<Reference> {
    let (id, explicit_class, properties) = match value {
        Value::Object(map) => {
            let href = match map.get("href") {
                Some(Value::String(h)) => Some(parse_href(h)?),
                Some(_) => return None,
                None => None,
            };
            let id = match (map.get("placeholder"), map.get("id")) {
                (Some(Value::String(name)), _) if !name.is_empty() => {
                    RefId::Placeholder(name.trim_start_matches('#').to_string())
                }
                (Some(_), _) => return None,
                (None, Some(id)) => RefId::Assigned(scalar_id(id)?),
                (None, None) => RefId::Assigned(href.as_ref()?.1),
            };
            let class = match (map.get("class"), &href) {
                (Some(Value::String(c)), Some((href_class, _))) if c != href_class => return None,
                (Some(Value::String(c)), _) => Some(c.clone()),
                (Some(_), _) => return None,
                (None, Some((href_class, _))) => Some(href_class.clone()),
                (None, None) => None,
            };
            let properties = match map.get("properties") {
                Some(Value::Object(props)) => props.clone(),
                Some(Value::Null) | None => Properties::new(),
                Some(_) => return None,
            };
            (id, class, properties)
        }
        Value::String(s) if s.starts_with('#') => {
            let name = &s[1..];
            if name.is_empty() {
                return None;
            }
            (RefId::Placeholder(name.to_string()), None, Properties::new())
        }
        Value::String(s) => match s.parse::<i64>() {
            Ok(n) => (RefId::Assigned(EntityId(n)), None, Properties::new()),
            Err(_) => {
                let (class, id) = parse_href(s)?;
                (RefId::Assigned(id), Some(class), Properties::new())
            }
        },
        Value::Number(_) => (
            RefId::Assigned(scalar_id(value)?),
            None,
            Properties::new(),
        ),
        _ => return None,
    };

    Some(Reference {
        target: ResourceRef {
            id,
            class: explicit_class.or_else(|| default_class.map(str::to_string)),
        },
        properties,
    })
}

fn scalar_id(value: &Value) -> Option<EntityId> {
    match value {
        Value::Number(n) => n.as_i64().map(EntityId),
        Value::String(s) => s.parse().ok().map(EntityId),
        _ => None,
    }
}

fn reserved_id(value: &Value, intent: Intent) -> Result<Option<EntityId>> {
    if intent == Intent::Modify || value.is_null() {
        return Ok(None);
    }
    match scalar_id(value) {
        Some(id) if id.0 > 0 => Ok(Some(id)),
        _ => Err(StoreError::validation(format!("'id' must be a positive integer, got {value}"))),
    }
}

fn check_kind(name: &str, kind: PropertyKind, value: &Value) -> Result<()> {
    let ok = match (kind, value) {
        (_, Value::Null) => true,
        (PropertyKind::Scalar, v) => !v.is_array() && !v.is_object(),
        (PropertyKind::Array, v) => v.is_array(),
        (PropertyKind::Object, v) => v.is_object(),
    };
    if ok {
        Ok(())
    } else {
        Err(StoreError::validation(format!(
            "property '{name}' expects a {kind:?} value, got {value}"
        )))
    }
}

/// Turn stored property values back into their declared shape.
///
/// Neo4j keeps arrays and objects as JSON strings.
pub fn decode_properties(
    mut properties: Properties,
    kinds: &BTreeMap<String, PropertyKind>,
) -> Properties {
    for (name, value) in properties.iter_mut() {
        let Some(kind) = kinds.get(name) else { continue };
        if *kind == PropertyKind::Scalar {
            continue;
        }
        if let Value::String(raw) = value {
            if let Ok(decoded) = serde_json::from_str::<Value>(raw) {
                *value = decoded;
            }
        }
    }
    properties
}
