//! Schema model and typed entity identity.
//!
//! # Responsibility
//! - Define the schema (`Model`, `EntityDef`, `AttributeDef`) a store is
//!   synchronized against.
//! - Define the attribute value representation shared by records, queries
//!   and the store engine.
//! - Bind user record types to entities through the `Record` trait and the
//!   typed `EntityId` handle.
//!
//! # Invariants
//! - Entity and attribute names are unique within a model and valid SQL
//!   identifiers; `id` is reserved for the primary key.
//! - An `EntityId` starts pending and becomes permanent exactly once, when
//!   a save obtains a store-assigned identifier.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use uuid::Uuid;

pub mod resource;

/// Storage kind of one attribute column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrKind {
    Bool,
    Int,
    Real,
    Text,
    Blob,
}

/// A single attribute value.
///
/// `Null` is the absent value for optional attributes; required attributes
/// must carry a non-null value by save time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Returns the kind this value belongs to, or `None` for `Null`.
    pub fn kind(&self) -> Option<AttrKind> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(AttrKind::Bool),
            Self::Int(_) => Some(AttrKind::Int),
            Self::Real(_) => Some(AttrKind::Real),
            Self::Text(_) => Some(AttrKind::Text),
            Self::Blob(_) => Some(AttrKind::Blob),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Real(value) => Some(*value),
            Self::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(value) => Some(value.as_slice()),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl<T> From<Option<T>> for Value
where
    Value: From<T>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Value::from)
    }
}

/// Attribute name to value map for one entity row.
pub type AttrMap = BTreeMap<String, Value>;

/// Definition of one attribute column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    pub kind: AttrKind,
    #[serde(default)]
    pub optional: bool,
}

impl AttributeDef {
    pub fn required(name: impl Into<String>, kind: AttrKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, kind: AttrKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: true,
        }
    }
}

/// Definition of one entity type (one table in the store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    pub attributes: Vec<AttributeDef>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>, attributes: Vec<AttributeDef>) -> Self {
        Self {
            name: name.into(),
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|attr| attr.name == name)
    }
}

/// Schema definition for one store: the set of entity types and their
/// attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    entities: Vec<EntityDef>,
}

impl Model {
    /// Builds and validates a model.
    ///
    /// Returns `None` (logged) when the definition is unusable: duplicate
    /// entity or attribute names, names that are not plain identifiers, or
    /// an attribute named `id`.
    pub fn new(entities: Vec<EntityDef>) -> Option<Self> {
        let mut seen_entities = HashSet::new();
        for entity in &entities {
            if !is_identifier(&entity.name) {
                log::error!(
                    "event=model_build module=model status=error detail=bad_entity_name name={}",
                    entity.name
                );
                return None;
            }
            if !seen_entities.insert(entity.name.as_str()) {
                log::error!(
                    "event=model_build module=model status=error detail=duplicate_entity name={}",
                    entity.name
                );
                return None;
            }
            let mut seen_attrs = HashSet::new();
            for attr in &entity.attributes {
                if attr.name == RESERVED_ID_ATTRIBUTE || !is_identifier(&attr.name) {
                    log::error!(
                        "event=model_build module=model status=error detail=bad_attribute_name entity={} attribute={}",
                        entity.name,
                        attr.name
                    );
                    return None;
                }
                if !seen_attrs.insert(attr.name.as_str()) {
                    log::error!(
                        "event=model_build module=model status=error detail=duplicate_attribute entity={} attribute={}",
                        entity.name,
                        attr.name
                    );
                    return None;
                }
            }
        }
        Some(Self { entities })
    }

    pub fn entities(&self) -> &[EntityDef] {
        &self.entities
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|entity| entity.name == name)
    }

    pub(crate) fn require_entity(&self, name: &str) -> Result<&EntityDef, ModelViolation> {
        self.entity(name)
            .ok_or_else(|| ModelViolation::UnknownEntity(name.to_string()))
    }

    pub(crate) fn require_attribute(
        &self,
        entity: &str,
        attribute: &str,
    ) -> Result<&AttributeDef, ModelViolation> {
        self.require_entity(entity)?
            .attribute(attribute)
            .ok_or_else(|| ModelViolation::UnknownAttribute {
                entity: entity.to_string(),
                attribute: attribute.to_string(),
            })
    }

    /// Validates one full row against the model: every attribute must be
    /// declared, carry a value of the declared kind, and required
    /// attributes must be present and non-null.
    pub(crate) fn check_record(&self, entity: &str, attrs: &AttrMap) -> Result<(), ModelViolation> {
        let def = self.require_entity(entity)?;
        for (name, value) in attrs {
            let attr = def
                .attribute(name)
                .ok_or_else(|| ModelViolation::UnknownAttribute {
                    entity: entity.to_string(),
                    attribute: name.clone(),
                })?;
            if value.is_null() {
                continue;
            }
            if value.kind() != Some(attr.kind) {
                return Err(ModelViolation::TypeMismatch {
                    entity: entity.to_string(),
                    attribute: name.clone(),
                    expected: attr.kind,
                });
            }
        }
        for attr in &def.attributes {
            if attr.optional {
                continue;
            }
            let present = attrs.get(&attr.name).is_some_and(|value| !value.is_null());
            if !present {
                return Err(ModelViolation::MissingAttribute {
                    entity: entity.to_string(),
                    attribute: attr.name.clone(),
                });
            }
        }
        Ok(())
    }
}

const RESERVED_ID_ATTRIBUTE: &str = "id";

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Violation of the model contract by a record, predicate or sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelViolation {
    UnknownEntity(String),
    UnknownAttribute { entity: String, attribute: String },
    MissingAttribute { entity: String, attribute: String },
    TypeMismatch {
        entity: String,
        attribute: String,
        expected: AttrKind,
    },
}

impl Display for ModelViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEntity(name) => write!(f, "unknown entity `{name}`"),
            Self::UnknownAttribute { entity, attribute } => {
                write!(f, "unknown attribute `{attribute}` on entity `{entity}`")
            }
            Self::MissingAttribute { entity, attribute } => {
                write!(f, "missing required attribute `{attribute}` on entity `{entity}`")
            }
            Self::TypeMismatch {
                entity,
                attribute,
                expected,
            } => write!(
                f,
                "attribute `{attribute}` on entity `{entity}` expects {expected:?}"
            ),
        }
    }
}

impl Error for ModelViolation {}

/// Failure decoding a persisted row back into a user record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    Missing(&'static str),
    Invalid {
        attribute: &'static str,
        message: String,
    },
}

impl Display for RecordError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(attribute) => write!(f, "missing attribute `{attribute}`"),
            Self::Invalid { attribute, message } => {
                write!(f, "invalid attribute `{attribute}`: {message}")
            }
        }
    }
}

impl Error for RecordError {}

/// Binds a user record type to one entity of the model.
///
/// Implementations convert between the record and its attribute map; the
/// attribute names and kinds must match the entity definition the store was
/// loaded with, which is enforced at save and query time rather than here.
pub trait Record: Clone + Send + 'static {
    /// The entity this record type persists as.
    fn entity_name() -> &'static str;

    /// Encodes the record as a full attribute row.
    fn to_attrs(&self) -> AttrMap;

    /// Decodes a persisted attribute row.
    fn from_attrs(attrs: &AttrMap) -> Result<Self, RecordError>;
}

/// Internal identity key: pending until a save obtains a permanent id.
///
/// Ordering puts permanent rows first, in id order, which gives fetches a
/// deterministic base order before any sort spec applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum IdKey {
    Permanent(i64),
    Pending(Uuid),
}

/// Typed identifier for one persisted entity of kind `E`.
///
/// Newly created entities carry a pending identifier; once the owning
/// context chain saves, the identifier maps to a permanent store-assigned
/// id, resolvable through [`crate::Context::permanent_id`]. Identifiers are
/// the only thing that may cross context boundaries; records themselves are
/// re-resolved in the target context.
pub struct EntityId<E> {
    pub(crate) key: IdKey,
    marker: PhantomData<fn() -> E>,
}

impl<E> EntityId<E> {
    pub(crate) fn new(key: IdKey) -> Self {
        Self {
            key,
            marker: PhantomData,
        }
    }

    pub(crate) fn pending() -> Self {
        Self::new(IdKey::Pending(Uuid::new_v4()))
    }

    /// Rebuilds a typed identifier from a raw permanent id, e.g. one kept
    /// across process restarts.
    pub fn from_permanent(id: i64) -> Self {
        Self::new(IdKey::Permanent(id))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self.key, IdKey::Permanent(_))
    }

    pub fn as_permanent(&self) -> Option<i64> {
        match self.key {
            IdKey::Permanent(id) => Some(id),
            IdKey::Pending(_) => None,
        }
    }
}

impl<E> Clone for EntityId<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for EntityId<E> {}

impl<E> PartialEq for EntityId<E> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<E> Eq for EntityId<E> {}

impl<E> Hash for EntityId<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<E> std::fmt::Debug for EntityId<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.key {
            IdKey::Permanent(id) => write!(f, "EntityId({id})"),
            IdKey::Pending(uuid) => write!(f, "EntityId(pending:{uuid})"),
        }
    }
}
