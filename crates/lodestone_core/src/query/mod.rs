//! Fetch request construction and evaluation.
//!
//! # Responsibility
//! - Define the typed predicate / sort / limit surface of fetch requests.
//! - Validate requests against the model before execution.
//! - Evaluate predicates and orderings over attribute rows.
//!
//! # Invariants
//! - Requests are constructed fresh per call and never retained by the
//!   library.
//! - A request that references an undeclared attribute fails validation
//!   with a `QueryError` instead of matching nothing.

use crate::model::{AttrKind, AttrMap, IdKey, Model, ModelViolation, Value};
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type QueryResult<T> = Result<T, QueryError>;

/// Failure executing a count / exists / fetch operation.
#[derive(Debug)]
pub enum QueryError {
    Model(ModelViolation),
    InvalidData { entity: String, message: String },
    Db(rusqlite::Error),
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model(violation) => write!(f, "{violation}"),
            Self::InvalidData { entity, message } => {
                write!(f, "invalid persisted row for entity `{entity}`: {message}")
            }
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for QueryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Model(violation) => Some(violation),
            Self::InvalidData { .. } => None,
            Self::Db(err) => Some(err),
        }
    }
}

impl From<ModelViolation> for QueryError {
    fn from(value: ModelViolation) -> Self {
        Self::Model(value)
    }
}

impl From<rusqlite::Error> for QueryError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(value)
    }
}

/// Comparison operator for attribute predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Typed predicate over one entity's attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every row.
    All,
    Compare {
        attribute: String,
        op: CompareOp,
        value: Value,
    },
    Contains {
        attribute: String,
        needle: String,
        ignore_case: bool,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn cmp(attribute: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            attribute: attribute.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(attribute, CompareOp::Eq, value)
    }

    pub fn ne(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(attribute, CompareOp::Ne, value)
    }

    pub fn lt(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(attribute, CompareOp::Lt, value)
    }

    pub fn gt(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(attribute, CompareOp::Gt, value)
    }

    /// Case-sensitive substring match on a text attribute.
    pub fn contains(attribute: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::Contains {
            attribute: attribute.into(),
            needle: needle.into(),
            ignore_case: false,
        }
    }

    /// Case-insensitive substring match on a text attribute.
    pub fn contains_ci(attribute: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::Contains {
            attribute: attribute.into(),
            needle: needle.into(),
            ignore_case: true,
        }
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Self::And(predicates)
    }

    pub fn or(predicates: Vec<Predicate>) -> Self {
        Self::Or(predicates)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(predicate: Predicate) -> Self {
        Self::Not(Box::new(predicate))
    }

    pub(crate) fn validate(&self, model: &Model, entity: &str) -> Result<(), ModelViolation> {
        match self {
            Self::All => Ok(()),
            Self::Compare {
                attribute, value, ..
            } => {
                let def = model.require_attribute(entity, attribute)?;
                if compatible(value, def.kind) {
                    Ok(())
                } else {
                    Err(ModelViolation::TypeMismatch {
                        entity: entity.to_string(),
                        attribute: attribute.clone(),
                        expected: def.kind,
                    })
                }
            }
            Self::Contains { attribute, .. } => {
                let def = model.require_attribute(entity, attribute)?;
                if def.kind == AttrKind::Text {
                    Ok(())
                } else {
                    Err(ModelViolation::TypeMismatch {
                        entity: entity.to_string(),
                        attribute: attribute.clone(),
                        expected: AttrKind::Text,
                    })
                }
            }
            Self::And(predicates) | Self::Or(predicates) => {
                for predicate in predicates {
                    predicate.validate(model, entity)?;
                }
                Ok(())
            }
            Self::Not(predicate) => predicate.validate(model, entity),
        }
    }

    pub(crate) fn matches(&self, attrs: &AttrMap) -> bool {
        match self {
            Self::All => true,
            Self::Compare {
                attribute,
                op,
                value,
            } => {
                let actual = attrs.get(attribute).unwrap_or(&Value::Null);
                match op {
                    CompareOp::Eq => value_eq(actual, value),
                    CompareOp::Ne => !value_eq(actual, value),
                    CompareOp::Lt => matches!(value_partial_cmp(actual, value), Some(Ordering::Less)),
                    CompareOp::Le => matches!(
                        value_partial_cmp(actual, value),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    CompareOp::Gt => {
                        matches!(value_partial_cmp(actual, value), Some(Ordering::Greater))
                    }
                    CompareOp::Ge => matches!(
                        value_partial_cmp(actual, value),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                }
            }
            Self::Contains {
                attribute,
                needle,
                ignore_case,
            } => match attrs.get(attribute).and_then(Value::as_text) {
                Some(text) if *ignore_case => {
                    text.to_lowercase().contains(&needle.to_lowercase())
                }
                Some(text) => text.contains(needle.as_str()),
                None => false,
            },
            Self::And(predicates) => predicates.iter().all(|p| p.matches(attrs)),
            Self::Or(predicates) => predicates.iter().any(|p| p.matches(attrs)),
            Self::Not(predicate) => !predicate.matches(attrs),
        }
    }
}

fn compatible(value: &Value, kind: AttrKind) -> bool {
    match value.kind() {
        None => true,
        Some(value_kind) if value_kind == kind => true,
        // Numeric comparisons may mix int literals with real attributes.
        Some(AttrKind::Int) => kind == AttrKind::Real,
        Some(AttrKind::Real) => kind == AttrKind::Int,
        Some(_) => false,
    }
}

/// One sort key; later keys break ties of earlier ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub attribute: String,
    pub ascending: bool,
}

impl SortSpec {
    pub fn asc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ascending: true,
        }
    }

    pub fn desc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ascending: false,
        }
    }
}

/// One read query over one entity type.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub predicate: Option<Predicate>,
    pub sort: Vec<SortSpec>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl FetchRequest {
    /// Request matching every row, in stable id order.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matching(predicate: Predicate) -> Self {
        Self {
            predicate: Some(predicate),
            ..Self::default()
        }
    }

    pub fn sorted_by(mut self, sort: Vec<SortSpec>) -> Self {
        self.sort = sort;
        self
    }

    pub fn limited(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn validate(&self, model: &Model, entity: &str) -> Result<(), ModelViolation> {
        if let Some(predicate) = &self.predicate {
            predicate.validate(model, entity)?;
        }
        for spec in &self.sort {
            model.require_attribute(entity, &spec.attribute)?;
        }
        Ok(())
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(v) => Some(*v as f64),
        Value::Real(v) => Some(*v),
        _ => None,
    }
}

pub(crate) fn value_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x == y;
    }
    a == b
}

/// `None` when the two values are not comparable (null or mixed kinds);
/// ordering predicates treat that as a non-match.
pub(crate) fn value_partial_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Blob(x), Value::Blob(y)) => Some(x.cmp(y)),
        _ => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Real(_) => 2,
        Value::Text(_) => 3,
        Value::Blob(_) => 4,
    }
}

/// Total order used for sorting: nulls first, then by kind, then by value.
pub(crate) fn value_sort_cmp(a: &Value, b: &Value) -> Ordering {
    value_partial_cmp(a, b).unwrap_or_else(|| kind_rank(a).cmp(&kind_rank(b)))
}

/// Sorts rows by the given sort keys, falling back to the stable row key
/// order so fetches stay deterministic.
pub(crate) fn order_rows(rows: &mut [(IdKey, AttrMap)], sort: &[SortSpec]) {
    rows.sort_by(|(left_key, left), (right_key, right)| {
        for spec in sort {
            let a = left.get(&spec.attribute).unwrap_or(&Value::Null);
            let b = right.get(&spec.attribute).unwrap_or(&Value::Null);
            let ordering = if spec.ascending {
                value_sort_cmp(a, b)
            } else {
                value_sort_cmp(b, a)
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        left_key.cmp(right_key)
    });
}
