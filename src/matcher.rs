use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;

use crate::error::StoreError;
use crate::event::Event;

/// Where a clause looks its field up: the event metadata map or the payload
/// object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Metadata,
    Payload,
}

/// Comparison operation of a single match clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Equals,
    NotEquals,
    LowerThan,
    LowerThanEquals,
    GreaterThan,
    GreaterThanEquals,
    In,
    NotIn,
    Regex,
}

/// One predicate of a [`MetadataMatcher`].
#[derive(Debug, Clone)]
pub struct MatchClause {
    pub field: String,
    pub value: Value,
    pub operation: Operation,
    pub field_type: FieldType,
    pattern: Option<Regex>,
}

/// Conjunctive predicate tree over event metadata and payload fields.
///
/// Clauses are joined by logical AND; an empty matcher matches every event.
/// Operand validation happens at construction so evaluation is pure and
/// never fails: a missing field, a type mismatch, or an unsupported
/// comparison simply evaluates the clause to false.
#[derive(Debug, Clone, Default)]
pub struct MetadataMatcher {
    clauses: Vec<MatchClause>,
}

impl MetadataMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a clause, validating the operand against the operation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidMatcher`] when the field name is empty,
    /// the `Regex` operand is not a valid pattern string, or the `In`/`NotIn`
    /// operand is not an array.
    pub fn with(
        mut self,
        field: impl Into<String>,
        operation: Operation,
        value: Value,
        field_type: FieldType,
    ) -> Result<Self, StoreError> {
        let field = field.into();
        if field.is_empty() {
            return Err(StoreError::InvalidMatcher("field name must not be empty".into()));
        }

        let pattern = match operation {
            Operation::Regex => {
                let raw = value.as_str().ok_or_else(|| {
                    StoreError::InvalidMatcher(format!("regex operand for `{field}` must be a string"))
                })?;
                // The pattern is taken verbatim. Anchoring is the caller's call.
                Some(Regex::new(raw).map_err(|err| {
                    StoreError::InvalidMatcher(format!("invalid regex for `{field}`: {err}"))
                })?)
            }
            Operation::In | Operation::NotIn => {
                if !value.is_array() {
                    return Err(StoreError::InvalidMatcher(format!(
                        "operand for `{field}` must be an array"
                    )));
                }
                None
            }
            _ => None,
        };

        self.clauses.push(MatchClause {
            field,
            value,
            operation,
            field_type,
            pattern,
        });
        Ok(self)
    }

    pub fn clauses(&self) -> &[MatchClause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Evaluates every clause against the event. AND semantics.
    pub fn matches(&self, event: &Event) -> bool {
        self.clauses.iter().all(|clause| clause.matches(event))
    }
}

impl MatchClause {
    fn matches(&self, event: &Event) -> bool {
        let field = match self.field_type {
            FieldType::Metadata => event.metadata.get(&self.field),
            FieldType::Payload => event.payload.get(&self.field),
        };
        let Some(field) = field else {
            return false;
        };

        match self.operation {
            Operation::Equals => field == &self.value,
            Operation::NotEquals => field != &self.value,
            Operation::LowerThan => matches!(compare(field, &self.value), Some(Ordering::Less)),
            Operation::LowerThanEquals => {
                matches!(compare(field, &self.value), Some(Ordering::Less | Ordering::Equal))
            }
            Operation::GreaterThan => matches!(compare(field, &self.value), Some(Ordering::Greater)),
            Operation::GreaterThanEquals => {
                matches!(compare(field, &self.value), Some(Ordering::Greater | Ordering::Equal))
            }
            Operation::In => contains(&self.value, field),
            Operation::NotIn => !contains(&self.value, field),
            Operation::Regex => match (field.as_str(), &self.pattern) {
                (Some(text), Some(pattern)) => pattern.is_match(text),
                _ => false,
            },
        }
    }
}

/// Natural ordering for numbers, lexicographic for strings. Booleans and
/// mixed types do not order.
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn contains(operand: &Value, field: &Value) -> bool {
    operand
        .as_array()
        .is_some_and(|candidates| candidates.iter().any(|candidate| candidate == field))
}
