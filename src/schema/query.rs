//! Constraint-based queries over instances
//!
//! A [`QueryModel`] is a conjunction of [`Constraint`]s, optionally scoped to a
//! [`DataModel`]. An instance matches only when every constraint holds; a
//! constraint on an attribute the instance has no value for never holds.

use super::model::{Attribute, AttributeType, DataModel, Instance, Location, SchemaError, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Comparison operator of a [`Relation`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelationOp {
    Eq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    NotEq,
}

/// Binary comparison against a scalar
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relation {
    pub op: RelationOp,
    pub value: Value,
}

impl Relation {
    pub fn new(op: RelationOp, value: impl Into<Value>) -> Self {
        Self {
            op,
            value: value.into(),
        }
    }

    pub fn check(&self, candidate: &Value) -> bool {
        if candidate.attribute_type() != self.value.attribute_type() {
            return false;
        }
        match self.op {
            RelationOp::Eq => candidate == &self.value,
            RelationOp::NotEq => candidate != &self.value,
            op => match candidate.compare(&self.value) {
                Some(ordering) => match op {
                    RelationOp::Lt => ordering == Ordering::Less,
                    RelationOp::Gt => ordering == Ordering::Greater,
                    RelationOp::LtEq => ordering != Ordering::Greater,
                    RelationOp::GtEq => ordering != Ordering::Less,
                    RelationOp::Eq | RelationOp::NotEq => unreachable!("handled above"),
                },
                None => false,
            },
        }
    }
}

/// Membership operator of a set constraint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SetOp {
    In,
    NotIn,
}

/// How a constraint tests one attribute value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Relation(Relation),
    /// Inclusive range, both bounds of the attribute's type
    Range { min: Value, max: Value },
    Set { op: SetOp, values: Vec<Value> },
    /// Location within `max_km` of `center`
    Distance { center: Location, max_km: f64 },
}

impl ConstraintKind {
    pub fn check(&self, candidate: &Value) -> bool {
        match self {
            ConstraintKind::Relation(relation) => relation.check(candidate),
            ConstraintKind::Range { min, max } => {
                matches!(
                    candidate.compare(min),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    candidate.compare(max),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            ConstraintKind::Set { op, values } => {
                let same_type = values
                    .first()
                    .map_or(true, |v| v.attribute_type() == candidate.attribute_type());
                if !same_type {
                    return false;
                }
                let contained = values.iter().any(|v| v == candidate);
                match op {
                    SetOp::In => contained,
                    SetOp::NotIn => !contained,
                }
            }
            ConstraintKind::Distance { center, max_km } => match candidate {
                Value::Location(location) => center.distance_km(location) <= *max_km,
                _ => false,
            },
        }
    }

    /// Types of every scalar carried by the constraint
    fn operand_types(&self) -> Vec<AttributeType> {
        match self {
            ConstraintKind::Relation(relation) => vec![relation.value.attribute_type()],
            ConstraintKind::Range { min, max } => vec![min.attribute_type(), max.attribute_type()],
            ConstraintKind::Set { values, .. } => {
                values.iter().map(Value::attribute_type).collect()
            }
            ConstraintKind::Distance { .. } => vec![AttributeType::Location],
        }
    }
}

/// Constraint on a single attribute
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraint {
    pub attribute: Attribute,
    pub kind: ConstraintKind,
}

impl Constraint {
    pub fn new(attribute: Attribute, kind: ConstraintKind) -> Self {
        Self { attribute, kind }
    }

    pub fn relation(attribute: Attribute, op: RelationOp, value: impl Into<Value>) -> Self {
        Self::new(attribute, ConstraintKind::Relation(Relation::new(op, value)))
    }

    /// Evaluate against an instance. A missing value fails the constraint.
    pub fn check(&self, instance: &Instance) -> bool {
        match instance.value(&self.attribute.name) {
            Some(value) => self.kind.check(value),
            None => false,
        }
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let expected = self.attribute.attribute_type;
        let invalid = |message: String| SchemaError::InvalidConstraint {
            attribute: self.attribute.name.clone(),
            message,
        };

        if let Some(actual) = self.kind.operand_types().into_iter().find(|t| *t != expected) {
            return Err(invalid(format!(
                "operand type {actual:?} does not match attribute type {expected:?}"
            )));
        }

        match &self.kind {
            ConstraintKind::Range { .. }
                if matches!(expected, AttributeType::Bool | AttributeType::Location) =>
            {
                Err(invalid(format!("range is not defined for {expected:?}")))
            }
            ConstraintKind::Range { min, max }
                if min.compare(max) == Some(Ordering::Greater) =>
            {
                Err(invalid("range minimum is greater than maximum".to_string()))
            }
            ConstraintKind::Set { values, .. } if values.is_empty() => {
                Err(invalid("set constraint has no values".to_string()))
            }
            ConstraintKind::Distance { max_km, .. } if max_km.is_nan() || *max_km < 0.0 => {
                Err(invalid("distance must be a non-negative number".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Conjunction of constraints, optionally scoped to a data model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryModel {
    constraints: Vec<Constraint>,
    #[serde(default)]
    model: Option<DataModel>,
}

impl QueryModel {
    pub fn new(constraints: Vec<Constraint>, model: Option<DataModel>) -> Result<Self, SchemaError> {
        let query = Self { constraints, model };
        query.validate()?;
        Ok(query)
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn model(&self) -> Option<&DataModel> {
        self.model.as_ref()
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if let Some(model) = &self.model {
            model.validate()?;
        }
        for constraint in &self.constraints {
            constraint.validate()?;
            if let Some(model) = &self.model {
                if model.attribute(&constraint.attribute.name).is_none() {
                    return Err(SchemaError::UnknownAttribute {
                        model: model.name().to_string(),
                        attribute: constraint.attribute.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// True when the instance satisfies the model filter and every constraint
    pub fn check(&self, instance: &Instance) -> bool {
        if let Some(model) = &self.model {
            if model.name() != instance.model().name() {
                return false;
            }
        }
        self.constraints.iter().all(|c| c.check(instance))
    }
}
