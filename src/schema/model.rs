//! Typed attribute schemas and the instances that conform to them
//!
//! A [`DataModel`] names a set of typed attributes. An [`Instance`] is a concrete
//! attribute-value record checked against its model when it is built; an
//! instance that does not fit its model never exists as a value.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Errors raised while building or validating schema values
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("Duplicate attribute '{attribute}' in data model '{model}'")]
    DuplicateAttribute { model: String, attribute: String },

    #[error("Attribute '{attribute}' is not declared by data model '{model}'")]
    UnknownAttribute { model: String, attribute: String },

    #[error("Required attribute '{attribute}' of data model '{model}' has no value")]
    MissingRequired { model: String, attribute: String },

    #[error("Attribute '{attribute}' expects {expected:?} but got {actual:?}")]
    TypeMismatch {
        attribute: String,
        expected: AttributeType,
        actual: AttributeType,
    },

    #[error("Invalid constraint on '{attribute}': {message}")]
    InvalidConstraint { attribute: String, message: String },
}

/// Declared type of an attribute
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Int,
    Float,
    Bool,
    String,
    Location,
}

/// Geographic coordinate in decimal degrees
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in kilometres (haversine)
    pub fn distance_km(&self, other: &Location) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * Self::EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Typed attribute value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Location(Location),
}

impl Value {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Value::Int(_) => AttributeType::Int,
            Value::Float(_) => AttributeType::Float,
            Value::Bool(_) => AttributeType::Bool,
            Value::String(_) => AttributeType::String,
            Value::Location(_) => AttributeType::Location,
        }
    }

    /// Compare two values of the same type.
    ///
    /// Returns `None` when the types differ or the type has no ordering
    /// (locations, NaN floats). Numeric types are never coerced into each other.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Location> for Value {
    fn from(v: Location) -> Self {
        Value::Location(v)
    }
}

/// A named, typed attribute of a data model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type")]
    pub attribute_type: AttributeType,
    pub required: bool,
}

impl Attribute {
    pub fn new(name: impl Into<String>, attribute_type: AttributeType, required: bool) -> Self {
        Self {
            name: name.into(),
            attribute_type,
            required,
        }
    }
}

/// Named attribute schema. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataModel {
    name: String,
    attributes: Vec<Attribute>,
    description: String,
}

impl DataModel {
    /// Build a data model, rejecting duplicate attribute names
    pub fn new(
        name: impl Into<String>,
        attributes: Vec<Attribute>,
        description: impl Into<String>,
    ) -> Result<Self, SchemaError> {
        let model = Self {
            name: name.into(),
            attributes,
            description: description.into(),
        };
        model.validate()?;
        Ok(model)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Check attribute name uniqueness (models decoded off the wire skip `new`)
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        for attribute in &self.attributes {
            if !seen.insert(attribute.name.as_str()) {
                return Err(SchemaError::DuplicateAttribute {
                    model: self.name.clone(),
                    attribute: attribute.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Attribute values conforming to a [`DataModel`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    model: DataModel,
    values: BTreeMap<String, Value>,
}

impl Instance {
    /// Build an instance, checking every value against the model
    pub fn new<K, I>(model: DataModel, values: I) -> Result<Self, SchemaError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let instance = Self {
            model,
            values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        };
        instance.validate()?;
        Ok(instance)
    }

    pub fn model(&self) -> &DataModel {
        &self.model
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn value(&self, attribute: &str) -> Option<&Value> {
        self.values.get(attribute)
    }

    /// Re-check the instance invariants.
    ///
    /// Instances decoded from an envelope have not gone through [`Instance::new`]
    /// and must pass this before they are registered.
    pub fn validate(&self) -> Result<(), SchemaError> {
        self.model.validate()?;

        for (name, value) in &self.values {
            let attribute =
                self.model
                    .attribute(name)
                    .ok_or_else(|| SchemaError::UnknownAttribute {
                        model: self.model.name.clone(),
                        attribute: name.clone(),
                    })?;
            if attribute.attribute_type != value.attribute_type() {
                return Err(SchemaError::TypeMismatch {
                    attribute: name.clone(),
                    expected: attribute.attribute_type,
                    actual: value.attribute_type(),
                });
            }
        }

        if let Some(missing) = self
            .model
            .attributes
            .iter()
            .find(|a| a.required && !self.values.contains_key(&a.name))
        {
            return Err(SchemaError::MissingRequired {
                model: self.model.name.clone(),
                attribute: missing.name.clone(),
            });
        }

        Ok(())
    }
}
