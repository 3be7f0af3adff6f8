//! Data model: typed attribute schemas, instances and queries
//!
//! Pure value types with no dependency on the rest of the broker.

pub mod model;
pub mod query;

pub use model::{Attribute, AttributeType, DataModel, Instance, Location, SchemaError, Value};
pub use query::{Constraint, ConstraintKind, QueryModel, Relation, RelationOp, SetOp};
