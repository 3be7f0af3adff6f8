//! OEF core - agent communication broker
//!
//! Agents connect over TCP, advertise searchable descriptions of themselves
//! and the services they offer, discover each other by structured query, and
//! negotiate through a FIPA-style CFP → propose → accept/decline exchange
//! relayed by the broker.
//!
//! # Overview
//!
//! - [`schema`]: data models, instances and constraint queries
//! - [`directory`]: service and identity registrations answering queries
//! - [`scheduler`]: the single ordered worker that owns all broker state
//! - [`conversation`]: threading rules for negotiation dialogues
//! - [`handshake`] and [`server`]: admission and the TCP front end
//! - [`proxy`]: the agent-side [`OefCore`] capability, over TCP or in-process
//!
//! # Quick Start
//!
//! ```rust
//! use oef_core::schema::{
//!     Attribute, AttributeType, Constraint, DataModel, Instance, QueryModel, RelationOp, Value,
//! };
//! use oef_core::directory::ServiceDirectory;
//!
//! let car = DataModel::new(
//!     "car",
//!     vec![
//!         Attribute::new("manufacturer", AttributeType::String, true),
//!         Attribute::new("luxury", AttributeType::Bool, true),
//!     ],
//!     "A car for sale",
//! )
//! .unwrap();
//!
//! let ferrari = Instance::new(
//!     car.clone(),
//!     [
//!         ("manufacturer", Value::from("Ferrari")),
//!         ("luxury", Value::from(true)),
//!     ],
//! )
//! .unwrap();
//!
//! let mut directory = ServiceDirectory::new();
//! directory.register("Agent1", ferrari);
//!
//! let luxury = QueryModel::new(
//!     vec![Constraint::relation(
//!         Attribute::new("luxury", AttributeType::Bool, true),
//!         RelationOp::Eq,
//!         true,
//!     )],
//!     Some(car),
//! )
//! .unwrap();
//!
//! assert_eq!(directory.query(&luxury), vec!["Agent1".to_string()]);
//! ```

pub mod config;
pub mod conversation;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod observability;
pub mod protocol;
pub mod proxy;
pub mod scheduler;
pub mod schema;
pub mod server;
pub mod testing;

pub use config::{BrokerConfig, ClientConfig, ConfigError};
pub use conversation::{ConversationRegistry, Dialogue, DialogueBook, ProtocolError};
pub use directory::ServiceDirectory;
pub use error::{OefError, OefResult};
pub use proxy::{AgentHandler, LocalProxy, NetworkProxy, OefCore};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use server::Broker;
