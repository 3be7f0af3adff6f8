//! Test support: handlers that record or script agent behaviour
//!
//! Used by the crate's own tests and by integration tests that drive real
//! agents through a broker.

pub mod mocks;

pub use mocks::*;
