//! Broker observability: structured logging, metrics and health endpoints

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_logging, parse_level, LogFormat, LogSettings};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{dispatch_span, handshake_span, session_span};
