//! Structured logging for the broker
//!
//! All output goes through `tracing`. [`LogSettings`] is read from the
//! environment:
//!
//! - `LOG_LEVEL`: level for broker events (ERROR, WARN, INFO, DEBUG, TRACE), INFO by default
//! - `LOG_FORMAT`: `json` (default), `pretty` or `compact`
//! - `LOG_SPANS`: `true` to log span open/close, which times every session and dispatch
//! - `RUST_LOG`: replaces the generated filter entirely
//!
//! Dependencies (warp, hyper, tokio) are held at WARN whatever the broker
//! level is, so `LOG_LEVEL=TRACE` shows every envelope without the HTTP
//! stack's internals.
//!
//! ```bash
//! # Follow every envelope through the scheduler
//! LOG_FORMAT=compact LOG_LEVEL=TRACE LOG_SPANS=true oef-core run
//! ```
//!
//! The span macros name the three units of broker work. Each takes the agent
//! id first, followed by any extra fields:
//!
//! ```
//! let agent_id = "Agent1";
//! let _span = oef_core::dispatch_span!(agent_id, operation = "SEARCH_AGENTS", msg_id = 3u32);
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, for log aggregation
    #[default]
    Json,
    Pretty,
    /// Single-line colored output without targets
    Compact,
}

impl LogFormat {
    /// Unrecognised names fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Map a `LOG_LEVEL` value to a level, INFO when unrecognised
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Subscriber settings for one process
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub spans: bool,
    /// Raw `RUST_LOG` filter, used instead of the generated directives
    pub filter_override: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            spans: false,
            filter_override: None,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            level: lookup("LOG_LEVEL")
                .map(|value| parse_level(&value))
                .unwrap_or(Level::INFO),
            format: lookup("LOG_FORMAT")
                .map(|value| LogFormat::parse(&value))
                .unwrap_or_default(),
            spans: lookup("LOG_SPANS").is_some_and(|value| value.eq_ignore_ascii_case("true")),
            filter_override: lookup("RUST_LOG").filter(|value| !value.trim().is_empty()),
        }
    }

    /// Filter directives: the broker at `level`, everything else at most WARN
    pub fn directives(&self) -> String {
        if let Some(filter) = &self.filter_override {
            return filter.clone();
        }
        let broker = self.level.to_string().to_lowercase();
        let others = if self.level == Level::ERROR { "error" } else { "warn" };
        format!("{others},oef_core={broker}")
    }

    fn span_events(&self) -> FmtSpan {
        if self.spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(settings: &LogSettings) -> Result<(), TryInitError> {
    let filter = EnvFilter::new(settings.directives());
    let registry = tracing_subscriber::registry().with(filter);
    let events = settings.span_events();

    match settings.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(events))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(events))
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(events),
            )
            .try_init(),
    }
}

/// Span covering an admitted agent's connection
#[macro_export]
macro_rules! session_span {
    ($agent_id:expr) => {
        tracing::info_span!("agent_session", agent_id = %$agent_id)
    };
    ($agent_id:expr, $($field:tt)+) => {
        tracing::info_span!("agent_session", agent_id = %$agent_id, $($field)+)
    };
}

/// Span covering the challenge exchange for one connecting agent
#[macro_export]
macro_rules! handshake_span {
    ($agent_id:expr) => {
        tracing::info_span!("handshake", agent_id = %$agent_id)
    };
    ($agent_id:expr, $($field:tt)+) => {
        tracing::info_span!("handshake", agent_id = %$agent_id, $($field)+)
    };
}

/// Span covering one envelope or delivered message
#[macro_export]
macro_rules! dispatch_span {
    ($agent_id:expr) => {
        tracing::debug_span!("envelope_dispatch", agent_id = %$agent_id)
    };
    ($agent_id:expr, $($field:tt)+) => {
        tracing::debug_span!("envelope_dispatch", agent_id = %$agent_id, $($field)+)
    };
}

pub use {dispatch_span, handshake_span, session_span};
