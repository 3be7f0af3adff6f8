//! OEF agent protocol: wire messages and framing
//!
//! The message set here is the whole agent-facing surface of the broker.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_BYTES};
pub use messages::*;
