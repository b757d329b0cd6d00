//! Message payloads and per-user message state.
//!
//! - `frames` - Client/server frames, close codes and the bincode codec
//! - `dedupe` - Local TTL de-duplication of message ids
//! - `offline` - Bounded pending-message buffers for offline users

pub mod dedupe;
pub mod frames;
pub mod offline;

pub use dedupe::*;
pub use frames::*;
pub use offline::*;
