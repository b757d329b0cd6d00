//! Core runtime infrastructure.
//!
//! - `config` - Configuration parsing and validation
//! - `runtime` - Process wiring, background tasks and shutdown
//! - `shutdown` - Drain flag shared with readiness checks
//! - `time` - Deterministic time utilities

pub mod config;
pub mod runtime;
pub mod shutdown;
pub mod time;

pub use config::*;
pub use runtime::*;
pub use shutdown::*;
pub use time::*;
