//! Local connection bookkeeping.
//!
//! - `session` - Per-connection state and the socket send handle
//! - `registry` - Single-lock registry of live sessions
//! - `heartbeat` - Liveness sweep and lease renewal
//! - `drain` - Shutdown eviction of every session

pub mod drain;
pub mod heartbeat;
pub mod registry;
pub mod session;

pub use drain::{DrainReport, ShutdownDrainService};
pub use heartbeat::{HeartbeatSweeper, SweepStats};
pub use registry::{ConnectionRegistry, SessionBuffer};
pub use session::{ConnectionSession, Outbound, SessionSocket};
