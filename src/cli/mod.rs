//! Courier CLI - unified command-line interface.
//!
//! - `courier start` - Start a gateway node
//! - `courier check-config` - Validate a configuration file
//! - `courier pick-node` - Rendezvous owner diagnostics
//! - `courier sign` - Hook signature diagnostics

mod args;
pub mod commands;

pub use args::{CheckConfigArgs, Cli, Commands, PickNodeArgs, SignArgs, StartArgs};
