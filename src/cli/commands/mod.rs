//! CLI command implementations.

mod diagnostics;
mod start;

pub use diagnostics::{run_check_config, run_pick_node, run_sign};
pub use start::run_start;
