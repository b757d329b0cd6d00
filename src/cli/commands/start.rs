//! Start command - launches a gateway node.

use crate::cli::args::StartArgs;
use crate::config::Config;
use crate::runtime::Runtime;
use crate::telemetry;
use crate::time::SystemClock;
use anyhow::Result;
use std::env;

pub async fn run_start(args: StartArgs) -> Result<()> {
    // Config::load_from_env reads the path from here so env overrides still apply.
    env::set_var("COURIER_CONFIG", args.config.display().to_string());

    let config = Config::load_from_env()?;
    let log_handle = telemetry::init_tracing(config.telemetry.log_level.as_deref())?;
    let mut runtime = Runtime::new(config, SystemClock, Some(log_handle))?;
    runtime.run().await
}
