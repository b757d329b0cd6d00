//! Courier - gateway node entrypoint.
//!
//! Usage:
//!   courier start --config config/courier.toml
//!   courier check-config --config config/courier.toml
//!   courier pick-node --tenant acme --user u1 --nodes n1,n2,n3
//!   courier sign --secret s --request-id r --timestamp-ms 0 --payload-base64 AAAA

use anyhow::Result;
use clap::Parser;
use courier::cli::commands::{run_check_config, run_pick_node, run_sign, run_start};
use courier::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::CheckConfig(args) => run_check_config(args),
        Commands::PickNode(args) => run_pick_node(args),
        Commands::Sign(args) => run_sign(args),
    }
}
