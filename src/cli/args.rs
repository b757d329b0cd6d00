//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Courier - multi-tenant IM gateway routing and delivery node.
#[derive(Parser)]
#[command(name = "courier")]
#[command(version)]
#[command(about = "Courier gateway node and operator diagnostics")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a gateway node
    Start(StartArgs),

    /// Load and validate a configuration file
    CheckConfig(CheckConfigArgs),

    /// Show which node owns a (tenant, user) key
    PickNode(PickNodeArgs),

    /// Compute a hook request signature
    Sign(SignArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/courier.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct CheckConfigArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/courier.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct PickNodeArgs {
    #[arg(long)]
    pub tenant: String,

    #[arg(long)]
    pub user: String,

    /// Comma-separated live node ids
    #[arg(long, value_delimiter = ',', required = true)]
    pub nodes: Vec<String>,
}

#[derive(Args)]
pub struct SignArgs {
    /// Tenant hook secret
    #[arg(long)]
    pub secret: String,

    #[arg(long)]
    pub request_id: String,

    #[arg(long)]
    pub timestamp_ms: i64,

    /// Encoded request with `meta.sign` cleared, base64
    #[arg(long)]
    pub payload_base64: String,
}
