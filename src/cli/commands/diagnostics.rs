//! Offline operator commands: config validation, owner lookup, signatures.

use crate::cli::args::{CheckConfigArgs, PickNodeArgs, SignArgs};
use crate::cluster::{pick_node_id, score, NodeInfo};
use crate::config::Config;
use crate::hook::compute_signature;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

pub fn run_check_config(args: CheckConfigArgs) -> Result<()> {
    let mut config = Config::load(&args.config)?;
    config.apply_env_overrides();
    config.validate()?;
    println!("config ok: {}", args.config.display());
    println!("  node_id:        {}", config.node.node_id);
    println!("  endpoint:       {}", config.node.public_endpoint);
    println!("  rpc_bind:       {}", config.node.rpc_bind);
    println!("  store:          {}", config.store.connection_string);
    println!(
        "  metrics_bind:   {}",
        config.telemetry.metrics_bind.as_deref().unwrap_or("-")
    );
    let mut tenants: Vec<&String> = config.tenants.keys().collect();
    tenants.sort();
    println!("  tenants ({}):", tenants.len());
    for tenant in tenants {
        println!("    {tenant}");
    }
    Ok(())
}

pub fn run_pick_node(args: PickNodeArgs) -> Result<()> {
    let nodes: Vec<NodeInfo> = args
        .nodes
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(|id| NodeInfo::new(id, ""))
        .collect();
    let owner = pick_node_id(&args.tenant, &args.user, &nodes)
        .context("no live nodes given")?;
    println!("owner: {owner}");
    for node in &nodes {
        println!(
            "  {:<24} {:#018x}",
            node.node_id,
            score(&args.tenant, &args.user, &node.node_id)
        );
    }
    Ok(())
}

pub fn run_sign(args: SignArgs) -> Result<()> {
    let payload = BASE64
        .decode(args.payload_base64.trim())
        .context("payload is not valid base64")?;
    let sign = compute_signature(&args.secret, &payload, &args.request_id, args.timestamp_ms)?;
    println!("{sign}");
    Ok(())
}
