//! ChainGate CLI.
//!
//! # Commands
//! ```text
//! chaingate serve   --config <chaingate.yaml>
//! chaingate health  --config <chaingate.yaml>
//! chaingate call    --config <chaingate.yaml> --chain <id> --method <name> [--params <json>]
//! chaingate gas     --config <chaingate.yaml> --chain <id>
//! chaingate nonce   --config <chaingate.yaml> --chain <id> --address <0x..>
//! chaingate chains  --config <chaingate.yaml>
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use chaingate_core::HealthStatus;
use chaingate_gateway::{init_tracing, Gateway, GatewayConfig};

#[derive(Parser)]
#[command(
    name = "chaingate",
    about = "Multi-chain JSON-RPC gateway: ChainGate CLI",
    long_about = "
ChainGate CLI: run the gateway or issue one-off calls through it.

ENVIRONMENT VARIABLES:
  CHAINGATE_STORE_URL   Shared store URL (redis://... switches to Redis)
  CHAINGATE_LOG_LEVEL   Global log level (trace, debug, info, warn, error)
",
    version
)]
struct Cli {
    /// Gateway configuration file
    #[arg(short, long, global = true, default_value = "chaingate.yaml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until Ctrl-C
    Serve,

    /// Run every health check once and print the report
    Health,

    /// Send one JSON-RPC call through the provider pool
    Call {
        /// Chain id, e.g. 1 for Ethereum mainnet
        #[arg(long)]
        chain: u64,
        /// Method name, e.g. eth_blockNumber
        #[arg(long)]
        method: String,
        /// JSON array of parameters
        #[arg(long, default_value = "[]")]
        params: String,
        /// Caller id for rate limiting
        #[arg(long)]
        caller: Option<String>,
    },

    /// Print the current gas price tiers for a chain
    Gas {
        #[arg(long)]
        chain: u64,
    },

    /// Allocate the next nonce for an address
    Nonce {
        #[arg(long)]
        chain: u64,
        #[arg(long)]
        address: String,
    },

    /// List configured chains and their endpoints
    Chains,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.json_logs {
        config.logging.json = true;
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve => cmd_serve(config).await,
        Commands::Health => cmd_health(config).await,
        Commands::Call { chain, method, params, caller } => {
            cmd_call(config, chain, &method, &params, caller.as_deref()).await
        }
        Commands::Gas { chain } => cmd_gas(config, chain).await,
        Commands::Nonce { chain, address } => cmd_nonce(config, chain, &address).await,
        Commands::Chains => cmd_chains(&config),
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn started(config: GatewayConfig) -> Result<Gateway> {
    let gateway = Gateway::connect(config).await.context("building gateway")?;
    gateway.start().await.context("starting gateway")?;
    Ok(gateway)
}

async fn cmd_serve(config: GatewayConfig) -> Result<()> {
    let gateway = started(config).await?;
    tracing::info!(chains = gateway.chains().len(), "chaingate running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutting down");
    gateway.shutdown().await;
    Ok(())
}

async fn cmd_health(config: GatewayConfig) -> Result<()> {
    let gateway = started(config).await?;
    let report = gateway.get_health().await;
    gateway.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status == HealthStatus::Unhealthy {
        bail!("gateway is unhealthy");
    }
    Ok(())
}

async fn cmd_call(
    config: GatewayConfig,
    chain: u64,
    method: &str,
    params: &str,
    caller: Option<&str>,
) -> Result<()> {
    let params: Vec<Value> = serde_json::from_str(params).context("--params must be a JSON array")?;

    let gateway = started(config).await?;
    let resp = gateway.execute_rpc(chain, method, params, caller).await;
    gateway.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&resp)?);
    if let Some(err) = resp.error {
        bail!("rpc error {}: {}", err.code, err.message);
    }
    Ok(())
}

async fn cmd_gas(config: GatewayConfig, chain: u64) -> Result<()> {
    let gateway = started(config).await?;
    let estimate = gateway.get_gas_price(chain).await;
    gateway.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&estimate?)?);
    Ok(())
}

async fn cmd_nonce(config: GatewayConfig, chain: u64, address: &str) -> Result<()> {
    let gateway = started(config).await?;
    let nonce = gateway.get_nonce(chain, address).await;
    gateway.shutdown().await;

    println!("{}", nonce?);
    Ok(())
}

fn cmd_chains(config: &GatewayConfig) -> Result<()> {
    for spec in config.chain_specs() {
        println!(
            "{:>10}  {:<12} block {:>6} ms  {}",
            spec.chain_id,
            spec.display_name(),
            spec.block_time().as_millis(),
            if spec.is_fee_market() { "eip1559" } else { "legacy" },
        );
        let mut endpoints: Vec<_> = config
            .endpoints
            .iter()
            .filter(|e| e.chain_id == spec.chain_id)
            .collect();
        endpoints.sort_by_key(|e| e.priority);
        for e in endpoints {
            let state = if e.active { "" } else { " (inactive)" };
            println!("            - {} [priority {}]{}", e.id, e.priority, state);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_call_arguments() {
        let cli = Cli::parse_from([
            "chaingate",
            "--config",
            "gw.yaml",
            "call",
            "--chain",
            "137",
            "--method",
            "eth_getBalance",
            "--params",
            r#"["0x0", "latest"]"#,
        ]);
        assert_eq!(cli.config, PathBuf::from("gw.yaml"));
        match cli.command {
            Commands::Call { chain, method, params, caller } => {
                assert_eq!(chain, 137);
                assert_eq!(method, "eth_getBalance");
                assert!(serde_json::from_str::<Vec<Value>>(&params).is_ok());
                assert!(caller.is_none());
            }
            _ => panic!("expected call"),
        }
    }
}
