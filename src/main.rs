//! Airnode settlement entrypoint.
//!
//! Runs one settlement cycle over the workload in `WORKLOAD_FILE` and prints the
//! final requests of every provider as JSON.
//!
//! Subcommands:
//! - `derive-sponsor-wallet <sponsor>`: print the sponsor wallet address
//! - `xpub`: print the extended public key sponsors use to recompute wallets
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG_FILE` path of the TOML configuration (default `config.toml`)
//! - `AIRNODE_WALLET_MNEMONIC` airnode mnemonic
//! - `WORKLOAD_FILE` collaborator outputs for this cycle (default `workload.json`)
//! - `RUST_LOG`, `LOG_FORMAT` logging

use dotenvy::dotenv;
use std::sync::Arc;

use airnode_settlement::chain::evm::EvmConnector;
use airnode_settlement::config::{AirnodeConfig, Secrets};
use airnode_settlement::coordinator;
use airnode_settlement::external::{Collaborators, Workload};
use airnode_settlement::gas::ProviderGasOracle;
use airnode_settlement::logging::{self, LogFormat};
use airnode_settlement::wallet::{self, MasterNode};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    logging::init(LogFormat::from_env())?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("derive-sponsor-wallet") => {
            let sponsor = args.get(1).ok_or("usage: derive-sponsor-wallet <sponsor-address>")?;
            let sponsor = wallet::parse_address(sponsor)?;
            let master = MasterNode::from_mnemonic(&Secrets::from_env()?.mnemonic)?;
            let signer = wallet::derive_sponsor_wallet(&master, &sponsor)?;
            println!("{}", signer.address());
            return Ok(());
        }
        Some("xpub") => {
            let master = MasterNode::from_mnemonic(&Secrets::from_env()?.mnemonic)?;
            println!("{}", wallet::extended_public_key(&master)?);
            return Ok(());
        }
        Some(other) => return Err(format!("unknown command: {other}").into()),
        None => {}
    }

    let config = AirnodeConfig::from_env()?;
    tracing::info!(chains = config.chains.len(), "Configuration loaded successfully");
    let secrets = Secrets::from_env()?;

    let workload_path =
        std::env::var("WORKLOAD_FILE").unwrap_or_else(|_| "workload.json".to_string());
    let workload = Workload::from_file(&workload_path)?;
    tracing::info!(
        path = %workload_path,
        api_calls = workload.api_calls.len(),
        withdrawals = workload.withdrawals.len(),
        "Workload loaded"
    );

    let results = coordinator::run(
        &config,
        &secrets,
        &Collaborators::from_workload(workload),
        Arc::new(EvmConnector::from_config(&config)),
        Arc::new(ProviderGasOracle),
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
