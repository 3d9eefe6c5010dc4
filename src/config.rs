//! Node configuration loaded from `config.toml`.
//!
//! The file describes the chains the node serves (RRP contract, providers, gas
//! options) and the endpoints it answers for. The only secret, the airnode
//! mnemonic, never lives in the file and is read from the environment instead.
//!
//! Provider URLs may reference environment variables as `${NAME}`; they are
//! expanded when the file is loaded.

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable holding the airnode mnemonic.
pub const MNEMONIC_ENV: &str = "AIRNODE_WALLET_MNEMONIC";

/// Complete node configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AirnodeConfig {
    pub node_settings: NodeSettings,
    pub chains: Vec<ChainConfig>,
    pub triggers: TriggersConfig,
}

impl AirnodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// If the file doesn't exist, returns the default configuration.
    /// If the file exists but is malformed, returns an error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let mut config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        config.resolve_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load configuration from environment variable CONFIG_FILE or default path.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        Self::from_file(config_path)
    }

    fn resolve_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String> + Copy,
    ) -> Result<(), config::ConfigError> {
        for chain in &mut self.chains {
            for url in chain.providers.values_mut() {
                *url = expand_env(url, lookup)?;
            }
        }
        Ok(())
    }
}

/// Replace every `${NAME}` in `input` with the value `lookup` returns for it.
fn expand_env(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, config::ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            config::ConfigError::Message(format!("unterminated variable reference in {input:?}"))
        })?;
        let name = &after[..end];
        let value = lookup(name).ok_or_else(|| {
            config::ConfigError::Message(format!("environment variable {name} is not set"))
        })?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Process-level settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Budget for one whole run; an overrunning run is abandoned.
    /// Default: 90 seconds.
    pub run_timeout_seconds: u64,

    /// Timeout for a single attempt of a retried RPC call.
    /// Default: 10 seconds.
    pub rpc_attempt_timeout_seconds: u64,

    /// HTTP connection establishment timeout in seconds.
    /// Default: 10 seconds.
    pub connection_timeout_seconds: u64,

    /// Maximum idle connections per host in the connection pool.
    /// Default: 100 connections.
    pub pool_max_idle_per_host: usize,

    /// How long to keep idle connections alive in seconds.
    /// Default: 90 seconds.
    pub pool_idle_timeout_seconds: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            run_timeout_seconds: 90,
            rpc_attempt_timeout_seconds: 10,
            connection_timeout_seconds: 10,
            pool_max_idle_per_host: 100,
            pool_idle_timeout_seconds: 90,
        }
    }
}

impl NodeSettings {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    pub fn rpc_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_attempt_timeout_seconds)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_seconds)
    }
}

/// One chain served by the node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    /// EIP-155 chain id.
    pub id: u64,
    /// `AirnodeRrpV0` deployment.
    pub airnode_rrp: Address,
    /// Provider name → RPC URL. Every provider is processed independently.
    pub providers: BTreeMap<String, String>,
    /// Events younger than this many blocks are ignored by the event source.
    #[serde(default)]
    pub min_confirmations: u64,
    /// How far back the event source scans.
    #[serde(default = "default_block_history_limit")]
    pub block_history_limit: u64,
    #[serde(default)]
    pub options: ChainOptions,
}

fn default_block_history_limit() -> u64 {
    300
}

/// Transaction envelope used for fulfillments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Legacy,
    #[default]
    Eip1559,
}

/// Gas and transaction options of one chain.
///
/// Written in snake_case in `config.toml`; serialized in camelCase as part of
/// the provider state handed to sponsor workers. Both spellings are accepted.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChainOptions {
    #[serde(alias = "tx_type")]
    pub tx_type: TxType,

    /// Gas limit for `fulfill` transactions.
    /// Default: 500,000.
    #[serde(alias = "fulfillment_gas_limit")]
    pub fulfillment_gas_limit: u64,

    /// Multiplier applied to the provider-recommended gas price (legacy only).
    /// Default: 1.0.
    #[serde(alias = "gas_price_multiplier")]
    pub gas_price_multiplier: f64,

    /// Gas price used when the provider cannot recommend one.
    /// Default: 20 gwei.
    #[serde(alias = "fallback_gas_price_wei")]
    pub fallback_gas_price_wei: u64,

    /// EIP-1559 priority fee.
    /// Default: 3.12 gwei.
    #[serde(alias = "priority_fee_wei")]
    pub priority_fee_wei: u64,

    /// Multiplier applied to the latest base fee to get `maxFeePerGas` (EIP-1559 only).
    /// Default: 2.
    #[serde(alias = "base_fee_multiplier")]
    pub base_fee_multiplier: u64,

    /// Amount left in a sponsor wallet after a withdrawal.
    /// Default: 0.
    #[serde(alias = "withdrawal_remainder_wei")]
    pub withdrawal_remainder_wei: u64,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            tx_type: TxType::default(),
            fulfillment_gas_limit: 500_000,
            gas_price_multiplier: 1.0,
            fallback_gas_price_wei: 20_000_000_000,
            priority_fee_wei: 3_120_000_000,
            base_fee_multiplier: 2,
            withdrawal_remainder_wei: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TriggersConfig {
    pub rrp: Vec<RrpTrigger>,
}

impl TriggersConfig {
    /// Trigger answering for `endpoint_id`, if the node serves it.
    pub fn trigger_for(&self, endpoint_id: &B256) -> Option<&RrpTrigger> {
        self.rrp.iter().find(|t| t.endpoint_id == *endpoint_id)
    }
}

/// Endpoint the node answers RRP requests for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RrpTrigger {
    pub endpoint_id: B256,
    pub ois_title: String,
    pub endpoint_name: String,
}

/// Secrets read from the environment.
#[derive(Clone)]
pub struct Secrets {
    pub mnemonic: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}

impl Secrets {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let mnemonic = std::env::var(MNEMONIC_ENV)
            .map_err(|_| config::ConfigError::NotFound(MNEMONIC_ENV.to_string()))?;
        Ok(Self { mnemonic })
    }
}
