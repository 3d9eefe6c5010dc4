//! Gas pricing for fulfillment transactions.

use alloy::network::TransactionBuilder;
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chain::{ChainError, RrpChain};
use crate::config::{ChainOptions, TxType};

/// Fee settings for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "type")]
pub enum GasTarget {
    Legacy {
        gas_price: u128,
    },
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

impl GasTarget {
    /// Worst-case price paid per unit of gas.
    pub fn max_price_per_gas(&self) -> u128 {
        match self {
            GasTarget::Legacy { gas_price } => *gas_price,
            GasTarget::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }

    pub fn apply(&self, tx: TransactionRequest) -> TransactionRequest {
        match *self {
            GasTarget::Legacy { gas_price } => tx.with_gas_price(gas_price),
            GasTarget::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => tx
                .with_max_fee_per_gas(max_fee_per_gas)
                .with_max_priority_fee_per_gas(max_priority_fee_per_gas),
        }
    }
}

/// Source of the gas target used by one sponsor's transactions.
#[async_trait]
pub trait GasTargetSource: Send + Sync {
    async fn gas_target(
        &self,
        chain: &dyn RrpChain,
        options: &ChainOptions,
    ) -> Result<GasTarget, ChainError>;
}

/// Provider-recommended pricing with a constant fallback.
///
/// Legacy chains pay the provider's gas price times the configured multiplier.
/// EIP-1559 chains pay at most `base fee × base_fee_multiplier + priority fee`.
/// When the provider cannot answer, the configured fallback price is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderGasOracle;

impl ProviderGasOracle {
    fn fallback(options: &ChainOptions) -> GasTarget {
        let fallback = u128::from(options.fallback_gas_price_wei);
        match options.tx_type {
            TxType::Legacy => GasTarget::Legacy { gas_price: fallback },
            TxType::Eip1559 => GasTarget::Eip1559 {
                max_fee_per_gas: fallback,
                max_priority_fee_per_gas: u128::from(options.priority_fee_wei).min(fallback),
            },
        }
    }
}

fn apply_multiplier(price: u128, multiplier: f64) -> u128 {
    if multiplier <= 0.0 || !multiplier.is_finite() {
        return price;
    }
    (price as f64 * multiplier) as u128
}

#[async_trait]
impl GasTargetSource for ProviderGasOracle {
    async fn gas_target(
        &self,
        chain: &dyn RrpChain,
        options: &ChainOptions,
    ) -> Result<GasTarget, ChainError> {
        let target = match options.tx_type {
            TxType::Legacy => chain.gas_price().await.map(|price| GasTarget::Legacy {
                gas_price: apply_multiplier(price, options.gas_price_multiplier),
            }),
            TxType::Eip1559 => match chain.base_fee_per_gas().await {
                Ok(Some(base_fee)) => {
                    let priority = u128::from(options.priority_fee_wei);
                    Ok(GasTarget::Eip1559 {
                        max_fee_per_gas: base_fee
                            .saturating_mul(u128::from(options.base_fee_multiplier))
                            .saturating_add(priority),
                        max_priority_fee_per_gas: priority,
                    })
                }
                Ok(None) => Err(ChainError::RpcProvider(
                    "latest block has no base fee".to_string(),
                )),
                Err(e) => Err(e),
            },
        };
        match target {
            Ok(target) => {
                tracing::debug!(?target, "Gas target fetched");
                Ok(target)
            }
            Err(e) => {
                let fallback = Self::fallback(options);
                tracing::warn!(error = %e, ?fallback, "Failed to fetch gas price, using fallback");
                Ok(fallback)
            }
        }
    }
}
