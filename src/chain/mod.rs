//! Chain access used by the settlement pipeline.
//!
//! [`RrpChain`] is the narrow set of RPC operations the pipeline needs from one
//! provider of one chain. The production implementation is
//! [`evm::EvmRrpChain`]; tests substitute an in-memory chain.

use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::NodeSettings;
use crate::state::ProviderSettings;

pub mod evm;
#[cfg(test)]
pub(crate) mod mock;

sol! {
    /// Fulfillment entry points of the RRP protocol contract.
    interface AirnodeRrpV0 {
        function fulfill(
            bytes32 requestId,
            address airnode,
            address fulfillAddress,
            bytes4 fulfillFunctionId,
            bytes calldata data,
            bytes calldata signature
        ) external returns (bool callSuccess, bytes memory callData);

        function fulfillWithdrawal(
            bytes32 requestId,
            address airnode,
            address sponsor
        ) external payable;
    }
}

/// Number of attempts for calls that are retried.
pub const RPC_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    /// Connection-level failure (DNS, TCP, HTTP timeouts, exhausted pool).
    #[error("RPC provider error: {0}")]
    RpcProvider(String),
    /// The node answered but execution failed; carries the decoded revert reason
    /// when available.
    #[error("contract call failed: {0}")]
    ContractCall(String),
    /// All attempts ran into the per-attempt timeout.
    #[error("{0} timed out")]
    Timeout(String),
    #[error("failed to sign transaction: {0}")]
    Signing(String),
}

/// RPC operations of one chain provider.
#[async_trait]
pub trait RrpChain: Send + Sync {
    /// Transactions sent from `address`, counting the mempool where the provider supports it.
    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError>;

    async fn balance(&self, address: Address) -> Result<U256, ChainError>;

    async fn gas_price(&self) -> Result<u128, ChainError>;

    /// Base fee of the latest block, `None` on chains without EIP-1559.
    async fn base_fee_per_gas(&self) -> Result<Option<u128>, ChainError>;

    async fn estimate_gas(&self, tx: TransactionRequest) -> Result<u64, ChainError>;

    /// Execute `tx` without broadcasting it and return the output.
    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, ChainError>;

    /// Sign a fully specified transaction with `signer` and broadcast it.
    async fn send(
        &self,
        tx: TransactionRequest,
        signer: &PrivateKeySigner,
    ) -> Result<B256, ChainError>;
}

/// Builds a chain handle for a provider. Workers use it to rebuild their
/// connection from serialized provider settings.
pub trait ChainConnector: Send + Sync {
    fn connect(
        &self,
        settings: &ProviderSettings,
        node: &NodeSettings,
    ) -> Result<Arc<dyn RrpChain>, ChainError>;
}

/// Run `operation` with one retry, each attempt bounded by `attempt_timeout`.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    attempt_timeout: Duration,
    mut f: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let mut last_error = ChainError::Timeout(operation.to_string());
    for attempt in 1..=RPC_ATTEMPTS {
        match tokio::time::timeout(attempt_timeout, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(operation, attempt, error = %e, "RPC call failed");
                last_error = e;
            }
            Err(_) => {
                tracing::warn!(
                    operation,
                    attempt,
                    timeout_ms = attempt_timeout.as_millis() as u64,
                    "RPC call timed out"
                );
                last_error = ChainError::Timeout(operation.to_string());
            }
        }
    }
    Err(last_error)
}
