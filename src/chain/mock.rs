//! In-memory chain for unit tests.

use alloy::primitives::{Address, B256, Bytes, U256, keccak256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolCall, SolValue};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::chain::{AirnodeRrpV0, ChainConnector, ChainError, RrpChain};
use crate::config::NodeSettings;
use crate::state::ProviderSettings;

pub(crate) struct MockChain {
    pub transaction_counts: Mutex<HashMap<Address, u64>>,
    pub balances: Mutex<HashMap<Address, U256>>,
    pub gas_price: u128,
    pub gas_estimate: Option<u64>,
    pub callback_success: bool,
    pub call_reverts: bool,
    pub reject_sends: bool,
    /// Balance and transaction-count calls that fail before they start succeeding.
    pub transient_failures: AtomicUsize,
    /// Wallets whose transaction count can never be fetched.
    pub unreachable_wallets: Mutex<HashSet<Address>>,
    pub sent: Mutex<Vec<(Address, TransactionRequest)>>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self {
            transaction_counts: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            gas_price: 1000,
            gas_estimate: Some(50_000),
            callback_success: true,
            call_reverts: false,
            reject_sends: false,
            transient_failures: AtomicUsize::new(0),
            unreachable_wallets: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl MockChain {
    pub fn with_transaction_count(self, address: Address, count: u64) -> Self {
        self.transaction_counts.lock().unwrap().insert(address, count);
        self
    }

    pub fn with_balance(self, address: Address, balance: U256) -> Self {
        self.balances.lock().unwrap().insert(address, balance);
        self
    }

    pub fn with_unreachable_wallet(self, address: Address) -> Self {
        self.unreachable_wallets.lock().unwrap().insert(address);
        self
    }

    pub fn sent(&self) -> Vec<(Address, TransactionRequest)> {
        self.sent.lock().unwrap().clone()
    }

    fn transient(&self) -> Result<(), ChainError> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ChainError::RpcProvider("Connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RrpChain for MockChain {
    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        self.transient()?;
        if self.unreachable_wallets.lock().unwrap().contains(&address) {
            return Err(ChainError::RpcProvider("connection refused".to_string()));
        }
        Ok(self.transaction_counts.lock().unwrap().get(&address).copied().unwrap_or(0))
    }

    async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        self.transient()?;
        Ok(self.balances.lock().unwrap().get(&address).copied().unwrap_or_default())
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(self.gas_price)
    }

    async fn base_fee_per_gas(&self) -> Result<Option<u128>, ChainError> {
        Ok(Some(self.gas_price / 2))
    }

    async fn estimate_gas(&self, _tx: TransactionRequest) -> Result<u64, ChainError> {
        self.gas_estimate
            .ok_or_else(|| ChainError::ContractCall("estimate_gas failed".to_string()))
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, ChainError> {
        if self.call_reverts {
            return Err(ChainError::ContractCall("Invalid request fulfillment".to_string()));
        }
        let input = tx.input.input().cloned().unwrap_or_default();
        AirnodeRrpV0::fulfillCall::abi_decode(&input)
            .map_err(|e| ChainError::ContractCall(e.to_string()))?;
        Ok((self.callback_success, Bytes::new()).abi_encode_params().into())
    }

    async fn send(
        &self,
        tx: TransactionRequest,
        signer: &PrivateKeySigner,
    ) -> Result<B256, ChainError> {
        if self.reject_sends {
            return Err(ChainError::ContractCall("nonce too low".to_string()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((signer.address(), tx));
        Ok(keccak256(sent.len().to_be_bytes()))
    }
}

/// Hands out the same mock chain for every provider.
pub(crate) struct MockConnector(pub Arc<MockChain>);

impl ChainConnector for MockConnector {
    fn connect(
        &self,
        _settings: &ProviderSettings,
        _node: &NodeSettings,
    ) -> Result<Arc<dyn RrpChain>, ChainError> {
        Ok(self.0.clone())
    }
}
