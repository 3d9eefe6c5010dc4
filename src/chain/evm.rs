//! JSON-RPC implementation of [`RrpChain`] over HTTP.
//!
//! One [`EvmRrpChain`] wraps one provider URL of one chain. Transactions are
//! fully specified by the caller (nonce, gas limit, fees), signed locally and
//! sent raw; the provider never fills anything in.
//!
//! Errors are categorised the same way for every call: connection problems
//! become [`ChainError::RpcProvider`], anything the node answered becomes
//! [`ChainError::ContractCall`] with the revert reason decoded where possible.

use alloy::consensus::BlockHeader;
use alloy::hex;
use alloy::network::{Ethereum, EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::{BlockNumberOrTag, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{Panic, Revert, SolError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Instrument;
use url::Url;

use crate::chain::{ChainConnector, ChainError, RrpChain};
use crate::config::{AirnodeConfig, NodeSettings};
use crate::state::ProviderSettings;

pub struct EvmRrpChain {
    inner: RootProvider<Ethereum>,
    provider_name: String,
}

impl EvmRrpChain {
    /// Build a provider for `url` with HTTP timeouts and pool limits from `node`.
    pub fn try_new(
        provider_name: &str,
        url: Url,
        node: &NodeSettings,
    ) -> Result<Self, ChainError> {
        tracing::debug!(
            provider = provider_name,
            rpc_timeout_secs = node.rpc_attempt_timeout_seconds,
            connection_timeout_secs = node.connection_timeout_seconds,
            pool_max_idle = node.pool_max_idle_per_host,
            pool_idle_timeout_secs = node.pool_idle_timeout_seconds,
            "Configuring RPC client"
        );

        let http_client = alloy::transports::http::reqwest::Client::builder()
            .connect_timeout(node.connection_timeout())
            .timeout(node.rpc_attempt_timeout())
            .pool_idle_timeout(node.pool_idle_timeout())
            .pool_max_idle_per_host(node.pool_max_idle_per_host)
            .build()
            .map_err(|e| {
                ChainError::RpcProvider(format!(
                    "failed to build HTTP client for {provider_name}: {e}"
                ))
            })?;
        let transport = alloy::transports::http::Http::with_client(http_client, url);
        let client = RpcClient::new(transport, false);

        tracing::info!(provider = provider_name, "Initialized provider");
        Ok(Self {
            inner: RootProvider::new(client),
            provider_name: provider_name.to_string(),
        })
    }
}

#[async_trait]
impl RrpChain for EvmRrpChain {
    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        match self.inner.get_transaction_count(address).pending().await {
            Ok(count) => {
                tracing::debug!(
                    %address,
                    nonce = count,
                    block_tag = "pending",
                    "transaction count fetched"
                );
                Ok(count)
            }
            Err(e) if is_unsupported_pending_error(&e) => {
                tracing::warn!(
                    %address,
                    provider = %self.provider_name,
                    error = ?e,
                    "pending block tag not supported by RPC, falling back to latest"
                );
                self.inner
                    .get_transaction_count(address)
                    .latest()
                    .await
                    .map_err(|e| categorize_transport_error(e, "get_transaction_count"))
            }
            Err(e) => Err(categorize_transport_error(e, "get_transaction_count")),
        }
    }

    async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        self.inner
            .get_balance(address)
            .await
            .map_err(|e| categorize_transport_error(e, "get_balance"))
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.inner
            .get_gas_price()
            .instrument(tracing::debug_span!("get_gas_price"))
            .await
            .map_err(|e| categorize_transport_error(e, "get_gas_price"))
    }

    async fn base_fee_per_gas(&self) -> Result<Option<u128>, ChainError> {
        let block = self
            .inner
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .map_err(|e| categorize_transport_error(e, "get_block_by_number"))?
            .ok_or_else(|| ChainError::RpcProvider("latest block not available".to_string()))?;
        Ok(block.header.base_fee_per_gas().map(u128::from))
    }

    async fn estimate_gas(&self, tx: TransactionRequest) -> Result<u64, ChainError> {
        self.inner
            .estimate_gas(tx)
            .await
            .map_err(|e| categorize_transport_error(e, "estimate_gas"))
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, ChainError> {
        self.inner
            .call(tx)
            .await
            .map_err(|e| categorize_transport_error(e, "eth_call"))
    }

    async fn send(
        &self,
        tx: TransactionRequest,
        signer: &PrivateKeySigner,
    ) -> Result<B256, ChainError> {
        let wallet = EthereumWallet::from(signer.clone());
        let envelope = tx
            .build(&wallet)
            .await
            .map_err(|e| ChainError::Signing(e.to_string()))?;
        let pending = self
            .inner
            .send_tx_envelope(envelope)
            .await
            .map_err(|e| categorize_transport_error(e, "send_raw_transaction"))?;
        Ok(*pending.tx_hash())
    }
}

/// Connects to the providers named in the node configuration.
///
/// URLs are looked up by chain id and provider name so they never travel with
/// serialized provider state.
pub struct EvmConnector {
    urls: HashMap<(u64, String), String>,
}

impl EvmConnector {
    pub fn from_config(config: &AirnodeConfig) -> Self {
        let urls = config
            .chains
            .iter()
            .flat_map(|chain| {
                chain
                    .providers
                    .iter()
                    .map(move |(name, url)| ((chain.id, name.clone()), url.clone()))
            })
            .collect();
        Self { urls }
    }
}

impl ChainConnector for EvmConnector {
    fn connect(
        &self,
        settings: &ProviderSettings,
        node: &NodeSettings,
    ) -> Result<Arc<dyn RrpChain>, ChainError> {
        let raw = self
            .urls
            .get(&(settings.chain_id, settings.provider_name.clone()))
            .ok_or_else(|| {
                ChainError::RpcProvider(format!(
                    "no URL configured for provider {} on chain {}",
                    settings.provider_name, settings.chain_id
                ))
            })?;
        let url = Url::parse(raw).map_err(|e| {
            ChainError::RpcProvider(format!(
                "invalid URL for provider {}: {e}",
                settings.provider_name
            ))
        })?;
        Ok(Arc::new(EvmRrpChain::try_new(&settings.provider_name, url, node)?))
    }
}

/// Whether the node rejected the `pending` block tag itself, as opposed to
/// failing the request for any other reason.
fn is_unsupported_pending_error<E: std::fmt::Debug>(error: &E) -> bool {
    let err_str = format!("{error:?}").to_lowercase();
    err_str.contains("unsupported pending")
        || err_str.contains("pending block is not available")
        || err_str.contains("pending tag not supported")
}

/// Reason the RRP contract reverted with.
///
/// The contract guards fulfillments with `require` messages, so `Error(string)`
/// carries the useful text. Compiler panics are reported by code and any other
/// custom error by its selector.
fn decode_revert_reason(data: &[u8]) -> Option<String> {
    let selector = data.get(..4)?;
    if let Ok(revert) = Revert::abi_decode(data) {
        return Some(revert.reason);
    }
    if let Ok(panic) = Panic::abi_decode(data) {
        return Some(format!("Panic({})", panic.code));
    }
    Some(format!("UnknownError(0x{})", hex::encode(selector)))
}

/// Pull revert data out of a debug-formatted RPC error.
///
/// Looks for `data: Some(RawValue("0x..."))`, with plain or escaped quotes.
fn extract_revert(err_str: &str) -> Option<String> {
    const PATTERNS: [(&str, &str); 2] = [
        ("data: Some(RawValue(\"", "\""),
        (r#"data: Some(RawValue(\""#, r#"\""#),
    ];
    PATTERNS.iter().find_map(|(open, close)| {
        let start = err_str.find(open)? + open.len();
        let end = err_str[start..].find(close)?;
        let data: Bytes = err_str[start..start + end].parse().ok()?;
        decode_revert_reason(&data)
    })
}

/// Categorize transport/RPC errors.
///
/// Distinguishes between:
/// - Network/connection errors (DNS, TCP, timeouts) -> RpcProvider
/// - Resource exhaustion (file descriptors, pool) -> RpcProvider
/// - Contract execution errors -> ContractCall with decoded revert reason
fn categorize_transport_error(e: impl std::fmt::Debug, context: &str) -> ChainError {
    let err_str = format!("{:?}", e);

    if let Some(revert_reason) = extract_revert(&err_str) {
        tracing::debug!("{context}: Contract reverted: {revert_reason}");
        return ChainError::ContractCall(revert_reason);
    }

    if err_str.contains("Connection refused")
        || err_str.contains("Connection reset")
        || err_str.contains("No route to host")
        || err_str.contains("timeout")
        || err_str.contains("Timeout")
        || err_str.contains("dns error")
    {
        tracing::debug!("{context}: RPC connection error: {err_str}");
        ChainError::RpcProvider(format!("{context}: Connection error"))
    } else if err_str.contains("Too many open files") || err_str.contains("EMFILE") {
        tracing::debug!("{context}: File descriptor exhaustion: {err_str}");
        ChainError::RpcProvider("Connection pool exhausted".to_string())
    } else if err_str.contains("execution reverted") {
        ChainError::ContractCall("execution reverted".to_string())
    } else {
        tracing::debug!("{context}: RPC call failed: {err_str}");
        ChainError::ContractCall(format!("{context} failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainOptions, TxType};

    const REVERT_INSUFFICIENT: &str = concat!(
        "0x08c379a0",
        "0000000000000000000000000000000000000000000000000000000000000020",
        "000000000000000000000000000000000000000000000000000000000000001a",
        "496e73756666696369656e742073706f6e736f722066756e6473000000000000",
    );

    fn revert_bytes(hex_data: &str) -> Vec<u8> {
        hex::decode(hex_data).unwrap()
    }

    #[test]
    fn test_decode_error_string() {
        assert_eq!(
            decode_revert_reason(&revert_bytes(REVERT_INSUFFICIENT)),
            Some("Insufficient sponsor funds".to_string())
        );
        let encoded = Revert {
            reason: "Invalid request fulfillment".to_string(),
        }
        .abi_encode();
        assert_eq!(
            decode_revert_reason(&encoded),
            Some("Invalid request fulfillment".to_string())
        );
    }

    #[test]
    fn test_decode_panic_code() {
        let encoded = Panic { code: U256::from(0x11) }.abi_encode();
        assert_eq!(decode_revert_reason(&encoded), Some("Panic(17)".to_string()));
    }

    #[test]
    fn test_decode_custom_error() {
        let data =
            revert_bytes("0xdeadbeef00000000000000000000000000000000000000000000000000000000");
        assert_eq!(decode_revert_reason(&data), Some("UnknownError(0xdeadbeef)".to_string()));
    }

    #[test]
    fn test_decode_short_data() {
        assert_eq!(decode_revert_reason(&[]), None);
        assert_eq!(decode_revert_reason(&[0xab]), None);
    }

    #[test]
    fn test_pending_tag_rejection_is_recognised() {
        assert!(is_unsupported_pending_error(
            &r#"ErrorResp(ErrorPayload { code: -32000, message: "Unsupported pending tag" })"#
        ));
        assert!(is_unsupported_pending_error(&"pending block is not available"));
        // anything else is a real failure and must not be masked by a latest-tag retry
        assert!(!is_unsupported_pending_error(&"Connection refused"));
        assert!(!is_unsupported_pending_error(&"execution reverted"));
    }

    #[test]
    fn test_extract_revert_patterns() {
        let plain = format!(concat!(
            r#"TransportError(ErrorResp(ErrorPayload {{ code: 3, "#,
            r#"message: "execution reverted", data: Some(RawValue("{}")) }}))"#,
        ), REVERT_INSUFFICIENT);
        assert_eq!(extract_revert(&plain), Some("Insufficient sponsor funds".to_string()));

        let escaped =
            format!(r#"message: \"x\", data: Some(RawValue(\"{REVERT_INSUFFICIENT}\"))"#);
        assert_eq!(extract_revert(&escaped), Some("Insufficient sponsor funds".to_string()));

        let invalid = r#"data: Some(RawValue("0xzzzz"))"#;
        assert_eq!(extract_revert(invalid), None);

        let none = r#"ErrorResp(ErrorPayload { code: 3, message: "execution reverted" })"#;
        assert_eq!(extract_revert(none), None);
    }

    #[test]
    fn test_categorize_connection_errors() {
        let errors = [
            "Connection refused",
            "Connection reset by peer",
            "request timeout after 30s",
            "dns error: no such host",
        ];
        for err in errors {
            assert!(matches!(categorize_transport_error(err, "test"), ChainError::RpcProvider(_)));
        }
        assert_eq!(
            categorize_transport_error("EMFILE: too many open files in system", "test"),
            ChainError::RpcProvider("Connection pool exhausted".to_string())
        );
    }

    #[test]
    fn test_categorize_revert_with_reason() {
        let err = format!(
            r#"ErrorPayload {{ message: "execution reverted", data: Some(RawValue("{}")) }}"#,
            REVERT_INSUFFICIENT
        );
        assert_eq!(
            categorize_transport_error(err, "eth_call"),
            ChainError::ContractCall("Insufficient sponsor funds".to_string())
        );
    }

    #[test]
    fn test_categorize_generic_error() {
        assert_eq!(
            categorize_transport_error("some unknown error", "estimate_gas"),
            ChainError::ContractCall("estimate_gas failed".to_string())
        );
    }

    fn settings(chain_id: u64, provider: &str) -> ProviderSettings {
        ProviderSettings {
            chain_id,
            provider_name: provider.to_string(),
            airnode_rrp: Address::ZERO,
            airnode_address: Address::ZERO,
            min_confirmations: 0,
            block_history_limit: 300,
            options: ChainOptions {
                tx_type: TxType::Legacy,
                ..ChainOptions::default()
            },
        }
    }

    #[test]
    fn test_connector_looks_up_url_by_chain_and_provider() {
        let config: AirnodeConfig = toml::from_str(
            r#"
[[chains]]
id = 31337
airnode_rrp = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
providers = { local = "http://127.0.0.1:8545", broken = "not a url" }
"#,
        )
        .unwrap();
        let connector = EvmConnector::from_config(&config);
        let node = NodeSettings::default();

        assert!(connector.connect(&settings(31337, "local"), &node).is_ok());
        assert!(matches!(
            connector.connect(&settings(31337, "broken"), &node),
            Err(ChainError::RpcProvider(_))
        ));
        assert!(matches!(
            connector.connect(&settings(1, "local"), &node),
            Err(ChainError::RpcProvider(_))
        ));
    }
}
