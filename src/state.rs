//! Per-run provider state.
//!
//! State is split in two. [`ProviderStateCore`] is plain data (settings,
//! requests, gas target, nonce baselines) and can be serialized and handed to a
//! worker. [`Capabilities`] holds what cannot cross that boundary: the live
//! chain connection and the HD master node. A worker rebuilds its capabilities
//! from the core plus the node secrets with [`ProviderState::rebuild`].
//!
//! Each pipeline stage consumes a state and returns a new one; nothing is
//! shared or locked.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::chain::{ChainConnector, ChainError, RrpChain};
use crate::config::{ChainConfig, ChainOptions, NodeSettings, Secrets};
use crate::gas::GasTarget;
use crate::types::GroupedRequests;
use crate::wallet::{MasterNode, WalletError};

/// Everything about one provider that the pipeline needs besides live handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    pub chain_id: u64,
    pub provider_name: String,
    pub airnode_rrp: Address,
    pub airnode_address: Address,
    pub min_confirmations: u64,
    pub block_history_limit: u64,
    pub options: ChainOptions,
}

impl ProviderSettings {
    pub fn new(chain: &ChainConfig, provider_name: &str, airnode_address: Address) -> Self {
        Self {
            chain_id: chain.id,
            provider_name: provider_name.to_string(),
            airnode_rrp: chain.airnode_rrp,
            airnode_address,
            min_confirmations: chain.min_confirmations,
            block_history_limit: chain.block_history_limit,
            options: chain.options.clone(),
        }
    }
}

/// State scoped to a whole provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderScope;

/// State narrowed to a single sponsor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorScope {
    pub sponsor_address: Address,
}

/// Serializable part of the provider state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStateCore<S> {
    pub settings: ProviderSettings,
    pub scope: S,
    #[serde(default)]
    pub gas_target: Option<GasTarget>,
    pub requests: GroupedRequests,
    /// On-chain nonce baseline per sponsor, fetched once per run.
    #[serde(default)]
    pub transaction_counts_by_sponsor_address: BTreeMap<Address, u64>,
}

/// Live handles that are rebuilt rather than transferred.
#[derive(Clone)]
pub struct Capabilities {
    pub chain: Arc<dyn RrpChain>,
    pub master: MasterNode,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

#[derive(Debug, Clone)]
pub struct ProviderState<S> {
    pub core: ProviderStateCore<S>,
    pub capabilities: Capabilities,
}

impl<S> ProviderState<S> {
    pub fn new(core: ProviderStateCore<S>, capabilities: Capabilities) -> Self {
        Self { core, capabilities }
    }

    /// Recreate live handles for `core` from the node secrets.
    pub fn rebuild(
        core: ProviderStateCore<S>,
        secrets: &Secrets,
        connector: &dyn ChainConnector,
        node: &NodeSettings,
    ) -> Result<Self, RebuildError> {
        let master = MasterNode::from_mnemonic(&secrets.mnemonic)?;
        let chain = connector.connect(&core.settings, node)?;
        Ok(Self::new(core, Capabilities { chain, master }))
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.core.settings
    }

    pub fn requests(&self) -> &GroupedRequests {
        &self.core.requests
    }

    pub fn chain(&self) -> &dyn RrpChain {
        self.capabilities.chain.as_ref()
    }

    pub fn master(&self) -> &MasterNode {
        &self.capabilities.master
    }

    pub fn into_core(self) -> ProviderStateCore<S> {
        self.core
    }

    pub fn with_requests(mut self, requests: GroupedRequests) -> Self {
        self.core.requests = requests;
        self
    }

    pub fn with_gas_target(mut self, gas_target: Option<GasTarget>) -> Self {
        self.core.gas_target = gas_target;
        self
    }

    pub fn with_transaction_counts(mut self, counts: BTreeMap<Address, u64>) -> Self {
        self.core.transaction_counts_by_sponsor_address = counts;
        self
    }
}

impl ProviderState<ProviderScope> {
    pub fn for_provider(settings: ProviderSettings, capabilities: Capabilities) -> Self {
        Self::new(
            ProviderStateCore {
                settings,
                scope: ProviderScope,
                gas_target: None,
                requests: GroupedRequests::default(),
                transaction_counts_by_sponsor_address: BTreeMap::new(),
            },
            capabilities,
        )
    }

    /// Serializable core for one sponsor's worker, carrying only that sponsor's
    /// requests and nonce baseline.
    pub fn sponsor_core(
        &self,
        sponsor: Address,
        requests: GroupedRequests,
    ) -> ProviderStateCore<SponsorScope> {
        let transaction_counts_by_sponsor_address = self
            .core
            .transaction_counts_by_sponsor_address
            .get(&sponsor)
            .map(|count| BTreeMap::from([(sponsor, *count)]))
            .unwrap_or_default();
        ProviderStateCore {
            settings: self.core.settings.clone(),
            scope: SponsorScope {
                sponsor_address: sponsor,
            },
            gas_target: self.core.gas_target,
            requests,
            transaction_counts_by_sponsor_address,
        }
    }
}

impl ProviderState<SponsorScope> {
    pub fn sponsor_address(&self) -> Address {
        self.core.scope.sponsor_address
    }

    /// Nonce baseline of this sponsor's wallet, if it could be fetched.
    pub fn transaction_count(&self) -> Option<u64> {
        self.core
            .transaction_counts_by_sponsor_address
            .get(&self.sponsor_address())
            .copied()
    }
}
