//! One settlement cycle over every configured provider.
//!
//! Providers run concurrently. Within a provider the stages run in order:
//! aggregate, resolve templates, verify identities, apply authorizations, call
//! APIs, fetch nonce baselines, then hand each sponsor to its own worker. A
//! worker receives only a serializable [`ProviderStateCore`] and rebuilds its
//! chain connection and wallets from the node secrets, so a panic or failure in
//! one sponsor never reaches another.

use alloy::primitives::{Address, B256};
use alloy::signers::local::PrivateKeySigner;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::aggregation::{aggregate, merge_api_calls_with_templates};
use crate::authorization::apply_authorizations;
use crate::chain::{ChainConnector, with_retry};
use crate::config::{AirnodeConfig, NodeSettings, Secrets};
use crate::external::Collaborators;
use crate::gas::GasTargetSource;
use crate::grouping::{group_requests_by_sponsor_address, sort_grouped_requests};
use crate::logging;
use crate::nonces::assign_nonces;
use crate::signing::sign_fulfillment;
use crate::state::{
    Capabilities, ProviderScope, ProviderSettings, ProviderState, ProviderStateCore, SponsorScope,
};
use crate::submission::submit_transactions;
use crate::types::{ApiCall, ApiCallResponse, GroupedRequests, Request, RequestStatus};
use crate::verification::{verify_api_call_ids, verify_sponsor_wallets};
use crate::wallet::{self, MasterNode, WalletError};

/// Failures that abort the whole run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid airnode wallet: {0}")]
    InvalidMnemonic(#[from] WalletError),
    #[error("no chain provider could be initialized")]
    NoProviders,
    #[error("run did not finish within {0:?}")]
    Timeout(Duration),
}

/// Final requests of one provider after a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResult {
    pub chain_id: u64,
    pub provider_name: String,
    pub requests: GroupedRequests,
}

/// Shared by every provider pipeline of one run.
struct RunContext<'a> {
    config: &'a AirnodeConfig,
    secrets: &'a Secrets,
    collaborators: &'a Collaborators,
    connector: Arc<dyn ChainConnector>,
    gas_source: Arc<dyn GasTargetSource>,
    master: MasterNode,
    airnode: PrivateKeySigner,
}

fn new_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{nanos:x}")
}

/// Run one settlement cycle.
///
/// Returns the final requests of every provider that could be connected. An
/// invalid mnemonic, no reachable provider at all, or exceeding the run timeout
/// fails the run; everything else is logged and scoped to the request or
/// sponsor it affects.
pub async fn run(
    config: &AirnodeConfig,
    secrets: &Secrets,
    collaborators: &Collaborators,
    connector: Arc<dyn ChainConnector>,
    gas_source: Arc<dyn GasTargetSource>,
) -> Result<Vec<ProviderResult>, PipelineError> {
    let run_id = new_run_id();
    run_cycle(config, secrets, collaborators, connector, gas_source)
        .instrument(logging::run_span(&run_id))
        .await
}

async fn run_cycle(
    config: &AirnodeConfig,
    secrets: &Secrets,
    collaborators: &Collaborators,
    connector: Arc<dyn ChainConnector>,
    gas_source: Arc<dyn GasTargetSource>,
) -> Result<Vec<ProviderResult>, PipelineError> {
    let master = MasterNode::from_mnemonic(&secrets.mnemonic)?;
    let airnode = wallet::airnode_wallet(&master)?;
    tracing::info!(airnode = %airnode.address(), "Starting settlement run");

    let ctx = RunContext {
        config,
        secrets,
        collaborators,
        connector,
        gas_source,
        master,
        airnode,
    };

    let run_timeout = config.node_settings.run_timeout();
    let providers = config
        .chains
        .iter()
        .flat_map(|chain| {
            chain
                .providers
                .keys()
                .map(|name| ProviderSettings::new(chain, name, ctx.airnode.address()))
        })
        .map(|settings| {
            let span = logging::provider_span(settings.chain_id, &settings.provider_name);
            process_provider(&ctx, settings).instrument(span)
        });

    let outcomes = tokio::time::timeout(run_timeout, join_all(providers))
        .await
        .map_err(|_| PipelineError::Timeout(run_timeout))?;

    let results: Vec<ProviderResult> = outcomes.into_iter().flatten().collect();
    if results.is_empty() {
        tracing::error!("No chain provider could be initialized");
        return Err(PipelineError::NoProviders);
    }
    tracing::info!(providers = results.len(), "Settlement run finished");
    Ok(results)
}

/// Run the pipeline for one provider. `None` when the provider cannot be reached.
async fn process_provider(
    ctx: &RunContext<'_>,
    settings: ProviderSettings,
) -> Option<ProviderResult> {
    let node = &ctx.config.node_settings;
    let chain = match ctx.connector.connect(&settings, node) {
        Ok(chain) => chain,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize provider");
            return None;
        }
    };
    let state = ProviderState::for_provider(
        settings,
        Capabilities {
            chain,
            master: ctx.master.clone(),
        },
    );

    let requests = match ctx.collaborators.requests.pending_requests(state.settings()).await {
        Ok(requests) => requests,
        Err(e) => {
            tracing::error!(error = %e, "Failed to fetch pending requests");
            return None;
        }
    };
    tracing::info!(
        api_calls = requests.api_calls.len(),
        withdrawals = requests.withdrawals.len(),
        "Fetched pending requests"
    );

    let api_calls = prepare_api_calls(ctx, &state, requests.api_calls).await;
    let withdrawals = verify_sponsor_wallets(requests.withdrawals, state.master());
    let state = state.with_requests(GroupedRequests::new(api_calls, withdrawals));

    let by_sponsor = group_requests_by_sponsor_address(state.requests().clone());
    let sponsors = by_sponsor.keys().copied();
    let counts = fetch_transaction_counts(&state, sponsors, node.rpc_attempt_timeout()).await;
    let state = state.with_transaction_counts(counts);

    let requests = submit_per_sponsor(ctx, &state, by_sponsor).await;
    let settings = state.settings();
    Some(ProviderResult {
        chain_id: settings.chain_id,
        provider_name: settings.provider_name.clone(),
        requests,
    })
}

/// Aggregate, resolve, verify, authorize and execute the provider's API calls.
async fn prepare_api_calls(
    ctx: &RunContext<'_>,
    state: &ProviderState<ProviderScope>,
    api_calls: Vec<Request<ApiCall>>,
) -> Vec<Request<ApiCall>> {
    let settings = state.settings();
    let triggers = &ctx.config.triggers;

    let api_calls = aggregate(api_calls, triggers);

    let mut template_ids: Vec<B256> =
        api_calls.iter().filter_map(|r| r.payload.template_id).collect();
    template_ids.sort();
    template_ids.dedup();
    let templates = if template_ids.is_empty() {
        Default::default()
    } else {
        match ctx.collaborators.templates.templates(settings, &template_ids).await {
            Ok(templates) => templates,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch templates");
                Default::default()
            }
        }
    };
    let api_calls = merge_api_calls_with_templates(api_calls, &templates, triggers);

    let api_calls = verify_api_call_ids(api_calls, settings.airnode_rrp);
    let api_calls = verify_sponsor_wallets(api_calls, state.master());

    let authorizations = if api_calls.is_empty() {
        Default::default()
    } else {
        match ctx.collaborators.authorizations.authorizations(settings, &api_calls).await {
            Ok(authorizations) => authorizations,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch authorizations");
                Default::default()
            }
        }
    };
    let api_calls = apply_authorizations(api_calls, &authorizations);

    let responses = join_all(api_calls.into_iter().map(|call| call_api(ctx, call))).await;
    responses.into_iter().flatten().collect()
}

/// Attach the signed API response, or drop the call when the API fails.
async fn call_api(ctx: &RunContext<'_>, mut call: Request<ApiCall>) -> Option<Request<ApiCall>> {
    if call.status != RequestStatus::Pending {
        return Some(call);
    }
    if call.payload.endpoint_name.is_none() {
        tracing::error!(
            request_id = %call.id,
            "No endpoint configured for request, dropping request"
        );
        return None;
    }
    let data = match ctx.collaborators.api.call_api(&call).await {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(
                request_id = %call.id,
                error = %e,
                "API call failed, dropping request"
            );
            return None;
        }
    };
    let signature = match sign_fulfillment(&ctx.airnode, call.id, &data) {
        Ok(signature) => signature,
        Err(e) => {
            tracing::error!(
                request_id = %call.id,
                error = %e,
                "Failed to sign API response, dropping request"
            );
            return None;
        }
    };
    call.payload.response = Some(ApiCallResponse {
        data,
        signature: Some(signature),
    });
    Some(call)
}

/// On-chain nonce baseline of every sponsor wallet. Sponsors whose count cannot
/// be fetched are missing from the result.
async fn fetch_transaction_counts(
    state: &ProviderState<ProviderScope>,
    sponsors: impl Iterator<Item = Address>,
    attempt_timeout: Duration,
) -> BTreeMap<Address, u64> {
    let chain = state.chain();
    let fetches = sponsors.map(|sponsor| async move {
        let wallet = match wallet::derive_sponsor_wallet(state.master(), &sponsor) {
            Ok(signer) => signer.address(),
            Err(e) => {
                tracing::error!(%sponsor, error = %e, "Failed to derive sponsor wallet");
                return None;
            }
        };
        let count = with_retry("transaction_count", attempt_timeout, || {
            chain.transaction_count(wallet)
        })
        .await;
        match count {
            Ok(count) => {
                tracing::debug!(
                    %sponsor,
                    sponsor_wallet = %wallet,
                    count,
                    "Fetched transaction count"
                );
                Some((sponsor, count))
            }
            Err(e) => {
                tracing::error!(
                    %sponsor,
                    sponsor_wallet = %wallet,
                    error = %e,
                    "Failed to fetch transaction count"
                );
                None
            }
        }
    });
    join_all(fetches).await.into_iter().flatten().collect()
}

/// Assign nonces and submit each sponsor's requests in its own task.
async fn submit_per_sponsor(
    ctx: &RunContext<'_>,
    state: &ProviderState<ProviderScope>,
    by_sponsor: BTreeMap<Address, GroupedRequests>,
) -> GroupedRequests {
    let mut results: BTreeMap<Address, GroupedRequests> = BTreeMap::new();
    let mut workers = JoinSet::new();

    for (sponsor, requests) in by_sponsor {
        let requests = sort_grouped_requests(requests);
        let counts = &state.core.transaction_counts_by_sponsor_address;
        let Some(count) = counts.get(&sponsor).copied() else {
            tracing::error!(
                %sponsor,
                "No transaction count for sponsor wallet, skipping sponsor"
            );
            results.insert(sponsor, requests);
            continue;
        };
        let requests = assign_nonces(requests, count);
        results.insert(sponsor, requests.clone());

        let core = state.sponsor_core(sponsor, requests);
        let secrets = ctx.secrets.clone();
        let connector = ctx.connector.clone();
        let gas_source = ctx.gas_source.clone();
        let node = ctx.config.node_settings.clone();
        workers.spawn(
            async move {
                let core = sponsor_worker(
                    core,
                    &secrets,
                    connector.as_ref(),
                    gas_source.as_ref(),
                    &node,
                )
                .await;
                (sponsor, core)
            }
            .instrument(logging::sponsor_span(&sponsor)),
        );
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((sponsor, core)) => {
                results.insert(sponsor, core.requests);
            }
            // the sponsor keeps its pre-submission requests
            Err(e) => tracing::error!(error = %e, "Sponsor worker failed"),
        }
    }

    results
        .into_values()
        .fold(GroupedRequests::default(), |mut all, mut requests| {
            all.api_calls.append(&mut requests.api_calls);
            all.withdrawals.append(&mut requests.withdrawals);
            all
        })
}

/// Submit one sponsor's requests. Returns the core unchanged when the worker
/// cannot rebuild its state or price its transactions.
pub async fn sponsor_worker(
    core: ProviderStateCore<SponsorScope>,
    secrets: &Secrets,
    connector: &dyn ChainConnector,
    gas_source: &dyn GasTargetSource,
    node: &NodeSettings,
) -> ProviderStateCore<SponsorScope> {
    let state = match ProviderState::rebuild(core.clone(), secrets, connector, node) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to rebuild sponsor state");
            return core;
        }
    };
    let gas_target = match gas_source.gas_target(state.chain(), &state.settings().options).await {
        Ok(target) => target,
        Err(e) => {
            tracing::error!(error = %e, "Failed to fetch gas target, skipping sponsor");
            return core;
        }
    };
    submit_transactions(state.with_gas_target(Some(gas_target)), node.rpc_attempt_timeout())
        .await
        .into_core()
}
