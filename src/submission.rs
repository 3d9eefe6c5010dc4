//! Signs and broadcasts one sponsor's fulfillments.
//!
//! Requests of both kinds share the sponsor wallet's nonce space, so they are
//! merged into one ascending-nonce sequence and sent strictly one after the
//! other. A failing request is logged and left untouched; it is picked up
//! again from chain state on the next run.

use alloy::network::TransactionBuilder;
use alloy::primitives::U256;
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use std::time::Duration;

use crate::chain::{AirnodeRrpV0, RrpChain, with_retry};
use crate::gas::GasTarget;
use crate::state::{ProviderSettings, ProviderState, SponsorScope};
use crate::types::{ApiCall, Fulfillment, Request, RequestStatus, Withdrawal};
use crate::wallet;

/// Added to the withdrawal gas estimate.
pub const WITHDRAWAL_GAS_PADDING: u64 = 20_000;

/// Value sent with the withdrawal estimate; the real value is unknown until the cost is.
const WITHDRAWAL_ESTIMATE_VALUE: u64 = 1;

/// What is left to withdraw after paying for the transaction and keeping
/// `remainder` in the wallet, or `None` when the balance does not cover that.
pub fn funds_to_send(
    balance: U256,
    gas_limit: u64,
    price_per_gas: u128,
    remainder: U256,
) -> Option<U256> {
    let tx_cost = U256::from(gas_limit).checked_mul(U256::from(price_per_gas))?;
    balance.checked_sub(tx_cost)?.checked_sub(remainder)
}

struct Submitter<'a> {
    chain: &'a dyn RrpChain,
    signer: &'a PrivateKeySigner,
    settings: &'a ProviderSettings,
    gas_target: GasTarget,
    attempt_timeout: Duration,
}

impl Submitter<'_> {
    fn base_tx(&self) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(self.signer.address())
            .with_to(self.settings.airnode_rrp)
    }

    fn finalize(&self, tx: TransactionRequest, nonce: u64, gas_limit: u64) -> TransactionRequest {
        self.gas_target.apply(
            tx.with_chain_id(self.settings.chain_id)
                .with_nonce(nonce)
                .with_gas_limit(gas_limit),
        )
    }

    async fn submit_api_call(
        &self,
        request: &Request<ApiCall>,
        nonce: u64,
    ) -> Option<Fulfillment> {
        let call = &request.payload;
        let Some(response) = &call.response else {
            tracing::error!(request_id = %request.id, "API call has no response, skipping");
            return None;
        };
        let Some(signature) = &response.signature else {
            tracing::error!(request_id = %request.id, "API response is not signed, skipping");
            return None;
        };

        let input = AirnodeRrpV0::fulfillCall {
            requestId: request.id,
            airnode: self.settings.airnode_address,
            fulfillAddress: call.fulfill_address,
            fulfillFunctionId: call.fulfill_function_id,
            data: response.data.clone(),
            signature: signature.clone(),
        }
        .abi_encode();
        let tx = self.base_tx().with_input(input);

        match self.chain.call(tx.clone()).await {
            Ok(output) => match AirnodeRrpV0::fulfillCall::abi_decode_returns(&output) {
                Ok(result) if result.callSuccess => {}
                Ok(_) => {
                    tracing::info!(
                        request_id = %request.id,
                        "Requester callback would revert, not fulfilling"
                    );
                    return None;
                }
                Err(e) => {
                    tracing::error!(
                        request_id = %request.id,
                        error = %e,
                        "Unexpected fulfill simulation output"
                    );
                    return None;
                }
            },
            Err(e) => {
                tracing::error!(
                    request_id = %request.id,
                    error = %e,
                    "Fulfillment simulation failed"
                );
                return None;
            }
        }

        let tx = self.finalize(tx, nonce, self.settings.options.fulfillment_gas_limit);
        match self.chain.send(tx, self.signer).await {
            Ok(hash) => {
                tracing::info!(
                    request_id = %request.id,
                    nonce,
                    tx_hash = %hash,
                    "Submitted API call fulfillment"
                );
                Some(Fulfillment { hash })
            }
            Err(e) => {
                tracing::error!(
                    request_id = %request.id,
                    nonce,
                    error = %e,
                    "Failed to submit API call fulfillment"
                );
                None
            }
        }
    }

    async fn submit_withdrawal(
        &self,
        request: &Request<Withdrawal>,
        nonce: u64,
    ) -> Option<Fulfillment> {
        let wallet_address = self.signer.address();
        let balance = with_retry("get_balance", self.attempt_timeout, || {
            self.chain.balance(wallet_address)
        })
        .await;
        let balance = match balance {
            Ok(balance) => balance,
            Err(e) => {
                tracing::error!(
                    request_id = %request.id,
                    error = %e,
                    "Failed to fetch sponsor wallet balance"
                );
                return None;
            }
        };

        let input = AirnodeRrpV0::fulfillWithdrawalCall {
            requestId: request.id,
            airnode: self.settings.airnode_address,
            sponsor: request.sponsor_address,
        }
        .abi_encode();
        let tx = self.base_tx().with_input(input);

        let estimate_tx = tx.clone().with_value(U256::from(WITHDRAWAL_ESTIMATE_VALUE));
        let estimate = with_retry("estimate_gas", self.attempt_timeout, || {
            self.chain.estimate_gas(estimate_tx.clone())
        })
        .await;
        let estimate = match estimate {
            Ok(estimate) => estimate,
            Err(e) => {
                tracing::error!(
                    request_id = %request.id,
                    error = %e,
                    "Failed to estimate withdrawal gas"
                );
                return None;
            }
        };

        let gas_limit = estimate.saturating_add(WITHDRAWAL_GAS_PADDING);
        let price = self.gas_target.max_price_per_gas();
        let remainder = U256::from(self.settings.options.withdrawal_remainder_wei);
        let Some(value) = funds_to_send(balance, gas_limit, price, remainder) else {
            tracing::info!(
                request_id = %request.id,
                balance = %balance,
                gas_limit,
                price_per_gas = price,
                remainder = %remainder,
                "Sponsor wallet balance does not cover the withdrawal transaction"
            );
            return None;
        };

        let tx = self.finalize(tx.with_value(value), nonce, gas_limit);
        match self.chain.send(tx, self.signer).await {
            Ok(hash) => {
                tracing::info!(
                    request_id = %request.id,
                    nonce,
                    amount = %value,
                    tx_hash = %hash,
                    "Submitted withdrawal"
                );
                Some(Fulfillment { hash })
            }
            Err(e) => {
                tracing::error!(
                    request_id = %request.id,
                    nonce,
                    error = %e,
                    "Failed to submit withdrawal"
                );
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Job {
    ApiCall(usize),
    Withdrawal(usize),
}

fn mark_submitted<P>(request: &mut Request<P>, fulfillment: Option<Fulfillment>) {
    if let Some(fulfillment) = fulfillment {
        request.fulfillment = Some(fulfillment);
        request.status = RequestStatus::Submitted;
    }
}

fn is_submittable<P>(request: &Request<P>) -> Option<u64> {
    match request.status {
        RequestStatus::Pending => request.nonce,
        _ => None,
    }
}

/// Submit every pending, nonce-bearing request of the sponsor in nonce order.
pub async fn submit_transactions(
    state: ProviderState<SponsorScope>,
    attempt_timeout: Duration,
) -> ProviderState<SponsorScope> {
    let sponsor = state.sponsor_address();
    let Some(gas_target) = state.core.gas_target else {
        tracing::error!(%sponsor, "No gas target available, skipping submission");
        return state;
    };
    let signer = match wallet::derive_sponsor_wallet(state.master(), &sponsor) {
        Ok(signer) => signer,
        Err(e) => {
            tracing::error!(
                %sponsor,
                error = %e,
                "Failed to derive sponsor wallet, skipping submission"
            );
            return state;
        }
    };

    let mut requests = state.requests().clone();
    let mut jobs: Vec<(u64, Job)> = requests
        .api_calls
        .iter()
        .enumerate()
        .filter_map(|(i, r)| is_submittable(r).map(|nonce| (nonce, Job::ApiCall(i))))
        .chain(requests.withdrawals.iter().enumerate().filter_map(|(i, r)| {
            is_submittable(r).map(|nonce| (nonce, Job::Withdrawal(i)))
        }))
        .collect();
    jobs.sort_by_key(|(nonce, _)| *nonce);

    let submitter = Submitter {
        chain: state.chain(),
        signer: &signer,
        settings: state.settings(),
        gas_target,
        attempt_timeout,
    };
    tracing::debug!(
        %sponsor,
        sponsor_wallet = %signer.address(),
        count = jobs.len(),
        "Submitting transactions"
    );

    for (nonce, job) in jobs {
        match job {
            Job::ApiCall(i) => {
                let fulfillment = submitter.submit_api_call(&requests.api_calls[i], nonce).await;
                mark_submitted(&mut requests.api_calls[i], fulfillment);
            }
            Job::Withdrawal(i) => {
                let fulfillment = submitter
                    .submit_withdrawal(&requests.withdrawals[i], nonce)
                    .await;
                mark_submitted(&mut requests.withdrawals[i], fulfillment);
            }
        }
    }

    state.with_requests(requests)
}
