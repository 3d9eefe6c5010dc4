//! Identity checks: request ids, template ids and sponsor wallets.
//!
//! Every id is recomputed from the fields it is supposed to commit to. A request
//! that fails any of these checks is permanently invalid and dropped; nothing
//! here tries to repair it.

use alloy::primitives::{Address, B256, Bytes, U256, keccak256};
use alloy::sol_types::SolValue;
use std::collections::HashMap;

use crate::types::{ApiCall, ApiCallTemplate, Request, RequestType};
use crate::wallet::{self, MasterNode};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("{request_type:?} request {id} is missing {field}")]
    MissingField {
        id: B256,
        request_type: RequestType,
        field: &'static str,
    },
}

/// Recompute the id `AirnodeRrpV0` assigned to an API call.
///
/// The preimage is the tight packing of chain id, RRP contract, requester,
/// request count, then the template id (template requests) or airnode and
/// endpoint id (full requests), sponsor, sponsor wallet, fulfill target and
/// encoded parameters.
pub fn expected_request_id(
    request: &Request<ApiCall>,
    rrp_address: Address,
) -> Result<B256, VerificationError> {
    let call = &request.payload;
    let missing = |field| VerificationError::MissingField {
        id: request.id,
        request_type: call.request_type,
        field,
    };
    let chain_id = U256::from(request.chain_id);

    let packed = match call.request_type {
        RequestType::Template => {
            let template_id = call.template_id.ok_or_else(|| missing("templateId"))?;
            (
                chain_id,
                rrp_address,
                call.requester_address,
                call.request_count,
                template_id,
                request.sponsor_address,
                request.sponsor_wallet_address,
                call.fulfill_address,
                call.fulfill_function_id,
                call.encoded_parameters.clone(),
            )
                .abi_encode_packed()
        }
        RequestType::Full => {
            let endpoint_id = call.endpoint_id.ok_or_else(|| missing("endpointId"))?;
            (
                chain_id,
                rrp_address,
                call.requester_address,
                call.request_count,
                request.airnode_address,
                endpoint_id,
                request.sponsor_address,
                request.sponsor_wallet_address,
                call.fulfill_address,
                call.fulfill_function_id,
                call.encoded_parameters.clone(),
            )
                .abi_encode_packed()
        }
    };
    Ok(keccak256(packed))
}

pub fn is_valid_request_id(request: &Request<ApiCall>, rrp_address: Address) -> bool {
    matches!(expected_request_id(request, rrp_address), Ok(id) if id == request.id)
}

/// Template id as created by `AirnodeRrpV0.createTemplate`.
pub fn expected_template_id_v0(airnode: Address, endpoint_id: B256, parameters: &Bytes) -> B256 {
    keccak256((airnode, endpoint_id, parameters.clone()).abi_encode_packed())
}

/// Airnode-agnostic template id.
pub fn expected_template_id_v1(endpoint_id: B256, parameters: &Bytes) -> B256 {
    keccak256((endpoint_id, parameters.clone()).abi_encode_packed())
}

/// Whether a fetched template hashes to the id it is stored under.
pub fn is_valid_template(template: &ApiCallTemplate) -> bool {
    template.id
        == expected_template_id_v0(
            template.airnode_address,
            template.endpoint_id,
            &template.encoded_parameters,
        )
        || template.id
            == expected_template_id_v1(template.endpoint_id, &template.encoded_parameters)
}

/// Drop API calls whose id does not match its recomputed hash.
pub fn verify_api_call_ids(
    api_calls: Vec<Request<ApiCall>>,
    rrp_address: Address,
) -> Vec<Request<ApiCall>> {
    api_calls
        .into_iter()
        .filter(|request| match expected_request_id(request, rrp_address) {
            Ok(expected) if expected == request.id => true,
            Ok(expected) => {
                tracing::error!(
                    request_id = %request.id,
                    expected = %expected,
                    "Invalid request ID, dropping request"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    request_id = %request.id,
                    error = %e,
                    "Cannot verify request ID, dropping request"
                );
                false
            }
        })
        .collect()
}

/// Drop requests whose sponsor wallet is not the one derived for their sponsor.
///
/// Works for either payload kind. Derivations are cached per sponsor.
pub fn verify_sponsor_wallets<P>(
    requests: Vec<Request<P>>,
    master: &MasterNode,
) -> Vec<Request<P>> {
    let mut derived: HashMap<Address, Option<Address>> = HashMap::new();
    requests
        .into_iter()
        .filter(|request| {
            let expected = *derived.entry(request.sponsor_address).or_insert_with(|| {
                match wallet::derive_sponsor_wallet(master, &request.sponsor_address) {
                    Ok(signer) => Some(signer.address()),
                    Err(e) => {
                        tracing::error!(
                            sponsor = %request.sponsor_address,
                            error = %e,
                            "Failed to derive sponsor wallet"
                        );
                        None
                    }
                }
            });
            match expected {
                Some(expected) if expected == request.sponsor_wallet_address => {
                    tracing::debug!(
                        request_id = %request.id,
                        sponsor = %request.sponsor_address,
                        sponsor_wallet = %expected,
                        "Sponsor wallet verified"
                    );
                    true
                }
                Some(expected) => {
                    tracing::error!(
                        request_id = %request.id,
                        sponsor = %request.sponsor_address,
                        sponsor_wallet = %request.sponsor_wallet_address,
                        expected = %expected,
                        "Invalid sponsor wallet, dropping request"
                    );
                    false
                }
                None => false,
            }
        })
        .collect()
}
