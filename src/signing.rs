//! Airnode signatures over fulfilled values.
//!
//! `AirnodeRrpV0.fulfill` only accepts data signed by the airnode wallet, and
//! signed-data endpoints hand out the same kind of proof off-chain. Both are
//! EIP-191 personal signatures over a keccak256 digest, encoded as 65-byte
//! `r‖s‖v`.

use alloy::primitives::{B256, Bytes, U256, keccak256};
use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolValue;

/// Signature checked by `fulfill`: over `keccak256(requestId ‖ data)`.
pub fn sign_fulfillment(
    airnode: &PrivateKeySigner,
    request_id: B256,
    data: &Bytes,
) -> Result<Bytes, alloy::signers::Error> {
    let digest = keccak256((request_id, data.clone()).abi_encode_packed());
    let signature = airnode.sign_message_sync(digest.as_slice())?;
    Ok(Bytes::copy_from_slice(&signature.as_bytes()))
}

/// Signature for signed-data responses: over `keccak256(id ‖ uint256 timestamp ‖ data)`.
///
/// `id` is the request id or template id the value was produced for.
pub fn sign_signed_data(
    airnode: &PrivateKeySigner,
    id: B256,
    timestamp: U256,
    data: &Bytes,
) -> Result<Bytes, alloy::signers::Error> {
    let digest = keccak256((id, timestamp, data.clone()).abi_encode_packed());
    let signature = airnode.sign_message_sync(digest.as_slice())?;
    Ok(Bytes::copy_from_slice(&signature.as_bytes()))
}
