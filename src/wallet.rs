//! Deterministic HD wallets for the airnode and its sponsors.
//!
//! Every sponsor gets a dedicated signing wallet derived from the airnode
//! mnemonic at `m/44'/60'/0'/1/c0/c1/c2/c3/c4/c5`, where `c0..c5` are the sponsor
//! address split into six 31-bit chunks (least significant first). All of those
//! segments are non-hardened, so anyone holding the published `m/44'/60'/0'`
//! extended public key can recompute a sponsor wallet address without the
//! mnemonic.

use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use bip32::{ChildNumber, DerivationPath, Prefix, XPrv, XPub};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use std::fmt;
use std::str::FromStr;

/// Account-level path whose xpub is published for third parties.
pub const AIRNODE_ACCOUNT_PATH: &str = "m/44'/60'/0'";
/// Path of the airnode's own identity wallet.
pub const AIRNODE_WALLET_PATH: &str = "m/44'/60'/0'/0/0";
/// Branch under the account path reserved for sponsor wallets.
const SPONSOR_WALLET_BRANCH: u32 = 1;
const CHUNK_BITS: usize = 31;
const CHUNK_COUNT: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid extended public key: {0}")]
    InvalidExtendedPublicKey(String),
    #[error("key derivation failed: {0}")]
    Derivation(String),
}

impl From<bip32::Error> for WalletError {
    fn from(e: bip32::Error) -> Self {
        WalletError::Derivation(e.to_string())
    }
}

/// BIP-32 master node built from the airnode mnemonic.
///
/// Holds the BIP-39 seed; child keys are derived on demand and never cached.
#[derive(Clone)]
pub struct MasterNode {
    seed: [u8; 64],
}

impl fmt::Debug for MasterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterNode").finish_non_exhaustive()
    }
}

impl MasterNode {
    /// Parse a BIP-39 mnemonic and compute its seed (empty passphrase).
    pub fn from_mnemonic(phrase: &str) -> Result<Self, WalletError> {
        let mnemonic = bip39::Mnemonic::parse_normalized(phrase)
            .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
        Ok(Self {
            seed: mnemonic.to_seed_normalized(""),
        })
    }

    fn derive(&self, path: &str) -> Result<XPrv, WalletError> {
        let path = DerivationPath::from_str(path)?;
        Ok(XPrv::derive_from_path(self.seed, &path)?)
    }

    fn signer(&self, path: &str) -> Result<PrivateKeySigner, WalletError> {
        let xprv = self.derive(path)?;
        PrivateKeySigner::from_bytes(&B256::from(xprv.to_bytes()))
            .map_err(|e| WalletError::Derivation(e.to_string()))
    }
}

/// Parse a user-supplied address without coercion.
///
/// Requires the `0x` prefix and exactly 40 hex digits. Mixed-case input must
/// carry a valid EIP-55 checksum.
pub fn parse_address(input: &str) -> Result<Address, WalletError> {
    let invalid = || WalletError::InvalidAddress(input.to_string());
    let digits = input.strip_prefix("0x").ok_or_else(invalid)?;
    if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let is_single_case = digits == digits.to_lowercase() || digits == digits.to_uppercase();
    if is_single_case {
        Address::from_str(input).map_err(|_| invalid())
    } else {
        Address::parse_checksummed(input, None).map_err(|_| invalid())
    }
}

/// The six 31-bit chunks of a sponsor address, least significant first.
fn sponsor_address_chunks(sponsor: &Address) -> [u32; CHUNK_COUNT] {
    let value = U256::from_be_slice(sponsor.as_slice());
    let mask = U256::from(0x7fff_ffffu32);
    let mut chunks = [0u32; CHUNK_COUNT];
    for (i, chunk) in chunks.iter_mut().enumerate() {
        *chunk = ((value >> (CHUNK_BITS * i)) & mask).to::<u32>();
    }
    chunks
}

/// Derivation path relative to the account node, e.g. `1/0/0/0/0/0/0` for the zero address.
pub fn sponsor_wallet_relative_path(sponsor: &Address) -> String {
    let mut segments = vec![SPONSOR_WALLET_BRANCH.to_string()];
    segments.extend(sponsor_address_chunks(sponsor).iter().map(u32::to_string));
    segments.join("/")
}

/// Full derivation path of a sponsor wallet.
pub fn sponsor_wallet_path(sponsor: &Address) -> String {
    format!("{AIRNODE_ACCOUNT_PATH}/{}", sponsor_wallet_relative_path(sponsor))
}

/// Derive the signing wallet dedicated to `sponsor`.
pub fn derive_sponsor_wallet(
    master: &MasterNode,
    sponsor: &Address,
) -> Result<PrivateKeySigner, WalletError> {
    master.signer(&sponsor_wallet_path(sponsor))
}

/// Derive the airnode's own identity wallet.
pub fn airnode_wallet(master: &MasterNode) -> Result<PrivateKeySigner, WalletError> {
    master.signer(AIRNODE_WALLET_PATH)
}

/// Extended public key of the account node, published so that sponsor wallet
/// addresses can be recomputed without the mnemonic.
pub fn extended_public_key(master: &MasterNode) -> Result<String, WalletError> {
    let account = master.derive(AIRNODE_ACCOUNT_PATH)?;
    Ok(account.public_key().to_string(Prefix::XPUB))
}

/// Recompute a sponsor wallet address from the published account xpub.
pub fn derive_sponsor_wallet_address_from_xpub(
    xpub: &str,
    sponsor: &Address,
) -> Result<Address, WalletError> {
    let mut node =
        XPub::from_str(xpub).map_err(|e| WalletError::InvalidExtendedPublicKey(e.to_string()))?;
    let indices = std::iter::once(SPONSOR_WALLET_BRANCH).chain(sponsor_address_chunks(sponsor));
    for index in indices {
        node = node.derive_child(ChildNumber::new(index, false)?)?;
    }
    let public_key = k256::PublicKey::from_sec1_bytes(&node.to_bytes())
        .map_err(|e| WalletError::Derivation(e.to_string()))?;
    let uncompressed = public_key.to_encoded_point(false);
    Ok(Address::from_raw_public_key(&uncompressed.as_bytes()[1..]))
}
