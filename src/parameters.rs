//! Codec for on-chain `encodedParameters`.
//!
//! The layout is a `bytes32` header (the version character `1` followed by one
//! type character per parameter) and then one `(bytes32 name, value)` pair per
//! parameter, all ABI-encoded as a single tuple. Names and `S` values are short
//! strings right-padded with zero bytes.
//!
//! | char | solidity type | decoded as |
//! |------|---------------|------------|
//! | `a`  | `address`     | checksummed hex |
//! | `b`  | `bytes`       | 0x-hex |
//! | `B`  | `bytes32`     | 0x-hex |
//! | `i`  | `int256`      | decimal |
//! | `u`  | `uint256`     | decimal |
//! | `s`  | `string`      | as is |
//! | `S`  | `bytes32`     | short string |
//! | `x`  | `bool`        | `true` / `false` |

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::hex;
use alloy::primitives::{Address, B256, I256, U256};
use std::collections::BTreeMap;
use std::str::FromStr;

const VERSION: u8 = b'1';
const WORD: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParameterError {
    #[error("unsupported encoding version {0:?}")]
    UnsupportedVersion(char),
    #[error("unknown parameter type {0:?}")]
    UnknownType(char),
    #[error("malformed encoded parameters: {0}")]
    Malformed(String),
    #[error("invalid value for parameter {name}: {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("{0} does not fit in 32 bytes")]
    TooLong(String),
    #[error("too many parameters ({0}), at most 31 are supported")]
    TooMany(usize),
}

/// Parameter types supported by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    Address,
    Bytes,
    Bytes32,
    Int256,
    Uint256,
    String,
    String32,
    Bool,
}

impl ParameterType {
    fn from_char(c: char) -> Result<Self, ParameterError> {
        Ok(match c {
            'a' => ParameterType::Address,
            'b' => ParameterType::Bytes,
            'B' => ParameterType::Bytes32,
            'i' => ParameterType::Int256,
            'u' => ParameterType::Uint256,
            's' => ParameterType::String,
            'S' => ParameterType::String32,
            'x' => ParameterType::Bool,
            other => return Err(ParameterError::UnknownType(other)),
        })
    }

    fn as_char(self) -> char {
        match self {
            ParameterType::Address => 'a',
            ParameterType::Bytes => 'b',
            ParameterType::Bytes32 => 'B',
            ParameterType::Int256 => 'i',
            ParameterType::Uint256 => 'u',
            ParameterType::String => 's',
            ParameterType::String32 => 'S',
            ParameterType::Bool => 'x',
        }
    }

    fn sol_type(self) -> DynSolType {
        match self {
            ParameterType::Address => DynSolType::Address,
            ParameterType::Bytes => DynSolType::Bytes,
            ParameterType::Bytes32 | ParameterType::String32 => DynSolType::FixedBytes(WORD),
            ParameterType::Int256 => DynSolType::Int(256),
            ParameterType::Uint256 => DynSolType::Uint(256),
            ParameterType::String => DynSolType::String,
            ParameterType::Bool => DynSolType::Bool,
        }
    }
}

/// A single named parameter to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub kind: ParameterType,
    pub name: String,
    pub value: String,
}

impl Parameter {
    pub fn new(kind: ParameterType, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            value: value.into(),
        }
    }
}

fn string32_to_word(value: &str) -> Result<B256, ParameterError> {
    let bytes = value.as_bytes();
    if bytes.len() > WORD {
        return Err(ParameterError::TooLong(value.to_string()));
    }
    let mut word = [0u8; WORD];
    word[..bytes.len()].copy_from_slice(bytes);
    Ok(B256::from(word))
}

fn word_to_string32(word: &B256) -> Result<String, ParameterError> {
    let end = word.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    String::from_utf8(word[..end].to_vec())
        .map_err(|e| ParameterError::Malformed(format!("short string is not utf-8: {e}")))
}

fn parse_value(parameter: &Parameter) -> Result<DynSolValue, ParameterError> {
    let invalid = |reason: String| ParameterError::InvalidValue {
        name: parameter.name.clone(),
        reason,
    };
    let value = parameter.value.as_str();
    Ok(match parameter.kind {
        ParameterType::Address => {
            DynSolValue::Address(Address::from_str(value).map_err(|e| invalid(e.to_string()))?)
        }
        ParameterType::Bytes => {
            DynSolValue::Bytes(hex::decode(value).map_err(|e| invalid(e.to_string()))?)
        }
        ParameterType::Bytes32 => DynSolValue::FixedBytes(
            B256::from_str(value).map_err(|e| invalid(e.to_string()))?,
            WORD,
        ),
        ParameterType::Int256 => DynSolValue::Int(
            I256::from_dec_str(value).map_err(|e| invalid(e.to_string()))?,
            256,
        ),
        ParameterType::Uint256 => DynSolValue::Uint(
            U256::from_str_radix(value, 10).map_err(|e| invalid(e.to_string()))?,
            256,
        ),
        ParameterType::String => DynSolValue::String(value.to_string()),
        ParameterType::String32 => DynSolValue::FixedBytes(string32_to_word(value)?, WORD),
        ParameterType::Bool => {
            DynSolValue::Bool(bool::from_str(value).map_err(|e| invalid(e.to_string()))?)
        }
    })
}

fn render_value(kind: ParameterType, value: DynSolValue) -> Result<String, ParameterError> {
    let mismatch = || {
        ParameterError::Malformed(format!("unexpected value for type {}", kind.as_char()))
    };
    Ok(match (kind, value) {
        (ParameterType::Address, DynSolValue::Address(address)) => address.to_checksum(None),
        (ParameterType::Bytes, DynSolValue::Bytes(bytes)) => hex::encode_prefixed(bytes),
        (ParameterType::Bytes32, DynSolValue::FixedBytes(word, _)) => word.to_string(),
        (ParameterType::String32, DynSolValue::FixedBytes(word, _)) => word_to_string32(&word)?,
        (ParameterType::Int256, DynSolValue::Int(value, _)) => value.to_string(),
        (ParameterType::Uint256, DynSolValue::Uint(value, _)) => value.to_string(),
        (ParameterType::String, DynSolValue::String(value)) => value,
        (ParameterType::Bool, DynSolValue::Bool(value)) => value.to_string(),
        _ => return Err(mismatch()),
    })
}

/// Encode parameters into the on-chain layout.
pub fn encode_parameters(parameters: &[Parameter]) -> Result<Vec<u8>, ParameterError> {
    if parameters.len() >= WORD {
        return Err(ParameterError::TooMany(parameters.len()));
    }
    let header: String = std::iter::once(VERSION as char)
        .chain(parameters.iter().map(|p| p.kind.as_char()))
        .collect();

    let mut values = vec![DynSolValue::FixedBytes(string32_to_word(&header)?, WORD)];
    for parameter in parameters {
        values.push(DynSolValue::FixedBytes(string32_to_word(&parameter.name)?, WORD));
        values.push(parse_value(parameter)?);
    }
    Ok(DynSolValue::Tuple(values).abi_encode_params())
}

/// Decode on-chain parameters into a name → value map.
///
/// Empty input decodes to an empty map. When a name repeats, the later value wins.
pub fn decode_parameters(encoded: &[u8]) -> Result<BTreeMap<String, String>, ParameterError> {
    if encoded.is_empty() {
        return Ok(BTreeMap::new());
    }
    if encoded.len() < WORD {
        return Err(ParameterError::Malformed(format!(
            "expected at least {WORD} bytes, got {}",
            encoded.len()
        )));
    }

    let header = word_to_string32(&B256::from_slice(&encoded[..WORD]))?;
    let mut chars = header.chars();
    match chars.next() {
        Some(c) if c as u32 == VERSION as u32 => {}
        Some(c) => return Err(ParameterError::UnsupportedVersion(c)),
        None => return Err(ParameterError::Malformed("empty header".to_string())),
    }
    let kinds = chars.map(ParameterType::from_char).collect::<Result<Vec<_>, _>>()?;

    let mut types = vec![DynSolType::FixedBytes(WORD)];
    for kind in &kinds {
        types.push(DynSolType::FixedBytes(WORD));
        types.push(kind.sol_type());
    }
    let decoded = DynSolType::Tuple(types)
        .abi_decode_params(encoded)
        .map_err(|e| ParameterError::Malformed(e.to_string()))?;
    let DynSolValue::Tuple(values) = decoded else {
        return Err(ParameterError::Malformed("expected a tuple".to_string()));
    };

    let mut parameters = BTreeMap::new();
    let mut pairs = values.into_iter().skip(1);
    for kind in kinds {
        let (Some(DynSolValue::FixedBytes(name, _)), Some(value)) = (pairs.next(), pairs.next())
        else {
            return Err(ParameterError::Malformed("missing name/value pair".to_string()));
        };
        parameters.insert(word_to_string32(&name)?, render_value(kind, value)?);
    }
    Ok(parameters)
}
