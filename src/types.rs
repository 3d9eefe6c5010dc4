//! Request model shared by every settlement stage.
//!
//! A [`Request`] is one unit of work discovered from one on-chain event. The
//! payload type parameter distinguishes API calls from withdrawals; everything
//! that does not care about the payload (grouping, sorting, nonce assignment) is
//! written against `Request<P>` generically, and [`AnyRequest`] is the tagged
//! union used where both kinds share one sequence.
//!
//! Requests are never persisted. A request still pending on the next run is
//! rebuilt from chain state, so none of these types carries history.

use alloy::primitives::{Address, B256, Bytes, FixedBytes, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Number of blocks after which a blocked request is considered expired and dropped.
pub const BLOCKED_REQUEST_EXPIRY_BLOCKS: u64 = 20;

/// Lifecycle status of a request within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RequestStatus {
    /// Waiting to be fulfilled.
    #[default]
    Pending,
    /// Cannot be processed this run and holds back the sponsor's queue.
    Blocked,
    /// Already settled on-chain.
    Fulfilled,
    /// A fulfillment transaction was broadcast in this run.
    Submitted,
}

/// How an API call request identifies its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestType {
    /// The request references an on-chain template by id.
    Template,
    /// The request names the airnode and endpoint directly.
    Full,
}

/// Where and when the originating event was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    /// Block the event was emitted in.
    pub block_number: u64,
    /// Chain height at the time the event was fetched.
    pub current_block: u64,
    /// Blocked requests older than this many blocks are dropped.
    #[serde(default = "default_expiry_blocks")]
    pub ignore_blocked_requests_after_blocks: u64,
    /// Position of the event within its block.
    pub log_index: u64,
    /// Transaction that emitted the event.
    pub transaction_hash: B256,
}

fn default_expiry_blocks() -> u64 {
    BLOCKED_REQUEST_EXPIRY_BLOCKS
}

impl RequestMetadata {
    /// Number of blocks between the event and the observed chain head.
    pub fn age_in_blocks(&self) -> u64 {
        self.current_block.saturating_sub(self.block_number)
    }
}

/// Result of a broadcast fulfillment transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fulfillment {
    pub hash: B256,
}

/// One unit of work derived from one on-chain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<P> {
    pub id: B256,
    pub airnode_address: Address,
    pub sponsor_address: Address,
    pub sponsor_wallet_address: Address,
    pub chain_id: u64,
    pub metadata: RequestMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<Fulfillment>,
    #[serde(default)]
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub payload: P,
}

impl<P> Request<P> {
    /// Sort key reproducing on-chain emission order.
    pub fn emission_order(&self) -> (u64, u64) {
        (self.metadata.block_number, self.metadata.log_index)
    }
}

/// API call specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCall {
    pub request_type: RequestType,
    pub requester_address: Address,
    /// Per-requester counter baked into the request id.
    pub request_count: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<B256>,
    pub encoded_parameters: Bytes,
    /// Decoded parameters, template parameters merged in where applicable.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub fulfill_address: Address,
    pub fulfill_function_id: FixedBytes<4>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ois_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ApiCallResponse>,
}

/// Withdrawal specific fields. A withdrawal is fully described by the common
/// request fields: the sponsor asks for its sponsor wallet's balance back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdrawal {}

/// On-chain template referenced by template requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallTemplate {
    pub id: B256,
    pub airnode_address: Address,
    pub endpoint_id: B256,
    pub encoded_parameters: Bytes,
}

/// Output of the API-execution collaborator for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallResponse {
    /// ABI-encoded value delivered to the requester.
    pub data: Bytes,
    /// Signature over the value for signed-data modes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Bytes>,
}

/// Templates keyed by template id.
pub type TemplatesById = HashMap<B256, ApiCallTemplate>;

/// Authorization decisions keyed by request id.
pub type AuthorizationsByRequestId = HashMap<B256, bool>;

/// The requests of one partition, split by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedRequests {
    pub api_calls: Vec<Request<ApiCall>>,
    pub withdrawals: Vec<Request<Withdrawal>>,
}

impl GroupedRequests {
    pub fn new(api_calls: Vec<Request<ApiCall>>, withdrawals: Vec<Request<Withdrawal>>) -> Self {
        Self {
            api_calls,
            withdrawals,
        }
    }

    pub fn len(&self) -> usize {
        self.api_calls.len() + self.withdrawals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.api_calls.is_empty() && self.withdrawals.is_empty()
    }
}

/// Kind of a request, used where both kinds share one ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestKind {
    ApiCall,
    Withdrawal,
}

/// A request of either kind.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyRequest {
    ApiCall(Request<ApiCall>),
    Withdrawal(Request<Withdrawal>),
}

impl AnyRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            AnyRequest::ApiCall(_) => RequestKind::ApiCall,
            AnyRequest::Withdrawal(_) => RequestKind::Withdrawal,
        }
    }

    pub fn id(&self) -> B256 {
        match self {
            AnyRequest::ApiCall(request) => request.id,
            AnyRequest::Withdrawal(request) => request.id,
        }
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            AnyRequest::ApiCall(request) => request.status,
            AnyRequest::Withdrawal(request) => request.status,
        }
    }

    pub fn metadata(&self) -> &RequestMetadata {
        match self {
            AnyRequest::ApiCall(request) => &request.metadata,
            AnyRequest::Withdrawal(request) => &request.metadata,
        }
    }

    pub fn nonce(&self) -> Option<u64> {
        match self {
            AnyRequest::ApiCall(request) => request.nonce,
            AnyRequest::Withdrawal(request) => request.nonce,
        }
    }

    pub fn set_nonce(&mut self, nonce: Option<u64>) {
        match self {
            AnyRequest::ApiCall(request) => request.nonce = nonce,
            AnyRequest::Withdrawal(request) => request.nonce = nonce,
        }
    }

    /// Emission order with API calls ranked ahead of withdrawals at equal position.
    pub fn sequence_key(&self) -> (u64, u64, RequestKind) {
        let metadata = self.metadata();
        (metadata.block_number, metadata.log_index, self.kind())
    }
}

impl From<GroupedRequests> for Vec<AnyRequest> {
    fn from(grouped: GroupedRequests) -> Self {
        grouped
            .api_calls
            .into_iter()
            .map(AnyRequest::ApiCall)
            .chain(grouped.withdrawals.into_iter().map(AnyRequest::Withdrawal))
            .collect()
    }
}

impl FromIterator<AnyRequest> for GroupedRequests {
    fn from_iter<I: IntoIterator<Item = AnyRequest>>(iter: I) -> Self {
        let mut grouped = GroupedRequests::default();
        for request in iter {
            match request {
                AnyRequest::ApiCall(request) => grouped.api_calls.push(request),
                AnyRequest::Withdrawal(request) => grouped.withdrawals.push(request),
            }
        }
        grouped
    }
}
