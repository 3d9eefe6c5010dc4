//! End-to-end settlement cycles against an in-memory chain.

use alloy::primitives::{Address, B256, Bytes, FixedBytes, U256, address, b256, keccak256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use airnode_settlement::chain::{ChainConnector, ChainError, RrpChain};
use airnode_settlement::config::{
    AirnodeConfig, ChainConfig, ChainOptions, NodeSettings, RrpTrigger, Secrets, TriggersConfig,
    TxType,
};
use airnode_settlement::coordinator::{self, PipelineError, ProviderResult};
use airnode_settlement::external::{ApiResponse, AuthorizationDecision, Collaborators, Workload};
use airnode_settlement::gas::ProviderGasOracle;
use airnode_settlement::grouping::{group_requests_by_sponsor_address, sort_grouped_requests};
use airnode_settlement::nonces::assign_nonces;
use airnode_settlement::state::ProviderSettings;
use airnode_settlement::types::{
    ApiCall, GroupedRequests, Request, RequestMetadata, RequestStatus, RequestType, Withdrawal,
};
use airnode_settlement::verification::expected_request_id;
use airnode_settlement::wallet::{self, MasterNode};

const MNEMONIC: &str = "test test test test test test test test test test test junk";
const RRP: Address = address!("0xa0AD79D995DdeeB18a14eAef56A549A04e3Aa1Bd");
const SPONSOR: Address = address!("0x2479808b1216E998309A727df8A0A98A1130A162");
const REQUESTER: Address = address!("0x2479808b1216e998309a727DF8a0a98A1130a161");
const ENDPOINT_ID: B256 =
    b256!("0x13dea3311fe0d6b84f4daeab831befbc49e19e6494c41e9e065a09c3c68f43b6");
const CHAIN_ID: u64 = 31337;
const GAS_PRICE: u128 = 1000;

#[derive(Default)]
struct TestChain {
    transaction_counts: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    sent: Mutex<Vec<TransactionRequest>>,
}

#[async_trait]
impl RrpChain for TestChain {
    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        Ok(self.transaction_counts.get(&address).copied().unwrap_or(0))
    }

    async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        Ok(self.balances.get(&address).copied().unwrap_or_default())
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(GAS_PRICE)
    }

    async fn base_fee_per_gas(&self) -> Result<Option<u128>, ChainError> {
        Ok(None)
    }

    async fn estimate_gas(&self, _tx: TransactionRequest) -> Result<u64, ChainError> {
        Ok(50_000)
    }

    async fn call(&self, _tx: TransactionRequest) -> Result<Bytes, ChainError> {
        Ok((true, Bytes::new()).abi_encode_params().into())
    }

    async fn send(
        &self,
        tx: TransactionRequest,
        _signer: &PrivateKeySigner,
    ) -> Result<B256, ChainError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(tx);
        Ok(keccak256(sent.len().to_be_bytes()))
    }
}

struct TestConnector(Arc<TestChain>);

impl ChainConnector for TestConnector {
    fn connect(
        &self,
        _settings: &ProviderSettings,
        _node: &NodeSettings,
    ) -> Result<Arc<dyn RrpChain>, ChainError> {
        Ok(self.0.clone())
    }
}

fn master() -> MasterNode {
    MasterNode::from_mnemonic(MNEMONIC).unwrap()
}

fn airnode() -> Address {
    wallet::airnode_wallet(&master()).unwrap().address()
}

fn sponsor_wallet() -> Address {
    wallet::derive_sponsor_wallet(&master(), &SPONSOR).unwrap().address()
}

fn config() -> AirnodeConfig {
    AirnodeConfig {
        node_settings: NodeSettings::default(),
        chains: vec![ChainConfig {
            id: CHAIN_ID,
            airnode_rrp: RRP,
            providers: BTreeMap::from([("local".to_string(), "http://127.0.0.1:8545".to_string())]),
            min_confirmations: 0,
            block_history_limit: 300,
            options: ChainOptions {
                tx_type: TxType::Legacy,
                ..ChainOptions::default()
            },
        }],
        triggers: TriggersConfig {
            rrp: vec![RrpTrigger {
                endpoint_id: ENDPOINT_ID,
                ois_title: "Currency Converter API".to_string(),
                endpoint_name: "convertToUSD".to_string(),
            }],
        },
    }
}

fn metadata(block_number: u64, log_index: u64) -> RequestMetadata {
    RequestMetadata {
        block_number,
        current_block: 110,
        ignore_blocked_requests_after_blocks: 20,
        log_index,
        transaction_hash: B256::repeat_byte(0xaa),
    }
}

fn api_call(request_count: u64, block_number: u64, log_index: u64) -> Request<ApiCall> {
    let mut request = Request {
        id: B256::ZERO,
        airnode_address: airnode(),
        sponsor_address: SPONSOR,
        sponsor_wallet_address: sponsor_wallet(),
        chain_id: CHAIN_ID,
        metadata: metadata(block_number, log_index),
        nonce: None,
        fulfillment: None,
        status: RequestStatus::Pending,
        error_message: None,
        payload: ApiCall {
            request_type: RequestType::Full,
            requester_address: REQUESTER,
            request_count: U256::from(request_count),
            template_id: None,
            endpoint_id: Some(ENDPOINT_ID),
            encoded_parameters: Bytes::new(),
            parameters: BTreeMap::new(),
            fulfill_address: REQUESTER,
            fulfill_function_id: FixedBytes::from([0x48, 0xa4, 0x15, 0x7c]),
            ois_title: None,
            endpoint_name: None,
            response: None,
        },
    };
    request.id = expected_request_id(&request, RRP).unwrap();
    request
}

fn withdrawal(n: u8, block_number: u64, log_index: u64) -> Request<Withdrawal> {
    Request {
        id: B256::repeat_byte(n),
        airnode_address: airnode(),
        sponsor_address: SPONSOR,
        sponsor_wallet_address: sponsor_wallet(),
        chain_id: CHAIN_ID,
        metadata: metadata(block_number, log_index),
        nonce: None,
        fulfillment: None,
        status: RequestStatus::Pending,
        error_message: None,
        payload: Withdrawal {},
    }
}

fn workload(api_calls: Vec<Request<ApiCall>>, withdrawals: Vec<Request<Withdrawal>>) -> Workload {
    Workload {
        authorizations: api_calls
            .iter()
            .map(|c| AuthorizationDecision {
                request_id: c.id,
                authorized: true,
            })
            .collect(),
        api_responses: api_calls
            .iter()
            .map(|c| ApiResponse {
                request_id: c.id,
                data: U256::from(42).abi_encode().into(),
            })
            .collect(),
        api_calls,
        withdrawals,
        ..Workload::default()
    }
}

async fn run(
    chain: Arc<TestChain>,
    workload: Workload,
) -> Result<Vec<ProviderResult>, PipelineError> {
    coordinator::run(
        &config(),
        &Secrets {
            mnemonic: MNEMONIC.to_string(),
        },
        &Collaborators::from_workload(workload),
        Arc::new(TestConnector(chain)),
        Arc::new(ProviderGasOracle),
    )
    .await
}

#[tokio::test]
async fn pending_calls_continue_from_on_chain_nonce() {
    let chain = Arc::new(TestChain {
        transaction_counts: HashMap::from([(sponsor_wallet(), 79)]),
        ..TestChain::default()
    });
    let first = api_call(1, 100, 0);
    let second = api_call(2, 101, 0);

    let workload = workload(vec![second.clone(), first.clone()], vec![]);
    let results = run(chain.clone(), workload).await.unwrap();

    let calls = &results[0].requests.api_calls;
    assert_eq!(calls.iter().map(|c| (c.id, c.nonce)).collect::<Vec<_>>(), vec![
        (first.id, Some(79)),
        (second.id, Some(80))
    ]);
    assert!(calls.iter().all(|c| c.status == RequestStatus::Submitted && c.fulfillment.is_some()));

    let sent = chain.sent.lock().unwrap();
    assert_eq!(sent.iter().map(|tx| tx.nonce).collect::<Vec<_>>(), vec![Some(79), Some(80)]);
    assert!(sent.iter().all(|tx| tx.from == Some(sponsor_wallet())));
}

#[tokio::test]
async fn request_with_wrong_id_is_never_nonced() {
    let chain = Arc::new(TestChain::default());
    let good = api_call(1, 100, 0);
    let mut forged = api_call(2, 101, 0);
    forged.id = B256::repeat_byte(0x42);

    let workload = workload(vec![good.clone(), forged.clone()], vec![]);
    let results = run(chain.clone(), workload).await.unwrap();

    let calls = &results[0].requests.api_calls;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, good.id);
    assert_eq!(calls[0].nonce, Some(0));
    assert_eq!(chain.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn duplicate_events_collapse_into_one_call() {
    let chain = Arc::new(TestChain::default());
    let call = api_call(1, 100, 0);
    let mut duplicate = call.clone();
    duplicate.metadata.log_index = 3;

    let workload = workload(vec![call.clone(), duplicate], vec![]);
    let results = run(chain.clone(), workload).await.unwrap();

    let calls = &results[0].requests.api_calls;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].metadata.log_index, 0);
    assert_eq!(chain.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn fulfilled_requests_are_not_renonced() {
    let chain = Arc::new(TestChain {
        transaction_counts: HashMap::from([(sponsor_wallet(), 5)]),
        ..TestChain::default()
    });
    let mut fulfilled = api_call(1, 100, 0);
    fulfilled.status = RequestStatus::Fulfilled;
    let pending = api_call(2, 101, 0);

    let workload = workload(vec![fulfilled.clone(), pending.clone()], vec![]);
    let results = run(chain.clone(), workload).await.unwrap();

    let calls = &results[0].requests.api_calls;
    assert_eq!(calls[0].id, fulfilled.id);
    assert_eq!(calls[0].nonce, None);
    assert_eq!(calls[0].status, RequestStatus::Fulfilled);
    assert_eq!(calls[1].nonce, Some(5));
    assert_eq!(chain.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn submitted_requests_leave_no_nonce_gap() {
    let chain = Arc::new(TestChain {
        transaction_counts: HashMap::from([(sponsor_wallet(), 5)]),
        ..TestChain::default()
    });
    let mut submitted = api_call(1, 100, 0);
    submitted.status = RequestStatus::Submitted;
    let pending = api_call(2, 101, 0);

    let workload = workload(vec![submitted.clone(), pending.clone()], vec![]);
    let results = run(chain.clone(), workload).await.unwrap();

    let calls = &results[0].requests.api_calls;
    assert_eq!((calls[0].id, calls[0].nonce), (submitted.id, None));
    assert_eq!((calls[1].id, calls[1].nonce), (pending.id, Some(5)));
    let sent = chain.sent.lock().unwrap();
    assert_eq!(sent.iter().map(|tx| tx.nonce).collect::<Vec<_>>(), vec![Some(5)]);
}

#[tokio::test]
async fn withdrawal_sends_balance_minus_padded_gas_cost() {
    let chain = Arc::new(TestChain {
        balances: HashMap::from([(sponsor_wallet(), U256::from(250_000_000u64))]),
        ..TestChain::default()
    });
    let call = api_call(1, 100, 0);
    let workload = workload(vec![call], vec![withdrawal(9, 100, 1)]);
    let results = run(chain.clone(), workload).await.unwrap();

    let requests = &results[0].requests;
    assert_eq!(requests.api_calls[0].nonce, Some(0));
    assert_eq!(requests.withdrawals[0].nonce, Some(1));
    assert_eq!(requests.withdrawals[0].status, RequestStatus::Submitted);

    let sent = chain.sent.lock().unwrap();
    assert_eq!(sent[1].value, Some(U256::from(180_000_000u64)));
    assert_eq!(sent[1].gas, Some(70_000));
    assert_eq!(sent[1].gas_price, Some(GAS_PRICE));
}

#[tokio::test]
async fn underfunded_withdrawal_is_deferred() {
    let chain = Arc::new(TestChain {
        balances: HashMap::from([(sponsor_wallet(), U256::from(1_000u64))]),
        ..TestChain::default()
    });
    let results = run(chain.clone(), workload(vec![], vec![withdrawal(9, 100, 0)])).await.unwrap();

    let withdrawal = &results[0].requests.withdrawals[0];
    assert_eq!(withdrawal.nonce, Some(0));
    assert_eq!(withdrawal.status, RequestStatus::Pending);
    assert!(chain.sent.lock().unwrap().is_empty());
}

#[test]
fn nonce_assignment_is_idempotent() {
    let mut blocked = withdrawal(7, 105, 0);
    blocked.status = RequestStatus::Blocked;
    let requests = GroupedRequests::new(
        vec![api_call(2, 102, 0), api_call(1, 100, 0), api_call(3, 106, 0)],
        vec![withdrawal(9, 101, 0), blocked],
    );

    let assign = |requests: GroupedRequests| -> BTreeMap<Address, GroupedRequests> {
        group_requests_by_sponsor_address(requests)
            .into_iter()
            .map(|(sponsor, group)| (sponsor, assign_nonces(sort_grouped_requests(group), 12)))
            .collect()
    };

    let first = assign(requests.clone());
    let second = assign(requests);
    assert_eq!(first, second);

    let group = &first[&SPONSOR];
    let nonces: Vec<_> = group.api_calls.iter().map(|r| r.nonce).collect();
    // the blocked withdrawal at block 105 holds back everything after it
    assert_eq!(nonces, vec![Some(12), Some(14), None]);
    assert_eq!(group.withdrawals[0].nonce, Some(13));
    assert_eq!(group.withdrawals[1].nonce, None);
}
