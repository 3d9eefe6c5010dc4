//! Per-sponsor partitioning and ordering.

use alloy::primitives::Address;
use std::collections::BTreeMap;

use crate::types::{GroupedRequests, Request};

/// Partition requests by sponsor. Every request lands in exactly one group and
/// keeps its kind.
pub fn group_requests_by_sponsor_address(
    requests: GroupedRequests,
) -> BTreeMap<Address, GroupedRequests> {
    let mut groups: BTreeMap<Address, GroupedRequests> = BTreeMap::new();
    for request in requests.api_calls {
        groups
            .entry(request.sponsor_address)
            .or_default()
            .api_calls
            .push(request);
    }
    for request in requests.withdrawals {
        groups
            .entry(request.sponsor_address)
            .or_default()
            .withdrawals
            .push(request);
    }
    groups
}

fn sort_by_emission<P>(requests: &mut [Request<P>]) {
    requests.sort_by_key(Request::emission_order);
}

/// Order each kind by (block number, log index), the order the chain emitted them in.
pub fn sort_grouped_requests(mut requests: GroupedRequests) -> GroupedRequests {
    sort_by_emission(&mut requests.api_calls);
    sort_by_emission(&mut requests.withdrawals);
    requests
}
