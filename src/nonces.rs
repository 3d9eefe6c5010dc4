//! Per-sponsor nonce assignment.
//!
//! A single left fold over the sponsor's requests in emission order, API calls
//! ahead of withdrawals at the same position. The fold state is the next free
//! nonce (seeded from the on-chain transaction count) and whether the queue is
//! blocked. Once a request blocks the queue, nothing after it gets a nonce in
//! this run, since the chain would reject any nonce past the gap.

use crate::types::{AnyRequest, GroupedRequests, RequestStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NonceState {
    next_nonce: u64,
    blocked: bool,
}

/// Assign transaction nonces to one sponsor's requests.
///
/// - Fulfilled and already submitted requests pass through untouched and never
///   consume a nonce. Only pending requests are broadcast, so a submitted request
///   holding a nonce would leave a gap in the sponsor's sequence.
/// - A blocked request older than its expiry window is dropped; assignment continues.
/// - A younger blocked request is kept without a nonce and blocks the rest of the queue.
/// - Everything else takes the next nonce.
pub fn assign_nonces(requests: GroupedRequests, transaction_count: u64) -> GroupedRequests {
    let mut flat: Vec<AnyRequest> = requests.into();
    flat.sort_by_key(AnyRequest::sequence_key);

    let initial = NonceState {
        next_nonce: transaction_count,
        blocked: false,
    };
    let (assigned, _) = flat.into_iter().fold(
        (Vec::new(), initial),
        |(mut assigned, mut state), mut request| {
            if state.blocked {
                request.set_nonce(None);
                assigned.push(request);
                return (assigned, state);
            }
            match request.status() {
                RequestStatus::Fulfilled | RequestStatus::Submitted => assigned.push(request),
                RequestStatus::Blocked => {
                    let metadata = request.metadata();
                    if metadata.age_in_blocks() > metadata.ignore_blocked_requests_after_blocks {
                        tracing::info!(
                            request_id = %request.id(),
                            age_in_blocks = metadata.age_in_blocks(),
                            "Dropping expired blocked request"
                        );
                    } else {
                        tracing::warn!(
                            request_id = %request.id(),
                            "Blocked request holds back the rest of the sponsor's queue"
                        );
                        request.set_nonce(None);
                        state.blocked = true;
                        assigned.push(request);
                    }
                }
                RequestStatus::Pending => {
                    tracing::debug!(
                        request_id = %request.id(),
                        nonce = state.next_nonce,
                        "Assigned nonce"
                    );
                    request.set_nonce(Some(state.next_nonce));
                    state.next_nonce += 1;
                    assigned.push(request);
                }
            }
            (assigned, state)
        },
    );
    assigned.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::*;
    use crate::types::{ApiCall, Request, Withdrawal};

    fn nonces(grouped: &GroupedRequests) -> Vec<(u8, Option<u64>)> {
        let mut flat: Vec<AnyRequest> = grouped.clone().into();
        flat.sort_by_key(AnyRequest::sequence_key);
        flat.iter().map(|r| (r.id()[0], r.nonce())).collect()
    }

    fn blocked(mut request: Request<ApiCall>, age: u64) -> Request<ApiCall> {
        request.status = RequestStatus::Blocked;
        request.metadata.current_block = request.metadata.block_number + age;
        request
    }

    #[test]
    fn test_nonces_follow_discovery_order() {
        let requests = GroupedRequests::new(
            vec![api_call(id(2), SPONSOR, 101, 0), api_call(id(1), SPONSOR, 100, 0)],
            vec![],
        );
        let assigned = assign_nonces(requests, 79);
        assert_eq!(nonces(&assigned), vec![(1, Some(79)), (2, Some(80))]);
    }

    #[test]
    fn test_kinds_share_one_nonce_space() {
        let requests = GroupedRequests::new(
            vec![api_call(id(1), SPONSOR, 10, 0), api_call(id(3), SPONSOR, 12, 0)],
            vec![withdrawal(id(2), SPONSOR, 11, 0), withdrawal(id(4), SPONSOR, 12, 0)],
        );
        let assigned = assign_nonces(requests, 5);
        assert_eq!(
            nonces(&assigned),
            vec![(1, Some(5)), (2, Some(6)), (3, Some(7)), (4, Some(8))]
        );
        assert_eq!(assigned.api_calls.len(), 2);
        assert_eq!(assigned.withdrawals.len(), 2);
    }

    #[test]
    fn test_fulfilled_requests_are_never_renonced() {
        let mut fulfilled = api_call(id(1), SPONSOR, 10, 0);
        fulfilled.status = RequestStatus::Fulfilled;
        let requests =
            GroupedRequests::new(vec![fulfilled, api_call(id(2), SPONSOR, 11, 0)], vec![]);
        let assigned = assign_nonces(requests, 3);
        assert_eq!(nonces(&assigned), vec![(1, None), (2, Some(3))]);
    }

    #[test]
    fn test_submitted_requests_do_not_consume_a_nonce() {
        let mut submitted = api_call(id(1), SPONSOR, 10, 0);
        submitted.status = RequestStatus::Submitted;
        let requests = GroupedRequests::new(
            vec![submitted, api_call(id(2), SPONSOR, 11, 0)],
            vec![withdrawal(id(3), SPONSOR, 12, 0)],
        );
        let assigned = assign_nonces(requests, 5);
        assert_eq!(nonces(&assigned), vec![(1, None), (2, Some(5)), (3, Some(6))]);
        assert_eq!(assigned.api_calls[0].status, RequestStatus::Submitted);
    }

    #[test]
    fn test_blocked_request_blocks_the_rest() {
        let requests = GroupedRequests::new(
            vec![
                api_call(id(1), SPONSOR, 10, 0),
                blocked(api_call(id(2), SPONSOR, 11, 0), 5),
                api_call(id(3), SPONSOR, 12, 0),
            ],
            vec![withdrawal(id(4), SPONSOR, 13, 0)],
        );
        let assigned = assign_nonces(requests, 0);
        assert_eq!(
            nonces(&assigned),
            vec![(1, Some(0)), (2, None), (3, None), (4, None)]
        );
    }

    #[test]
    fn test_expired_blocked_request_is_dropped() {
        let requests = GroupedRequests::new(
            vec![
                api_call(id(1), SPONSOR, 10, 0),
                blocked(api_call(id(2), SPONSOR, 11, 0), 21),
                api_call(id(3), SPONSOR, 12, 0),
            ],
            vec![],
        );
        let assigned = assign_nonces(requests, 0);
        assert_eq!(nonces(&assigned), vec![(1, Some(0)), (3, Some(1))]);
    }

    #[test]
    fn test_blocked_request_at_expiry_boundary_is_kept() {
        let requests =
            GroupedRequests::new(vec![blocked(api_call(id(1), SPONSOR, 10, 0), 20)], vec![]);
        let assigned = assign_nonces(requests, 0);
        assert_eq!(nonces(&assigned), vec![(1, None)]);
    }

    #[test]
    fn test_reassignment_is_idempotent() {
        let requests = GroupedRequests::new(
            vec![api_call(id(1), SPONSOR, 10, 0), api_call(id(2), SPONSOR, 10, 1)],
            vec![withdrawal(id(3), SPONSOR, 10, 1)],
        );
        let first = assign_nonces(requests.clone(), 42);
        let second = assign_nonces(requests, 42);
        assert_eq!(first, second);
        // API call ranks ahead of a withdrawal at the same position
        assert_eq!(nonces(&first), vec![(1, Some(42)), (2, Some(43)), (3, Some(44))]);
    }

    #[test]
    fn test_nonces_are_gapless_and_unique() {
        let api: Vec<Request<ApiCall>> = (0..10u8)
            .map(|i| api_call(id(i + 1), SPONSOR, 100 + u64::from(i % 3), u64::from(i)))
            .collect();
        let withdrawals: Vec<Request<Withdrawal>> = (10..13u8)
            .map(|i| withdrawal(id(i + 1), SPONSOR, 100, u64::from(i)))
            .collect();
        let assigned = assign_nonces(GroupedRequests::new(api, withdrawals), 7);
        let mut assigned_nonces: Vec<u64> =
            nonces(&assigned).into_iter().filter_map(|(_, n)| n).collect();
        assigned_nonces.sort_unstable();
        assert_eq!(assigned_nonces, (7..20).collect::<Vec<_>>());
    }
}
