//! Applies authorization decisions made elsewhere.

use crate::types::{ApiCall, AuthorizationsByRequestId, Request};

/// Keep only the calls explicitly authorized in `authorizations`.
pub fn apply_authorizations(
    api_calls: Vec<Request<ApiCall>>,
    authorizations: &AuthorizationsByRequestId,
) -> Vec<Request<ApiCall>> {
    api_calls
        .into_iter()
        .filter(|request| {
            let Some(endpoint_id) = request.payload.endpoint_id else {
                tracing::error!(
                    request_id = %request.id,
                    "Request has no endpoint ID, dropping request"
                );
                return false;
            };
            match authorizations.get(&request.id) {
                Some(true) => {
                    tracing::debug!(
                        request_id = %request.id,
                        endpoint_id = %endpoint_id,
                        "Requester is authorized"
                    );
                    true
                }
                Some(false) => {
                    tracing::warn!(
                        request_id = %request.id,
                        endpoint_id = %endpoint_id,
                        requester = %request.payload.requester_address,
                        "Requester is not authorized, dropping request"
                    );
                    false
                }
                None => {
                    tracing::warn!(
                        request_id = %request.id,
                        "No authorization decision found, dropping request"
                    );
                    false
                }
            }
        })
        .collect()
}
