//! Collapses raw events into canonical API calls and resolves templates.

use std::collections::HashSet;

use crate::config::TriggersConfig;
use crate::parameters;
use crate::types::{ApiCall, Request, RequestType, TemplatesById};
use crate::verification;

fn resolve_endpoint(request: &mut Request<ApiCall>, triggers: &TriggersConfig) {
    let Some(endpoint_id) = request.payload.endpoint_id else {
        return;
    };
    match triggers.trigger_for(&endpoint_id) {
        Some(trigger) => {
            request.payload.ois_title = Some(trigger.ois_title.clone());
            request.payload.endpoint_name = Some(trigger.endpoint_name.clone());
        }
        None => {
            tracing::warn!(
                request_id = %request.id,
                endpoint_id = %endpoint_id,
                "No trigger configured for endpoint"
            );
        }
    }
}

/// One canonical call per request id.
///
/// The first occurrence of an id wins and later duplicates are discarded. Request
/// parameters are decoded here; a call whose parameters cannot be decoded is
/// dropped. Calls that already name their endpoint get its OIS title and
/// endpoint name from the matching trigger.
pub fn aggregate(
    api_calls: Vec<Request<ApiCall>>,
    triggers: &TriggersConfig,
) -> Vec<Request<ApiCall>> {
    let mut seen = HashSet::new();
    let mut aggregated = Vec::with_capacity(api_calls.len());

    for mut request in api_calls {
        if !seen.insert(request.id) {
            tracing::debug!(request_id = %request.id, "Duplicate request event ignored");
            continue;
        }
        match parameters::decode_parameters(&request.payload.encoded_parameters) {
            Ok(decoded) => request.payload.parameters = decoded,
            Err(e) => {
                tracing::error!(
                    request_id = %request.id,
                    error = %e,
                    "Failed to decode request parameters, dropping request"
                );
                continue;
            }
        }
        resolve_endpoint(&mut request, triggers);
        aggregated.push(request);
    }
    aggregated
}

/// Fill template-linked calls from their templates.
///
/// The template's decoded parameters are the base and the request's own
/// parameters override them key by key. Keys compare case-sensitively, so
/// `from` and `From` both survive. Full requests pass through unchanged.
pub fn merge_api_calls_with_templates(
    api_calls: Vec<Request<ApiCall>>,
    templates: &TemplatesById,
    triggers: &TriggersConfig,
) -> Vec<Request<ApiCall>> {
    api_calls
        .into_iter()
        .filter_map(|mut request| {
            if request.payload.request_type == RequestType::Full {
                return Some(request);
            }
            let Some(template_id) = request.payload.template_id else {
                tracing::error!(
                    request_id = %request.id,
                    "Template request without template ID, dropping request"
                );
                return None;
            };
            let Some(template) = templates.get(&template_id) else {
                tracing::warn!(
                    request_id = %request.id,
                    template_id = %template_id,
                    "Template not found, dropping request"
                );
                return None;
            };
            if template.id != template_id || !verification::is_valid_template(template) {
                tracing::error!(
                    request_id = %request.id,
                    template_id = %template_id,
                    "Invalid template ID, dropping request"
                );
                return None;
            }
            let mut merged = match parameters::decode_parameters(&template.encoded_parameters) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::error!(
                        request_id = %request.id,
                        template_id = %template_id,
                        error = %e,
                        "Failed to decode template parameters, dropping request"
                    );
                    return None;
                }
            };
            merged.extend(std::mem::take(&mut request.payload.parameters));

            request.payload.parameters = merged;
            request.payload.endpoint_id = Some(template.endpoint_id);
            resolve_endpoint(&mut request, triggers);
            Some(request)
        })
        .collect()
}
