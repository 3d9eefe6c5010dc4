//! Collaborators the pipeline consumes but does not implement.
//!
//! Event scanning, template lookup, authorization checks and the API calls
//! themselves live outside the settlement pipeline. Each is an `async_trait`
//! seam so the coordinator can hold them as `Arc<dyn …>`.
//!
//! [`Workload`] implements all four from a JSON document holding their
//! precomputed outputs; the binary runs one settlement cycle over it.

use alloy::primitives::{B256, Bytes};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::state::ProviderSettings;
use crate::types::{
    ApiCall, ApiCallTemplate, AuthorizationsByRequestId, GroupedRequests, Request, TemplatesById,
    Withdrawal,
};

#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    #[error("no {what} for {id}")]
    NotFound { what: &'static str, id: B256 },
    #[error("{0}")]
    Failed(String),
    #[error("failed to read workload: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse workload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decoded request events of one provider.
#[async_trait]
pub trait RequestSource: Send + Sync {
    async fn pending_requests(
        &self,
        settings: &ProviderSettings,
    ) -> Result<GroupedRequests, ExternalError>;
}

/// On-chain templates by id. Ids that are not found are simply absent from the result.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn templates(
        &self,
        settings: &ProviderSettings,
        ids: &[B256],
    ) -> Result<TemplatesById, ExternalError>;
}

/// Authorizer decisions for a batch of API calls.
#[async_trait]
pub trait AuthorizationSource: Send + Sync {
    async fn authorizations(
        &self,
        settings: &ProviderSettings,
        api_calls: &[Request<ApiCall>],
    ) -> Result<AuthorizationsByRequestId, ExternalError>;
}

/// Executes the API call behind a request and returns the ABI-encoded value.
#[async_trait]
pub trait ApiCaller: Send + Sync {
    async fn call_api(&self, api_call: &Request<ApiCall>) -> Result<Bytes, ExternalError>;
}

/// The full set of collaborators one run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub requests: Arc<dyn RequestSource>,
    pub templates: Arc<dyn TemplateSource>,
    pub authorizations: Arc<dyn AuthorizationSource>,
    pub api: Arc<dyn ApiCaller>,
}

impl Collaborators {
    /// Serve every collaborator from one workload.
    pub fn from_workload(workload: Workload) -> Self {
        let workload = Arc::new(workload);
        Self {
            requests: workload.clone(),
            templates: workload.clone(),
            authorizations: workload.clone(),
            api: workload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationDecision {
    pub request_id: B256,
    pub authorized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub request_id: B256,
    pub data: Bytes,
}

/// Precomputed collaborator outputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Workload {
    pub api_calls: Vec<Request<ApiCall>>,
    pub withdrawals: Vec<Request<Withdrawal>>,
    pub templates: Vec<ApiCallTemplate>,
    pub authorizations: Vec<AuthorizationDecision>,
    pub api_responses: Vec<ApiResponse>,
}

impl Workload {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ExternalError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn serves<P>(request: &Request<P>, settings: &ProviderSettings) -> bool {
        request.chain_id == settings.chain_id
            && request.airnode_address == settings.airnode_address
            && request.metadata.age_in_blocks() >= settings.min_confirmations
    }
}

#[async_trait]
impl RequestSource for Workload {
    async fn pending_requests(
        &self,
        settings: &ProviderSettings,
    ) -> Result<GroupedRequests, ExternalError> {
        Ok(GroupedRequests::new(
            self.api_calls
                .iter()
                .filter(|r| Self::serves(r, settings))
                .cloned()
                .collect(),
            self.withdrawals
                .iter()
                .filter(|r| Self::serves(r, settings))
                .cloned()
                .collect(),
        ))
    }
}

#[async_trait]
impl TemplateSource for Workload {
    async fn templates(
        &self,
        _settings: &ProviderSettings,
        ids: &[B256],
    ) -> Result<TemplatesById, ExternalError> {
        Ok(self
            .templates
            .iter()
            .filter(|t| ids.contains(&t.id))
            .map(|t| (t.id, t.clone()))
            .collect())
    }
}

#[async_trait]
impl AuthorizationSource for Workload {
    async fn authorizations(
        &self,
        _settings: &ProviderSettings,
        api_calls: &[Request<ApiCall>],
    ) -> Result<AuthorizationsByRequestId, ExternalError> {
        let decisions: HashMap<B256, bool> = self
            .authorizations
            .iter()
            .map(|d| (d.request_id, d.authorized))
            .collect();
        Ok(api_calls
            .iter()
            .filter_map(|call| decisions.get(&call.id).map(|authorized| (call.id, *authorized)))
            .collect())
    }
}

#[async_trait]
impl ApiCaller for Workload {
    async fn call_api(&self, api_call: &Request<ApiCall>) -> Result<Bytes, ExternalError> {
        self.api_responses
            .iter()
            .find(|r| r.request_id == api_call.id)
            .map(|r| r.data.clone())
            .ok_or(ExternalError::NotFound {
                what: "API response",
                id: api_call.id,
            })
    }
}
