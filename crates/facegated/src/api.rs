//! Transport-independent request handling behind the D-Bus interface.
//!
//! Every rejection leaves this module as a stable reason code; file paths
//! and other internal detail are logged here and never returned.

use facegate_core::{
    Decision, Embedding, EmbeddingStore, MatchEngine, MatchResult, RegistrationWorkflow,
    RequestId, RequestStatus,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ApiError {
    #[error("{0}")]
    InvalidArgument(&'static str),
    #[error("{0}")]
    Rejected(&'static str),
    #[error("internal_error")]
    Internal,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidArgument(code) | ApiError::Rejected(code) => code,
            ApiError::Internal => "internal_error",
        }
    }
}

impl From<ApiError> for zbus::fdo::Error {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::InvalidArgument(code) => zbus::fdo::Error::InvalidArgs(code.into()),
            other => zbus::fdo::Error::Failed(other.code().into()),
        }
    }
}

/// Reply to a match request.
#[derive(Debug, Serialize, PartialEq)]
pub struct MatchResponse {
    pub is_match: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl From<MatchResult> for MatchResponse {
    fn from(result: MatchResult) -> Self {
        match result {
            MatchResult::Match { identity, score } => Self {
                is_match: true,
                identity: Some(identity),
                confidence: Some(score),
                reason: None,
            },
            MatchResult::NoMatch { reason, .. } => Self {
                is_match: false,
                identity: None,
                confidence: None,
                reason: Some(reason.code()),
            },
        }
    }
}

/// Shared state for every API call.
#[derive(Clone)]
pub struct GateApi {
    store: Arc<EmbeddingStore>,
    workflow: Arc<RegistrationWorkflow>,
    engine: MatchEngine,
}

impl GateApi {
    pub fn new(workflow: Arc<RegistrationWorkflow>, engine: MatchEngine) -> Self {
        Self {
            store: Arc::clone(workflow.store()),
            workflow,
            engine,
        }
    }

    pub fn match_probe(&self, probe: &[f64]) -> Result<MatchResponse, ApiError> {
        let probe = to_embedding(probe)?;
        let gallery = self.store.snapshot();
        let result = self.engine.match_probe(&probe, &gallery).map_err(|e| {
            tracing::debug!(error = %e, "probe rejected");
            ApiError::InvalidArgument(e.reason_code())
        })?;
        tracing::info!(
            matched = result.is_match(),
            identity = result.identity().unwrap_or(""),
            "match evaluated"
        );
        Ok(result.into())
    }

    pub fn request_registration(&self, name: &str, image_ref: &str) -> Result<String, ApiError> {
        let image_ref = Some(image_ref.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        self.workflow
            .request(name, image_ref)
            .map(|id| id.to_string())
            .map_err(|e| ApiError::InvalidArgument(e.reason_code()))
    }

    pub fn status(&self, request_id: &str) -> &'static str {
        match request_id.parse::<RequestId>() {
            Ok(id) => self.workflow.status(id).as_str(),
            Err(_) => RequestStatus::NotFound.as_str(),
        }
    }

    pub fn decide(&self, request_id: &str, outcome: &str) -> Result<(), ApiError> {
        let id = parse_id(request_id)?;
        let decision: Decision = outcome
            .parse()
            .map_err(|_| ApiError::InvalidArgument("invalid_outcome"))?;
        self.apply_decision(id, decision)
    }

    /// Apply a raw approver callback (`action=approve&request_id=...`).
    pub fn decide_postback(&self, payload: &str) -> Result<(), ApiError> {
        let (id, decision) =
            Decision::from_postback(payload).map_err(|e| ApiError::InvalidArgument(e.reason_code()))?;
        self.apply_decision(id, decision)
    }

    fn apply_decision(&self, id: RequestId, decision: Decision) -> Result<(), ApiError> {
        self.workflow
            .decide(id, decision)
            .map(|_| ())
            .map_err(|e| ApiError::Rejected(e.reason_code()))
    }

    /// Commit an approved request's embeddings. Runs the disk write off the
    /// async executor.
    pub async fn register_commit(
        &self,
        request_id: &str,
        embeddings: Vec<Vec<f64>>,
    ) -> Result<u32, ApiError> {
        let id = parse_id(request_id)?;
        let embeddings = embeddings
            .iter()
            .map(|e| to_embedding(e))
            .collect::<Result<Vec<_>, _>>()?;

        let workflow = Arc::clone(&self.workflow);
        let result = tokio::task::spawn_blocking(move || workflow.commit(id, &embeddings))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "commit task failed");
                ApiError::Internal
            })?;

        match result {
            Ok(count) => Ok(count as u32),
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "commit rejected");
                Err(ApiError::Rejected(e.reason_code()))
            }
        }
    }

    /// Rebuild the index from disk; returns the number of identities.
    pub async fn reload(&self) -> Result<u32, ApiError> {
        let store = Arc::clone(&self.store);
        let report = tokio::task::spawn_blocking(move || store.reload())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "reload task failed");
                ApiError::Internal
            })?
            .map_err(|e| {
                tracing::error!(error = %e, "reload failed");
                ApiError::Rejected(e.reason_code())
            })?;
        tracing::info!(
            files = report.files_loaded,
            skipped = report.skipped.len(),
            "store reloaded"
        );
        Ok(self.store.snapshot().len() as u32)
    }

    pub fn info(&self) -> serde_json::Value {
        let gallery = self.store.snapshot();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": gallery.len(),
            "embeddings": gallery.total_embeddings(),
            "dimension": gallery.dimension(),
            "threshold": self.engine.threshold(),
            "pending_requests": self.workflow.pending().len(),
            "notifier": self.workflow.notifier().stats(),
        })
    }
}

fn parse_id(request_id: &str) -> Result<RequestId, ApiError> {
    request_id
        .parse()
        .map_err(|_| ApiError::InvalidArgument("invalid_request_id"))
}

fn to_embedding(values: &[f64]) -> Result<Embedding, ApiError> {
    if values.is_empty() {
        return Err(ApiError::InvalidArgument("empty_embedding"));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ApiError::InvalidArgument("non_finite_embedding"));
    }
    Ok(Embedding::new(values.iter().map(|&v| v as f32).collect()))
}
