//! Registration approval workflow.
//!
//! A request moves `Pending -> Approved | Rejected`; both outcomes are
//! terminal. Approved requests are committed into the [`EmbeddingStore`] and
//! then retired. The request table lives in memory only: pending requests do
//! not survive a restart.

use crate::notifier::{NotifierHandle, NotifyError, RegistrationNotice};
use crate::store::{self, EmbeddingStore, StoreError};
use crate::types::Embedding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

/// Unique registration request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Approved,
    Rejected,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Approved => "approved",
            RequestState::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestState::Pending)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Known(RequestState),
    NotFound,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Known(state) => state.as_str(),
            RequestStatus::NotFound => "not_found",
        }
    }
}

/// The approver's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn outcome(self) -> RequestState {
        match self {
            Decision::Approve => RequestState::Approved,
            Decision::Reject => RequestState::Rejected,
        }
    }

    /// Parse an approver callback payload such as
    /// `action=approve&request_id=<uuid>`. `user_id` is accepted in place of
    /// `request_id` for older approver bridges.
    pub fn from_postback(payload: &str) -> Result<(RequestId, Decision), WorkflowError> {
        let mut action = None;
        let mut request_id = None;
        for pair in payload.split('&') {
            match pair.split_once('=') {
                Some(("action", v)) => action = Some(v.parse::<Decision>()?),
                Some(("request_id" | "user_id", v)) => {
                    request_id = Some(
                        v.parse::<RequestId>()
                            .map_err(|_| WorkflowError::MalformedPostback)?,
                    )
                }
                _ => {}
            }
        }
        match (request_id, action) {
            (Some(id), Some(decision)) => Ok((id, decision)),
            _ => Err(WorkflowError::MalformedPostback),
        }
    }
}

impl FromStr for Decision {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(Decision::Approve),
            "reject" | "rejected" => Ok(Decision::Reject),
            _ => Err(WorkflowError::MalformedPostback),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRequest {
    pub id: RequestId,
    pub display_name: String,
    pub state: RequestState,
    pub image_ref: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    committing: bool,
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("registration request not found")]
    RequestNotFound,
    #[error("request already {current}")]
    AlreadyDecided { current: RequestState },
    #[error("request is {current}, not approved")]
    NotApproved { current: RequestState },
    #[error("display name cannot be stored as an identity")]
    InvalidName,
    #[error("no embeddings to register")]
    NoEmbeddings,
    #[error("a commit for this request is already running")]
    CommitInProgress,
    #[error("malformed decision payload")]
    MalformedPostback,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    /// Stable code used at the API boundary.
    pub fn reason_code(&self) -> &'static str {
        match self {
            WorkflowError::RequestNotFound => "not_found",
            WorkflowError::AlreadyDecided { .. } => "already_decided",
            WorkflowError::NotApproved { .. } => "not_approved",
            WorkflowError::InvalidName => "invalid_name",
            WorkflowError::NoEmbeddings => "no_embeddings",
            WorkflowError::CommitInProgress => "commit_in_progress",
            WorkflowError::MalformedPostback => "malformed_decision",
            WorkflowError::Store(e) => e.reason_code(),
        }
    }
}

/// Request table plus the store approved embeddings are committed to.
pub struct RegistrationWorkflow {
    store: Arc<EmbeddingStore>,
    notifier: NotifierHandle,
    requests: Mutex<HashMap<RequestId, RegistrationRequest>>,
}

impl RegistrationWorkflow {
    pub fn new(store: Arc<EmbeddingStore>, notifier: NotifierHandle) -> Self {
        Self {
            store,
            notifier,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    pub fn notifier(&self) -> &NotifierHandle {
        &self.notifier
    }

    /// Open a pending request and notify the approver.
    ///
    /// The request stays valid even if the notice cannot be queued; it can
    /// still be decided through another channel.
    pub fn request(
        &self,
        display_name: &str,
        image_ref: Option<String>,
    ) -> Result<RequestId, WorkflowError> {
        let display_name = display_name.trim();
        if let Err(err) = store::validate_identity(display_name) {
            tracing::debug!(error = %err, "registration name refused");
            return Err(WorkflowError::InvalidName);
        }

        let id = RequestId::new();
        let request = RegistrationRequest {
            id,
            display_name: display_name.to_string(),
            state: RequestState::Pending,
            image_ref: image_ref.clone(),
            submitted_at: Utc::now(),
            decided_at: None,
            committing: false,
        };
        self.lock().insert(id, request);
        tracing::info!(request_id = %id, name = display_name, "registration requested");

        let notice = RegistrationNotice {
            request_id: id,
            display_name: display_name.to_string(),
            image_ref,
        };
        if let Err(err) = self.notifier.dispatch(notice) {
            log_dispatch_failure(id, &err);
        }

        Ok(id)
    }

    /// Record the approver's decision. Only pending requests can be decided.
    pub fn decide(&self, id: RequestId, decision: Decision) -> Result<RequestState, WorkflowError> {
        let mut requests = self.lock();
        let request = requests.get_mut(&id).ok_or(WorkflowError::RequestNotFound)?;
        if request.state.is_terminal() {
            return Err(WorkflowError::AlreadyDecided {
                current: request.state,
            });
        }
        request.state = decision.outcome();
        request.decided_at = Some(Utc::now());
        tracing::info!(request_id = %id, state = %request.state, "registration decided");
        Ok(request.state)
    }

    /// Persist the embeddings of an approved request and retire it.
    ///
    /// Returns the number of embeddings stored. On a store failure the request
    /// stays approved so the commit can be retried.
    ///
    /// The request table is not locked during the store write; the request is
    /// claimed first so a concurrent commit gets `CommitInProgress`.
    pub fn commit(&self, id: RequestId, embeddings: &[Embedding]) -> Result<usize, WorkflowError> {
        let display_name = {
            let mut requests = self.lock();
            let request = requests.get_mut(&id).ok_or(WorkflowError::RequestNotFound)?;
            if request.state != RequestState::Approved {
                return Err(WorkflowError::NotApproved {
                    current: request.state,
                });
            }
            if request.committing {
                return Err(WorkflowError::CommitInProgress);
            }
            if embeddings.is_empty() {
                return Err(WorkflowError::NoEmbeddings);
            }
            request.committing = true;
            request.display_name.clone()
        };

        let result = self.store.add(&display_name, embeddings);

        let mut requests = self.lock();
        match result {
            Ok(count) => {
                requests.remove(&id);
                tracing::info!(request_id = %id, count, "registration committed");
                Ok(count)
            }
            Err(err) => {
                if let Some(request) = requests.get_mut(&id) {
                    request.committing = false;
                }
                Err(err.into())
            }
        }
    }

    pub fn status(&self, id: RequestId) -> RequestStatus {
        self.lock()
            .get(&id)
            .map(|r| RequestStatus::Known(r.state))
            .unwrap_or(RequestStatus::NotFound)
    }

    pub fn get(&self, id: RequestId) -> Option<RegistrationRequest> {
        self.lock().get(&id).cloned()
    }

    /// Requests still waiting for a decision, oldest first.
    pub fn pending(&self) -> Vec<RegistrationRequest> {
        let mut pending: Vec<_> = self
            .lock()
            .values()
            .filter(|r| r.state == RequestState::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.submitted_at);
        pending
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, RegistrationRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_dispatch_failure(id: RequestId, err: &NotifyError) {
    tracing::warn!(
        request_id = %id,
        error = %err,
        "registration notice not queued; request remains pending"
    );
}
