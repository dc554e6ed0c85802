//! facegate-core — Face access-control core.
//!
//! Gates frames through a presence countdown, matches face embeddings
//! against a local store by cosine similarity, and runs the approval
//! workflow that enrolls new identities.

pub mod capture;
pub mod codec;
pub mod extractor;
pub mod matcher;
pub mod notifier;
pub mod registration;
pub mod store;
pub mod types;

pub use capture::{CaptureEvent, CaptureState, CaptureStateMachine};
pub use matcher::{MatchEngine, MatchResult, NoMatchReason};
pub use notifier::{spawn_notifier, LogNotifier, Notifier, NotifierHandle, RegistrationNotice};
pub use registration::{Decision, RegistrationWorkflow, RequestId, RequestState, RequestStatus};
pub use store::{EmbeddingStore, Gallery, StoreError};
pub use types::{score, BoundingBox, Embedding, Frame, ScoreError};
