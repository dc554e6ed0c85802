//! Fire-and-forget delivery of registration notices to an external approver.
//!
//! Notices are queued on a bounded channel and delivered from a dedicated
//! thread, so `RegistrationWorkflow::request` never waits on the approver's
//! transport. Failures are logged and counted, never propagated.

use crate::registration::RequestId;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Default capacity of the notice queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notice queue full")]
    QueueFull,
    #[error("notifier thread exited")]
    Closed,
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// What the approver is told about a new registration request.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationNotice {
    pub request_id: RequestId,
    pub display_name: String,
    /// Reference to a preview image, if the caller supplied one.
    pub image_ref: Option<String>,
}

/// Delivers notices to the approver (messaging bot, D-Bus signal, ...).
///
/// Called from the notifier thread; implementations may block.
pub trait Notifier: Send + 'static {
    fn notify(&mut self, notice: &RegistrationNotice) -> Result<(), NotifyError>;
}

/// Notifier that only logs; used when no approver bridge is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, notice: &RegistrationNotice) -> Result<(), NotifyError> {
        tracing::info!(
            request_id = %notice.request_id,
            name = %notice.display_name,
            image_ref = notice.image_ref.as_deref().unwrap_or(""),
            "registration awaiting approval"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Delivery counters, including notices that never left the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotifierStats {
    pub delivered: u64,
    pub failed: u64,
}

/// Clone-safe handle to the notifier thread.
#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::Sender<RegistrationNotice>,
    counters: Arc<Counters>,
}

impl NotifierHandle {
    /// Queue a notice without blocking.
    pub fn dispatch(&self, notice: RegistrationNotice) -> Result<(), NotifyError> {
        let result = self.tx.try_send(notice).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
        });
        if result.is_err() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// Spawn the notifier on a dedicated OS thread.
///
/// The thread exits once every handle has been dropped.
pub fn spawn_notifier<N: Notifier>(
    mut notifier: N,
    queue_depth: usize,
) -> std::io::Result<NotifierHandle> {
    let (tx, mut rx) = mpsc::channel::<RegistrationNotice>(queue_depth.max(1));
    let counters = Arc::new(Counters::default());
    let thread_counters = Arc::clone(&counters);

    std::thread::Builder::new()
        .name("facegate-notify".into())
        .spawn(move || {
            tracing::debug!("notifier thread started");
            while let Some(notice) = rx.blocking_recv() {
                match notifier.notify(&notice) {
                    Ok(()) => {
                        thread_counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        thread_counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            request_id = %notice.request_id,
                            error = %err,
                            "registration notice not delivered"
                        );
                    }
                }
            }
            tracing::debug!("notifier thread exiting");
        })?;

    Ok(NotifierHandle { tx, counters })
}
