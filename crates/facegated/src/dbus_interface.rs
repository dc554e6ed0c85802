use crate::api::GateApi;
use facegate_core::notifier::{Notifier, NotifyError, RegistrationNotice};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.facegate.Gate1";
pub const OBJECT_PATH: &str = "/org/facegate/Gate1";

/// D-Bus interface for the facegate daemon.
///
/// Bus name: org.facegate.Gate1
/// Object path: /org/facegate/Gate1
pub struct GateService {
    api: GateApi,
}

impl GateService {
    pub fn new(api: GateApi) -> Self {
        Self { api }
    }
}

#[interface(name = "org.facegate.Gate1")]
impl GateService {
    /// Match a probe embedding against enrolled identities. Returns JSON.
    #[zbus(name = "Match")]
    async fn match_probe(&self, probe: Vec<f64>) -> zbus::fdo::Result<String> {
        let response = self.api.match_probe(&probe)?;
        Ok(serde_json::to_string(&response).unwrap_or_default())
    }

    /// Open a registration request for an unknown face; returns its id.
    async fn request_registration(&self, name: &str, image_ref: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, "registration request received");
        Ok(self.api.request_registration(name, image_ref)?)
    }

    /// Poll a registration request: pending, approved, rejected or not_found.
    async fn status(&self, request_id: &str) -> String {
        self.api.status(request_id).to_string()
    }

    /// Record an approver decision (`approve` or `reject`).
    async fn decide(&self, request_id: &str, outcome: &str) -> zbus::fdo::Result<()> {
        Ok(self.api.decide(request_id, outcome)?)
    }

    /// Record an approver decision from a raw callback payload.
    async fn decide_postback(&self, payload: &str) -> zbus::fdo::Result<()> {
        Ok(self.api.decide_postback(payload)?)
    }

    /// Store the embeddings of an approved request; returns how many were stored.
    async fn register_commit(
        &self,
        request_id: &str,
        embeddings: Vec<Vec<f64>>,
    ) -> zbus::fdo::Result<u32> {
        Ok(self.api.register_commit(request_id, embeddings).await?)
    }

    /// Rebuild the embedding index from disk; returns the identity count.
    async fn reload(&self) -> zbus::fdo::Result<u32> {
        Ok(self.api.reload().await?)
    }

    /// Return daemon status information.
    async fn info(&self) -> String {
        self.api.info().to_string()
    }

    /// Emitted for every new registration request, for approver bridges.
    #[zbus(signal)]
    async fn registration_requested(
        emitter: &SignalEmitter<'_>,
        request_id: &str,
        name: &str,
        image_ref: &str,
    ) -> zbus::Result<()>;
}

/// Delivers registration notices as `RegistrationRequested` signals.
pub struct SignalNotifier {
    conn: zbus::Connection,
    runtime: tokio::runtime::Handle,
}

impl SignalNotifier {
    pub fn new(conn: zbus::Connection, runtime: tokio::runtime::Handle) -> Self {
        Self { conn, runtime }
    }
}

impl Notifier for SignalNotifier {
    fn notify(&mut self, notice: &RegistrationNotice) -> Result<(), NotifyError> {
        let request_id = notice.request_id.to_string();
        let image_ref = notice.image_ref.as_deref().unwrap_or("");
        self.runtime
            .block_on(async {
                let emitter = SignalEmitter::new(&self.conn, OBJECT_PATH)?;
                GateService::registration_requested(
                    &emitter,
                    &request_id,
                    &notice.display_name,
                    image_ref,
                )
                .await
            })
            .map_err(|e| NotifyError::Delivery(e.to_string()))
    }
}
