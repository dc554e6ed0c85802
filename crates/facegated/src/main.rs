use anyhow::{Context, Result};
use facegate_core::{spawn_notifier, EmbeddingStore, LogNotifier, MatchEngine, RegistrationWorkflow};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod dbus_interface;

use config::{BusKind, Config};
use dbus_interface::{GateService, SignalNotifier, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let cfg = Config::load()?;

    let db_dir = cfg.db_dir.clone();
    let (store, report) = tokio::task::spawn_blocking(move || EmbeddingStore::open(db_dir))
        .await?
        .with_context(|| format!("opening embedding store at {}", cfg.db_dir.display()))?;
    if !report.skipped.is_empty() {
        tracing::warn!(skipped = report.skipped.len(), "some embedding files were not loaded");
    }

    let conn = match cfg.bus {
        BusKind::System => zbus::Connection::system().await,
        BusKind::Session => zbus::Connection::session().await,
    }
    .context("connecting to D-Bus")?;

    let notifier = if cfg.notify_signal {
        let signals = SignalNotifier::new(conn.clone(), tokio::runtime::Handle::current());
        spawn_notifier(signals, cfg.notify_queue_depth)?
    } else {
        tracing::info!("registration signals disabled via FACEGATE_NOTIFY_SIGNAL=0");
        spawn_notifier(LogNotifier, cfg.notify_queue_depth)?
    };

    let workflow = Arc::new(RegistrationWorkflow::new(Arc::new(store), notifier));
    let engine = MatchEngine::new(cfg.similarity_threshold);
    let service = GateService::new(api::GateApi::new(workflow, engine));

    conn.object_server().at(OBJECT_PATH, service).await?;
    conn.request_name(BUS_NAME).await?;

    tracing::info!(
        bus = ?cfg.bus,
        name = BUS_NAME,
        threshold = cfg.similarity_threshold,
        "facegated ready"
    );

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
