use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facegate", about = "facegate access-control CLI")]
struct Cli {
    /// Bus the daemon is listening on
    #[arg(long, value_enum, default_value_t = Bus::Session)]
    bus: Bus,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Bus {
    System,
    Session,
}

#[derive(Clone, Copy, ValueEnum)]
enum Outcome {
    Approve,
    Reject,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Approve => "approve",
            Outcome::Reject => "reject",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Match a probe embedding (JSON array of numbers) against enrolled faces
    Match {
        embedding: PathBuf,
    },
    /// Ask the approver to admit a new identity
    Request {
        name: String,
        /// Reference to a preview image shown to the approver
        #[arg(long, default_value = "")]
        image_ref: String,
    },
    /// Show the state of a registration request
    Status {
        request_id: String,
    },
    /// Approve or reject a pending request
    Decide {
        request_id: String,
        #[arg(value_enum)]
        outcome: Outcome,
    },
    /// Store embeddings (JSON array of arrays) for an approved request
    Commit {
        request_id: String,
        embeddings: PathBuf,
    },
    /// Reload the embedding store from disk
    Reload,
    /// Show daemon status
    Info,
}

#[zbus::proxy(
    interface = "org.facegate.Gate1",
    default_service = "org.facegate.Gate1",
    default_path = "/org/facegate/Gate1",
    gen_blocking = false
)]
trait Gate {
    #[zbus(name = "Match")]
    async fn match_probe(&self, probe: &[f64]) -> zbus::Result<String>;
    async fn request_registration(&self, name: &str, image_ref: &str) -> zbus::Result<String>;
    async fn status(&self, request_id: &str) -> zbus::Result<String>;
    async fn decide(&self, request_id: &str, outcome: &str) -> zbus::Result<()>;
    async fn register_commit(&self, request_id: &str, embeddings: &[Vec<f64>]) -> zbus::Result<u32>;
    async fn reload(&self) -> zbus::Result<u32>;
    async fn info(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = match cli.bus {
        Bus::System => zbus::Connection::system().await,
        Bus::Session => zbus::Connection::session().await,
    }
    .context("connecting to D-Bus")?;
    tracing::debug!(bus = ?cli.bus, "connected");
    let gate = GateProxy::new(&conn)
        .await
        .context("facegated not reachable")?;

    match cli.command {
        Commands::Match { embedding } => {
            let probe: Vec<f64> = read_json(&embedding)?;
            println!("{}", gate.match_probe(&probe).await?);
        }
        Commands::Request { name, image_ref } => {
            let id = gate.request_registration(&name, &image_ref).await?;
            println!("{id}");
        }
        Commands::Status { request_id } => {
            println!("{}", gate.status(&request_id).await?);
        }
        Commands::Decide { request_id, outcome } => {
            gate.decide(&request_id, outcome.as_str()).await?;
            println!("{request_id}: {}", outcome.as_str());
        }
        Commands::Commit {
            request_id,
            embeddings,
        } => {
            let batch: Vec<Vec<f64>> = read_json(&embeddings)?;
            if batch.is_empty() {
                bail!("{} holds no embeddings", embeddings.display());
            }
            let count = gate.register_commit(&request_id, &batch).await?;
            println!("registered {count} embeddings");
        }
        Commands::Reload => {
            let identities = gate.reload().await?;
            println!("loaded {identities} identities");
        }
        Commands::Info => {
            let raw = gate.info().await?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
