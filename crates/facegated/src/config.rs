use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Which D-Bus bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file (`FACEGATE_CONFIG`),
/// then `FACEGATE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the embedding batch files.
    pub db_dir: PathBuf,
    /// Cosine similarity a probe must exceed to match.
    pub similarity_threshold: f32,
    /// Capacity of the registration notice queue.
    pub notify_queue_depth: usize,
    /// Emit `RegistrationRequested` D-Bus signals (otherwise only log).
    pub notify_signal: bool,
    pub bus: BusKind,
}

/// Optional on-disk overrides; every field may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_dir: Option<PathBuf>,
    similarity_threshold: Option<f32>,
    notify_queue_depth: Option<usize>,
    notify_signal: Option<bool>,
    bus: Option<BusKind>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        Self {
            db_dir: data_dir.join("embeddings"),
            similarity_threshold: facegate_core::matcher::DEFAULT_THRESHOLD,
            notify_queue_depth: facegate_core::notifier::DEFAULT_QUEUE_DEPTH,
            notify_signal: true,
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load configuration: defaults, config file, then environment.
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        if let Ok(path) = std::env::var("FACEGATE_CONFIG") {
            cfg.apply_file(Path::new(&path))?;
        }
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        self.apply_toml(&raw)
            .with_context(|| format!("parsing config {}", path.display()))
    }

    fn apply_toml(&mut self, raw: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(raw)?;
        if let Some(v) = file.db_dir {
            self.db_dir = v;
        }
        if let Some(v) = file.similarity_threshold {
            self.similarity_threshold = v;
        }
        if let Some(v) = file.notify_queue_depth {
            self.notify_queue_depth = v;
        }
        if let Some(v) = file.notify_signal {
            self.notify_signal = v;
        }
        if let Some(v) = file.bus {
            self.bus = v;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("FACEGATE_DB_DIR") {
            self.db_dir = PathBuf::from(dir);
        }
        self.similarity_threshold = env_f32("FACEGATE_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.notify_queue_depth = env_usize("FACEGATE_NOTIFY_QUEUE_DEPTH", self.notify_queue_depth);
        if let Ok(v) = std::env::var("FACEGATE_NOTIFY_SIGNAL") {
            self.notify_signal = v != "0";
        }
        match std::env::var("FACEGATE_BUS").as_deref() {
            Ok("system") => self.bus = BusKind::System,
            Ok("session") => self.bus = BusKind::Session,
            Ok(other) => tracing::warn!(value = other, "ignoring unknown FACEGATE_BUS"),
            Err(_) => {}
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
