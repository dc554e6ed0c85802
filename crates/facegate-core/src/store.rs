//! Embedding store: identity name -> enrolled embeddings, backed by a
//! directory of batch files (see [`crate::codec`]).
//!
//! Readers take an `Arc<Gallery>` snapshot and scan it without holding any
//! lock. Writers (`add`, `reload`) are serialised by a single writer lock and
//! publish a complete new snapshot only after disk I/O has succeeded.
//!
//! Batch ids are time-ordered, so filename order within an identity is the
//! order batches were added and a reload rebuilds each record unchanged.
//! On load the store dimension is the one carried by the most embeddings
//! (ties go to the first file in name order); files of any other dimension
//! are skipped.

use crate::codec::{self, CodecError, FILE_EXTENSION};
use crate::types::Embedding;
use ndarray::Array2;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

const NAME_SUFFIX: &str = "_embeddings";

/// Longest identity, in bytes, whose batch file name still fits in 255 bytes.
pub const MAX_IDENTITY_BYTES: usize = 255 - (1 + 32 + NAME_SUFFIX.len() + 1 + FILE_EXTENSION.len());

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("embedding dimension {found} does not match store dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("invalid identity name: {0:?}")]
    InvalidIdentity(String),
    #[error("no embeddings supplied")]
    EmptyBatch,
    #[error("failed to persist embeddings: {0}")]
    PersistFailure(#[source] std::io::Error),
    #[error("store directory unavailable: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Stable code used at the API boundary.
    pub fn reason_code(&self) -> &'static str {
        match self {
            StoreError::DimensionMismatch { .. } => "dimension_mismatch",
            StoreError::InvalidIdentity(_) => "invalid_identity",
            StoreError::EmptyBatch => "no_embeddings",
            StoreError::PersistFailure(_) => "persist_failure",
            StoreError::Io(_) => "store_unavailable",
        }
    }
}

/// Why a file in the store directory was left out of the index.
#[derive(Error, Debug)]
pub enum CorruptRecord {
    #[error("file name does not follow <identity>_<id>_embeddings.fge")]
    UnparsableName,
    #[error("unreadable: {0}")]
    Unreadable(#[source] std::io::Error),
    #[error("undecodable: {0}")]
    Decode(#[from] CodecError),
    #[error("dimension {found} does not match store dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// A file skipped during load.
#[derive(Debug)]
pub struct SkippedRecord {
    pub file: PathBuf,
    pub reason: CorruptRecord,
}

/// Summary of a directory scan.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub files_loaded: usize,
    pub embeddings_loaded: usize,
    pub skipped: Vec<SkippedRecord>,
}

/// Structured name of a batch file: `<identity>_<id>_embeddings.fge`.
///
/// The identity may itself contain underscores; the id is the last
/// `_`-separated component before the suffix and must be a UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFileName {
    pub identity: String,
    pub id: Uuid,
}

impl BatchFileName {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            id: Uuid::now_v7(),
        }
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name
            .strip_suffix(FILE_EXTENSION)?
            .strip_suffix('.')?
            .strip_suffix(NAME_SUFFIX)?;
        let (identity, id) = stem.rsplit_once('_')?;
        if validate_identity(identity).is_err() {
            return None;
        }
        let id = Uuid::parse_str(id).ok()?;
        Some(Self {
            identity: identity.to_string(),
            id,
        })
    }

    fn is_candidate(file_name: &str) -> bool {
        !file_name.starts_with('.') && file_name.ends_with(&format!("{NAME_SUFFIX}.{FILE_EXTENSION}"))
    }
}

impl fmt::Display for BatchFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}{NAME_SUFFIX}.{FILE_EXTENSION}",
            self.identity,
            self.id.simple()
        )
    }
}

/// Check that `identity` can be used as the prefix of a batch file name.
pub fn validate_identity(identity: &str) -> Result<(), StoreError> {
    let bad = identity.trim().is_empty()
        || identity.len() > MAX_IDENTITY_BYTES
        || identity.starts_with('.')
        || identity
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if bad {
        Err(StoreError::InvalidIdentity(identity.to_string()))
    } else {
        Ok(())
    }
}

/// Immutable snapshot of the index.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    identities: BTreeMap<String, Vec<Embedding>>,
    dimension: Option<usize>,
}

impl Gallery {
    /// Number of identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn total_embeddings(&self) -> usize {
        self.identities.values().map(Vec::len).sum()
    }

    /// Dimensionality shared by every stored embedding, if any are stored.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.identities.keys().map(String::as_str)
    }

    pub fn embeddings_for(&self, identity: &str) -> Option<&[Embedding]> {
        self.identities.get(identity).map(Vec::as_slice)
    }

    /// Identities in stable (name) order with their embeddings in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Embedding])> {
        self.identities
            .iter()
            .map(|(name, embs)| (name.as_str(), embs.as_slice()))
    }

    fn insert(&mut self, identity: &str, embeddings: impl IntoIterator<Item = Embedding>) {
        let entry = self.identities.entry(identity.to_string()).or_default();
        for e in embeddings {
            self.dimension.get_or_insert(e.dim());
            entry.push(e);
        }
    }
}

/// Scan `dir` and build a gallery. Bad files are skipped and reported.
///
/// Only failure to create or list the directory itself is an error.
pub fn load(dir: &Path) -> Result<(Gallery, LoadReport), StoreError> {
    std::fs::create_dir_all(dir)?;

    let mut names: Vec<(String, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            Some((name, entry.path()))
        })
        .collect();
    names.sort();

    let mut gallery = Gallery::default();
    let mut report = LoadReport::default();
    let mut batches = Vec::new();

    for (name, path) in names {
        if !BatchFileName::is_candidate(&name) {
            tracing::debug!(file = %name, "ignoring non-batch file");
            continue;
        }
        match read_batch(&name, &path) {
            Ok((file_name, batch)) => batches.push((path, file_name, batch)),
            Err(reason) => report.skip(path, reason),
        }
    }

    let dimension = dominant_dimension(&batches);
    for (path, file_name, batch) in batches {
        let found = batch.ncols();
        match dimension {
            Some(expected) if expected != found => {
                report.skip(path, CorruptRecord::DimensionMismatch { expected, found });
            }
            _ => {
                report.files_loaded += 1;
                report.embeddings_loaded += batch.nrows();
                let rows = batch.rows().into_iter().map(|row| Embedding::new(row.to_vec()));
                gallery.insert(&file_name.identity, rows);
            }
        }
    }

    tracing::info!(
        identities = gallery.len(),
        embeddings = report.embeddings_loaded,
        skipped = report.skipped.len(),
        dir = %dir.display(),
        "loaded embedding store"
    );

    Ok((gallery, report))
}

impl LoadReport {
    fn skip(&mut self, file: PathBuf, reason: CorruptRecord) {
        tracing::warn!(file = %file.display(), error = %reason, "skipping corrupt record");
        self.skipped.push(SkippedRecord { file, reason });
    }
}

fn read_batch(name: &str, path: &Path) -> Result<(BatchFileName, Array2<f32>), CorruptRecord> {
    let file_name = BatchFileName::parse(name).ok_or(CorruptRecord::UnparsableName)?;
    let bytes = std::fs::read(path).map_err(CorruptRecord::Unreadable)?;
    Ok((file_name, codec::decode(&bytes)?))
}

/// Dimension carried by the most embeddings; ties keep the earliest file.
fn dominant_dimension(batches: &[(PathBuf, BatchFileName, Array2<f32>)]) -> Option<usize> {
    let mut counts: Vec<(usize, usize)> = Vec::new();
    for (_, _, batch) in batches {
        match counts.iter_mut().find(|(dim, _)| *dim == batch.ncols()) {
            Some((_, rows)) => *rows += batch.nrows(),
            None => counts.push((batch.ncols(), batch.nrows())),
        }
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(usize, usize)>, (dim, rows)| match best {
            Some((_, top)) if top >= rows => best,
            _ => Some((dim, rows)),
        })
        .map(|(dim, _)| dim)
}

/// Process-wide embedding index.
pub struct EmbeddingStore {
    dir: PathBuf,
    snapshot: RwLock<Arc<Gallery>>,
    writer: Mutex<()>,
}

impl EmbeddingStore {
    /// Open (creating if needed) the store directory and load it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<(Self, LoadReport), StoreError> {
        let dir = dir.into();
        let (gallery, report) = load(&dir)?;
        let store = Self {
            dir,
            snapshot: RwLock::new(Arc::new(gallery)),
            writer: Mutex::new(()),
        };
        Ok((store, report))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current consistent view of the index.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persist `embeddings` as a new batch file for `identity`, then publish
    /// them. On any error the in-memory index is left untouched.
    pub fn add(&self, identity: &str, embeddings: &[Embedding]) -> Result<usize, StoreError> {
        validate_identity(identity)?;
        let first = embeddings.first().ok_or(StoreError::EmptyBatch)?;
        let dim = first.dim();
        if dim == 0 {
            return Err(StoreError::EmptyBatch);
        }
        if let Some(bad) = embeddings.iter().find(|e| e.dim() != dim) {
            return Err(StoreError::DimensionMismatch {
                expected: dim,
                found: bad.dim(),
            });
        }

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.snapshot();
        if let Some(expected) = current.dimension() {
            if expected != dim {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    found: dim,
                });
            }
        }

        let file_name = BatchFileName::new(identity);
        self.persist(&file_name, embeddings)?;

        let mut next = (*current).clone();
        next.insert(identity, embeddings.iter().cloned());
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);

        tracing::info!(
            identity,
            count = embeddings.len(),
            file = %file_name,
            "added embeddings"
        );
        Ok(embeddings.len())
    }

    /// Rebuild the index from disk and swap it in wholesale.
    pub fn reload(&self) -> Result<LoadReport, StoreError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let (gallery, report) = load(&self.dir)?;
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(gallery);
        Ok(report)
    }

    /// Write to a temp file in the store directory, fsync, then rename into place.
    fn persist(&self, file_name: &BatchFileName, embeddings: &[Embedding]) -> Result<(), StoreError> {
        let rows: Vec<&[f32]> = embeddings.iter().map(Embedding::values).collect();
        let bytes = codec::encode_rows(&rows).map_err(|e| {
            StoreError::PersistFailure(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(StoreError::PersistFailure)?;
        tmp.write_all(&bytes).map_err(StoreError::PersistFailure)?;
        tmp.as_file().sync_all().map_err(StoreError::PersistFailure)?;
        tmp.persist_noclobber(self.dir.join(file_name.to_string()))
            .map_err(|e| StoreError::PersistFailure(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_file_name_roundtrip() {
        let name = BatchFileName::new("mary_ann");
        let parsed = BatchFileName::parse(&name.to_string()).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn test_file_name_rejects_bad_schema() {
        assert!(BatchFileName::parse("alice_embeddings.fge").is_none());
        assert!(BatchFileName::parse("alice_user_1234_embeddings.fge").is_none());
        assert!(BatchFileName::parse("alice_embeddings.npy").is_none());
        let id = Uuid::new_v4().simple().to_string();
        assert!(BatchFileName::parse(&format!("_{id}_embeddings.fge")).is_none());
        assert!(BatchFileName::parse(&format!("bob_{id}_embeddings.fge")).is_some());
    }

    #[test]
    fn test_identity_length_bound() {
        let longest = "a".repeat(MAX_IDENTITY_BYTES);
        assert!(validate_identity(&longest).is_ok());
        assert_eq!(BatchFileName::new(&longest).to_string().len(), 255);
        assert!(validate_identity(&format!("{longest}a")).is_err());

        // multi-byte names are bounded by bytes, not chars
        let thai = "ก".repeat(70);
        assert!(thai.chars().count() < MAX_IDENTITY_BYTES);
        assert!(matches!(validate_identity(&thai), Err(StoreError::InvalidIdentity(_))));
    }

    #[test]
    fn test_open_creates_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested/db");
        let (store, report) = EmbeddingStore::open(&dir).unwrap();
        assert!(dir.is_dir());
        assert!(store.snapshot().is_empty());
        assert_eq!(report.files_loaded, 0);
    }

    #[test]
    fn test_add_then_reload_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = EmbeddingStore::open(tmp.path()).unwrap();
        let e1 = emb(&[0.25, -1.5, 3.0e-7]);
        let e2 = emb(&[9.0, 0.1, -0.0]);

        assert_eq!(store.add("alice", &[e1.clone(), e2.clone()]).unwrap(), 2);
        store.reload().unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.embeddings_for("alice").unwrap(), &[e1, e2]);
        assert_eq!(snap.dimension(), Some(3));
    }

    #[test]
    fn test_batches_for_same_identity_are_grouped() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = EmbeddingStore::open(tmp.path()).unwrap();
        store.add("alice", &[emb(&[1.0, 0.0])]).unwrap();
        store.add("alice", &[emb(&[0.0, 1.0])]).unwrap();
        store.add("bob", &[emb(&[1.0, 1.0])]).unwrap();

        let (gallery, report) = load(tmp.path()).unwrap();
        assert_eq!(report.files_loaded, 3);
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.embeddings_for("alice").unwrap().len(), 2);
        assert_eq!(gallery.total_embeddings(), 3);
    }

    #[test]
    fn test_batch_order_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = EmbeddingStore::open(tmp.path()).unwrap();
        for i in 0..16 {
            store.add("alice", &[emb(&[i as f32, 1.0])]).unwrap();
            store.add("alice_b", &[emb(&[1.0, i as f32])]).unwrap();
        }
        let before = store.snapshot();

        store.reload().unwrap();
        let after = store.snapshot();
        for identity in ["alice", "alice_b"] {
            assert_eq!(before.embeddings_for(identity), after.embeddings_for(identity));
        }
        let firsts: Vec<f32> = after
            .embeddings_for("alice")
            .unwrap()
            .iter()
            .map(|e| e.values()[0])
            .collect();
        assert_eq!(firsts, (0..16).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_load_keeps_majority_dimension() {
        let tmp = tempfile::tempdir().unwrap();
        let id = || Uuid::now_v7().simple().to_string();
        // a stray wide file that sorts ahead of everything else
        let wide = codec::encode_rows(&[vec![1.0f32, 0.0, 0.0]]).unwrap();
        std::fs::write(tmp.path().join(format!("aaron_{}_embeddings.fge", id())), wide).unwrap();
        let narrow = codec::encode_rows(&[vec![1.0f32, 0.0], vec![0.0, 1.0]]).unwrap();
        std::fs::write(tmp.path().join(format!("bob_{}_embeddings.fge", id())), &narrow).unwrap();
        std::fs::write(tmp.path().join(format!("carol_{}_embeddings.fge", id())), &narrow).unwrap();

        let (gallery, report) = load(tmp.path()).unwrap();
        assert_eq!(gallery.dimension(), Some(2));
        assert_eq!(gallery.identities().collect::<Vec<_>>(), vec!["bob", "carol"]);
        assert_eq!(report.files_loaded, 2);
        assert_eq!(report.skipped.len(), 1);
        assert!(matches!(
            report.skipped[0].reason,
            CorruptRecord::DimensionMismatch { expected: 2, found: 3 }
        ));
    }

    #[test]
    fn test_add_rejects_dimension_mismatch_without_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = EmbeddingStore::open(tmp.path()).unwrap();
        store.add("alice", &[emb(&[1.0, 0.0])]).unwrap();

        let err = store.add("bob", &[emb(&[1.0, 0.0, 0.0])]).unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 2, found: 3 }));
        assert!(store.snapshot().embeddings_for("bob").is_none());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);

        let err = store.add("carol", &[emb(&[1.0, 0.0]), emb(&[1.0])]).unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_add_rejects_bad_identity_and_empty_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = EmbeddingStore::open(tmp.path()).unwrap();
        assert!(matches!(
            store.add("../etc", &[emb(&[1.0])]),
            Err(StoreError::InvalidIdentity(_))
        ));
        assert!(matches!(store.add("  ", &[emb(&[1.0])]), Err(StoreError::InvalidIdentity(_))));
        assert!(matches!(store.add("alice", &[]), Err(StoreError::EmptyBatch)));
    }

    #[test]
    fn test_persist_failure_leaves_index_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("db");
        let (store, _) = EmbeddingStore::open(&dir).unwrap();
        store.add("alice", &[emb(&[1.0, 0.0])]).unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
        let err = store.add("bob", &[emb(&[0.0, 1.0])]).unwrap_err();
        assert!(matches!(err, StoreError::PersistFailure(_)));
        assert_eq!(err.reason_code(), "persist_failure");

        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap.embeddings_for("bob").is_none());
    }

    #[test]
    fn test_load_skips_corrupt_records() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = EmbeddingStore::open(tmp.path()).unwrap();
        store.add("alice", &[emb(&[1.0, 0.0])]).unwrap();

        let id = Uuid::new_v4().simple().to_string();
        // garbage contents under a valid name
        std::fs::write(tmp.path().join(format!("bob_{id}_embeddings.fge")), b"nope").unwrap();
        // valid contents under an unparsable name
        let good = codec::encode_rows(&[vec![0.0f32, 1.0]]).unwrap();
        std::fs::write(tmp.path().join("carol_embeddings.fge"), &good).unwrap();
        // wrong dimensionality
        let wide = codec::encode_rows(&[vec![0.0f32, 1.0, 2.0]]).unwrap();
        std::fs::write(tmp.path().join(format!("dave_{id}_embeddings.fge")), wide).unwrap();
        // unrelated file
        std::fs::write(tmp.path().join("README.txt"), b"hi").unwrap();

        let report = store.reload().unwrap();
        assert_eq!(report.files_loaded, 1);
        assert_eq!(report.skipped.len(), 3);
        assert!(report
            .skipped
            .iter()
            .any(|s| matches!(s.reason, CorruptRecord::UnparsableName)));
        assert!(report
            .skipped
            .iter()
            .any(|s| matches!(s.reason, CorruptRecord::Decode(_))));
        assert!(report
            .skipped
            .iter()
            .any(|s| matches!(s.reason, CorruptRecord::DimensionMismatch { expected: 2, found: 3 })));

        let snap = store.snapshot();
        assert_eq!(snap.identities().collect::<Vec<_>>(), vec!["alice"]);
    }

    #[test]
    fn test_reload_replaces_snapshot_wholesale() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = EmbeddingStore::open(tmp.path()).unwrap();
        store.add("alice", &[emb(&[1.0, 0.0])]).unwrap();
        let before = store.snapshot();

        for entry in std::fs::read_dir(tmp.path()).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }
        store.reload().unwrap();

        // old readers keep their complete view
        assert_eq!(before.len(), 1);
        assert!(store.snapshot().is_empty());
    }
}
