//! Checkpoint naming, manifest bookkeeping and resume discovery.
//!
//! Every save location holds `checkpoint_epoch_<N>.<ext>` files, at most one
//! `checkpoint_best.<ext>` file and a `checkpoints.json` manifest. Resume reads
//! the manifest and only scans file names when the manifest is absent,
//! unreadable or lists nothing that still exists.

use crate::backend::{Backend, StateBundle};
use crate::error::{Result, TrainError};
use crate::network::{Network, OptimizerMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "checkpoints.json";
pub const EPOCH_PREFIX: &str = "checkpoint_epoch_";
pub const BEST_STEM: &str = "checkpoint_best";

/// Which logical slot a checkpoint file fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Initial,
    Periodic,
    Best,
}

impl CheckpointKind {
    fn is_resumable(self) -> bool {
        !matches!(self, CheckpointKind::Best)
    }
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: String,
    pub kind: CheckpointKind,
    pub epoch: usize,
    /// File name relative to the save location.
    pub file: String,
    /// Validation score at save time, if one was computed.
    pub score: Option<f64>,
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Parse the epoch out of `checkpoint_epoch_<N>.<ext>`.
///
/// Returns the epoch and the extension. Any other shape is malformed.
pub fn parse_checkpoint_name(file_name: &str) -> Result<(usize, &str)> {
    let malformed = || TrainError::MalformedCheckpointName(file_name.to_string());
    let rest = file_name.strip_prefix(EPOCH_PREFIX).ok_or_else(malformed)?;
    let (digits, ext) = rest.split_once('.').ok_or_else(malformed)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) || ext.is_empty() {
        return Err(malformed());
    }
    let epoch = digits.parse().map_err(|_| malformed())?;
    Ok((epoch, ext))
}

/// Owns one save location for one backend's checkpoint format.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    extensions: Vec<String>,
}

impl CheckpointManager {
    /// `extensions` lists accepted extensions, canonical first.
    pub fn new(dir: impl Into<PathBuf>, extensions: &[&str]) -> Result<Self> {
        if extensions.is_empty() {
            return Err(TrainError::checkpoint("at least one extension is required"));
        }
        Ok(Self {
            dir: dir.into(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect(),
        })
    }

    pub fn for_backend(dir: impl Into<PathBuf>, backend: &dyn Backend) -> Result<Self> {
        Self::new(dir, backend.extensions())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn primary_extension(&self) -> &str {
        &self.extensions[0]
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.dir
            .join(format!("{EPOCH_PREFIX}{epoch}.{}", self.primary_extension()))
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir
            .join(format!("{BEST_STEM}.{}", self.primary_extension()))
    }

    fn has_accepted_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.iter().any(|x| x == e))
    }

    /// Append the canonical extension unless the path already carries an
    /// accepted one.
    pub fn canonicalize(&self, path: &Path) -> PathBuf {
        if self.has_accepted_extension(path) {
            return path.to_path_buf();
        }
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(self.primary_extension());
        PathBuf::from(name)
    }

    /// The file that actually exists for `path`: the canonical form first, then
    /// the same stem with each fallback extension.
    pub fn resolve_existing(&self, path: &Path) -> Option<PathBuf> {
        let canonical = self.canonicalize(path);
        if canonical.is_file() {
            return Some(canonical);
        }
        self.extensions
            .iter()
            .map(|ext| canonical.with_extension(ext))
            .find(|candidate| candidate.is_file())
    }

    /// Write a checkpoint for `kind` and record it in the manifest.
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        backend: &dyn Backend,
        kind: CheckpointKind,
        network: &dyn Network,
        optimizers: &OptimizerMap,
        epoch: usize,
        score: Option<f64>,
        extra: &Map<String, Value>,
    ) -> Result<CheckpointEntry> {
        let path = match kind {
            CheckpointKind::Best => self.best_path(),
            CheckpointKind::Initial | CheckpointKind::Periodic => self.epoch_path(epoch),
        };
        backend.save_state(&path, network, optimizers, epoch, extra)?;
        let entry = self.record(kind, &path, epoch, score)?;
        tracing::info!(
            kind = ?kind,
            epoch,
            path = %path.display(),
            size_bytes = entry.size_bytes,
            "Saved checkpoint"
        );
        Ok(entry)
    }

    /// Load a bundle from `path`, resolving extension fallbacks.
    pub fn load(&self, backend: &dyn Backend, path: &Path) -> Result<StateBundle> {
        let resolved = self.resolve_existing(path).ok_or_else(|| {
            TrainError::checkpoint(format!(
                "no checkpoint at {} (tried extensions {:?})",
                self.canonicalize(path).display(),
                self.extensions
            ))
        })?;
        tracing::debug!(path = %resolved.display(), "Loading checkpoint");
        backend.load_state(&resolved)
    }

    /// Add an entry for a file that was just written.
    pub fn record(
        &self,
        kind: CheckpointKind,
        path: &Path,
        epoch: usize,
        score: Option<f64>,
    ) -> Result<CheckpointEntry> {
        let bytes = std::fs::read(path)?;
        let sha256 = format!("{:x}", Sha256::digest(&bytes));
        let file = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TrainError::checkpoint(format!("bad file name {}", path.display())))?
            .to_string();

        let entry = CheckpointEntry {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            epoch,
            file,
            score,
            sha256,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let mut entries = self.manifest().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Checkpoint manifest unreadable; rebuilding it");
            Vec::new()
        });
        entries.retain(|existing| match kind {
            CheckpointKind::Best => existing.kind != CheckpointKind::Best,
            _ => existing.kind == CheckpointKind::Best || existing.epoch != epoch,
        });
        entries.push(entry.clone());
        kiln_core::persistence::atomic_write_json(&self.manifest_path(), &entries)?;
        Ok(entry)
    }

    /// Manifest entries, oldest first. A missing manifest is empty.
    pub fn manifest(&self) -> Result<Vec<CheckpointEntry>> {
        Ok(kiln_core::persistence::load_json(&self.manifest_path())?.unwrap_or_default())
    }

    /// The recorded best entry, if its file still exists.
    pub fn best_entry(&self) -> Option<CheckpointEntry> {
        self.manifest()
            .ok()?
            .into_iter()
            .find(|e| e.kind == CheckpointKind::Best && self.dir.join(&e.file).is_file())
    }

    /// Path of the best checkpoint in any accepted extension.
    pub fn find_best(&self) -> Option<PathBuf> {
        self.resolve_existing(&self.dir.join(BEST_STEM))
    }

    /// Epoch files found by name, one per epoch, preferring earlier extensions.
    ///
    /// Names that look like epoch checkpoints but do not parse are skipped with
    /// a warning.
    pub fn scan(&self) -> Result<BTreeMap<usize, PathBuf>> {
        let mut found: BTreeMap<usize, (usize, PathBuf)> = BTreeMap::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(EPOCH_PREFIX) {
                continue;
            }
            let (epoch, ext) = match parse_checkpoint_name(name) {
                Ok(parsed) => parsed,
                Err(error) => {
                    tracing::warn!(%error, "Skipping checkpoint file");
                    continue;
                }
            };
            let Some(rank) = self.extensions.iter().position(|e| e == ext) else {
                tracing::debug!(file = name, "Ignoring checkpoint with foreign extension");
                continue;
            };
            match found.get(&epoch) {
                Some((existing, _)) if *existing <= rank => {}
                _ => {
                    found.insert(epoch, (rank, path));
                }
            }
        }

        Ok(found.into_iter().map(|(epoch, (_, path))| (epoch, path)).collect())
    }

    /// The highest-epoch non-best checkpoint to resume from.
    pub fn latest_resumable(&self) -> Result<Option<(usize, PathBuf)>> {
        match self.manifest() {
            Ok(entries) => {
                let latest = entries
                    .iter()
                    .filter(|e| e.kind.is_resumable())
                    .filter_map(|e| {
                        let path = self.dir.join(&e.file);
                        path.is_file().then_some((e.epoch, path))
                    })
                    .max_by_key(|(epoch, _)| *epoch);
                if latest.is_some() {
                    return Ok(latest);
                }
            }
            Err(error) => {
                tracing::warn!(%error, "Checkpoint manifest unreadable; scanning file names");
            }
        }
        Ok(self.scan()?.into_iter().next_back())
    }
}
