//! Parameter checkpoints on disk.
//!
//! ```text
//! <dir>/
//!   CKPT+<unixtime>-<seq>/
//!     model.safetensors   VarMap contents
//!     meta.json           user meta + "unixtime"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use candle_nn::VarMap;

use crate::{Error, Result};

/// Free-form checkpoint metadata (`{"acc": 0.71, "epoch": 3}`).
pub type CheckpointMeta = BTreeMap<String, serde_json::Value>;

const CKPT_PREFIX: &str = "CKPT+";
const MODEL_FILE: &str = "model.safetensors";
const META_FILE: &str = "meta.json";
const STAGING_PREFIX: &str = ".partial-";

/// Persists model parameters with metadata.
pub trait Checkpointer: Send {
    /// Write a new checkpoint. Returns its directory.
    fn save_checkpoint(&mut self, varmap: &VarMap, meta: CheckpointMeta) -> Result<PathBuf>;

    /// Write a new checkpoint, then delete every other checkpoint except the
    /// one with the largest `max_key` and the one just written.
    fn save_and_keep_only(
        &mut self,
        varmap: &VarMap,
        meta: CheckpointMeta,
        max_key: &str,
    ) -> Result<PathBuf>;
}

/// A saved checkpoint found on disk.
#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub path: PathBuf,
    pub meta: CheckpointMeta,
}

/// Checkpointer writing safetensors + JSON into one directory.
#[derive(Debug, Clone)]
pub struct SafetensorsCheckpointer {
    dir: PathBuf,
    seq: usize,
}

impl SafetensorsCheckpointer {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, seq: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All complete checkpoints in the directory, oldest first.
    ///
    /// Directories without `meta.json` are left over from an interrupted save
    /// and are skipped.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_ckpt = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(CKPT_PREFIX));
            if !is_ckpt || !path.is_dir() {
                continue;
            }
            let meta_path = path.join(META_FILE);
            if !meta_path.is_file() {
                tracing::warn!(path = %path.display(), "skipping checkpoint without meta.json");
                continue;
            }
            let raw = std::fs::read_to_string(meta_path)?;
            let meta: CheckpointMeta = serde_json::from_str(&raw)?;
            entries.push(CheckpointEntry { path, meta });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// The checkpoint with the largest numeric `max_key`.
    pub fn best(&self, max_key: &str) -> Result<Option<CheckpointEntry>> {
        Ok(self
            .list()?
            .into_iter()
            .filter_map(|e| meta_value(&e.meta, max_key).map(|v| (v, e)))
            .max_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, e)| e))
    }

    /// Load the best checkpoint by `max_key` into `varmap`.
    ///
    /// Returns its metadata, or `None` when nothing was saved yet.
    pub fn recover_best(&self, varmap: &mut VarMap, max_key: &str) -> Result<Option<CheckpointMeta>> {
        let Some(best) = self.best(max_key)? else {
            return Ok(None);
        };
        varmap
            .load(best.path.join(MODEL_FILE))
            .map_err(|e| Error::Checkpoint(format!("{}: {e}", best.path.display())))?;
        tracing::info!(path = %best.path.display(), "recovered checkpoint");
        Ok(Some(best.meta))
    }

    fn next_name(&mut self) -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.seq += 1;
        format!("{CKPT_PREFIX}{secs:012}-{:06}", self.seq)
    }
}

fn meta_value(meta: &CheckpointMeta, key: &str) -> Option<f64> {
    meta.get(key).and_then(serde_json::Value::as_f64)
}

fn write_checkpoint_files(dir: &Path, varmap: &VarMap, meta: &mut CheckpointMeta) -> Result<()> {
    varmap
        .save(dir.join(MODEL_FILE))
        .map_err(|e| Error::Checkpoint(format!("{}: {e}", dir.display())))?;
    let unixtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    meta.insert("unixtime".into(), unixtime.into());
    std::fs::write(dir.join(META_FILE), serde_json::to_string_pretty(meta)?)?;
    Ok(())
}

impl Checkpointer for SafetensorsCheckpointer {
    fn save_checkpoint(&mut self, varmap: &VarMap, mut meta: CheckpointMeta) -> Result<PathBuf> {
        let name = self.next_name();
        let path = self.dir.join(&name);
        // Staged outside the CKPT+ namespace until both files exist.
        let staging = self.dir.join(format!("{STAGING_PREFIX}{name}"));
        std::fs::create_dir_all(&staging)?;
        if let Err(e) = write_checkpoint_files(&staging, varmap, &mut meta) {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                tracing::warn!(path = %staging.display(), %cleanup, "could not remove partial checkpoint");
            }
            return Err(e);
        }
        std::fs::rename(&staging, &path)?;
        tracing::info!(path = %path.display(), "saved checkpoint");
        Ok(path)
    }

    fn save_and_keep_only(
        &mut self,
        varmap: &VarMap,
        meta: CheckpointMeta,
        max_key: &str,
    ) -> Result<PathBuf> {
        let saved = self.save_checkpoint(varmap, meta)?;
        let best = self.best(max_key)?.map(|e| e.path);
        for entry in self.list()? {
            if entry.path == saved || Some(&entry.path) == best.as_ref() {
                continue;
            }
            std::fs::remove_dir_all(&entry.path)?;
            tracing::debug!(path = %entry.path.display(), "deleted checkpoint");
        }
        Ok(saved)
    }
}
