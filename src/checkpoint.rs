//! Durable per-(group, feed kind) checkpoints.
//!
//! The whole store is one pretty-printed JSON document
//! `{ "<group_id>": { "home": {..}, "digest": {..} } }` so an operator can
//! read, diff and hand-repair it. Every `put` reads the full document,
//! replaces one entry and rewrites the file. There is no locking: callers
//! must not run two writers against the same file.
use chrono::Utc;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::model::{Checkpoint, FeedKind};

/// Inner keys are the feed kind's wire name so that entries written by a
/// newer build survive a rewrite by an older one.
type Document = BTreeMap<String, BTreeMap<String, Checkpoint>>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt checkpoint file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode checkpoints: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.checkpoint_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[instrument(skip_all)]
    pub async fn get(
        &self,
        group_id: &str,
        kind: FeedKind,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let mut doc = self.read_document().await?;
        Ok(doc
            .get_mut(group_id)
            .and_then(|kinds| kinds.remove(kind.as_str())))
    }

    /// Replace the checkpoint of one (group, kind), leaving every other entry
    /// as it was on disk.
    #[instrument(skip_all)]
    pub async fn put(
        &self,
        group_id: &str,
        kind: FeedKind,
        checkpoint: Checkpoint,
    ) -> Result<(), CheckpointError> {
        let mut doc = match self.read_document().await {
            Ok(doc) => doc,
            Err(CheckpointError::Corrupt { source, .. }) => {
                let moved = self.quarantine().await?;
                warn!(
                    error = %source,
                    moved_to = %moved.display(),
                    "checkpoint file was corrupt; moved aside and starting a fresh one"
                );
                Document::new()
            }
            Err(err) => return Err(err),
        };
        doc.entry(group_id.to_string())
            .or_default()
            .insert(kind.as_str().to_string(), checkpoint);
        self.write_document(&doc).await
    }

    /// Drop stored checkpoints for a group, or only one of its feed kinds.
    /// Returns whether anything was removed.
    #[instrument(skip_all)]
    pub async fn reset(
        &self,
        group_id: &str,
        kind: Option<FeedKind>,
    ) -> Result<bool, CheckpointError> {
        let mut doc = self.read_document().await?;
        let removed = match kind {
            None => doc.remove(group_id).is_some(),
            Some(kind) => {
                let removed = doc
                    .get_mut(group_id)
                    .map(|kinds| kinds.remove(kind.as_str()).is_some())
                    .unwrap_or(false);
                if doc.get(group_id).is_some_and(|kinds| kinds.is_empty()) {
                    doc.remove(group_id);
                }
                removed
            }
        };
        if removed {
            self.write_document(&doc).await?;
            info!(group_id, kind = ?kind, "checkpoint reset");
        }
        Ok(removed)
    }

    async fn read_document(&self) -> Result<Document, CheckpointError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Document::new()),
            Err(err) => return Err(err.into()),
        };
        if content.trim().is_empty() {
            return Ok(Document::new());
        }
        serde_json::from_str(&content).map_err(|source| CheckpointError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Write to a sibling temp file, then rename over the store.
    async fn write_document(&self, doc: &Document) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut body = serde_json::to_string_pretty(doc).map_err(CheckpointError::Encode)?;
        body.push('\n');
        let tmp = self.sibling(".tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn quarantine(&self) -> Result<PathBuf, CheckpointError> {
        let target = self.sibling(&format!(".corrupt-{}", Utc::now().format("%Y%m%d%H%M%S")));
        fs::rename(&self.path, &target).await?;
        Ok(target)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }
}
