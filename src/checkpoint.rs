//! Workflow state and checkpoint persistence.
//!
//! Each batch run owns exactly one [`WorkflowState`], persisted as a single
//! JSON file named by workflow id. The orchestrator saves after every
//! completed item, so an interruption loses at most the one in-flight item
//! and resuming with the same id recomputes the remaining work exactly.
//!
//! Writes go to a temp file in the same directory and are renamed over the
//! final path, so a reader observes either the fully-previous or the
//! fully-new checkpoint, never a partial one. Single-writer discipline:
//! only the run owning a workflow id writes its checkpoint; concurrent runs
//! must use distinct ids.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Lifecycle of a workflow run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
}

/// Progress of one resumable batch-analysis run.
///
/// The three outcome sets are pairwise disjoint at all times; re-marking a
/// key moves it between sets. `total_items` is fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub source_type: String,
    pub source_identifier: String,
    pub total_items: usize,
    pub processed_keys: HashSet<String>,
    pub skipped_keys: HashSet<String>,
    /// Failed keys with the recorded failure reason.
    pub failed_keys: HashMap<String, String>,
    pub status: WorkflowStatus,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    fn new(
        source_type: &str,
        source_identifier: &str,
        total_items: usize,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: Uuid::new_v4().to_string(),
            source_type: source_type.to_string(),
            source_identifier: source_identifier.to_string(),
            total_items,
            processed_keys: HashSet::new(),
            skipped_keys: HashSet::new(),
            failed_keys: HashMap::new(),
            status: WorkflowStatus::Running,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_processed(&mut self, key: &str) {
        self.skipped_keys.remove(key);
        self.failed_keys.remove(key);
        self.processed_keys.insert(key.to_string());
        self.updated_at = Utc::now();
    }

    pub fn mark_skipped(&mut self, key: &str) {
        self.processed_keys.remove(key);
        self.failed_keys.remove(key);
        self.skipped_keys.insert(key.to_string());
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, key: &str, reason: &str) {
        self.processed_keys.remove(key);
        self.skipped_keys.remove(key);
        self.failed_keys.insert(key.to_string(), reason.to_string());
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self) {
        self.status = WorkflowStatus::Completed;
        self.updated_at = Utc::now();
    }

    /// Whether a key already has a terminal outcome.
    pub fn is_resolved(&self, key: &str) -> bool {
        self.processed_keys.contains(key)
            || self.skipped_keys.contains(key)
            || self.failed_keys.contains_key(key)
    }

    /// `all_keys` minus every key with a recorded outcome, duplicate-free,
    /// in `all_keys`'s original order. This determinism is what makes
    /// resuming and chunk-level reporting reproducible.
    pub fn remaining_keys(&self, all_keys: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        all_keys
            .iter()
            .filter(|key| seen.insert(key.as_str()) && !self.is_resolved(key))
            .cloned()
            .collect()
    }

    /// `(processed, skipped, failed)` counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.processed_keys.len(),
            self.skipped_keys.len(),
            self.failed_keys.len(),
        )
    }
}

/// One row of `list_workflows` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub source_type: String,
    pub source_identifier: String,
    pub total_items: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub status: WorkflowStatus,
    pub updated_at: DateTime<Utc>,
}

/// Persists and restores workflow checkpoints, one JSON file per id.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Build a fresh state with a unique id. The state is not persisted
    /// until the first `save_state`, so a run that aborts before touching
    /// any item leaves no checkpoint behind.
    pub fn create_workflow(
        &self,
        source_type: &str,
        source_identifier: &str,
        total_items: usize,
        metadata: HashMap<String, serde_json::Value>,
    ) -> WorkflowState {
        WorkflowState::new(source_type, source_identifier, total_items, metadata)
    }

    /// Persist `state` atomically: write a sibling temp file, then rename
    /// it over the final path.
    pub async fn save_state(&self, state: &WorkflowState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create checkpoint dir: {}", self.dir.display()))?;

        let path = self.state_path(&state.workflow_id)?;
        let tmp = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(state).context("Failed to serialize checkpoint")?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write checkpoint: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace checkpoint: {}", path.display()))?;

        Ok(())
    }

    /// Load a checkpoint by id. A missing file means "start fresh" and
    /// returns `None`, not an error.
    pub async fn load_state(&self, workflow_id: &str) -> Result<Option<WorkflowState>> {
        let path = self.state_path(workflow_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read checkpoint: {}", path.display()))
            }
        };

        let state: WorkflowState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;
        Ok(Some(state))
    }

    /// Summaries of all persisted workflows, optionally filtered by
    /// status, most recently updated first.
    pub async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowSummary>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to read checkpoint dir: {}", self.dir.display())
                })
            }
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(err) => {
                    warn!("skipping unreadable checkpoint {}: {}", path.display(), err);
                    continue;
                }
            };
            let state: WorkflowState = match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(err) => {
                    warn!("skipping malformed checkpoint {}: {}", path.display(), err);
                    continue;
                }
            };
            if let Some(wanted) = status {
                if state.status != wanted {
                    continue;
                }
            }
            let (processed, skipped, failed) = state.counts();
            summaries.push(WorkflowSummary {
                workflow_id: state.workflow_id,
                source_type: state.source_type,
                source_identifier: state.source_identifier,
                total_items: state.total_items,
                processed,
                skipped,
                failed,
                status: state.status,
                updated_at: state.updated_at,
            });
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    /// Remove a checkpoint file. Deleting an id that was never persisted
    /// is not an error, mirroring `load_state`.
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        let path = self.state_path(workflow_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to delete checkpoint: {}", path.display()))
            }
        }
    }

    fn state_path(&self, workflow_id: &str) -> Result<PathBuf> {
        if workflow_id.is_empty()
            || workflow_id.contains(['/', '\\'])
            || workflow_id.contains("..")
        {
            bail!("invalid workflow id: {:?}", workflow_id);
        }
        Ok(self.dir.join(format!("{}.json", workflow_id)))
    }
}
