//! Worktree janitor: stale detection, post-merge cleanup, reconciliation.
//!
//! Runs on the daemon's interval timer and on demand from the maintenance
//! routes. A worktree recorded in the Store but missing on disk is
//! reconciled by clearing the metadata; a worktree belonging to an active
//! session is never touched.

use chrono::{Duration, Utc};
use serde::Serialize;
use specwright_core::{Id, Spec};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::git;
use crate::session::Sessions;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum JanitorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, JanitorError>;

/// A worktree past the idle threshold with an unmerged PR.
#[derive(Debug, Clone, Serialize)]
pub struct StaleWorktree {
    pub spec_id: Id,
    pub worktree_path: String,
    pub idle_days: i64,
    pub pr_url: Option<String>,
}

/// Outcome of a cleanup sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    /// Specs whose worktrees were removed (or reconciled away).
    pub cleaned: Vec<Id>,
    /// Stale worktrees left in place (unmerged, not forced).
    pub stale: Vec<Id>,
    pub errors: Vec<String>,
}

pub struct WorktreeJanitor {
    storage: Arc<Storage>,
    sessions: Arc<Sessions>,
    max_idle_days: i64,
}

impl std::fmt::Debug for WorktreeJanitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorktreeJanitor")
            .field("max_idle_days", &self.max_idle_days)
            .finish_non_exhaustive()
    }
}

impl WorktreeJanitor {
    pub fn new(storage: Arc<Storage>, sessions: Arc<Sessions>, max_idle_days: i64) -> Self {
        Self {
            storage,
            sessions,
            max_idle_days,
        }
    }

    fn is_stale(&self, spec: &Spec) -> bool {
        if spec.pr_merged {
            return false;
        }
        let Some(last_activity) = spec.worktree_last_activity.or(spec.worktree_created_at) else {
            return true;
        };
        Utc::now() - last_activity > Duration::days(self.max_idle_days)
    }

    /// Worktrees idle past the threshold whose PR is not merged.
    pub async fn list_stale(&self) -> Result<Vec<StaleWorktree>> {
        let specs = self.storage.specs_with_worktrees().await?;
        let mut stale = Vec::new();
        for spec in specs {
            if self.sessions.is_active(&spec.id) || !self.is_stale(&spec) {
                continue;
            }
            let Some(path) = spec.worktree_path.clone() else {
                continue;
            };
            let idle_days = spec
                .worktree_last_activity
                .or(spec.worktree_created_at)
                .map(|t| (Utc::now() - t).num_days())
                .unwrap_or(i64::MAX);
            stale.push(StaleWorktree {
                spec_id: spec.id,
                worktree_path: path,
                idle_days,
                pr_url: spec.pr_url,
            });
        }
        Ok(stale)
    }

    /// Sweep all recorded worktrees.
    ///
    /// Merged-PR worktrees are always removed; stale unmerged ones only when
    /// `force` is set, and are otherwise reported as stale.
    pub async fn cleanup(&self, force: bool) -> Result<CleanupReport> {
        let specs = self.storage.specs_with_worktrees().await?;
        let mut report = CleanupReport::default();

        for spec in specs {
            if self.sessions.is_active(&spec.id) {
                continue;
            }
            let stale = self.is_stale(&spec);
            if spec.pr_merged || (stale && force) {
                match self.remove(&spec).await {
                    Ok(()) => report.cleaned.push(spec.id),
                    Err(message) => report.errors.push(message),
                }
            } else if stale {
                report.stale.push(spec.id);
            }
        }

        info!(
            cleaned = report.cleaned.len(),
            stale = report.stale.len(),
            errors = report.errors.len(),
            "worktree cleanup sweep"
        );
        Ok(report)
    }

    /// Unconditional removal of a spec's worktree and metadata.
    pub async fn delete(&self, spec_id: &Id) -> Result<()> {
        let spec = self.storage.get_spec(spec_id).await?;
        if spec.worktree_path.is_some() {
            if let Err(message) = self.remove(&spec).await {
                warn!(spec_id = %spec_id, error = %message, "forced worktree delete had errors");
                // Metadata is cleared regardless so the Store matches disk.
                self.storage.clear_spec_worktree(spec_id).await?;
            }
        }
        Ok(())
    }

    /// Remove a worktree from disk and clear its Store metadata.
    async fn remove(&self, spec: &Spec) -> std::result::Result<(), String> {
        let Some(path) = spec.worktree_path.as_deref() else {
            return Ok(());
        };
        let worktree_path = Path::new(path);

        if worktree_path.exists() {
            let project = self
                .storage
                .get_project(&spec.project_id)
                .await
                .map_err(|e| format!("spec {}: {e}", spec.id))?;
            let project_dir = Path::new(&project.directory);

            if let Err(git_err) = git::remove_worktree(project_dir, worktree_path) {
                // Fall back to a plain filesystem removal before reporting.
                if std::fs::remove_dir_all(worktree_path).is_err() {
                    return Err(format!("spec {}: {git_err}", spec.id));
                }
            }
        }

        self.storage
            .clear_spec_worktree(&spec.id)
            .await
            .map_err(|e| format!("spec {}: {e}", spec.id))?;
        info!(spec_id = %spec.id, path = %path, "worktree removed");
        Ok(())
    }
}
