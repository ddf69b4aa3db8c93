//! SQLite storage for the orchestration engine.
//!
//! Single source of truth for projects, specs, chunks, tool calls, workers,
//! and the admission queue. Session state must be reconstructible from here
//! on restart; only abort flags are transient. All writes land before any
//! event referencing them is emitted.

use chrono::{DateTime, Utc};
use specwright_core::dag;
use specwright_core::{
    Chunk, ChunkStatus, ChunkToolCall, Id, Project, QueueItem, ReviewStatus, Spec, SpecStatus,
    ToolCallStatus, Worker, WorkerProgress, WorkerStatus, WorkerStep,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Explicit column lists so row mapping stays correct regardless of the
/// physical column order left behind by ALTER TABLE migrations.
const SPECS_COLUMNS: &str = "id, project_id, title, content, version, status, branch_name, \
    original_branch, pr_number, pr_url, worktree_path, worktree_created_at, \
    worktree_last_activity, pr_merged, created_at, updated_at";

const CHUNKS_COLUMNS: &str = "id, spec_id, title, description, sort_order, status, dependencies, \
    output, output_summary, error, review_status, review_feedback, commit_hash, \
    started_at, completed_at";

const WORKERS_COLUMNS: &str = "id, spec_id, project_id, status, current_chunk_id, current_step, \
    progress_current, progress_total, progress_passed, progress_failed, \
    started_at, completed_at, error";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("spec not found: {0}")]
    SpecNotFound(String),
    #[error("chunk not found: {0}")]
    ChunkNotFound(String),
    #[error("worker not found: {0}")]
    WorkerNotFound(String),
    #[error(transparent)]
    InvalidDependencies(#[from] dag::DagError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (creating if needed) the database at the given path.
    ///
    /// WAL keeps cross-spec reads non-blocking while writes serialize;
    /// foreign keys must be on for cascade deletes to fire.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations to initialize or update the schema.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    // --- Project operations ---

    pub async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, name, directory, description, config, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(project.id.as_ref())
        .bind(&project.name)
        .bind(&project.directory)
        .bind(&project.description)
        .bind(&project.config_json)
        .bind(project.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_project(&self, id: &Id) -> Result<Project> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, directory, description, config, created_at \
             FROM projects WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::ProjectNotFound(id.to_string()))?;
        Ok(row.into_project())
    }

    /// Delete a project and, via `ON DELETE CASCADE`, all of its specs,
    /// chunks, tool calls, workers, and queue entries.
    pub async fn delete_project(&self, id: &Id) -> Result<()> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ProjectNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Spec operations ---

    pub async fn insert_spec(&self, spec: &Spec) -> Result<()> {
        sqlx::query(
            "INSERT INTO specs (id, project_id, title, content, version, status, branch_name, \
             original_branch, pr_number, pr_url, worktree_path, worktree_created_at, \
             worktree_last_activity, pr_merged, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )
        .bind(spec.id.as_ref())
        .bind(spec.project_id.as_ref())
        .bind(&spec.title)
        .bind(&spec.content)
        .bind(spec.version)
        .bind(spec.status.as_str())
        .bind(&spec.branch_name)
        .bind(&spec.original_branch)
        .bind(spec.pr_number)
        .bind(&spec.pr_url)
        .bind(&spec.worktree_path)
        .bind(spec.worktree_created_at.map(|t| t.timestamp_millis()))
        .bind(spec.worktree_last_activity.map(|t| t.timestamp_millis()))
        .bind(i64::from(spec.pr_merged))
        .bind(spec.created_at.timestamp_millis())
        .bind(spec.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_spec(&self, id: &Id) -> Result<Spec> {
        let query = format!("SELECT {SPECS_COLUMNS} FROM specs WHERE id = ?1");
        let row = sqlx::query_as::<_, SpecRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::SpecNotFound(id.to_string()))?;
        Ok(row.into_spec())
    }

    pub async fn list_specs(&self, project_id: Option<&Id>) -> Result<Vec<Spec>> {
        let rows = match project_id {
            Some(pid) => {
                let query = format!(
                    "SELECT {SPECS_COLUMNS} FROM specs WHERE project_id = ?1 \
                     ORDER BY created_at ASC"
                );
                sqlx::query_as::<_, SpecRow>(&query)
                    .bind(pid.as_ref())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!("SELECT {SPECS_COLUMNS} FROM specs ORDER BY created_at ASC");
                sqlx::query_as::<_, SpecRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(SpecRow::into_spec).collect())
    }

    /// Specs with a recorded worktree, for janitor sweeps.
    pub async fn specs_with_worktrees(&self) -> Result<Vec<Spec>> {
        let query = format!(
            "SELECT {SPECS_COLUMNS} FROM specs WHERE worktree_path IS NOT NULL \
             ORDER BY worktree_last_activity ASC"
        );
        let rows = sqlx::query_as::<_, SpecRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(SpecRow::into_spec).collect())
    }

    pub async fn update_spec_status(&self, id: &Id, status: SpecStatus) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result =
            sqlx::query("UPDATE specs SET status = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(status.as_str())
                .bind(now)
                .bind(id.as_ref())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SpecNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_spec_branches(
        &self,
        id: &Id,
        branch_name: Option<&str>,
        original_branch: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE specs SET branch_name = ?1, original_branch = ?2, updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(branch_name)
        .bind(original_branch)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SpecNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_spec_pr(&self, id: &Id, pr_number: i64, pr_url: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE specs SET pr_number = ?1, pr_url = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(pr_number)
        .bind(pr_url)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SpecNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_spec_pr_merged(&self, id: &Id, merged: bool) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result =
            sqlx::query("UPDATE specs SET pr_merged = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(i64::from(merged))
                .bind(now)
                .bind(id.as_ref())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SpecNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_spec_worktree(&self, id: &Id, path: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE specs SET worktree_path = ?1, worktree_created_at = ?2, \
             worktree_last_activity = ?2, updated_at = ?2 WHERE id = ?3",
        )
        .bind(path)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SpecNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn touch_worktree_activity(&self, id: &Id) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE specs SET worktree_last_activity = ?1, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SpecNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn clear_spec_worktree(&self, id: &Id) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE specs SET worktree_path = NULL, worktree_created_at = NULL, \
             worktree_last_activity = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SpecNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete a spec; chunks, tool calls, workers, and queue entries cascade.
    pub async fn delete_spec(&self, id: &Id) -> Result<()> {
        let result = sqlx::query("DELETE FROM specs WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SpecNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Chunk operations ---

    pub async fn insert_chunk(&self, chunk: &Chunk) -> Result<()> {
        let dependencies = serde_json::to_string(&chunk.dependencies)?;
        sqlx::query(
            "INSERT INTO chunks (id, spec_id, title, description, sort_order, status, \
             dependencies, output, output_summary, error, review_status, review_feedback, \
             commit_hash, started_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )
        .bind(chunk.id.as_ref())
        .bind(chunk.spec_id.as_ref())
        .bind(&chunk.title)
        .bind(&chunk.description)
        .bind(chunk.order)
        .bind(chunk.status.as_str())
        .bind(&dependencies)
        .bind(&chunk.output)
        .bind(&chunk.output_summary)
        .bind(&chunk.error)
        .bind(chunk.review_status.map(|s| s.as_str()))
        .bind(&chunk.review_feedback)
        .bind(&chunk.commit_hash)
        .bind(chunk.started_at.map(|t| t.timestamp_millis()))
        .bind(chunk.completed_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_chunk(&self, id: &Id) -> Result<Chunk> {
        let query = format!("SELECT {CHUNKS_COLUMNS} FROM chunks WHERE id = ?1");
        let row = sqlx::query_as::<_, ChunkRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::ChunkNotFound(id.to_string()))?;
        row.into_chunk()
    }

    /// Chunks of a spec in `order` ascending.
    pub async fn chunks_by_spec(&self, spec_id: &Id) -> Result<Vec<Chunk>> {
        let query = format!(
            "SELECT {CHUNKS_COLUMNS} FROM chunks WHERE spec_id = ?1 \
             ORDER BY sort_order ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, ChunkRow>(&query)
            .bind(spec_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ChunkRow::into_chunk).collect()
    }

    /// Allocate a fix chunk depending solely on its parent, ordered just
    /// after it. Later chunks shift to keep the total order dense.
    pub async fn insert_fix_chunk(
        &self,
        parent_id: &Id,
        title: &str,
        description: &str,
    ) -> Result<Chunk> {
        let parent = self.get_chunk(parent_id).await?;
        let dependencies = vec![parent.id.clone()];
        let chunk = Chunk {
            id: Id::new(),
            spec_id: parent.spec_id.clone(),
            title: title.to_string(),
            description: description.to_string(),
            order: parent.order + 1,
            status: ChunkStatus::Pending,
            dependencies,
            output: None,
            output_summary: None,
            error: None,
            review_status: None,
            review_feedback: None,
            commit_hash: None,
            started_at: None,
            completed_at: None,
        };

        let deps_json = serde_json::to_string(&chunk.dependencies)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE chunks SET sort_order = sort_order + 1 \
             WHERE spec_id = ?1 AND sort_order > ?2",
        )
        .bind(parent.spec_id.as_ref())
        .bind(parent.order)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO chunks (id, spec_id, title, description, sort_order, status, \
             dependencies) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(chunk.id.as_ref())
        .bind(chunk.spec_id.as_ref())
        .bind(&chunk.title)
        .bind(&chunk.description)
        .bind(chunk.order)
        .bind(chunk.status.as_str())
        .bind(&deps_json)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(chunk)
    }

    pub async fn mark_chunk_running(&self, id: &Id) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE chunks SET status = 'running', started_at = ?1, error = NULL WHERE id = ?2",
        )
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ChunkNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn mark_chunk_completed(
        &self,
        id: &Id,
        output: Option<&str>,
        output_summary: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE chunks SET status = 'completed', output = ?1, output_summary = ?2, \
             completed_at = ?3 WHERE id = ?4",
        )
        .bind(output)
        .bind(output_summary)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ChunkNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn mark_chunk_failed(&self, id: &Id, error: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE chunks SET status = 'failed', error = ?1, completed_at = ?2 WHERE id = ?3",
        )
        .bind(error)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ChunkNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn mark_chunk_cancelled(&self, id: &Id) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE chunks SET status = 'cancelled', completed_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ChunkNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_chunk_review(
        &self,
        id: &Id,
        status: ReviewStatus,
        feedback: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE chunks SET review_status = ?1, review_feedback = ?2 WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(feedback)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ChunkNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_chunk_commit(&self, id: &Id, hash: &str) -> Result<()> {
        let result = sqlx::query("UPDATE chunks SET commit_hash = ?1 WHERE id = ?2")
            .bind(hash)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ChunkNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Replace a chunk's dependency list, rejecting cycles and references
    /// outside the spec before anything is written.
    pub async fn update_chunk_dependencies(&self, id: &Id, dependencies: &[Id]) -> Result<()> {
        let chunk = self.get_chunk(id).await?;
        let snapshot = self.chunks_by_spec(&chunk.spec_id).await?;
        dag::validate_dependencies(&snapshot, id, dependencies)?;

        let deps_json = serde_json::to_string(dependencies)?;
        sqlx::query("UPDATE chunks SET dependencies = ?1 WHERE id = ?2")
            .bind(&deps_json)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a new chunk order: listed ids first in the given sequence,
    /// unlisted chunks keep their relative order after them.
    pub async fn reorder_chunks(&self, spec_id: &Id, ids: &[Id]) -> Result<()> {
        let current = self.chunks_by_spec(spec_id).await?;
        let sequence = reorder_sequence(current.iter().map(|c| c.id.clone()), ids);

        let mut tx = self.pool.begin().await?;
        for (index, id) in sequence.iter().enumerate() {
            sqlx::query("UPDATE chunks SET sort_order = ?1 WHERE id = ?2 AND spec_id = ?3")
                .bind(index as i64)
                .bind(id.as_ref())
                .bind(spec_id.as_ref())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // --- Tool call operations ---

    /// Insert or update a tool call; the Executor's `call_id` dedupes
    /// in-place updates as the call streams through its states.
    pub async fn upsert_tool_call(&self, call: &ChunkToolCall) -> Result<()> {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM chunk_tool_calls WHERE chunk_id = ?1 AND call_id = ?2",
        )
        .bind(call.chunk_id.as_ref())
        .bind(&call.call_id)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some((row_id,)) => {
                sqlx::query(
                    "UPDATE chunk_tool_calls SET tool = ?1, input = ?2, output = ?3, \
                     status = ?4, completed_at = ?5 WHERE id = ?6",
                )
                .bind(&call.tool)
                .bind(&call.input)
                .bind(&call.output)
                .bind(call.status.as_str())
                .bind(call.completed_at.map(|t| t.timestamp_millis()))
                .bind(&row_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO chunk_tool_calls (id, chunk_id, call_id, tool, input, output, \
                     status, started_at, completed_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )
                .bind(call.id.as_ref())
                .bind(call.chunk_id.as_ref())
                .bind(&call.call_id)
                .bind(&call.tool)
                .bind(&call.input)
                .bind(&call.output)
                .bind(call.status.as_str())
                .bind(call.started_at.timestamp_millis())
                .bind(call.completed_at.map(|t| t.timestamp_millis()))
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn tool_calls_by_chunk(&self, chunk_id: &Id) -> Result<Vec<ChunkToolCall>> {
        let rows = sqlx::query_as::<_, ToolCallRow>(
            "SELECT id, chunk_id, call_id, tool, input, output, status, started_at, \
             completed_at FROM chunk_tool_calls WHERE chunk_id = ?1 ORDER BY started_at ASC",
        )
        .bind(chunk_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ToolCallRow::into_tool_call).collect())
    }

    // --- Worker operations ---

    pub async fn insert_worker(&self, worker: &Worker) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (id, spec_id, project_id, status, current_chunk_id, \
             current_step, progress_current, progress_total, progress_passed, \
             progress_failed, started_at, completed_at, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(worker.id.as_ref())
        .bind(worker.spec_id.as_ref())
        .bind(worker.project_id.as_ref())
        .bind(worker.status.as_str())
        .bind(worker.current_chunk_id.as_ref().map(|id| id.as_ref()))
        .bind(worker.current_step.map(|s| s.as_str()))
        .bind(worker.progress.current)
        .bind(worker.progress.total)
        .bind(worker.progress.passed)
        .bind(worker.progress.failed)
        .bind(worker.started_at.map(|t| t.timestamp_millis()))
        .bind(worker.completed_at.map(|t| t.timestamp_millis()))
        .bind(&worker.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_worker(&self, id: &Id) -> Result<Worker> {
        let query = format!("SELECT {WORKERS_COLUMNS} FROM workers WHERE id = ?1");
        let row = sqlx::query_as::<_, WorkerRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::WorkerNotFound(id.to_string()))?;
        Ok(row.into_worker())
    }

    /// Workers currently occupying pool slots (idle, running, or paused).
    pub async fn active_workers(&self) -> Result<Vec<Worker>> {
        let query = format!(
            "SELECT {WORKERS_COLUMNS} FROM workers \
             WHERE status IN ('idle', 'running', 'paused') ORDER BY started_at ASC"
        );
        let rows = sqlx::query_as::<_, WorkerRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(WorkerRow::into_worker).collect())
    }

    pub async fn count_active_workers(&self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM workers WHERE status IN ('idle', 'running', 'paused')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as usize)
    }

    pub async fn set_worker_status(&self, id: &Id, status: WorkerStatus) -> Result<()> {
        let result = sqlx::query("UPDATE workers SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::WorkerNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_worker_chunk(
        &self,
        id: &Id,
        chunk_id: Option<&Id>,
        step: Option<WorkerStep>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workers SET current_chunk_id = ?1, current_step = ?2 WHERE id = ?3",
        )
        .bind(chunk_id.map(|c| c.as_ref()))
        .bind(step.map(|s| s.as_str()))
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::WorkerNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_worker_progress(&self, id: &Id, progress: WorkerProgress) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workers SET progress_current = ?1, progress_total = ?2, \
             progress_passed = ?3, progress_failed = ?4 WHERE id = ?5",
        )
        .bind(progress.current)
        .bind(progress.total)
        .bind(progress.passed)
        .bind(progress.failed)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::WorkerNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn finish_worker(
        &self,
        id: &Id,
        status: WorkerStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE workers SET status = ?1, error = ?2, completed_at = ?3, \
             current_chunk_id = NULL, current_step = NULL WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::WorkerNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Crash recovery: every worker still holding a slot is marked failed.
    pub async fn fail_active_workers(&self, reason: &str) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE workers SET status = 'failed', error = ?1, completed_at = ?2 \
             WHERE status IN ('idle', 'running', 'paused')",
        )
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Crash recovery: specs left `running` drop back to `review`.
    pub async fn reset_running_specs(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE specs SET status = 'review', updated_at = ?1 WHERE status = 'running'",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // --- Queue operations ---

    pub async fn enqueue(&self, item: &QueueItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO worker_queue (id, spec_id, project_id, priority, added_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(item.id.as_ref())
        .bind(item.spec_id.as_ref())
        .bind(item.project_id.as_ref())
        .bind(item.priority)
        .bind(item.added_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Queue snapshot in admission order.
    pub async fn queue_items(&self) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query_as::<_, QueueRow>(
            "SELECT id, spec_id, project_id, priority, added_at FROM worker_queue \
             ORDER BY priority DESC, added_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(QueueRow::into_item).collect())
    }

    /// Remove and return the next admissible item, if any.
    pub async fn dequeue_next(&self) -> Result<Option<QueueItem>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, QueueRow>(
            "SELECT id, spec_id, project_id, priority, added_at FROM worker_queue \
             ORDER BY priority DESC, added_at ASC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM worker_queue WHERE id = ?1")
            .bind(&row.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(row.into_item()))
    }

    pub async fn remove_from_queue(&self, spec_id: &Id) -> Result<u64> {
        let result = sqlx::query("DELETE FROM worker_queue WHERE spec_id = ?1")
            .bind(spec_id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Reassign priorities so the given order is preserved; items not listed
    /// retain their relative order after the listed ones.
    pub async fn reorder_queue(&self, ids: &[Id]) -> Result<()> {
        let current = self.queue_items().await?;
        let sequence = reorder_sequence(current.iter().map(|i| i.id.clone()), ids);
        let total = sequence.len() as i64;

        let mut tx = self.pool.begin().await?;
        for (index, id) in sequence.iter().enumerate() {
            sqlx::query("UPDATE worker_queue SET priority = ?1 WHERE id = ?2")
                .bind(total - index as i64)
                .bind(id.as_ref())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

}

#[cfg(test)]
impl Storage {
    /// Test-only: rewrite a spec's worktree activity timestamp.
    pub(crate) async fn backdate_worktree_activity(
        &self,
        id: &Id,
        timestamp_millis: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE specs SET worktree_last_activity = ?1 WHERE id = ?2")
            .bind(timestamp_millis)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Listed ids first (in the given order, unknown ids dropped), then the
/// remaining ids in their current relative order.
fn reorder_sequence(current: impl Iterator<Item = Id>, listed: &[Id]) -> Vec<Id> {
    let current: Vec<Id> = current.collect();
    let mut out: Vec<Id> = listed
        .iter()
        .filter(|id| current.contains(id))
        .cloned()
        .collect();
    for id in current {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    name: String,
    directory: String,
    description: Option<String>,
    config: Option<String>,
    created_at: i64,
}

impl ProjectRow {
    fn into_project(self) -> Project {
        Project {
            id: Id::from_string(self.id),
            name: self.name,
            directory: self.directory,
            description: self.description,
            config_json: self.config,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SpecRow {
    id: String,
    project_id: String,
    title: String,
    content: String,
    version: i64,
    status: String,
    branch_name: Option<String>,
    original_branch: Option<String>,
    pr_number: Option<i64>,
    pr_url: Option<String>,
    worktree_path: Option<String>,
    worktree_created_at: Option<i64>,
    worktree_last_activity: Option<i64>,
    pr_merged: i64,
    created_at: i64,
    updated_at: i64,
}

impl SpecRow {
    fn into_spec(self) -> Spec {
        Spec {
            id: Id::from_string(self.id),
            project_id: Id::from_string(self.project_id),
            title: self.title,
            content: self.content,
            version: self.version,
            status: SpecStatus::parse(&self.status),
            branch_name: self.branch_name,
            original_branch: self.original_branch,
            pr_number: self.pr_number,
            pr_url: self.pr_url,
            worktree_path: self.worktree_path,
            worktree_created_at: self
                .worktree_created_at
                .and_then(DateTime::from_timestamp_millis),
            worktree_last_activity: self
                .worktree_last_activity
                .and_then(DateTime::from_timestamp_millis),
            pr_merged: self.pr_merged != 0,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    id: String,
    spec_id: String,
    title: String,
    description: String,
    sort_order: i64,
    status: String,
    dependencies: String,
    output: Option<String>,
    output_summary: Option<String>,
    error: Option<String>,
    review_status: Option<String>,
    review_feedback: Option<String>,
    commit_hash: Option<String>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl ChunkRow {
    fn into_chunk(self) -> Result<Chunk> {
        let dependencies: Vec<Id> = serde_json::from_str(&self.dependencies)?;
        Ok(Chunk {
            id: Id::from_string(self.id),
            spec_id: Id::from_string(self.spec_id),
            title: self.title,
            description: self.description,
            order: self.sort_order,
            status: ChunkStatus::parse(&self.status),
            dependencies,
            output: self.output,
            output_summary: self.output_summary,
            error: self.error,
            review_status: self.review_status.as_deref().and_then(ReviewStatus::parse),
            review_feedback: self.review_feedback,
            commit_hash: self.commit_hash,
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            completed_at: self.completed_at.and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ToolCallRow {
    id: String,
    chunk_id: String,
    call_id: String,
    tool: String,
    input: Option<String>,
    output: Option<String>,
    status: String,
    started_at: i64,
    completed_at: Option<i64>,
}

impl ToolCallRow {
    fn into_tool_call(self) -> ChunkToolCall {
        ChunkToolCall {
            id: Id::from_string(self.id),
            chunk_id: Id::from_string(self.chunk_id),
            call_id: self.call_id,
            tool: self.tool,
            input: self.input,
            output: self.output,
            status: ToolCallStatus::parse(&self.status),
            started_at: DateTime::from_timestamp_millis(self.started_at).unwrap_or_default(),
            completed_at: self.completed_at.and_then(DateTime::from_timestamp_millis),
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: String,
    spec_id: String,
    project_id: String,
    status: String,
    current_chunk_id: Option<String>,
    current_step: Option<String>,
    progress_current: i64,
    progress_total: i64,
    progress_passed: i64,
    progress_failed: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl WorkerRow {
    fn into_worker(self) -> Worker {
        Worker {
            id: Id::from_string(self.id),
            spec_id: Id::from_string(self.spec_id),
            project_id: Id::from_string(self.project_id),
            status: WorkerStatus::parse(&self.status),
            current_chunk_id: self.current_chunk_id.map(Id::from_string),
            current_step: self.current_step.as_deref().and_then(WorkerStep::parse),
            progress: WorkerProgress {
                current: self.progress_current,
                total: self.progress_total,
                passed: self.progress_passed,
                failed: self.progress_failed,
            },
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            completed_at: self.completed_at.and_then(DateTime::from_timestamp_millis),
            error: self.error,
        }
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    spec_id: String,
    project_id: String,
    priority: i64,
    added_at: i64,
}

impl QueueRow {
    fn into_item(self) -> QueueItem {
        QueueItem {
            id: Id::from_string(self.id),
            spec_id: Id::from_string(self.spec_id),
            project_id: Id::from_string(self.project_id),
            priority: self.priority,
            added_at: DateTime::from_timestamp_millis(self.added_at).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) struct TestStorage {
        pub storage: std::sync::Arc<Storage>,
        _dir: TempDir, // Keep alive to prevent cleanup
    }

    pub(crate) async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate().await.unwrap();
        TestStorage {
            storage: std::sync::Arc::new(storage),
            _dir: dir,
        }
    }

    pub(crate) fn test_project(id: &str) -> Project {
        Project {
            id: Id::from_string(id),
            name: format!("project-{id}"),
            directory: "/tmp/project".to_string(),
            description: None,
            config_json: None,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn test_spec(id: &str, project_id: &str) -> Spec {
        let now = Utc::now();
        Spec {
            id: Id::from_string(id),
            project_id: Id::from_string(project_id),
            title: format!("spec-{id}"),
            content: "Build the thing".to_string(),
            version: 1,
            status: SpecStatus::Ready,
            branch_name: None,
            original_branch: None,
            pr_number: None,
            pr_url: None,
            worktree_path: None,
            worktree_created_at: None,
            worktree_last_activity: None,
            pr_merged: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn test_chunk(id: &str, spec_id: &str, order: i64, deps: &[&str]) -> Chunk {
        Chunk {
            id: Id::from_string(id),
            spec_id: Id::from_string(spec_id),
            title: format!("chunk-{id}"),
            description: String::new(),
            order,
            status: ChunkStatus::Pending,
            dependencies: deps.iter().map(|d| Id::from_string(*d)).collect(),
            output: None,
            output_summary: None,
            error: None,
            review_status: None,
            review_feedback: None,
            commit_hash: None,
            started_at: None,
            completed_at: None,
        }
    }

    async fn seed_spec(ts: &TestStorage) -> (Id, Id) {
        let project = test_project("p1");
        let spec = test_spec("s1", "p1");
        ts.storage.insert_project(&project).await.unwrap();
        ts.storage.insert_spec(&spec).await.unwrap();
        (project.id, spec.id)
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate().await.unwrap();
        storage.migrate().await.unwrap();

        storage.insert_project(&test_project("p1")).await.unwrap();
        let project = storage.get_project(&Id::from_string("p1")).await.unwrap();
        assert_eq!(project.name, "project-p1");
    }

    #[tokio::test]
    async fn spec_round_trips_all_fields() {
        let ts = create_test_storage().await;
        let (_, spec_id) = seed_spec(&ts).await;

        ts.storage
            .update_spec_branches(&spec_id, Some("spec/s1"), Some("main"))
            .await
            .unwrap();
        ts.storage
            .update_spec_pr(&spec_id, 42, "https://example.com/pr/42")
            .await
            .unwrap();
        ts.storage
            .update_spec_worktree(&spec_id, "/tmp/wt")
            .await
            .unwrap();
        ts.storage.set_spec_pr_merged(&spec_id, true).await.unwrap();

        let spec = ts.storage.get_spec(&spec_id).await.unwrap();
        assert_eq!(spec.branch_name.as_deref(), Some("spec/s1"));
        assert_eq!(spec.original_branch.as_deref(), Some("main"));
        assert_eq!(spec.pr_number, Some(42));
        assert_eq!(spec.worktree_path.as_deref(), Some("/tmp/wt"));
        assert!(spec.worktree_created_at.is_some());
        assert!(spec.pr_merged);
    }

    #[tokio::test]
    async fn chunks_by_spec_returns_order_ascending() {
        let ts = create_test_storage().await;
        let (_, spec_id) = seed_spec(&ts).await;

        for (id, order) in [("c2", 2), ("c1", 1), ("c3", 3)] {
            ts.storage
                .insert_chunk(&test_chunk(id, "s1", order, &[]))
                .await
                .unwrap();
        }

        let chunks = ts.storage.chunks_by_spec(&spec_id).await.unwrap();
        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_ref()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn insert_fix_chunk_orders_after_parent_and_shifts_rest() {
        let ts = create_test_storage().await;
        let (_, spec_id) = seed_spec(&ts).await;

        ts.storage
            .insert_chunk(&test_chunk("a", "s1", 0, &[]))
            .await
            .unwrap();
        ts.storage
            .insert_chunk(&test_chunk("b", "s1", 1, &["a"]))
            .await
            .unwrap();

        let fix = ts
            .storage
            .insert_fix_chunk(&Id::from_string("a"), "Fix a", "address review feedback")
            .await
            .unwrap();
        assert_eq!(fix.dependencies, vec![Id::from_string("a")]);
        assert_eq!(fix.status, ChunkStatus::Pending);

        let chunks = ts.storage.chunks_by_spec(&spec_id).await.unwrap();
        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_ref()).collect();
        assert_eq!(ids, vec!["a", fix.id.as_ref(), "b"]);
        assert_eq!(chunks[1].order, 1);
        assert_eq!(chunks[2].order, 2, "b shifted past the fix chunk");
    }

    #[tokio::test]
    async fn chunk_status_transitions_persist() {
        let ts = create_test_storage().await;
        seed_spec(&ts).await;
        let chunk = test_chunk("c1", "s1", 0, &[]);
        ts.storage.insert_chunk(&chunk).await.unwrap();

        ts.storage.mark_chunk_running(&chunk.id).await.unwrap();
        let running = ts.storage.get_chunk(&chunk.id).await.unwrap();
        assert_eq!(running.status, ChunkStatus::Running);
        assert!(running.started_at.is_some());

        ts.storage
            .mark_chunk_completed(&chunk.id, Some("did the work"), Some("summary"))
            .await
            .unwrap();
        ts.storage
            .set_chunk_review(&chunk.id, ReviewStatus::Pass, Some("lgtm"))
            .await
            .unwrap();
        ts.storage
            .set_chunk_commit(&chunk.id, "abc123")
            .await
            .unwrap();

        let done = ts.storage.get_chunk(&chunk.id).await.unwrap();
        assert_eq!(done.status, ChunkStatus::Completed);
        assert_eq!(done.output.as_deref(), Some("did the work"));
        assert_eq!(done.review_status, Some(ReviewStatus::Pass));
        assert_eq!(done.review_feedback.as_deref(), Some("lgtm"));
        assert_eq!(done.commit_hash.as_deref(), Some("abc123"));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn update_dependencies_rejects_cycle_and_leaves_store_unchanged() {
        let ts = create_test_storage().await;
        seed_spec(&ts).await;
        ts.storage
            .insert_chunk(&test_chunk("a", "s1", 0, &[]))
            .await
            .unwrap();
        ts.storage
            .insert_chunk(&test_chunk("b", "s1", 1, &["a"]))
            .await
            .unwrap();

        let err = ts
            .storage
            .update_chunk_dependencies(&Id::from_string("a"), &[Id::from_string("b")])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidDependencies(_)));

        let a = ts.storage.get_chunk(&Id::from_string("a")).await.unwrap();
        assert!(a.dependencies.is_empty(), "rejected write must not land");
    }

    #[tokio::test]
    async fn update_dependencies_accepts_valid_graph() {
        let ts = create_test_storage().await;
        seed_spec(&ts).await;
        ts.storage
            .insert_chunk(&test_chunk("a", "s1", 0, &[]))
            .await
            .unwrap();
        ts.storage
            .insert_chunk(&test_chunk("b", "s1", 1, &[]))
            .await
            .unwrap();

        ts.storage
            .update_chunk_dependencies(&Id::from_string("b"), &[Id::from_string("a")])
            .await
            .unwrap();
        let b = ts.storage.get_chunk(&Id::from_string("b")).await.unwrap();
        assert_eq!(b.dependencies, vec![Id::from_string("a")]);
    }

    #[tokio::test]
    async fn reorder_chunks_preserves_unlisted_relative_order() {
        let ts = create_test_storage().await;
        let (_, spec_id) = seed_spec(&ts).await;
        for (id, order) in [("a", 0), ("b", 1), ("c", 2), ("d", 3)] {
            ts.storage
                .insert_chunk(&test_chunk(id, "s1", order, &[]))
                .await
                .unwrap();
        }

        ts.storage
            .reorder_chunks(&spec_id, &[Id::from_string("c"), Id::from_string("a")])
            .await
            .unwrap();
        let chunks = ts.storage.chunks_by_spec(&spec_id).await.unwrap();
        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_ref()).collect();
        assert_eq!(ids, vec!["c", "a", "b", "d"]);
    }

    #[tokio::test]
    async fn tool_call_upsert_updates_in_place_by_call_id() {
        let ts = create_test_storage().await;
        seed_spec(&ts).await;
        ts.storage
            .insert_chunk(&test_chunk("c1", "s1", 0, &[]))
            .await
            .unwrap();

        let mut call = ChunkToolCall {
            id: Id::new(),
            chunk_id: Id::from_string("c1"),
            call_id: "call-1".to_string(),
            tool: "bash".to_string(),
            input: Some("{\"command\": \"ls\"}".to_string()),
            output: None,
            status: ToolCallStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
        };
        ts.storage.upsert_tool_call(&call).await.unwrap();

        call.status = ToolCallStatus::Completed;
        call.output = Some("src".to_string());
        call.completed_at = Some(Utc::now());
        ts.storage.upsert_tool_call(&call).await.unwrap();

        let calls = ts
            .storage
            .tool_calls_by_chunk(&Id::from_string("c1"))
            .await
            .unwrap();
        assert_eq!(calls.len(), 1, "duplicate call ids update in place");
        assert_eq!(calls[0].status, ToolCallStatus::Completed);
        assert_eq!(calls[0].output.as_deref(), Some("src"));
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_age() {
        let ts = create_test_storage().await;
        let (project_id, spec_id) = seed_spec(&ts).await;
        let spec2 = test_spec("s2", "p1");
        let spec3 = test_spec("s3", "p1");
        ts.storage.insert_spec(&spec2).await.unwrap();
        ts.storage.insert_spec(&spec3).await.unwrap();

        let base = Utc::now();
        for (id, spec, priority, offset) in [
            ("q1", &spec_id, 0, 0),
            ("q2", &spec2.id, 5, 1),
            ("q3", &spec3.id, 0, 2),
        ] {
            ts.storage
                .enqueue(&QueueItem {
                    id: Id::from_string(id),
                    spec_id: spec.clone(),
                    project_id: project_id.clone(),
                    priority,
                    added_at: base + chrono::Duration::seconds(offset),
                })
                .await
                .unwrap();
        }

        let items = ts.storage.queue_items().await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_ref()).collect();
        assert_eq!(ids, vec!["q2", "q1", "q3"]);

        let next = ts.storage.dequeue_next().await.unwrap().unwrap();
        assert_eq!(next.id.as_ref(), "q2");
        assert_eq!(ts.storage.queue_items().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reorder_queue_applies_given_order() {
        let ts = create_test_storage().await;
        let (project_id, spec_id) = seed_spec(&ts).await;
        let spec2 = test_spec("s2", "p1");
        ts.storage.insert_spec(&spec2).await.unwrap();

        let base = Utc::now();
        for (id, spec, offset) in [("q1", &spec_id, 0), ("q2", &spec2.id, 1)] {
            ts.storage
                .enqueue(&QueueItem {
                    id: Id::from_string(id),
                    spec_id: spec.clone(),
                    project_id: project_id.clone(),
                    priority: 0,
                    added_at: base + chrono::Duration::seconds(offset),
                })
                .await
                .unwrap();
        }

        ts.storage
            .reorder_queue(&[Id::from_string("q2"), Id::from_string("q1")])
            .await
            .unwrap();
        let items = ts.storage.queue_items().await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_ref()).collect();
        assert_eq!(ids, vec!["q2", "q1"]);
    }

    #[tokio::test]
    async fn delete_project_cascades_to_all_children() {
        let ts = create_test_storage().await;
        let (project_id, spec_id) = seed_spec(&ts).await;
        ts.storage
            .insert_chunk(&test_chunk("c1", "s1", 0, &[]))
            .await
            .unwrap();
        ts.storage
            .upsert_tool_call(&ChunkToolCall {
                id: Id::new(),
                chunk_id: Id::from_string("c1"),
                call_id: "call-1".to_string(),
                tool: "bash".to_string(),
                input: None,
                output: None,
                status: ToolCallStatus::Running,
                started_at: Utc::now(),
                completed_at: None,
            })
            .await
            .unwrap();
        ts.storage
            .insert_worker(&Worker {
                id: Id::from_string("w1"),
                spec_id: spec_id.clone(),
                project_id: project_id.clone(),
                status: WorkerStatus::Running,
                current_chunk_id: None,
                current_step: None,
                progress: WorkerProgress::default(),
                started_at: Some(Utc::now()),
                completed_at: None,
                error: None,
            })
            .await
            .unwrap();
        ts.storage
            .enqueue(&QueueItem {
                id: Id::from_string("q1"),
                spec_id: spec_id.clone(),
                project_id: project_id.clone(),
                priority: 0,
                added_at: Utc::now(),
            })
            .await
            .unwrap();

        ts.storage.delete_project(&project_id).await.unwrap();

        assert!(matches!(
            ts.storage.get_spec(&spec_id).await,
            Err(StorageError::SpecNotFound(_))
        ));
        assert!(matches!(
            ts.storage.get_chunk(&Id::from_string("c1")).await,
            Err(StorageError::ChunkNotFound(_))
        ));
        assert!(matches!(
            ts.storage.get_worker(&Id::from_string("w1")).await,
            Err(StorageError::WorkerNotFound(_))
        ));
        assert!(ts.storage.queue_items().await.unwrap().is_empty());
        assert!(ts
            .storage
            .tool_calls_by_chunk(&Id::from_string("c1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn active_worker_accounting() {
        let ts = create_test_storage().await;
        let (project_id, spec_id) = seed_spec(&ts).await;
        let spec2 = test_spec("s2", "p1");
        ts.storage.insert_spec(&spec2).await.unwrap();

        for (id, spec, status) in [
            ("w1", &spec_id, WorkerStatus::Running),
            ("w2", &spec2.id, WorkerStatus::Paused),
        ] {
            ts.storage
                .insert_worker(&Worker {
                    id: Id::from_string(id),
                    spec_id: spec.clone(),
                    project_id: project_id.clone(),
                    status,
                    current_chunk_id: None,
                    current_step: None,
                    progress: WorkerProgress::default(),
                    started_at: Some(Utc::now()),
                    completed_at: None,
                    error: None,
                })
                .await
                .unwrap();
        }

        assert_eq!(ts.storage.count_active_workers().await.unwrap(), 2);

        ts.storage
            .finish_worker(&Id::from_string("w1"), WorkerStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(ts.storage.count_active_workers().await.unwrap(), 1);

        let failed = ts.storage.fail_active_workers("daemon restart").await.unwrap();
        assert_eq!(failed, 1);
        let w2 = ts.storage.get_worker(&Id::from_string("w2")).await.unwrap();
        assert_eq!(w2.status, WorkerStatus::Failed);
        assert_eq!(w2.error.as_deref(), Some("daemon restart"));
    }

    #[tokio::test]
    async fn reset_running_specs_moves_to_review() {
        let ts = create_test_storage().await;
        let (_, spec_id) = seed_spec(&ts).await;
        ts.storage
            .update_spec_status(&spec_id, SpecStatus::Running)
            .await
            .unwrap();

        let reset = ts.storage.reset_running_specs().await.unwrap();
        assert_eq!(reset, 1);
        let spec = ts.storage.get_spec(&spec_id).await.unwrap();
        assert_eq!(spec.status, SpecStatus::Review);
    }

    #[tokio::test]
    async fn get_missing_rows_report_not_found() {
        let ts = create_test_storage().await;
        let missing = Id::from_string("missing");
        assert!(matches!(
            ts.storage.get_project(&missing).await,
            Err(StorageError::ProjectNotFound(_))
        ));
        assert!(matches!(
            ts.storage.get_spec(&missing).await,
            Err(StorageError::SpecNotFound(_))
        ));
        assert!(matches!(
            ts.storage.get_chunk(&missing).await,
            Err(StorageError::ChunkNotFound(_))
        ));
        assert!(matches!(
            ts.storage.get_worker(&missing).await,
            Err(StorageError::WorkerNotFound(_))
        ));
    }
}
