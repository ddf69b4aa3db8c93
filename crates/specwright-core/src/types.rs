//! Core types for the chunk orchestration engine.
//!
//! Entities are owned top-down: a Project owns Specs, a Spec exclusively owns
//! its Chunks, ToolCalls, Worker, and QueueItem. Deleting a parent cascades.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for projects, specs, chunks, tool calls, and workers.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Spec lifecycle status.
///
/// Transitions run `draft -> ready -> running -> {review, completed} -> merged`,
/// reversible from `review` back to `running` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    Draft,
    Ready,
    Running,
    Review,
    Completed,
    Merged,
}

impl SpecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ready" => Self::Ready,
            "running" => Self::Running,
            "review" => Self::Review,
            "completed" => Self::Completed,
            "merged" => Self::Merged,
            _ => Self::Draft,
        }
    }
}

/// Chunk execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

/// Structured verdict from the Reviewer agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pass,
    NeedsFix,
    Fail,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::NeedsFix => "needs_fix",
            Self::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(Self::Pass),
            "needs_fix" => Some(Self::NeedsFix),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// Status of a single Executor tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Completed,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "error" => Self::Error,
            _ => Self::Running,
        }
    }
}

/// Worker lifecycle status.
///
/// At most `max_workers` workers have a status in {idle, running, paused}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Idle,
        }
    }

    /// Whether this worker occupies a pool slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Idle | Self::Running | Self::Paused)
    }
}

/// The step a worker is currently in for its current chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStep {
    Executing,
    Reviewing,
}

impl WorkerStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executing => "executing",
            Self::Reviewing => "reviewing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "executing" => Some(Self::Executing),
            "reviewing" => Some(Self::Reviewing),
            _ => None,
        }
    }
}

// --- Entities ---

/// Root of ownership: a local directory with specs under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Id,
    pub name: String,
    /// Absolute path to an existing local directory.
    pub directory: String,
    pub description: Option<String>,
    /// JSON-serialized partial `Config` overriding daemon defaults.
    pub config_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A natural-language specification plus its git bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    pub id: Id,
    pub project_id: Id,
    pub title: String,
    pub content: String,
    pub version: i64,
    pub status: SpecStatus,
    /// Branch carrying this spec's work. Valid ref name when set.
    pub branch_name: Option<String>,
    /// Branch checked out before the run started, restored on teardown
    /// when no worktree is in use.
    pub original_branch: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    /// Exists on disk iff set.
    pub worktree_path: Option<String>,
    pub worktree_created_at: Option<DateTime<Utc>>,
    pub worktree_last_activity: Option<DateTime<Utc>>,
    pub pr_merged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of work delegated to the Executor agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Id,
    pub spec_id: Id,
    pub title: String,
    pub description: String,
    /// Total order within the spec; user-visible tie-break only, never a
    /// scheduling constraint.
    pub order: i64,
    pub status: ChunkStatus,
    /// Ids of chunks in the same spec that must complete first. Acyclic.
    pub dependencies: Vec<Id>,
    pub output: Option<String>,
    pub output_summary: Option<String>,
    pub error: Option<String>,
    pub review_status: Option<ReviewStatus>,
    pub review_feedback: Option<String>,
    /// Hash of the commit recorded after this chunk passed review.
    pub commit_hash: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Chunk {
    /// A fix chunk's sole dependency is its parent.
    pub fn is_fix_of(&self, parent: &Id) -> bool {
        self.dependencies.len() == 1 && self.dependencies[0] == *parent
    }
}

/// One Executor tool invocation, append-only per execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkToolCall {
    pub id: Id,
    pub chunk_id: Id,
    /// Executor call id; duplicate ids update the same row in place.
    pub call_id: String,
    pub tool: String,
    pub input: Option<String>,
    pub output: Option<String>,
    pub status: ToolCallStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Chunk counters surfaced as worker progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProgress {
    pub current: i64,
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
}

/// A background slot running one spec headlessly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Id,
    pub spec_id: Id,
    pub project_id: Id,
    pub status: WorkerStatus,
    pub current_chunk_id: Option<Id>,
    pub current_step: Option<WorkerStep>,
    pub progress: WorkerProgress,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A spec waiting for a free worker slot.
///
/// Ordered by `(priority DESC, added_at ASC)`; removed on admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Id,
    pub spec_id: Id,
    pub project_id: Id,
    pub priority: i64,
    pub added_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn spec_status_round_trips() {
        for status in [
            SpecStatus::Draft,
            SpecStatus::Ready,
            SpecStatus::Running,
            SpecStatus::Review,
            SpecStatus::Completed,
            SpecStatus::Merged,
        ] {
            assert_eq!(SpecStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn chunk_status_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&ChunkStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&ChunkStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn review_status_parse_rejects_unknown() {
        assert_eq!(ReviewStatus::parse("pass"), Some(ReviewStatus::Pass));
        assert_eq!(
            ReviewStatus::parse("needs_fix"),
            Some(ReviewStatus::NeedsFix)
        );
        assert_eq!(ReviewStatus::parse("maybe"), None);
    }

    #[test]
    fn worker_status_active_covers_pool_slots() {
        assert!(WorkerStatus::Idle.is_active());
        assert!(WorkerStatus::Running.is_active());
        assert!(WorkerStatus::Paused.is_active());
        assert!(!WorkerStatus::Completed.is_active());
        assert!(!WorkerStatus::Failed.is_active());
    }

    #[test]
    fn fix_chunk_detection_requires_sole_parent_dependency() {
        let parent = Id::from_string("parent");
        let mut chunk = Chunk {
            id: Id::from_string("fix"),
            spec_id: Id::from_string("spec"),
            title: "fix".to_string(),
            description: String::new(),
            order: 2,
            status: ChunkStatus::Pending,
            dependencies: vec![parent.clone()],
            output: None,
            output_summary: None,
            error: None,
            review_status: None,
            review_feedback: None,
            commit_hash: None,
            started_at: None,
            completed_at: None,
        };
        assert!(chunk.is_fix_of(&parent));

        chunk.dependencies.push(Id::from_string("other"));
        assert!(!chunk.is_fix_of(&parent));
    }
}
