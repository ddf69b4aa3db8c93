//! Event payloads for session streams and the worker bus.
//!
//! Session events are emitted in the order the session observes them and are
//! serialized as internally-tagged JSON (`{"event": "...", ...}`) so SSE
//! consumers can dispatch on the tag without a second parse.

use crate::types::{ChunkStatus, Id, ReviewStatus, ToolCallStatus, WorkerProgress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One event in a run session's live stream.
///
/// `seq` is monotonically increasing within a session; a write to the Store
/// for the referenced chunk always lands before the event is observable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: SessionPayload,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        self.payload.name()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Session event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionPayload {
    ChunkStart {
        chunk_id: Id,
        title: String,
    },
    ToolCall {
        chunk_id: Id,
        call_id: String,
        tool: String,
        state: ToolCallStatus,
    },
    ChunkComplete {
        chunk_id: Id,
        status: ChunkStatus,
    },
    ReviewStart {
        chunk_id: Id,
    },
    ReviewComplete {
        chunk_id: Id,
        status: ReviewStatus,
        feedback: Option<String>,
    },
    FixChunkCreated {
        chunk_id: Id,
        fix_chunk_id: Id,
        title: String,
    },
    GitCommit {
        chunk_id: Id,
        hash: String,
        files_changed: u32,
    },
    /// Benign terminal: the chunk passed review but produced no file changes.
    GitCommitSkipped {
        chunk_id: Id,
    },
    WorktreeCreated {
        path: String,
        branch: String,
    },
    WorktreeReused {
        path: String,
    },
    /// Git operations degraded to no-ops for this session.
    GitDisabled {
        reason: String,
    },
    PrOpened {
        url: String,
        number: i64,
    },
    /// Push/PR failure after a successful run; does not retract chunk results.
    GitPushFailed {
        error: String,
    },
    Stopped {
        reason: String,
    },
    AllComplete {
        passed: u32,
        failed: u32,
        fixes: u32,
        pr_url: Option<String>,
    },
    Error {
        chunk_id: Option<Id>,
        message: String,
    },
}

impl SessionPayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChunkStart { .. } => "chunk_start",
            Self::ToolCall { .. } => "tool_call",
            Self::ChunkComplete { .. } => "chunk_complete",
            Self::ReviewStart { .. } => "review_start",
            Self::ReviewComplete { .. } => "review_complete",
            Self::FixChunkCreated { .. } => "fix_chunk_created",
            Self::GitCommit { .. } => "git_commit",
            Self::GitCommitSkipped { .. } => "git_commit_skipped",
            Self::WorktreeCreated { .. } => "worktree_created",
            Self::WorktreeReused { .. } => "worktree_reused",
            Self::GitDisabled { .. } => "git_disabled",
            Self::PrOpened { .. } => "pr_opened",
            Self::GitPushFailed { .. } => "git_push_failed",
            Self::Stopped { .. } => "stopped",
            Self::AllComplete { .. } => "all_complete",
            Self::Error { .. } => "error",
        }
    }

    /// The chunk this event concerns, when any.
    pub fn chunk_id(&self) -> Option<&Id> {
        match self {
            Self::ChunkStart { chunk_id, .. }
            | Self::ToolCall { chunk_id, .. }
            | Self::ChunkComplete { chunk_id, .. }
            | Self::ReviewStart { chunk_id }
            | Self::ReviewComplete { chunk_id, .. }
            | Self::FixChunkCreated { chunk_id, .. }
            | Self::GitCommit { chunk_id, .. }
            | Self::GitCommitSkipped { chunk_id } => Some(chunk_id),
            Self::Error { chunk_id, .. } => chunk_id.as_ref(),
            _ => None,
        }
    }
}

/// Events published on the worker bus (`workers` topic).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    WorkerStarted {
        worker_id: Id,
        spec_id: Id,
    },
    WorkerProgress {
        worker_id: Id,
        progress: WorkerProgress,
    },
    WorkerChunkStart {
        worker_id: Id,
        chunk_id: Id,
    },
    WorkerChunkComplete {
        worker_id: Id,
        chunk_id: Id,
        status: ChunkStatus,
    },
    WorkerReviewStart {
        worker_id: Id,
        chunk_id: Id,
    },
    WorkerReviewComplete {
        worker_id: Id,
        chunk_id: Id,
        status: ReviewStatus,
    },
    WorkerPaused {
        worker_id: Id,
    },
    WorkerResumed {
        worker_id: Id,
    },
    WorkerCompleted {
        worker_id: Id,
    },
    WorkerFailed {
        worker_id: Id,
        error: String,
    },
    WorkerStopped {
        worker_id: Id,
    },
    QueueUpdated,
}

impl WorkerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkerStarted { .. } => "worker_started",
            Self::WorkerProgress { .. } => "worker_progress",
            Self::WorkerChunkStart { .. } => "worker_chunk_start",
            Self::WorkerChunkComplete { .. } => "worker_chunk_complete",
            Self::WorkerReviewStart { .. } => "worker_review_start",
            Self::WorkerReviewComplete { .. } => "worker_review_complete",
            Self::WorkerPaused { .. } => "worker_paused",
            Self::WorkerResumed { .. } => "worker_resumed",
            Self::WorkerCompleted { .. } => "worker_completed",
            Self::WorkerFailed { .. } => "worker_failed",
            Self::WorkerStopped { .. } => "worker_stopped",
            Self::QueueUpdated => "queue_updated",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_event_serializes_with_tag() {
        let event = SessionEvent {
            seq: 3,
            timestamp: Utc::now(),
            payload: SessionPayload::ChunkStart {
                chunk_id: Id::from_string("c1"),
                title: "Add parser".to_string(),
            },
        };
        let json = event.to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["event"], "chunk_start");
        assert_eq!(parsed["chunk_id"], "c1");
        assert_eq!(parsed["seq"], 3);
    }

    #[test]
    fn session_payload_names_are_stable() {
        let payload = SessionPayload::AllComplete {
            passed: 2,
            failed: 0,
            fixes: 1,
            pr_url: Some("https://example.com/pr/7".to_string()),
        };
        assert_eq!(payload.name(), "all_complete");

        let payload = SessionPayload::GitCommitSkipped {
            chunk_id: Id::from_string("c2"),
        };
        assert_eq!(payload.name(), "git_commit_skipped");
    }

    #[test]
    fn chunk_id_accessor_covers_chunk_events() {
        let id = Id::from_string("c9");
        let payload = SessionPayload::ReviewComplete {
            chunk_id: id.clone(),
            status: ReviewStatus::Pass,
            feedback: None,
        };
        assert_eq!(payload.chunk_id(), Some(&id));

        let payload = SessionPayload::Stopped {
            reason: "Aborted by user".to_string(),
        };
        assert_eq!(payload.chunk_id(), None);
    }

    #[test]
    fn worker_event_round_trips() {
        let event = WorkerEvent::WorkerFailed {
            worker_id: Id::from_string("w1"),
            error: "Aborted by user".to_string(),
        };
        let json = event.to_json().unwrap();
        let back: WorkerEvent = serde_json::from_str(&json).unwrap();
        match back {
            WorkerEvent::WorkerFailed { worker_id, error } => {
                assert_eq!(worker_id.as_ref(), "w1");
                assert_eq!(error, "Aborted by user");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn worker_event_names_match_wire_contract() {
        assert_eq!(WorkerEvent::QueueUpdated.name(), "queue_updated");
        assert_eq!(
            WorkerEvent::WorkerStopped {
                worker_id: Id::from_string("w")
            }
            .name(),
            "worker_stopped"
        );
    }
}
