//! Uniform invocation of the external coding agents.
//!
//! Both agents are black boxes behind traits so the chunk runner and the
//! tests never care which transport is underneath: the Executor speaks a
//! local HTTP + SSE protocol, the Reviewer is a short-lived CLI subprocess.

pub mod executor;
pub mod reviewer;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

use async_trait::async_trait;
use specwright_core::review::{ReviewErrorKind, RetryPolicy};
use specwright_core::{classify_error, retry_with_backoff, Chunk, Id, ToolCallStatus};
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("executor protocol error: {0}")]
    Protocol(String),
    #[error("no active execution for chunk {0}")]
    NoSession(String),
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

#[derive(Debug, Error)]
pub enum ReviewerError {
    #[error("reviewer timed out after {0}s")]
    Timeout(u32),
    #[error("reviewer failed: {0}")]
    Agent(String),
    #[error("failed to run reviewer: {0}")]
    Io(#[from] std::io::Error),
}

impl ReviewerError {
    /// Classify for the retry policy; only `RateLimit` is retried.
    pub fn kind(&self) -> ReviewErrorKind {
        match self {
            Self::Timeout(_) => ReviewErrorKind::Timeout,
            Self::Agent(message) => classify_error(message),
            Self::Io(_) => ReviewErrorKind::Unknown,
        }
    }
}

/// A streamed Executor tool-call update. Updates sharing a `call_id` refer to
/// the same call moving through its states.
#[derive(Debug, Clone)]
pub struct ToolCallUpdate {
    pub call_id: String,
    pub tool: String,
    pub state: ToolCallStatus,
    pub input: Option<String>,
    pub output: Option<String>,
}

/// Terminal status of one chunk execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

/// Result of awaiting an execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Reviewer response before verdict parsing.
#[derive(Debug, Clone)]
pub struct ReviewResponse {
    pub output: String,
    pub cost: Option<f64>,
    pub duration_ms: u64,
}

/// Long-running coding agent, driven as start + await so cancellation can
/// interpose between the two.
#[async_trait]
pub trait ExecutorAgent: Send + Sync {
    /// Begin executing a chunk in the given working directory; returns the
    /// agent session id without blocking on completion.
    async fn start_execution(&self, chunk: &Chunk, workdir: &Path) -> ExecutorResult<String>;

    /// Wait for the execution started for `chunk_id`, forwarding tool-call
    /// updates as they stream.
    async fn await_completion(
        &self,
        chunk_id: &Id,
        tool_calls: mpsc::Sender<ToolCallUpdate>,
    ) -> ExecutorResult<ExecutionOutcome>;

    /// Ask the agent to abandon the execution for `chunk_id`.
    async fn abort(&self, chunk_id: &Id) -> ExecutorResult<()>;
}

/// Short synchronous review agent.
#[async_trait]
pub trait ReviewerAgent: Send + Sync {
    async fn review(
        &self,
        chunk: &Chunk,
        prompt: &str,
        workdir: &Path,
    ) -> std::result::Result<ReviewResponse, ReviewerError>;
}

/// Invoke the reviewer with the rate-limit retry policy applied.
pub async fn review_with_retry(
    reviewer: &dyn ReviewerAgent,
    chunk: &Chunk,
    prompt: &str,
    workdir: &Path,
    policy: RetryPolicy,
) -> std::result::Result<ReviewResponse, ReviewerError> {
    retry_with_backoff(
        || reviewer.review(chunk, prompt, workdir),
        policy,
        ReviewerError::kind,
    )
    .await
}

/// Prompt handed to the Executor for a chunk.
pub fn executor_prompt(chunk: &Chunk) -> String {
    format!(
        "Implement the following unit of work.\n\nTitle: {}\n\n{}",
        chunk.title, chunk.description
    )
}

/// Prompt handed to the Reviewer for a completed chunk.
///
/// The reviewer is asked for the one piece of structure the engine parses:
/// a JSON verdict with `status`, `feedback`, and an optional `fixChunk`.
pub fn reviewer_prompt(chunk: &Chunk, execution_output: Option<&str>) -> String {
    let mut prompt = format!(
        "Review the work done for this task against its description.\n\n\
         Title: {}\n\nDescription: {}\n",
        chunk.title, chunk.description
    );
    if let Some(output) = execution_output {
        prompt.push_str("\nImplementation notes from the coding agent:\n");
        prompt.push_str(output);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nRespond with a JSON object: {\"status\": \"pass\" | \"needs_fix\" | \"fail\", \
         \"feedback\": \"...\", \"fixChunk\": {\"title\": \"...\", \"description\": \"...\"}}. \
         Include fixChunk only when status is needs_fix.",
    );
    prompt
}
