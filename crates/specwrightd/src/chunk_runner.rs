//! Per-chunk state machine: execute, review, optionally spawn a fix.
//!
//! The runner owns one chunk at a time. Tool calls are persisted as they
//! stream, review verdicts are persisted before their events are emitted,
//! and a `needs_fix` verdict creates a fix chunk for the caller to schedule.
//! Fix chunks themselves never spawn a second fix: the cascade is bounded at
//! depth one.

use chrono::Utc;
use specwright_core::review::RetryPolicy;
use specwright_core::{
    parse_verdict, Chunk, ChunkStatus, ChunkToolCall, Config, FixChunkSpec, Id, ReviewParsePolicy,
    ReviewStatus, ReviewVerdict, SessionPayload,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::gateway::{
    review_with_retry, reviewer_prompt, ExecutionStatus, ExecutorAgent, ReviewerAgent,
};
use crate::storage::Storage;

/// Receives session events in emission order. Implementations decide where
/// they go: a live SSE stream, worker progress rows, or a test buffer.
pub trait EventSink: Send + Sync {
    fn emit(&self, payload: SessionPayload);
}

/// Terminal outcome of running one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Passed review (or review bounded out); eligible for commit.
    Passed,
    /// Review requested a fix; the fix chunk is persisted and pending.
    FixSpawned { fix_chunk_id: Id },
    Failed { error: String },
    Cancelled,
}

/// Options for a single invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Set when running a fix chunk: a further `needs_fix` verdict is
    /// recorded but does not spawn another fix.
    pub suppress_fix: bool,
}

/// Runs one chunk through execute and review.
pub struct ChunkRunner {
    storage: Arc<Storage>,
    executor: Arc<dyn ExecutorAgent>,
    reviewer: Arc<dyn ReviewerAgent>,
    config: Config,
}

impl std::fmt::Debug for ChunkRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChunkRunner")
    }
}

impl ChunkRunner {
    pub fn new(
        storage: Arc<Storage>,
        executor: Arc<dyn ExecutorAgent>,
        reviewer: Arc<dyn ReviewerAgent>,
        config: Config,
    ) -> Self {
        Self {
            storage,
            executor,
            reviewer,
            config,
        }
    }

    /// Run `chunk` in `workdir`, emitting events to `sink`.
    ///
    /// The abort flag is checked at each agent boundary; an abort observed
    /// mid-chunk asks the executor to stop and reports `Cancelled`.
    pub async fn run(
        &self,
        chunk: &Chunk,
        workdir: &Path,
        sink: &dyn EventSink,
        abort: &AtomicBool,
        opts: RunOptions,
    ) -> crate::storage::Result<ChunkOutcome> {
        if abort.load(Ordering::SeqCst) {
            return Ok(ChunkOutcome::Cancelled);
        }

        self.storage.mark_chunk_running(&chunk.id).await?;
        sink.emit(SessionPayload::ChunkStart {
            chunk_id: chunk.id.clone(),
            title: chunk.title.clone(),
        });

        if let Err(e) = self.executor.start_execution(chunk, workdir).await {
            let message = format!("failed to start execution: {e}");
            return self.fail_chunk(chunk, message, sink).await;
        }

        // Tool calls persist as they arrive; the event follows the write.
        let (tx, mut rx) = mpsc::channel(64);
        let completion = self.executor.await_completion(&chunk.id, tx);
        let drain = async {
            while let Some(update) = rx.recv().await {
                let call = ChunkToolCall {
                    id: Id::new(),
                    chunk_id: chunk.id.clone(),
                    call_id: update.call_id.clone(),
                    tool: update.tool.clone(),
                    input: update.input.clone(),
                    output: update.output.clone(),
                    status: update.state,
                    started_at: Utc::now(),
                    completed_at: matches!(
                        update.state,
                        specwright_core::ToolCallStatus::Completed
                            | specwright_core::ToolCallStatus::Error
                    )
                    .then(Utc::now),
                };
                if let Err(e) = self.storage.upsert_tool_call(&call).await {
                    warn!(chunk_id = %chunk.id, error = %e, "failed to persist tool call");
                    continue;
                }
                sink.emit(SessionPayload::ToolCall {
                    chunk_id: chunk.id.clone(),
                    call_id: update.call_id,
                    tool: update.tool,
                    state: update.state,
                });
            }
        };
        let (completion, ()) = tokio::join!(completion, drain);

        let outcome = match completion {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = format!("execution failed: {e}");
                return self.fail_chunk(chunk, message, sink).await;
            }
        };

        match outcome.status {
            ExecutionStatus::Completed => {}
            ExecutionStatus::Cancelled => {
                self.storage.mark_chunk_cancelled(&chunk.id).await?;
                sink.emit(SessionPayload::ChunkComplete {
                    chunk_id: chunk.id.clone(),
                    status: ChunkStatus::Cancelled,
                });
                return Ok(ChunkOutcome::Cancelled);
            }
            ExecutionStatus::Failed | ExecutionStatus::Timeout => {
                // A failure after an abort request means the agent did not
                // cooperate; the chunk is cancelled, not failed.
                if abort.load(Ordering::SeqCst) {
                    self.storage.mark_chunk_cancelled(&chunk.id).await?;
                    sink.emit(SessionPayload::ChunkComplete {
                        chunk_id: chunk.id.clone(),
                        status: ChunkStatus::Cancelled,
                    });
                    return Ok(ChunkOutcome::Cancelled);
                }
                let message = outcome
                    .error
                    .unwrap_or_else(|| "execution failed".to_string());
                return self.fail_chunk(chunk, message, sink).await;
            }
        }

        let output = outcome.output;
        let summary = output.as_deref().map(summarize);
        self.storage
            .mark_chunk_completed(&chunk.id, output.as_deref(), summary.as_deref())
            .await?;
        sink.emit(SessionPayload::ChunkComplete {
            chunk_id: chunk.id.clone(),
            status: ChunkStatus::Completed,
        });

        if abort.load(Ordering::SeqCst) {
            let _ = self.executor.abort(&chunk.id).await;
            return Ok(ChunkOutcome::Cancelled);
        }

        self.review(chunk, output.as_deref(), workdir, sink, opts)
            .await
    }

    /// Persist the failure, then emit `chunk_complete(failed)` and `error`.
    async fn fail_chunk(
        &self,
        chunk: &Chunk,
        message: String,
        sink: &dyn EventSink,
    ) -> crate::storage::Result<ChunkOutcome> {
        self.storage.mark_chunk_failed(&chunk.id, &message).await?;
        sink.emit(SessionPayload::ChunkComplete {
            chunk_id: chunk.id.clone(),
            status: ChunkStatus::Failed,
        });
        sink.emit(SessionPayload::Error {
            chunk_id: Some(chunk.id.clone()),
            message: message.clone(),
        });
        Ok(ChunkOutcome::Failed { error: message })
    }

    async fn review(
        &self,
        chunk: &Chunk,
        execution_output: Option<&str>,
        workdir: &Path,
        sink: &dyn EventSink,
        opts: RunOptions,
    ) -> crate::storage::Result<ChunkOutcome> {
        sink.emit(SessionPayload::ReviewStart {
            chunk_id: chunk.id.clone(),
        });

        let policy = RetryPolicy {
            max_retries: self.config.review_retries,
            backoff_ms: self.config.review_retry_backoff_ms,
        };
        let prompt = reviewer_prompt(chunk, execution_output);
        let response =
            match review_with_retry(self.reviewer.as_ref(), chunk, &prompt, workdir, policy).await
            {
                Ok(response) => response,
                Err(e) => {
                    let message = format!("review failed ({}): {e}", e.kind().as_str());
                    self.storage.mark_chunk_failed(&chunk.id, &message).await?;
                    sink.emit(SessionPayload::Error {
                        chunk_id: Some(chunk.id.clone()),
                        message: message.clone(),
                    });
                    return Ok(ChunkOutcome::Failed { error: message });
                }
            };

        let verdict = match parse_verdict(&response.output) {
            Some(verdict) => verdict,
            None => match self.config.review_parse_failure {
                ReviewParsePolicy::Pass => ReviewVerdict {
                    status: ReviewStatus::Pass,
                    feedback: "parse failed".to_string(),
                    fix_chunk: None,
                },
                ReviewParsePolicy::NeedsFix => ReviewVerdict {
                    status: ReviewStatus::NeedsFix,
                    feedback: "parse failed".to_string(),
                    fix_chunk: Some(FixChunkSpec {
                        title: format!("Fix: {}", chunk.title),
                        description: format!(
                            "The review verdict for \"{}\" could not be parsed. \
                             Re-verify the work and address any problems found.",
                            chunk.title
                        ),
                    }),
                },
            },
        };

        self.storage
            .set_chunk_review(&chunk.id, verdict.status, Some(&verdict.feedback))
            .await?;
        sink.emit(SessionPayload::ReviewComplete {
            chunk_id: chunk.id.clone(),
            status: verdict.status,
            feedback: Some(verdict.feedback.clone()),
        });
        info!(
            chunk_id = %chunk.id,
            verdict = verdict.status.as_str(),
            duration_ms = response.duration_ms,
            "review complete"
        );

        match verdict.status {
            ReviewStatus::Pass => Ok(ChunkOutcome::Passed),
            ReviewStatus::Fail => {
                self.storage
                    .mark_chunk_failed(&chunk.id, &verdict.feedback)
                    .await?;
                Ok(ChunkOutcome::Failed {
                    error: verdict.feedback,
                })
            }
            ReviewStatus::NeedsFix => {
                if opts.suppress_fix {
                    // Depth-1 bound: record the verdict, keep the chunk
                    // completed, spawn nothing further.
                    info!(chunk_id = %chunk.id, "fix chunk reviewed needs_fix; bounding cascade");
                    return Ok(ChunkOutcome::Passed);
                }

                let fix = verdict.fix_chunk.unwrap_or_else(|| FixChunkSpec {
                    title: format!("Fix: {}", chunk.title),
                    description: verdict.feedback.clone(),
                });
                let fix_chunk = self
                    .storage
                    .insert_fix_chunk(&chunk.id, &fix.title, &fix.description)
                    .await?;
                sink.emit(SessionPayload::FixChunkCreated {
                    chunk_id: chunk.id.clone(),
                    fix_chunk_id: fix_chunk.id.clone(),
                    title: fix_chunk.title.clone(),
                });
                Ok(ChunkOutcome::FixSpawned {
                    fix_chunk_id: fix_chunk.id,
                })
            }
        }
    }
}

/// Short single-line summary of an execution output.
fn summarize(output: &str) -> String {
    let line = output.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut summary: String = line.chars().take(200).collect();
    if line.chars().count() > 200 {
        summary.push('…');
    }
    summary
}
