//! Scripted agent doubles for tests.
//!
//! The chunk runner and session tests drive these instead of live agents:
//! executions resolve instantly with scripted outcomes keyed by chunk title,
//! reviews pop a scripted queue (falling back to `pass`).

use async_trait::async_trait;
use specwright_core::{Chunk, Id, ToolCallStatus};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::{
    ExecutionOutcome, ExecutionStatus, ExecutorAgent, ExecutorError, ExecutorResult,
    ReviewResponse, ReviewerAgent, ReviewerError, ToolCallUpdate,
};

/// Scripted behavior for one execution.
#[derive(Debug, Clone)]
pub enum FakeExecution {
    Success {
        output: String,
        tool_calls: Vec<ToolCallUpdate>,
        /// File written into the working directory so a commit has changes.
        write_file: Option<(String, String)>,
    },
    Failure {
        error: String,
    },
    Timeout,
}

impl FakeExecution {
    pub fn success() -> Self {
        Self::Success {
            output: "done".to_string(),
            tool_calls: Vec::new(),
            write_file: None,
        }
    }

    /// Success that leaves a file behind, so git sees changes to commit.
    pub fn success_writing(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::Success {
            output: "done".to_string(),
            tool_calls: vec![ToolCallUpdate {
                call_id: format!("call-{name}"),
                tool: "write".to_string(),
                state: ToolCallStatus::Completed,
                input: Some(name.clone()),
                output: None,
            }],
            write_file: Some((name, "generated".to_string())),
        }
    }
}

struct PendingExecution {
    execution: FakeExecution,
    workdir: PathBuf,
}

/// Executor double with per-title scripts.
pub struct FakeExecutor {
    default: FakeExecution,
    by_title: Mutex<HashMap<String, FakeExecution>>,
    pending: Mutex<HashMap<Id, PendingExecution>>,
    started: Mutex<Vec<String>>,
    aborted: Mutex<Vec<Id>>,
    delay: Mutex<std::time::Duration>,
}

impl std::fmt::Debug for FakeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FakeExecutor")
    }
}

impl Default for FakeExecutor {
    fn default() -> Self {
        Self::new(FakeExecution::success())
    }
}

impl FakeExecutor {
    pub fn new(default: FakeExecution) -> Self {
        Self {
            default,
            by_title: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            delay: Mutex::new(std::time::Duration::ZERO),
        }
    }

    /// Make every execution take this long, so tests can observe busy slots.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Script a specific outcome for chunks with the given title.
    pub fn script_title(&self, title: impl Into<String>, execution: FakeExecution) {
        self.by_title
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(title.into(), execution);
    }

    /// Titles in the order executions were started.
    pub fn started_titles(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn aborted_chunks(&self) -> Vec<Id> {
        self.aborted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ExecutorAgent for FakeExecutor {
    async fn start_execution(&self, chunk: &Chunk, workdir: &Path) -> ExecutorResult<String> {
        let execution = self
            .by_title
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&chunk.title)
            .cloned()
            .unwrap_or_else(|| self.default.clone());

        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(chunk.title.clone());
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            chunk.id.clone(),
            PendingExecution {
                execution,
                workdir: workdir.to_path_buf(),
            },
        );
        Ok(format!("fake-session-{}", chunk.id))
    }

    async fn await_completion(
        &self,
        chunk_id: &Id,
        tool_calls: mpsc::Sender<ToolCallUpdate>,
    ) -> ExecutorResult<ExecutionOutcome> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(chunk_id)
            .ok_or_else(|| ExecutorError::NoSession(chunk_id.to_string()))?;

        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match pending.execution {
            FakeExecution::Success {
                output,
                tool_calls: calls,
                write_file,
            } => {
                for call in calls {
                    let _ = tool_calls.send(call).await;
                }
                if let Some((name, content)) = write_file {
                    let _ = std::fs::write(pending.workdir.join(name), content);
                }
                Ok(ExecutionOutcome {
                    status: ExecutionStatus::Completed,
                    output: Some(output),
                    error: None,
                })
            }
            FakeExecution::Failure { error } => Ok(ExecutionOutcome {
                status: ExecutionStatus::Failed,
                output: None,
                error: Some(error),
            }),
            FakeExecution::Timeout => Ok(ExecutionOutcome {
                status: ExecutionStatus::Timeout,
                output: None,
                error: Some("execution timed out".to_string()),
            }),
        }
    }

    async fn abort(&self, chunk_id: &Id) -> ExecutorResult<()> {
        self.aborted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(chunk_id.clone());
        Ok(())
    }
}

/// Reviewer double popping a scripted queue of responses.
pub struct FakeReviewer {
    script: Mutex<VecDeque<Result<ReviewResponse, ReviewerError>>>,
    calls: AtomicU32,
}

impl std::fmt::Debug for FakeReviewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FakeReviewer")
    }
}

impl Default for FakeReviewer {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }
}

impl FakeReviewer {
    /// Reviewer that answers `pass` forever.
    pub fn always_pass() -> Self {
        Self::default()
    }

    /// Queue a scripted response; once drained, reviews fall back to `pass`.
    pub fn push(&self, response: Result<ReviewResponse, ReviewerError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    pub fn push_output(&self, output: impl Into<String>) {
        self.push(Ok(ReviewResponse {
            output: output.into(),
            cost: None,
            duration_ms: 5,
        }));
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Verdict JSON for a passing review.
pub fn pass_output() -> String {
    r#"{"status": "pass", "feedback": "looks good"}"#.to_string()
}

/// Verdict JSON for a failing review.
pub fn fail_output(feedback: &str) -> String {
    format!(r#"{{"status": "fail", "feedback": "{feedback}"}}"#)
}

/// Verdict JSON proposing a fix chunk.
pub fn needs_fix_output(title: &str, description: &str) -> String {
    format!(
        r#"{{"status": "needs_fix", "feedback": "needs work", "fixChunk": {{"title": "{title}", "description": "{description}"}}}}"#
    )
}

#[async_trait]
impl ReviewerAgent for FakeReviewer {
    async fn review(
        &self,
        _chunk: &Chunk,
        _prompt: &str,
        _workdir: &Path,
    ) -> Result<ReviewResponse, ReviewerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match scripted {
            Some(response) => response,
            None => Ok(ReviewResponse {
                output: pass_output(),
                cost: None,
                duration_ms: 5,
            }),
        }
    }
}
