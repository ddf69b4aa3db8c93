//! Run-all sessions: one per spec, sequential within, parallel across.
//!
//! A session loads the spec's chunk DAG, dispatches ready chunks through the
//! runner one at a time (chunks share a worktree; serializing avoids racing
//! commits), commits passed work, resets on failure, and finalizes with a
//! push and pull request when the GitHub CLI is available. Session state is
//! reconstructible from the Store; only the abort flag is transient.

use specwright_core::dag;
use specwright_core::{
    Chunk, ChunkStatus, Config, Id, Project, SessionEvent, SessionPayload, Spec, SpecStatus,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::chunk_runner::{ChunkOutcome, ChunkRunner, EventSink, RunOptions};
use crate::gateway::{ExecutorAgent, ReviewerAgent};
use crate::git::{self, CommitOutcome};
use crate::storage::{Storage, StorageError};

/// Interval between pause-flag checks while a session is parked.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a run is already active for spec {0}")]
    AlreadyRunning(Id),
    #[error("spec has no runnable chunks")]
    NoRunnableChunks,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Path(#[from] crate::paths::PathError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Shared control flags for one active session.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    /// Checked before each chunk start and after each completion.
    pub abort: Arc<AtomicBool>,
    /// Advisory: the session parks between chunks while set.
    pub paused: Arc<AtomicBool>,
}

impl SessionHandle {
    fn new() -> Self {
        Self::default()
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// Totals reported by a finished session.
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    pub passed: u32,
    pub failed: u32,
    pub fixes: u32,
    pub aborted: bool,
    pub has_failure: bool,
    pub pr_url: Option<String>,
    /// Reason reported in the terminal `stopped` event, when any.
    pub stopped_reason: Option<String>,
}

/// Session coordinator: enforces one active run per spec and owns the
/// shared agent handles. Tests inject a fresh instance.
pub struct Sessions {
    storage: Arc<Storage>,
    executor: Arc<dyn ExecutorAgent>,
    reviewer: Arc<dyn ReviewerAgent>,
    base_config: Config,
    active: Mutex<HashMap<Id, SessionHandle>>,
}

impl std::fmt::Debug for Sessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sessions")
    }
}

impl Sessions {
    pub fn new(
        storage: Arc<Storage>,
        executor: Arc<dyn ExecutorAgent>,
        reviewer: Arc<dyn ReviewerAgent>,
        base_config: Config,
    ) -> Self {
        Self {
            storage,
            executor,
            reviewer,
            base_config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn is_active(&self, spec_id: &Id) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(spec_id)
    }

    pub fn handle(&self, spec_id: &Id) -> Option<SessionHandle> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(spec_id)
            .cloned()
    }

    /// Abort every active session; used during daemon shutdown.
    pub fn abort_all(&self) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for handle in active.values() {
            handle.abort.store(true, Ordering::SeqCst);
        }
    }

    /// Request an abort. Idempotent and immediate; the session observes the
    /// flag at its next chunk boundary. Returns false when no session is
    /// active for the spec.
    ///
    /// A chunk mid-execution is asked to stop via the executor; if the agent
    /// does not cooperate the chunk is cancelled when its timeout fires.
    pub fn abort(&self, spec_id: &Id) -> bool {
        match self.handle(spec_id) {
            Some(handle) => {
                handle.abort.store(true, Ordering::SeqCst);
                let storage = Arc::clone(&self.storage);
                let executor = Arc::clone(&self.executor);
                let spec_id = spec_id.clone();
                tokio::spawn(async move {
                    if let Ok(chunks) = storage.chunks_by_spec(&spec_id).await {
                        for chunk in chunks.iter().filter(|c| c.status == ChunkStatus::Running) {
                            let _ = executor.abort(&chunk.id).await;
                        }
                    }
                });
                true
            }
            None => false,
        }
    }

    fn register(&self, spec_id: &Id) -> Result<SessionHandle> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains_key(spec_id) {
            return Err(SessionError::AlreadyRunning(spec_id.clone()));
        }
        let handle = SessionHandle::new();
        active.insert(spec_id.clone(), handle.clone());
        Ok(handle)
    }

    fn unregister(&self, spec_id: &Id) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(spec_id);
    }

    /// Admission: register the spec and validate it has runnable chunks.
    ///
    /// Conflicting state surfaces synchronously (`AlreadyRunning` maps to
    /// 409, `NoRunnableChunks` to 400) before any work starts.
    pub async fn prepare(self: &Arc<Self>, spec_id: &Id) -> Result<PreparedSession> {
        let spec = self.storage.get_spec(spec_id).await?;
        let project = self.storage.get_project(&spec.project_id).await?;
        let chunks = self.storage.chunks_by_spec(spec_id).await?;

        if !chunks.iter().any(|c| c.status != ChunkStatus::Completed) {
            return Err(SessionError::NoRunnableChunks);
        }

        let handle = self.register(spec_id)?;

        let config = match project.config_json.as_deref() {
            Some(json) => Config::from_json(json).unwrap_or_else(|e| {
                warn!(project_id = %project.id, error = %e, "invalid project config; using defaults");
                self.base_config.clone()
            }),
            None => self.base_config.clone(),
        };

        Ok(PreparedSession {
            sessions: Arc::clone(self),
            spec,
            project,
            config,
            handle,
        })
    }
}

/// Working-directory resolution for one session.
struct GitContext {
    enabled: bool,
    workdir: PathBuf,
    branch: Option<String>,
    original_branch: Option<String>,
    using_worktree: bool,
}

/// An admitted session, ready to run.
pub struct PreparedSession {
    sessions: Arc<Sessions>,
    spec: Spec,
    project: Project,
    config: Config,
    handle: SessionHandle,
}

impl std::fmt::Debug for PreparedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedSession")
            .field("spec", &self.spec.id)
            .finish_non_exhaustive()
    }
}

impl Drop for PreparedSession {
    fn drop(&mut self) {
        self.sessions.unregister(&self.spec.id);
    }
}

impl PreparedSession {
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn spec_id(&self) -> &Id {
        &self.spec.id
    }

    /// Drive the session to completion. Never panics the caller: internal
    /// errors land the spec in `review` and are reported via the sink.
    /// Dropping (with or without running) unregisters the spec.
    pub async fn run(self, sink: Arc<dyn EventSink>) -> SessionOutcome {
        match self.run_inner(sink.as_ref()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(spec_id = %self.spec.id, error = %e, "session failed");
                let reason = e.to_string();
                sink.emit(SessionPayload::Error {
                    chunk_id: None,
                    message: reason.clone(),
                });
                sink.emit(SessionPayload::Stopped {
                    reason: reason.clone(),
                });
                let _ = self
                    .sessions
                    .storage
                    .update_spec_status(&self.spec.id, SpecStatus::Review)
                    .await;
                SessionOutcome {
                    has_failure: true,
                    stopped_reason: Some(reason),
                    ..SessionOutcome::default()
                }
            }
        }
    }

    async fn run_inner(&self, sink: &dyn EventSink) -> Result<SessionOutcome> {
        let storage = &self.sessions.storage;
        let spec_id = self.spec.id.clone();

        let git_ctx = self.init_git(sink).await?;

        storage
            .update_spec_status(&spec_id, SpecStatus::Running)
            .await?;

        let runner = ChunkRunner::new(
            Arc::clone(storage),
            Arc::clone(&self.sessions.executor),
            Arc::clone(&self.sessions.reviewer),
            self.config.clone(),
        );

        // Rolling sets are session-local; the scheduler stays pure.
        let mut completed: HashSet<Id> = storage
            .chunks_by_spec(&spec_id)
            .await?
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .map(|c| c.id.clone())
            .collect();
        let mut running: HashSet<Id> = HashSet::new();
        let mut failed: HashSet<Id> = HashSet::new();

        let mut outcome = SessionOutcome::default();

        'outer: loop {
            if self.handle.abort_requested() {
                outcome.aborted = true;
                break;
            }
            self.park_while_paused().await;

            // Fresh snapshot each tick so fix chunks join the DAG.
            let snapshot = storage.chunks_by_spec(&spec_id).await?;
            let ready: Vec<Chunk> = dag::ready(&snapshot, &completed, &running, &failed)
                .into_iter()
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }

            for chunk in ready {
                if self.handle.abort_requested() {
                    outcome.aborted = true;
                    break 'outer;
                }
                self.park_while_paused().await;
                if self.handle.abort_requested() {
                    outcome.aborted = true;
                    break 'outer;
                }

                running.insert(chunk.id.clone());
                let chunk_outcome = runner
                    .run(
                        &chunk,
                        &git_ctx.workdir,
                        sink,
                        &self.handle.abort,
                        RunOptions::default(),
                    )
                    .await?;
                running.remove(&chunk.id);

                match chunk_outcome {
                    ChunkOutcome::Passed => {
                        let message = format!("chunk {}: {}", chunk.order + 1, chunk.title);
                        if !self.commit_chunk(&git_ctx, &chunk, &message, sink).await? {
                            outcome.has_failure = true;
                            outcome.stopped_reason = Some("commit failed".to_string());
                            break 'outer;
                        }
                        completed.insert(chunk.id.clone());
                        outcome.passed += 1;
                    }
                    ChunkOutcome::FixSpawned { fix_chunk_id } => {
                        // The parent's work stays in the tree; the fix chunk
                        // runs immediately, sequentially, and one commit
                        // covers both.
                        completed.insert(chunk.id.clone());
                        outcome.passed += 1;
                        outcome.fixes += 1;

                        let fix = storage.get_chunk(&fix_chunk_id).await?;
                        let fix_outcome = runner
                            .run(
                                &fix,
                                &git_ctx.workdir,
                                sink,
                                &self.handle.abort,
                                RunOptions { suppress_fix: true },
                            )
                            .await?;
                        match fix_outcome {
                            ChunkOutcome::Passed => {
                                let message = format!("fix: {}", fix.title);
                                if !self.commit_chunk(&git_ctx, &fix, &message, sink).await? {
                                    outcome.has_failure = true;
                                    outcome.stopped_reason = Some("commit failed".to_string());
                                    break 'outer;
                                }
                                completed.insert(fix.id.clone());
                            }
                            ChunkOutcome::Failed { error } => {
                                self.reset_on_failure(&git_ctx);
                                failed.insert(fix.id.clone());
                                outcome.failed += 1;
                                outcome.has_failure = true;
                                outcome.stopped_reason = Some(error);
                                break 'outer;
                            }
                            ChunkOutcome::Cancelled => {
                                outcome.aborted = true;
                                break 'outer;
                            }
                            ChunkOutcome::FixSpawned { .. } => {
                                // Unreachable with suppress_fix set.
                                completed.insert(fix.id.clone());
                            }
                        }
                    }
                    ChunkOutcome::Failed { error } => {
                        self.reset_on_failure(&git_ctx);
                        failed.insert(chunk.id.clone());
                        outcome.failed += 1;
                        outcome.has_failure = true;
                        outcome.stopped_reason = Some(error);
                        break 'outer;
                    }
                    ChunkOutcome::Cancelled => {
                        outcome.aborted = true;
                        break 'outer;
                    }
                }

                if self.handle.abort_requested() {
                    outcome.aborted = true;
                    break 'outer;
                }
            }
        }

        self.finalize(&git_ctx, &mut outcome, sink).await?;
        self.teardown(&git_ctx).await;
        Ok(outcome)
    }

    /// Working-directory selection: recorded worktree if present, else a new
    /// worktree, else an in-place branch checkout, else no git at all.
    ///
    /// The project directory is user-provided and is validated against the
    /// configured workspace root before anything touches the filesystem.
    async fn init_git(&self, sink: &dyn EventSink) -> Result<GitContext> {
        let root = self
            .config
            .workspace_root
            .as_deref()
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"));
        let project_dir =
            crate::paths::validate_within(Path::new(&self.project.directory), &root)?;
        let storage = &self.sessions.storage;

        if !git::is_git_repo(&project_dir) {
            sink.emit(SessionPayload::GitDisabled {
                reason: "project directory is not a git repository".to_string(),
            });
            return Ok(GitContext {
                enabled: false,
                workdir: project_dir,
                branch: None,
                original_branch: None,
                using_worktree: false,
            });
        }

        let branch = self.spec.branch_name.clone().unwrap_or_else(|| {
            git::generate_branch_name(&self.config.branch_prefix, &self.spec.title)
        });
        let original_branch = match self.spec.original_branch.clone() {
            Some(branch) => Some(branch),
            None => git::current_branch(&project_dir).ok(),
        };
        storage
            .update_spec_branches(&self.spec.id, Some(&branch), original_branch.as_deref())
            .await?;

        // Reuse the recorded worktree when it still exists on disk.
        if let Some(path) = self.spec.worktree_path.as_deref() {
            let path = PathBuf::from(path);
            if path.exists() {
                storage.touch_worktree_activity(&self.spec.id).await?;
                sink.emit(SessionPayload::WorktreeReused {
                    path: path.display().to_string(),
                });
                return Ok(GitContext {
                    enabled: true,
                    workdir: path,
                    branch: Some(branch),
                    original_branch,
                    using_worktree: true,
                });
            }
            storage.clear_spec_worktree(&self.spec.id).await?;
        }

        match git::create_worktree(&project_dir, self.spec.id.as_ref(), &branch) {
            Ok(path) => {
                storage
                    .update_spec_worktree(&self.spec.id, &path.display().to_string())
                    .await?;
                sink.emit(SessionPayload::WorktreeCreated {
                    path: path.display().to_string(),
                    branch: branch.clone(),
                });
                Ok(GitContext {
                    enabled: true,
                    workdir: path,
                    branch: Some(branch),
                    original_branch,
                    using_worktree: true,
                })
            }
            Err(worktree_err) => {
                warn!(
                    spec_id = %self.spec.id,
                    error = %worktree_err,
                    "worktree creation failed; falling back to in-place checkout"
                );
                let checkout_result = if git::branch_exists(&project_dir, &branch).unwrap_or(false)
                {
                    git::checkout(&project_dir, &branch)
                } else {
                    git::create_branch(&project_dir, &branch, None)
                        .and_then(|()| git::checkout(&project_dir, &branch))
                };
                match checkout_result {
                    Ok(()) => Ok(GitContext {
                        enabled: true,
                        workdir: project_dir,
                        branch: Some(branch),
                        original_branch,
                        using_worktree: false,
                    }),
                    Err(checkout_err) => {
                        // Both isolation strategies failed; run without git.
                        sink.emit(SessionPayload::GitDisabled {
                            reason: format!(
                                "worktree failed ({worktree_err}); checkout failed ({checkout_err})"
                            ),
                        });
                        Ok(GitContext {
                            enabled: false,
                            workdir: project_dir,
                            branch: None,
                            original_branch,
                            using_worktree: false,
                        })
                    }
                }
            }
        }
    }

    /// Commit a passed chunk. Returns false on a fatal git failure (the
    /// tree has been reset).
    async fn commit_chunk(
        &self,
        git_ctx: &GitContext,
        chunk: &Chunk,
        message: &str,
        sink: &dyn EventSink,
    ) -> Result<bool> {
        if !git_ctx.enabled {
            return Ok(true);
        }

        match git::commit(&git_ctx.workdir, message) {
            Ok(CommitOutcome::Committed {
                hash,
                files_changed,
            }) => {
                self.sessions
                    .storage
                    .set_chunk_commit(&chunk.id, &hash)
                    .await?;
                sink.emit(SessionPayload::GitCommit {
                    chunk_id: chunk.id.clone(),
                    hash,
                    files_changed,
                });
                Ok(true)
            }
            Ok(CommitOutcome::NoChanges) => {
                sink.emit(SessionPayload::GitCommitSkipped {
                    chunk_id: chunk.id.clone(),
                });
                Ok(true)
            }
            Err(e) => {
                warn!(chunk_id = %chunk.id, error = %e, "commit failed; resetting worktree");
                self.reset_on_failure(git_ctx);
                sink.emit(SessionPayload::Error {
                    chunk_id: Some(chunk.id.clone()),
                    message: format!("git commit failed: {e}"),
                });
                Ok(false)
            }
        }
    }

    fn reset_on_failure(&self, git_ctx: &GitContext) {
        if git_ctx.enabled {
            if let Err(e) = git::reset_hard(&git_ctx.workdir) {
                warn!(spec_id = %self.spec.id, error = %e, "reset after failure also failed");
            }
        }
    }

    async fn finalize(
        &self,
        git_ctx: &GitContext,
        outcome: &mut SessionOutcome,
        sink: &dyn EventSink,
    ) -> Result<()> {
        let storage = &self.sessions.storage;
        let spec_id = &self.spec.id;

        if outcome.aborted {
            let reason = "Aborted by user".to_string();
            sink.emit(SessionPayload::Stopped {
                reason: reason.clone(),
            });
            outcome.stopped_reason = Some(reason);
            storage
                .update_spec_status(spec_id, SpecStatus::Review)
                .await?;
            return Ok(());
        }

        if outcome.has_failure {
            let reason = outcome
                .stopped_reason
                .clone()
                .unwrap_or_else(|| "run failed".to_string());
            sink.emit(SessionPayload::Stopped {
                reason: reason.clone(),
            });
            outcome.stopped_reason = Some(reason);
            storage
                .update_spec_status(spec_id, SpecStatus::Review)
                .await?;
            return Ok(());
        }

        storage
            .update_spec_status(spec_id, SpecStatus::Completed)
            .await?;

        // Push and open a PR when possible; failures here are reported but
        // never retract completed chunk results.
        if git_ctx.enabled && git::gh_available() {
            if let Some(branch) = git_ctx.branch.as_deref() {
                match git::push_branch(&git_ctx.workdir, branch) {
                    Ok(()) => {
                        let base = git_ctx
                            .original_branch
                            .clone()
                            .or_else(|| git::detect_default_branch(&git_ctx.workdir).ok())
                            .unwrap_or_else(|| "main".to_string());
                        let body = format!(
                            "Automated implementation of spec \"{}\".",
                            self.spec.title
                        );
                        match git::open_pr(&git_ctx.workdir, &self.spec.title, &body, &base) {
                            Ok(pr) => {
                                storage.update_spec_pr(spec_id, pr.number, &pr.url).await?;
                                sink.emit(SessionPayload::PrOpened {
                                    url: pr.url.clone(),
                                    number: pr.number,
                                });
                                outcome.pr_url = Some(pr.url);
                            }
                            Err(e) => sink.emit(SessionPayload::GitPushFailed {
                                error: format!("pr creation failed: {e}"),
                            }),
                        }
                    }
                    Err(e) => sink.emit(SessionPayload::GitPushFailed {
                        error: format!("push failed: {e}"),
                    }),
                }
            }
        }

        sink.emit(SessionPayload::AllComplete {
            passed: outcome.passed,
            failed: outcome.failed,
            fixes: outcome.fixes,
            pr_url: outcome.pr_url.clone(),
        });
        info!(
            spec_id = %spec_id,
            passed = outcome.passed,
            failed = outcome.failed,
            fixes = outcome.fixes,
            "run complete"
        );
        Ok(())
    }

    async fn teardown(&self, git_ctx: &GitContext) {
        let storage = &self.sessions.storage;
        if git_ctx.using_worktree {
            let _ = storage.touch_worktree_activity(&self.spec.id).await;
        } else if git_ctx.enabled {
            // In-place sessions restore whatever branch was checked out.
            if let Some(original) = git_ctx.original_branch.as_deref() {
                if let Err(e) = git::checkout(&git_ctx.workdir, original) {
                    warn!(
                        spec_id = %self.spec.id,
                        branch = original,
                        error = %e,
                        "failed to restore original branch"
                    );
                }
            }
        }
    }

    async fn park_while_paused(&self) {
        while self.handle.paused.load(Ordering::SeqCst)
            && !self.handle.abort.load(Ordering::SeqCst)
        {
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
    }
}

// --- Live subscriber sink ---

/// Sink feeding a single live subscriber.
///
/// A dropped receiver latches the sink closed; later emissions become silent
/// no-ops so subscriber disconnects never propagate into session logic.
pub struct LiveSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
    closed: AtomicBool,
    seq: AtomicU64,
}

impl std::fmt::Debug for LiveSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LiveSink")
    }
}

impl LiveSink {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
                seq: AtomicU64::new(0),
            }),
            rx,
        )
    }
}

impl EventSink for LiveSink {
    fn emit(&self, payload: SessionPayload) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let event = SessionEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            timestamp: chrono::Utc::now(),
            payload,
        };
        if self.tx.send(event).is_err() {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

/// Sink that discards everything; used where nobody is listening.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _payload: SessionPayload) {}
}
