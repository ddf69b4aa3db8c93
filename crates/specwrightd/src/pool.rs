//! Background worker pool: bounded headless run sessions plus an admission
//! queue.
//!
//! A worker wraps one run session with persisted progress instead of a live
//! subscriber. Capacity is enforced against the Store (workers in idle,
//! running, or paused occupy slots); the queue drains in
//! `(priority DESC, added_at ASC)` order whenever a slot frees up.

use chrono::Utc;
use specwright_core::{
    ChunkStatus, Id, QueueItem, SessionPayload, Worker, WorkerEvent, WorkerProgress, WorkerStatus,
    WorkerStep,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::chunk_runner::EventSink;
use crate::session::{SessionError, Sessions};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is at capacity")]
    AtCapacity,
    #[error("spec {0} already has an active worker or session")]
    AlreadyRunning(Id),
    #[error("worker {0} is not active")]
    NotActive(Id),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// The worker pool. Cheap to share; all state lives in the Store, the
/// session registry, and the bus.
pub struct WorkerPool {
    storage: Arc<Storage>,
    sessions: Arc<Sessions>,
    bus: Arc<EventBus>,
    max_workers: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.max_workers)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(
        storage: Arc<Storage>,
        sessions: Arc<Sessions>,
        bus: Arc<EventBus>,
        max_workers: usize,
    ) -> Self {
        Self {
            storage,
            sessions,
            bus,
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Allocate a worker slot and run the spec headlessly.
    ///
    /// Fails synchronously with `AtCapacity` or `AlreadyRunning`; the actual
    /// run happens on a background task that frees the slot and drains the
    /// queue when it ends.
    pub async fn start_worker(self: &Arc<Self>, spec_id: &Id) -> Result<Worker> {
        let spec = self.storage.get_spec(spec_id).await?;

        if self.sessions.is_active(spec_id) {
            return Err(PoolError::AlreadyRunning(spec_id.clone()));
        }
        if self.storage.count_active_workers().await? >= self.max_workers {
            return Err(PoolError::AtCapacity);
        }

        let prepared = self.sessions.prepare(spec_id).await.map_err(|e| match e {
            SessionError::AlreadyRunning(id) => PoolError::AlreadyRunning(id),
            other => PoolError::Session(other),
        })?;

        let total = self
            .storage
            .chunks_by_spec(spec_id)
            .await?
            .iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .count() as i64;

        let worker = Worker {
            id: Id::new(),
            spec_id: spec_id.clone(),
            project_id: spec.project_id.clone(),
            status: WorkerStatus::Running,
            current_chunk_id: None,
            current_step: None,
            progress: WorkerProgress {
                current: 0,
                total,
                passed: 0,
                failed: 0,
            },
            started_at: Some(Utc::now()),
            completed_at: None,
            error: None,
        };
        self.storage.insert_worker(&worker).await?;
        self.bus.publish_worker(&WorkerEvent::WorkerStarted {
            worker_id: worker.id.clone(),
            spec_id: spec_id.clone(),
        });
        info!(worker_id = %worker.id, spec_id = %spec_id, "worker started");

        let pool = Arc::clone(self);
        let worker_id = worker.id.clone();
        let spec_id = spec_id.clone();
        tokio::spawn(async move {
            pool.drive_worker(worker_id, spec_id, prepared).await;
        });

        Ok(worker)
    }

    async fn drive_worker(
        self: &Arc<Self>,
        worker_id: Id,
        spec_id: Id,
        prepared: crate::session::PreparedSession,
    ) {
        let (sink, relay) = WorkerSink::spawn(
            Arc::clone(&self.storage),
            Arc::clone(&self.bus),
            worker_id.clone(),
            spec_id.clone(),
        );

        let outcome = prepared.run(sink).await;
        // Let the relay flush every progress write before the terminal event.
        let _ = relay.await;

        let (status, error, event) = if outcome.aborted {
            (
                WorkerStatus::Failed,
                Some("Aborted by user".to_string()),
                WorkerEvent::WorkerStopped {
                    worker_id: worker_id.clone(),
                },
            )
        } else if outcome.has_failure {
            let error = outcome
                .stopped_reason
                .clone()
                .unwrap_or_else(|| "run failed".to_string());
            (
                WorkerStatus::Failed,
                Some(error.clone()),
                WorkerEvent::WorkerFailed {
                    worker_id: worker_id.clone(),
                    error,
                },
            )
        } else {
            (
                WorkerStatus::Completed,
                None,
                WorkerEvent::WorkerCompleted {
                    worker_id: worker_id.clone(),
                },
            )
        };

        if let Err(e) = self
            .storage
            .finish_worker(&worker_id, status, error.as_deref())
            .await
        {
            warn!(worker_id = %worker_id, error = %e, "failed to finish worker");
        }
        self.bus.publish_worker(&event);
        info!(worker_id = %worker_id, spec_id = %spec_id, status = status.as_str(), "worker finished");

        self.drain_queue().await;
    }

    /// Cooperative pause: the session parks before its next chunk.
    pub async fn pause(&self, worker_id: &Id) -> Result<()> {
        let worker = self.storage.get_worker(worker_id).await?;
        let handle = self
            .sessions
            .handle(&worker.spec_id)
            .ok_or_else(|| PoolError::NotActive(worker_id.clone()))?;
        handle.paused.store(true, Ordering::SeqCst);
        self.storage
            .set_worker_status(worker_id, WorkerStatus::Paused)
            .await?;
        self.bus.publish_worker(&WorkerEvent::WorkerPaused {
            worker_id: worker_id.clone(),
        });
        Ok(())
    }

    pub async fn resume(&self, worker_id: &Id) -> Result<()> {
        let worker = self.storage.get_worker(worker_id).await?;
        let handle = self
            .sessions
            .handle(&worker.spec_id)
            .ok_or_else(|| PoolError::NotActive(worker_id.clone()))?;
        handle.paused.store(false, Ordering::SeqCst);
        self.storage
            .set_worker_status(worker_id, WorkerStatus::Running)
            .await?;
        self.bus.publish_worker(&WorkerEvent::WorkerResumed {
            worker_id: worker_id.clone(),
        });
        Ok(())
    }

    /// Stop a worker by aborting its session. The worker finishes (and the
    /// slot frees) when the session observes the flag; a chunk mid-execution
    /// is asked to abort and marked cancelled if the agent ignores it.
    pub async fn stop(&self, worker_id: &Id) -> Result<()> {
        let worker = self.storage.get_worker(worker_id).await?;
        if !self.sessions.abort(&worker.spec_id) {
            return Err(PoolError::NotActive(worker_id.clone()));
        }
        Ok(())
    }

    /// Admit a spec: straight to a worker when capacity is free, otherwise
    /// onto the queue.
    pub async fn add_to_queue(self: &Arc<Self>, spec_id: &Id, priority: i64) -> Result<QueueItem> {
        let spec = self.storage.get_spec(spec_id).await?;

        if self.storage.count_active_workers().await? < self.max_workers
            && !self.sessions.is_active(spec_id)
        {
            let worker = self.start_worker(spec_id).await?;
            // Promoted immediately; report a synthetic zero-priority item so
            // callers see where the spec went.
            return Ok(QueueItem {
                id: worker.id,
                spec_id: spec_id.clone(),
                project_id: spec.project_id,
                priority,
                added_at: Utc::now(),
            });
        }

        let item = QueueItem {
            id: Id::new(),
            spec_id: spec_id.clone(),
            project_id: spec.project_id,
            priority,
            added_at: Utc::now(),
        };
        self.storage.enqueue(&item).await?;
        self.bus.publish_worker(&WorkerEvent::QueueUpdated);
        Ok(item)
    }

    /// Admit queued specs until capacity is exhausted.
    ///
    /// Returns a boxed future (rather than being an `async fn`) so its type
    /// is nominal instead of opaque: `drain_queue` and `start_worker` call
    /// each other, and leaving both as `async fn` makes the compiler try to
    /// inline each into the other's auto-trait (`Send`) computation forever.
    pub fn drain_queue(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.drain_queue_inner())
    }

    async fn drain_queue_inner(self: &Arc<Self>) {
        loop {
            match self.storage.count_active_workers().await {
                Ok(count) if count < self.max_workers => {}
                _ => break,
            }

            let item = match self.storage.dequeue_next().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "queue drain failed");
                    break;
                }
            };
            self.bus.publish_worker(&WorkerEvent::QueueUpdated);

            match self.start_worker(&item.spec_id).await {
                Ok(_) => {}
                Err(e) => {
                    // The item is already off the queue; dropping it beats
                    // a requeue loop against a permanently broken spec.
                    warn!(spec_id = %item.spec_id, error = %e, "queued spec not admissible");
                }
            }
        }
    }
}

/// Sink for headless sessions: translates session events into worker
/// progress rows and bus events, in order, off the session's hot path.
struct WorkerSink {
    tx: mpsc::UnboundedSender<SessionPayload>,
}

impl WorkerSink {
    fn spawn(
        storage: Arc<Storage>,
        bus: Arc<EventBus>,
        worker_id: Id,
        spec_id: Id,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionPayload>();
        let relay = tokio::spawn(async move {
            let mut progress = WorkerProgress::default();
            if let Ok(worker) = storage.get_worker(&worker_id).await {
                progress = worker.progress;
            }
            let spec_topic = EventBus::spec_topic(&spec_id);

            while let Some(payload) = rx.recv().await {
                // Mirror the raw session stream on the spec topic so UIs can
                // follow headless runs.
                if let Ok(json) = serde_json::to_string(&payload) {
                    bus.publish(&spec_topic, payload.name(), json);
                }

                match payload {
                    SessionPayload::ChunkStart { chunk_id, .. } => {
                        progress.current += 1;
                        let _ = storage
                            .update_worker_chunk(
                                &worker_id,
                                Some(&chunk_id),
                                Some(WorkerStep::Executing),
                            )
                            .await;
                        let _ = storage.update_worker_progress(&worker_id, progress).await;
                        bus.publish_worker(&WorkerEvent::WorkerChunkStart {
                            worker_id: worker_id.clone(),
                            chunk_id,
                        });
                        bus.publish_worker(&WorkerEvent::WorkerProgress {
                            worker_id: worker_id.clone(),
                            progress,
                        });
                    }
                    SessionPayload::ChunkComplete { chunk_id, status } => {
                        match status {
                            ChunkStatus::Completed => progress.passed += 1,
                            ChunkStatus::Failed => progress.failed += 1,
                            _ => {}
                        }
                        let _ = storage.update_worker_progress(&worker_id, progress).await;
                        bus.publish_worker(&WorkerEvent::WorkerChunkComplete {
                            worker_id: worker_id.clone(),
                            chunk_id,
                            status,
                        });
                        bus.publish_worker(&WorkerEvent::WorkerProgress {
                            worker_id: worker_id.clone(),
                            progress,
                        });
                    }
                    SessionPayload::ReviewStart { chunk_id } => {
                        let _ = storage
                            .update_worker_chunk(
                                &worker_id,
                                Some(&chunk_id),
                                Some(WorkerStep::Reviewing),
                            )
                            .await;
                        bus.publish_worker(&WorkerEvent::WorkerReviewStart {
                            worker_id: worker_id.clone(),
                            chunk_id,
                        });
                    }
                    SessionPayload::ReviewComplete {
                        chunk_id, status, ..
                    } => {
                        bus.publish_worker(&WorkerEvent::WorkerReviewComplete {
                            worker_id: worker_id.clone(),
                            chunk_id,
                            status,
                        });
                    }
                    SessionPayload::Error { message, .. } => {
                        // Chunk-level errors become failures in the terminal
                        // accounting; nothing extra to publish here.
                        tracing::debug!(worker_id = %worker_id, message = %message, "session error");
                    }
                    _ => {}
                }
            }
        });
        (Arc::new(Self { tx }), relay)
    }
}

impl EventSink for WorkerSink {
    fn emit(&self, payload: SessionPayload) {
        let _ = self.tx.send(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::fake::{FakeExecution, FakeExecutor, FakeReviewer};
    use crate::gateway::{ExecutorAgent, ReviewerAgent};
    use crate::storage::tests::{create_test_storage, test_chunk, test_project, test_spec, TestStorage};
    use specwright_core::Config;
    use std::time::Duration;

    struct Harness {
        ts: TestStorage,
        executor: Arc<FakeExecutor>,
        pool: Arc<WorkerPool>,
        bus: Arc<EventBus>,
        _dir: tempfile::TempDir,
    }

    async fn harness(max_workers: usize) -> Harness {
        let ts = create_test_storage().await;
        let dir = tempfile::TempDir::new().unwrap();
        let mut project = test_project("p1");
        project.directory = dir.path().display().to_string();
        ts.storage.insert_project(&project).await.unwrap();

        let executor = Arc::new(FakeExecutor::default());
        let reviewer = Arc::new(FakeReviewer::always_pass());
        let mut config = Config::default();
        config.review_retry_backoff_ms = 1;
        config.workspace_root = Some(dir.path().display().to_string());
        let sessions = Arc::new(Sessions::new(
            Arc::clone(&ts.storage),
            Arc::clone(&executor) as Arc<dyn ExecutorAgent>,
            reviewer as Arc<dyn ReviewerAgent>,
            config,
        ));
        let bus = Arc::new(EventBus::new());
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&ts.storage),
            sessions,
            Arc::clone(&bus),
            max_workers,
        ));
        Harness {
            ts,
            executor,
            pool,
            bus,
            _dir: dir,
        }
    }

    async fn seed_spec_with_chunk(h: &Harness, spec_id: &str) {
        h.ts.storage
            .insert_spec(&test_spec(spec_id, "p1"))
            .await
            .unwrap();
        h.ts.storage
            .insert_chunk(&test_chunk(
                &format!("{spec_id}-c1"),
                spec_id,
                0,
                &[],
            ))
            .await
            .unwrap();
    }

    async fn wait_for_worker_terminal(h: &Harness, worker_id: &Id) -> Worker {
        for _ in 0..200 {
            let worker = h.ts.storage.get_worker(worker_id).await.unwrap();
            if !worker.status.is_active() {
                return worker;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker {worker_id} never finished");
    }

    #[tokio::test]
    async fn worker_runs_spec_and_records_progress() {
        let h = harness(2).await;
        seed_spec_with_chunk(&h, "s1").await;

        let worker = h.pool.start_worker(&Id::from_string("s1")).await.unwrap();
        assert_eq!(worker.progress.total, 1);

        let finished = wait_for_worker_terminal(&h, &worker.id).await;
        assert_eq!(finished.status, WorkerStatus::Completed);
        assert_eq!(finished.progress.passed, 1);
        assert_eq!(finished.progress.failed, 0);
        assert!(finished.completed_at.is_some());
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let h = harness(2).await;
        for spec in ["s1", "s2", "s3"] {
            seed_spec_with_chunk(&h, spec).await;
        }
        h.executor.set_delay(Duration::from_millis(300));

        h.pool.start_worker(&Id::from_string("s1")).await.unwrap();
        h.pool.start_worker(&Id::from_string("s2")).await.unwrap();
        let err = h.pool.start_worker(&Id::from_string("s3")).await.unwrap_err();
        assert!(matches!(err, PoolError::AtCapacity));
    }

    #[tokio::test]
    async fn duplicate_worker_for_spec_is_rejected() {
        let h = harness(5).await;
        seed_spec_with_chunk(&h, "s1").await;
        h.executor.set_delay(Duration::from_millis(300));

        h.pool.start_worker(&Id::from_string("s1")).await.unwrap();
        let err = h.pool.start_worker(&Id::from_string("s1")).await.unwrap_err();
        assert!(matches!(err, PoolError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn add_to_queue_promotes_when_capacity_free() {
        let h = harness(2).await;
        seed_spec_with_chunk(&h, "s1").await;
        h.executor.set_delay(Duration::from_millis(300));

        h.pool.add_to_queue(&Id::from_string("s1"), 0).await.unwrap();
        // Promoted straight to a worker; queue stays empty.
        assert!(h.ts.storage.queue_items().await.unwrap().is_empty());
        assert_eq!(h.ts.storage.count_active_workers().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn add_to_queue_enqueues_at_capacity() {
        let h = harness(1).await;
        seed_spec_with_chunk(&h, "s1").await;
        seed_spec_with_chunk(&h, "s2").await;
        h.executor.set_delay(Duration::from_millis(300));

        h.pool.start_worker(&Id::from_string("s1")).await.unwrap();
        let item = h.pool.add_to_queue(&Id::from_string("s2"), 5).await.unwrap();
        assert_eq!(item.priority, 5);

        let queued = h.ts.storage.queue_items().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].spec_id.as_ref(), "s2");
    }

    #[tokio::test]
    async fn stopping_a_worker_admits_the_next_queued_spec() {
        let h = harness(2).await;
        for spec in ["sx", "sy", "sz"] {
            seed_spec_with_chunk(&h, spec).await;
        }
        h.executor.set_delay(Duration::from_millis(200));
        let mut rx = h.bus.subscribe(crate::bus::WORKERS_TOPIC);

        let wx = h.pool.start_worker(&Id::from_string("sx")).await.unwrap();
        h.pool.start_worker(&Id::from_string("sy")).await.unwrap();
        h.pool.add_to_queue(&Id::from_string("sz"), 0).await.unwrap();
        assert_eq!(h.ts.storage.queue_items().await.unwrap().len(), 1);

        h.pool.stop(&wx.id).await.unwrap();

        let stopped = wait_for_worker_terminal(&h, &wx.id).await;
        assert_eq!(stopped.status, WorkerStatus::Failed);
        assert_eq!(stopped.error.as_deref(), Some("Aborted by user"));

        // The queue drains into a new worker for sz.
        let mut admitted = false;
        for _ in 0..200 {
            let active = h.ts.storage.active_workers().await.unwrap();
            if active.iter().any(|w| w.spec_id.as_ref() == "sz") {
                admitted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(admitted, "sz admitted to a worker slot");
        assert!(h.ts.storage.queue_items().await.unwrap().is_empty());
        // Let the admission events land on the bus before draining it.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Observed event order: worker_stopped(X) precedes worker_started(Z).
        let mut saw_stopped = false;
        let mut saw_started_after_stop = false;
        while let Ok(message) = rx.try_recv() {
            if message.name == "worker_stopped" && message.data.contains(wx.id.as_ref()) {
                saw_stopped = true;
            }
            if saw_stopped && message.name == "worker_started" && message.data.contains("sz") {
                saw_started_after_stop = true;
            }
        }
        assert!(saw_stopped, "worker_stopped event published");
        assert!(saw_started_after_stop, "queued spec admitted after stop");
    }

    #[tokio::test]
    async fn pause_parks_session_and_resume_releases_it() {
        let h = harness(1).await;
        h.ts.storage.insert_spec(&test_spec("s1", "p1")).await.unwrap();
        for (id, order) in [("c1", 0), ("c2", 1)] {
            h.ts.storage
                .insert_chunk(&test_chunk(id, "s1", order, &[]))
                .await
                .unwrap();
        }
        h.executor.set_delay(Duration::from_millis(100));

        let worker = h.pool.start_worker(&Id::from_string("s1")).await.unwrap();
        h.pool.pause(&worker.id).await.unwrap();

        let paused = h.ts.storage.get_worker(&worker.id).await.unwrap();
        assert_eq!(paused.status, WorkerStatus::Paused);

        // Paused workers still count against capacity.
        assert_eq!(h.ts.storage.count_active_workers().await.unwrap(), 1);

        h.pool.resume(&worker.id).await.unwrap();
        let finished = wait_for_worker_terminal(&h, &worker.id).await;
        assert_eq!(finished.status, WorkerStatus::Completed);
        assert_eq!(finished.progress.passed, 2, "both chunks ran after resume");
    }

    #[tokio::test]
    async fn pause_of_finished_worker_reports_not_active() {
        let h = harness(1).await;
        seed_spec_with_chunk(&h, "s1").await;

        let worker = h.pool.start_worker(&Id::from_string("s1")).await.unwrap();
        wait_for_worker_terminal(&h, &worker.id).await;

        let err = h.pool.pause(&worker.id).await.unwrap_err();
        assert!(matches!(err, PoolError::NotActive(_)));
    }

    #[tokio::test]
    async fn failed_run_marks_worker_failed() {
        let h = harness(1).await;
        seed_spec_with_chunk(&h, "s1").await;
        h.executor.script_title(
            "chunk-s1-c1",
            FakeExecution::Failure {
                error: "agent gave up".to_string(),
            },
        );

        let worker = h.pool.start_worker(&Id::from_string("s1")).await.unwrap();
        let finished = wait_for_worker_terminal(&h, &worker.id).await;
        assert_eq!(finished.status, WorkerStatus::Failed);
        assert_eq!(finished.error.as_deref(), Some("agent gave up"));
        assert_eq!(finished.progress.failed, 1);
    }
}
