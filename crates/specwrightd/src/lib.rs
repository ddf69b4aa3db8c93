//! specwrightd - Specwright orchestration daemon.
//!
//! Wires the store, agent gateway, session coordinator, worker pool, event
//! bus, janitor, and HTTP control plane into one process.

pub mod bus;
pub mod chunk_runner;
pub mod gateway;
pub mod git;
pub mod janitor;
pub mod paths;
pub mod pool;
pub mod server;
pub mod session;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use specwright_core::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::gateway::executor::OpencodeExecutor;
use crate::gateway::reviewer::CliReviewer;
use crate::gateway::{ExecutorAgent, ReviewerAgent};
use crate::janitor::WorktreeJanitor;
use crate::pool::WorkerPool;
use crate::server::AppState;
use crate::session::Sessions;
use crate::storage::Storage;

/// Grace period for in-flight sessions to observe the abort flag during
/// shutdown before the HTTP server is torn down.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the `SQLite` database.
    pub db_path: PathBuf,
    /// HTTP server port.
    pub port: u16,
    /// Auth token for the HTTP API (optional).
    pub auth_token: Option<String>,
    /// Engine configuration (daemon-level defaults; projects may override).
    pub config: Config,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: 7700,
            auth_token: std::env::var("SPECWRIGHT_AUTH_TOKEN").ok(),
            config: Config::default(),
        }
    }
}

/// Default database path (~/.local/share/specwright/specwright.db).
fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("specwright").join("specwright.db")
}

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    storage: Arc<Storage>,
    sessions: Arc<Sessions>,
    pool: Arc<WorkerPool>,
    bus: Arc<EventBus>,
    janitor: Arc<WorktreeJanitor>,
    executor: Arc<OpencodeExecutor>,
    reviewer: Arc<CliReviewer>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub async fn new(config: DaemonConfig) -> AppResult<Self> {
        let storage = Arc::new(Storage::new(&config.db_path).await?);
        storage.migrate().await?;

        // Crash recovery: the Store is the source of truth, abort flags are
        // not. Anything still marked in-flight belongs to a dead process.
        let failed = storage.fail_active_workers("daemon restarted").await?;
        if failed > 0 {
            warn!(count = failed, "marked orphaned workers as failed");
        }
        let reset = storage.reset_running_specs().await?;
        if reset > 0 {
            warn!(count = reset, "reset interrupted specs to review");
        }

        let engine = &config.config;
        let executor = Arc::new(OpencodeExecutor::new(
            engine.executor_url.clone(),
            engine.executor_model.clone(),
            Duration::from_secs(u64::from(engine.execute_timeout_sec)),
        ));
        let reviewer = Arc::new(CliReviewer::new(
            engine.reviewer_bin.clone(),
            engine.reviewer_model.clone(),
            Duration::from_secs(u64::from(engine.review_timeout_sec)),
        ));

        let sessions = Arc::new(Sessions::new(
            Arc::clone(&storage),
            Arc::clone(&executor) as Arc<dyn ExecutorAgent>,
            Arc::clone(&reviewer) as Arc<dyn ReviewerAgent>,
            engine.clone(),
        ));
        let bus = Arc::new(EventBus::new());
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&storage),
            Arc::clone(&sessions),
            Arc::clone(&bus),
            engine.max_workers,
        ));
        let janitor = Arc::new(WorktreeJanitor::new(
            Arc::clone(&storage),
            Arc::clone(&sessions),
            engine.stale_worktree_days,
        ));

        Ok(Self {
            config,
            storage,
            sessions,
            pool,
            bus,
            janitor,
            executor,
            reviewer,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn sessions(&self) -> &Arc<Sessions> {
        &self.sessions
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Run the daemon until shutdown is signaled.
    pub async fn run(&self) -> AppResult<()> {
        info!("specwrightd starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        info!("max workers: {}", self.config.config.max_workers);
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        if self.executor.health().await {
            info!("executor agent reachable at {}", self.config.config.executor_url);
        } else {
            warn!(
                "executor agent not reachable at {}; runs will fail until it is up",
                self.config.config.executor_url
            );
        }

        let state = Arc::new(AppState::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.sessions),
            Arc::clone(&self.pool),
            Arc::clone(&self.bus),
            Arc::clone(&self.janitor),
            Arc::clone(&self.executor) as Arc<dyn ExecutorAgent>,
            Arc::clone(&self.reviewer) as Arc<dyn ReviewerAgent>,
            self.config.config.clone(),
            self.config.auth_token.clone(),
        ));

        let port = self.config.port;
        let http_handle = tokio::spawn(async move {
            if let Err(e) = server::start_server(state, port).await {
                tracing::error!("HTTP server error: {e}");
            }
        });

        // Periodic janitor sweeps until shutdown.
        let janitor = Arc::clone(&self.janitor);
        let interval_secs = self.config.config.janitor_interval_sec.max(1);
        let janitor_token = self.shutdown.clone();
        let janitor_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            // The first tick fires immediately; skip it so startup stays fast.
            interval.tick().await;
            loop {
                tokio::select! {
                    () = janitor_token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = janitor.cleanup(false).await {
                            warn!("janitor sweep failed: {e}");
                        }
                    }
                }
            }
        });

        self.shutdown.cancelled().await;
        info!("shutdown signal received");

        // Sessions unwind at their next chunk boundary.
        self.sessions.abort_all();
        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;

        janitor_handle.abort();
        http_handle.abort();
        Ok(())
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}
