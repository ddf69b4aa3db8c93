//! specwrightctl - CLI client for specwrightd.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use futures::StreamExt;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// CLI client for the Specwright orchestration daemon.
#[derive(Parser)]
#[command(name = "specwrightctl")]
#[command(about = "Control plane for the Specwright orchestration daemon")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7700)
    #[arg(long, global = true, env = "SPECWRIGHT_ADDR")]
    addr: Option<String>,

    /// Auth token for the daemon API
    #[arg(long, global = true, env = "SPECWRIGHT_AUTH_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a run-all for a spec and stream its events
    RunAll { spec_id: String },

    /// Abort an active run-all
    Abort { spec_id: String },

    /// Single-chunk operations
    Chunk {
        #[command(subcommand)]
        command: ChunkCommand,
    },

    /// Reorder a spec's chunks
    ChunksReorder {
        spec_id: String,
        chunk_ids: Vec<String>,
    },

    /// Worker operations
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },

    /// Queue operations
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    /// Stream worker pool and queue events
    Watch,

    /// Worktree maintenance
    Worktrees {
        #[command(subcommand)]
        command: WorktreeCommand,
    },
}

#[derive(Subcommand)]
enum ChunkCommand {
    /// Execute a single chunk
    Run { chunk_id: String },
    /// Abort a single-chunk execution
    Abort { chunk_id: String },
    /// Replace a chunk's dependencies
    Deps {
        chunk_id: String,
        dependencies: Vec<String>,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Start a background worker for a spec
    Start { spec_id: String },
    /// Pause a worker at its next chunk boundary
    Pause { worker_id: String },
    /// Resume a paused worker
    Resume { worker_id: String },
    /// Stop a worker (aborts its session)
    Stop { worker_id: String },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Enqueue a spec (promotes immediately when capacity is free)
    Add {
        spec_id: String,
        #[arg(long)]
        priority: Option<i64>,
    },
    /// Reorder queued items
    Reorder { queue_ids: Vec<String> },
}

#[derive(Subcommand)]
enum WorktreeCommand {
    /// List stale worktrees
    Stale,
    /// Clean up merged (and, with --force, stale) worktrees
    Cleanup {
        #[arg(long)]
        force: bool,
    },
    /// Remove a spec's worktree unconditionally
    Delete { spec_id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let addr = cli
        .addr
        .clone()
        .unwrap_or_else(|| "http://127.0.0.1:7700".to_string());

    let client = match Client::new(addr, cli.token.as_deref()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&client, cli.command).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(client: &Client, command: Command) -> Result<(), ClientError> {
    match command {
        Command::RunAll { spec_id } => {
            let response = client.run_all(&spec_id).await?;
            let failed = stream_sse(response, render::print_session_event).await?;
            if failed {
                std::process::exit(2);
            }
        }
        Command::Abort { spec_id } => {
            let aborted = client.abort_run_all(&spec_id).await?;
            if aborted {
                println!("abort requested for {spec_id}");
            } else {
                println!("no active run for {spec_id}");
            }
        }
        Command::Chunk { command } => match command {
            ChunkCommand::Run { chunk_id } => {
                client.run_chunk(&chunk_id).await?;
                println!("chunk {chunk_id} started");
            }
            ChunkCommand::Abort { chunk_id } => {
                client.abort_chunk(&chunk_id).await?;
                println!("chunk {chunk_id} aborted");
            }
            ChunkCommand::Deps {
                chunk_id,
                dependencies,
            } => {
                client.set_dependencies(&chunk_id, &dependencies).await?;
                println!("dependencies updated for {chunk_id}");
            }
        },
        Command::ChunksReorder { spec_id, chunk_ids } => {
            client.reorder_chunks(&spec_id, &chunk_ids).await?;
            println!("chunk order updated for {spec_id}");
        }
        Command::Worker { command } => match command {
            WorkerCommand::Start { spec_id } => {
                let worker = client.start_worker(&spec_id).await?;
                render::print_worker(&worker);
            }
            WorkerCommand::Pause { worker_id } => {
                client.pause_worker(&worker_id).await?;
                println!("worker {worker_id} pausing at next chunk boundary");
            }
            WorkerCommand::Resume { worker_id } => {
                client.resume_worker(&worker_id).await?;
                println!("worker {worker_id} resumed");
            }
            WorkerCommand::Stop { worker_id } => {
                client.stop_worker(&worker_id).await?;
                println!("worker {worker_id} stopping");
            }
        },
        Command::Queue { command } => match command {
            QueueCommand::Add { spec_id, priority } => {
                let item = client.enqueue(&spec_id, priority).await?;
                render::print_queue_item(&item);
            }
            QueueCommand::Reorder { queue_ids } => {
                client.reorder_queue(&queue_ids).await?;
                println!("queue order updated");
            }
        },
        Command::Watch => {
            let response = client.worker_events().await?;
            stream_sse(response, render::print_worker_event).await?;
        }
        Command::Worktrees { command } => match command {
            WorktreeCommand::Stale => {
                let response = client.stale_worktrees().await?;
                render::print_stale(&response.stale_worktrees);
            }
            WorktreeCommand::Cleanup { force } => {
                let report = client.cleanup_worktrees(force).await?;
                render::print_cleanup_report(&report);
            }
            WorktreeCommand::Delete { spec_id } => {
                client.delete_worktree(&spec_id).await?;
                println!("worktree removed for {spec_id}");
            }
        },
    }
    Ok(())
}

/// Consume an SSE response, dispatching each event to `print`.
///
/// Returns true when a terminal `stopped` or `error` event was observed.
async fn stream_sse(
    response: reqwest::Response,
    print: fn(&str, &serde_json::Value),
) -> Result<bool, ClientError> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut failed = false;

    while let Some(chunk) = stream.next().await {
        let bytes = chunk?;
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(frame_end) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..frame_end + 2).collect();
            let mut name = "message";
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    name = value.trim();
                } else if let Some(value) = line.strip_prefix("data:") {
                    data.push_str(value.trim_start());
                }
            }
            if data.is_empty() {
                continue;
            }
            let parsed: serde_json::Value =
                serde_json::from_str(&data).unwrap_or(serde_json::Value::Null);
            if name == "stopped" || name == "error" {
                failed = true;
            }
            print(name, &parsed);
        }
    }

    Ok(failed)
}
