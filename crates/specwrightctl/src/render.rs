//! Terminal rendering for specwrightctl.

use specwright_core::{QueueItem, Worker};

use crate::client::{CleanupReport, StaleWorktreeInfo};

/// One line per streamed session event.
pub fn print_session_event(name: &str, data: &serde_json::Value) {
    match name {
        "chunk_start" => println!("▶ chunk {}: {}", field(data, "chunk_id"), field(data, "title")),
        "tool_call" => println!("  · {} [{}]", field(data, "tool"), field(data, "state")),
        "chunk_complete" => println!("✓ chunk {} {}", field(data, "chunk_id"), field(data, "status")),
        "review_start" => println!("  reviewing {}", field(data, "chunk_id")),
        "review_complete" => {
            println!("  review: {} ({})", field(data, "status"), field(data, "feedback"));
        }
        "fix_chunk_created" => println!("  fix chunk created: {}", field(data, "title")),
        "git_commit" => println!("  committed {}", field(data, "hash")),
        "git_commit_skipped" => println!("  commit skipped (no changes)"),
        "worktree_created" => println!("worktree: {}", field(data, "path")),
        "worktree_reused" => println!("worktree (reused): {}", field(data, "path")),
        "git_disabled" => println!("git disabled: {}", field(data, "reason")),
        "pr_opened" => println!("PR opened: {}", field(data, "url")),
        "git_push_failed" => println!("push/PR failed: {}", field(data, "error")),
        "all_complete" => println!(
            "done: {} passed, {} failed, {} fixes",
            field(data, "passed"),
            field(data, "failed"),
            field(data, "fixes")
        ),
        "stopped" => println!("stopped: {}", field(data, "reason")),
        "error" => println!("error: {}", field(data, "message")),
        other => println!("{other}: {data}"),
    }
}

/// One line per worker bus event.
pub fn print_worker_event(name: &str, data: &serde_json::Value) {
    match name {
        "snapshot" => print_snapshot(data),
        "worker_progress" => {
            let progress = &data["progress"];
            println!(
                "{} progress {}/{} (passed {}, failed {})",
                field(data, "worker_id"),
                progress["current"],
                progress["total"],
                progress["passed"],
                progress["failed"]
            );
        }
        other => println!("{} {}", other, field(data, "worker_id")),
    }
}

fn print_snapshot(data: &serde_json::Value) {
    let workers = data["workers"].as_array().map(Vec::len).unwrap_or(0);
    let queue = data["queue"].as_array().map(Vec::len).unwrap_or(0);
    println!("{workers} active worker(s), {queue} queued");
}

pub fn print_worker(worker: &Worker) {
    println!("Worker: {}", worker.id);
    println!("  Spec:   {}", worker.spec_id);
    println!("  Status: {}", worker.status.as_str());
    println!(
        "  Progress: {}/{}",
        worker.progress.current, worker.progress.total
    );
    if let Some(started) = worker.started_at {
        let elapsed = chrono::Utc::now() - started;
        println!("  Elapsed:  {}s", elapsed.num_seconds().max(0));
    }
}

pub fn print_queue_item(item: &QueueItem) {
    println!("Queued: {}", item.id);
    println!("  Spec:     {}", item.spec_id);
    println!("  Priority: {}", item.priority);
}

pub fn print_stale(stale: &[StaleWorktreeInfo]) {
    if stale.is_empty() {
        println!("No stale worktrees.");
        return;
    }
    println!("{:<36}  {:<8}  PATH", "SPEC", "IDLE");
    for entry in stale {
        println!(
            "{:<36}  {:>5} d  {}",
            entry.spec_id.as_ref(),
            entry.idle_days,
            entry.worktree_path
        );
    }
}

pub fn print_cleanup_report(report: &CleanupReport) {
    println!(
        "cleaned {}, stale {}, errors {}",
        report.cleaned.len(),
        report.stale.len(),
        report.errors.len()
    );
    for error in &report.errors {
        println!("  error: {error}");
    }
}

fn field<'a>(data: &'a serde_json::Value, key: &str) -> FieldDisplay<'a> {
    FieldDisplay(data.get(key))
}

/// Displays a JSON field without quotes, empty when absent.
pub struct FieldDisplay<'a>(Option<&'a serde_json::Value>);

impl std::fmt::Display for FieldDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(serde_json::Value::String(s)) => write!(f, "{s}"),
            Some(other) => write!(f, "{other}"),
            None => Ok(()),
        }
    }
}
