//! Git operations for the orchestration engine.
//!
//! Every argument that reaches git or the GitHub CLI is passed as a discrete
//! `Command` argument. Branch names and commit messages may contain arbitrary
//! Unicode including shell metacharacters and are preserved byte-for-byte.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("branch already exists: {0}")]
    BranchExists(String),
    #[error("dirty working tree: {0}")]
    DirtyWorkingTree(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("github CLI: {0}")]
    Gh(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Outcome of a commit attempt. `NoChanges` is a benign terminal: the chunk
/// passed review but left the tree identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { hash: String, files_changed: u32 },
    NoChanges,
}

/// An opened pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub url: String,
    pub number: i64,
}

fn git(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    Ok(Command::new("git").args(args).current_dir(dir).output()?)
}

fn git_ok(dir: &Path, args: &[&str]) -> Result<String> {
    let output = git(dir, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)
}

/// Check whether `dir` is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    git(dir, &["rev-parse", "--is-inside-work-tree"])
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Name of the currently checked-out branch.
pub fn current_branch(dir: &Path) -> Result<String> {
    let out = git_ok(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(out.trim().to_string())
}

/// Check if a branch exists locally.
pub fn branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    let output = git(
        dir,
        &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
    )?;
    Ok(output.status.success())
}

/// Create a new branch from `base` (or HEAD) without checking it out.
pub fn create_branch(dir: &Path, branch: &str, base: Option<&str>) -> Result<()> {
    if branch_exists(dir, branch)? {
        return Err(GitError::BranchExists(branch.to_string()));
    }

    let output = match base {
        Some(base) => git(dir, &["branch", branch, base])?,
        None => git(dir, &["branch", branch])?,
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("already exists") {
            return Err(GitError::BranchExists(branch.to_string()));
        }
        return Err(GitError::CommandFailed(format!("git branch {branch}: {stderr}")));
    }
    Ok(())
}

/// Checkout a branch in place.
///
/// Refuses when uncommitted changes would be clobbered, surfacing the
/// condition as `DirtyWorkingTree`.
pub fn checkout(dir: &Path, branch: &str) -> Result<()> {
    let output = git(dir, &["checkout", branch])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("would be overwritten") {
            return Err(GitError::DirtyWorkingTree(stderr));
        }
        return Err(GitError::CommandFailed(format!("git checkout {branch}: {stderr}")));
    }
    Ok(())
}

/// Detect the default branch (remote HEAD, then `main`, then `master`).
pub fn detect_default_branch(dir: &Path) -> Result<String> {
    let output = git(dir, &["symbolic-ref", "refs/remotes/origin/HEAD"])?;
    if output.status.success() {
        let full_ref = String::from_utf8(output.stdout)
            .map_err(|_| GitError::InvalidUtf8)?
            .trim()
            .to_string();
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        if branch_exists(dir, candidate)? {
            return Ok(candidate.to_string());
        }
    }
    Ok("main".to_string())
}

/// Stage everything and commit with the given message.
///
/// The message goes through a single `-m` argument, never a shell; hostile
/// content stays literal.
pub fn commit(dir: &Path, message: &str) -> Result<CommitOutcome> {
    git_ok(dir, &["add", "-A"])?;

    let staged = git_ok(dir, &["diff", "--cached", "--name-only"])?;
    let files_changed = staged.lines().filter(|l| !l.trim().is_empty()).count() as u32;
    if files_changed == 0 {
        return Ok(CommitOutcome::NoChanges);
    }

    let output = git(dir, &["commit", "-m", message])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git commit: {}",
            stderr.trim()
        )));
    }

    let hash = git_ok(dir, &["rev-parse", "HEAD"])?.trim().to_string();
    Ok(CommitOutcome::Committed {
        hash,
        files_changed,
    })
}

/// Discard all uncommitted changes, returning the tree to the last commit.
pub fn reset_hard(dir: &Path) -> Result<()> {
    git_ok(dir, &["reset", "--hard", "HEAD"])?;
    git_ok(dir, &["clean", "-fd"])?;
    Ok(())
}

/// Deterministic branch name from a spec title: lowercase alphanumeric slug,
/// hyphens collapsed, bounded length.
pub fn generate_branch_name(prefix: &str, title: &str) -> String {
    const MAX_SLUG_LEN: usize = 48;

    let slug: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    let mut slug: String = slug.chars().take(MAX_SLUG_LEN).collect();
    let trimmed = slug.trim_end_matches('-');
    slug.truncate(trimmed.len());
    if slug.is_empty() {
        slug = "spec".to_string();
    }
    format!("{prefix}{slug}")
}

/// Create a worktree for a spec, creating the branch from HEAD if needed.
///
/// The path embeds the spec id and a creation timestamp so concurrent
/// sessions can never collide on disk.
pub fn create_worktree(project_dir: &Path, spec_id: &str, branch: &str) -> Result<PathBuf> {
    if !is_git_repo(project_dir) {
        return Err(GitError::NotARepo(project_dir.display().to_string()));
    }

    let repo = project_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo");
    let parent = project_dir.parent().unwrap_or(project_dir);
    let worktrees_dir = parent.join(format!("{repo}.worktrees"));
    std::fs::create_dir_all(&worktrees_dir).map_err(GitError::Execution)?;

    let mut stamp = Utc::now().timestamp_millis();
    let mut path = worktrees_dir.join(format!("{spec_id}-{stamp}"));
    while path.exists() {
        stamp += 1;
        path = worktrees_dir.join(format!("{spec_id}-{stamp}"));
    }

    if !branch_exists(project_dir, branch)? {
        create_branch(project_dir, branch, None)?;
    }

    let path_arg = path.to_string_lossy().to_string();
    let output = git(project_dir, &["worktree", "add", &path_arg, branch])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git worktree add: {}",
            stderr.trim()
        )));
    }

    Ok(path)
}

/// Remove a worktree (forcing past local changes) and prune bookkeeping.
pub fn remove_worktree(project_dir: &Path, worktree_path: &Path) -> Result<()> {
    let path_arg = worktree_path.to_string_lossy().to_string();
    let output = git(
        project_dir,
        &["worktree", "remove", "--force", &path_arg],
    )?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git worktree remove: {}",
            stderr.trim()
        )));
    }
    let _ = git(project_dir, &["worktree", "prune"]);
    Ok(())
}

/// Push a branch to origin, setting upstream.
pub fn push_branch(dir: &Path, branch: &str) -> Result<()> {
    let output = git(dir, &["push", "-u", "origin", branch])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git push -u origin {branch}: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Whether the GitHub CLI is installed and authenticated.
///
/// Push/PR are gated on this; absence degrades softly instead of failing
/// the run.
pub fn gh_available() -> bool {
    Command::new("gh")
        .args(["auth", "status"])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Open a pull request for the current branch via the GitHub CLI.
pub fn open_pr(dir: &Path, title: &str, body: &str, base: &str) -> Result<PullRequest> {
    let output = Command::new("gh")
        .args(["pr", "create", "--title", title, "--body", body, "--base", base])
        .current_dir(dir)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::Gh(stderr.trim().to_string()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let url = stdout
        .lines()
        .rev()
        .find(|line| line.trim().starts_with("http"))
        .map(|line| line.trim().to_string())
        .ok_or_else(|| GitError::CommandFailed("gh pr create returned no URL".to_string()))?;

    let number = url
        .rsplit('/')
        .next()
        .and_then(|n| n.parse::<i64>().ok())
        .unwrap_or(0);

    Ok(PullRequest { url, number })
}
