//! Configuration parsing for the orchestration engine.
//!
//! Parses the `key=value` format from `.specwright/config`. The same struct
//! serializes as the JSON stored in a project's `config` column; missing keys
//! fall back to defaults via serde.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Policy applied when the Reviewer's output cannot be parsed.
///
/// `Pass` preserves forward progress at the cost of possibly masking a bad
/// chunk; `NeedsFix` synthesizes a follow-up fix chunk instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewParsePolicy {
    #[default]
    Pass,
    NeedsFix,
}

impl ReviewParsePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::NeedsFix => "needs_fix",
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum concurrent background workers.
    pub max_workers: usize,

    /// Per-chunk Executor timeout in seconds.
    pub execute_timeout_sec: u32,
    /// Reviewer timeout in seconds, independent of the execute timeout.
    pub review_timeout_sec: u32,
    /// Maximum retries for rate-limited reviewer calls.
    pub review_retries: u32,
    /// Base backoff in milliseconds; doubles each attempt.
    pub review_retry_backoff_ms: u64,
    /// What to do when reviewer output fails to parse.
    pub review_parse_failure: ReviewParsePolicy,

    /// Base URL of the Executor agent's local HTTP server.
    pub executor_url: String,
    /// Model selection passed to the Executor.
    pub executor_model: String,

    /// Reviewer CLI binary.
    pub reviewer_bin: String,
    /// Model selection passed to the Reviewer CLI.
    pub reviewer_model: String,

    /// Prefix for generated branch names.
    pub branch_prefix: String,

    /// Root that project directories must resolve under. Unset means the
    /// user's home directory.
    pub workspace_root: Option<String>,

    /// Seconds between janitor sweeps.
    pub janitor_interval_sec: u64,
    /// Worktrees idle longer than this many days are considered stale.
    pub stale_worktree_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 5,
            execute_timeout_sec: 900,
            review_timeout_sec: 120,
            review_retries: 3,
            review_retry_backoff_ms: 1000,
            review_parse_failure: ReviewParsePolicy::Pass,
            executor_url: "http://127.0.0.1:4096".to_string(),
            executor_model: "default".to_string(),
            reviewer_bin: "claude".to_string(),
            reviewer_model: "sonnet".to_string(),
            branch_prefix: "spec/".to_string(),
            workspace_root: None,
            janitor_interval_sec: 3600,
            stale_worktree_days: 7,
        }
    }
}

impl Config {
    /// Load configuration from a `key=value` file.
    ///
    /// Lines starting with `#` and blank lines are skipped. Unknown keys and
    /// malformed values are rejected so typos surface immediately.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::default();

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(trimmed.to_string()));
            };
            config.apply(key.trim(), value.trim())?;
        }

        Ok(config)
    }

    /// Parse project-level overrides stored as JSON.
    ///
    /// Missing keys take their defaults; a parse failure is surfaced to the
    /// caller rather than silently ignored.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_workers" => self.max_workers = parse_int(key, value)? as usize,
            "execute_timeout_sec" => self.execute_timeout_sec = parse_int(key, value)? as u32,
            "review_timeout_sec" => self.review_timeout_sec = parse_int(key, value)? as u32,
            "review_retries" => self.review_retries = parse_int(key, value)? as u32,
            "review_retry_backoff_ms" => {
                self.review_retry_backoff_ms = parse_int(key, value)? as u64;
            }
            "review_parse_failure" => {
                self.review_parse_failure = match value {
                    "pass" => ReviewParsePolicy::Pass,
                    "needs_fix" => ReviewParsePolicy::NeedsFix,
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                        })
                    }
                };
            }
            "executor_url" => self.executor_url = value.to_string(),
            "executor_model" => self.executor_model = value.to_string(),
            "reviewer_bin" => self.reviewer_bin = value.to_string(),
            "reviewer_model" => self.reviewer_model = value.to_string(),
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "workspace_root" => self.workspace_root = Some(value.to_string()),
            "janitor_interval_sec" => self.janitor_interval_sec = parse_int(key, value)? as u64,
            "stale_worktree_days" => self.stale_worktree_days = parse_int(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

fn parse_int(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidInt {
        key: key.to_string(),
        value: value.to_string(),
    })
}
