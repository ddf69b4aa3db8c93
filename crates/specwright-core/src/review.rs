//! Review verdict parsing and reviewer error classification.
//!
//! The Reviewer agent is a black box; the only structure the engine relies on
//! is a small JSON verdict embedded in its output. Everything here is pure so
//! the policy can be tested without spawning subprocesses.

use crate::types::ReviewStatus;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

/// Follow-up work proposed by a `needs_fix` verdict.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FixChunkSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// Parsed reviewer verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewVerdict {
    pub status: ReviewStatus,
    pub feedback: String,
    pub fix_chunk: Option<FixChunkSpec>,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    status: String,
    #[serde(default)]
    feedback: String,
    #[serde(default, alias = "fixChunk")]
    fix_chunk: Option<FixChunkSpec>,
}

/// Extract the verdict from raw reviewer output.
///
/// Accepts the whole output as JSON, a fenced ```json block, or the first
/// balanced JSON object found in the text. Returns `None` when no verdict can
/// be recovered; the caller applies the configured parse-failure policy.
pub fn parse_verdict(output: &str) -> Option<ReviewVerdict> {
    for candidate in verdict_candidates(output) {
        if let Ok(raw) = serde_json::from_str::<RawVerdict>(&candidate) {
            if let Some(status) = ReviewStatus::parse(&raw.status) {
                return Some(ReviewVerdict {
                    status,
                    feedback: raw.feedback,
                    fix_chunk: raw.fix_chunk,
                });
            }
        }
    }
    None
}

fn verdict_candidates(output: &str) -> Vec<String> {
    let mut candidates = vec![output.trim().to_string()];

    // Fenced code blocks, ```json or bare ```.
    let mut rest = output;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            candidates.push(body[..end].trim().to_string());
            rest = &body[end + 3..];
        } else {
            break;
        }
    }

    // First balanced top-level object.
    if let Some(obj) = first_json_object(output) {
        candidates.push(obj);
    }

    candidates
}

fn first_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

// --- Error classification ---

/// Reviewer failure taxonomy. Only `RateLimit` is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewErrorKind {
    RateLimit,
    Timeout,
    ParseError,
    Unknown,
}

impl ReviewErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::ParseError => "parse_error",
            Self::Unknown => "unknown",
        }
    }
}

/// True iff the message denotes HTTP 429 or a textual rate limit.
pub fn detect_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("429")
        || lower.contains("too many requests")
}

/// Total classification over arbitrary error text.
pub fn classify_error(message: &str) -> ReviewErrorKind {
    if detect_rate_limit(message) {
        return ReviewErrorKind::RateLimit;
    }
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        return ReviewErrorKind::Timeout;
    }
    if lower.contains("parse") || lower.contains("invalid json") {
        return ReviewErrorKind::ParseError;
    }
    ReviewErrorKind::Unknown
}

// --- Retry policy ---

/// Retry parameters: at most `max_retries` retries, backoff
/// `backoff_ms * 2^attempt` between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(1 << attempt.min(16)))
    }
}

/// Run `op` with retries for rate-limited failures only.
///
/// `op` is called at most `max_retries + 1` times; any non-rate-limit error
/// propagates after the first attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut op: F,
    policy: RetryPolicy,
    classify: impl Fn(&E) -> ReviewErrorKind,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if classify(&err) != ReviewErrorKind::RateLimit || attempt >= policy.max_retries {
                    return Err(err);
                }
                tokio::time::sleep(policy.backoff_for(attempt)).await;
                attempt += 1;
            }
        }
    }
}
