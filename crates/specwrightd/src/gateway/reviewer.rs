//! Reviewer agent invoked as a CLI subprocess.
//!
//! The reviewer binary receives the prompt on stdin and streams JSON events
//! (system/init, assistant, user, result) one per line. Only the terminal
//! `result` event matters to the engine; everything else is logged at debug.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use specwright_core::Chunk;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ReviewResponse, ReviewerAgent, ReviewerError};

/// CLI-backed reviewer.
#[derive(Debug, Clone)]
pub struct CliReviewer {
    bin: String,
    model: String,
    timeout: Duration,
}

impl CliReviewer {
    pub fn new(bin: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            model: model.into(),
            timeout,
        }
    }

    async fn run(&self, prompt: &str, workdir: &Path) -> Result<ReviewResponse, ReviewerError> {
        let start = Utc::now();

        let mut child = Command::new(&self.bin)
            .args([
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--model",
                &self.model,
            ])
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            // Close stdin so the reviewer knows the prompt is complete.
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ReviewerError::Agent("reviewer stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut result: Option<ReviewResult> = None;
        loop {
            let line = match lines.next_line().await? {
                Some(line) => line,
                None => break,
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Value>(trimmed) else {
                debug!(line = %trimmed, "reviewer emitted non-JSON line");
                continue;
            };
            match event.get("type").and_then(Value::as_str) {
                Some("result") => {
                    result = Some(parse_result_event(&event));
                }
                Some(kind) => debug!(kind = %kind, "reviewer event"),
                None => {}
            }
        }

        let status = child.wait().await?;
        let duration_ms = (Utc::now() - start).num_milliseconds().max(0) as u64;

        match result {
            Some(ReviewResult::Success { output, cost }) => Ok(ReviewResponse {
                output,
                cost,
                duration_ms,
            }),
            Some(ReviewResult::Error { message }) => Err(ReviewerError::Agent(message)),
            None => {
                let code = status.code().unwrap_or(-1);
                Err(ReviewerError::Agent(format!(
                    "reviewer exited with code {code} without a result event"
                )))
            }
        }
    }
}

enum ReviewResult {
    Success { output: String, cost: Option<f64> },
    Error { message: String },
}

fn parse_result_event(event: &Value) -> ReviewResult {
    let is_error = event
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if is_error || event.get("subtype").and_then(Value::as_str) == Some("error") {
        let message = event
            .get("result")
            .or_else(|| event.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("reviewer reported an error")
            .to_string();
        return ReviewResult::Error { message };
    }

    let output = event
        .get("result")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let cost = event.get("total_cost_usd").and_then(Value::as_f64);
    ReviewResult::Success { output, cost }
}

#[async_trait]
impl ReviewerAgent for CliReviewer {
    async fn review(
        &self,
        chunk: &Chunk,
        prompt: &str,
        workdir: &Path,
    ) -> Result<ReviewResponse, ReviewerError> {
        debug!(chunk_id = %chunk.id, bin = %self.bin, "starting review");

        match tokio::time::timeout(self.timeout, self.run(prompt, workdir)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    chunk_id = %chunk.id,
                    timeout_sec = self.timeout.as_secs(),
                    "review timed out"
                );
                Err(ReviewerError::Timeout(self.timeout.as_secs() as u32))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::test_chunk;
    use tempfile::TempDir;

    #[test]
    fn parse_result_event_success() {
        let event = serde_json::json!({
            "type": "result",
            "subtype": "success",
            "result": "{\"status\": \"pass\", \"feedback\": \"ok\"}",
            "total_cost_usd": 0.012,
        });
        match parse_result_event(&event) {
            ReviewResult::Success { output, cost } => {
                assert!(output.contains("pass"));
                assert_eq!(cost, Some(0.012));
            }
            ReviewResult::Error { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn parse_result_event_error_flag() {
        let event = serde_json::json!({
            "type": "result",
            "is_error": true,
            "result": "429 rate limit exceeded",
        });
        match parse_result_event(&event) {
            ReviewResult::Error { message } => assert!(message.contains("429")),
            ReviewResult::Success { .. } => panic!("expected error"),
        }
    }

    // The reviewer binary is configurable, so a shell script standing in for
    // it exercises the full subprocess path.
    #[cfg(unix)]
    fn fake_reviewer_script(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-reviewer.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn review_reads_result_event_from_subprocess() {
        let dir = TempDir::new().unwrap();
        let script = fake_reviewer_script(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"system","subtype":"init"}'
echo '{"type":"result","subtype":"success","result":"{\"status\":\"pass\",\"feedback\":\"fine\"}","total_cost_usd":0.01}'"#,
        );
        let reviewer = CliReviewer::new(script, "sonnet", Duration::from_secs(10));
        let chunk = test_chunk("c1", "s1", 0, &[]);

        let response = reviewer
            .review(&chunk, "review this", dir.path())
            .await
            .unwrap();
        assert!(response.output.contains("pass"));
        assert_eq!(response.cost, Some(0.01));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn review_times_out_and_reports_timeout() {
        let dir = TempDir::new().unwrap();
        let script = fake_reviewer_script(dir.path(), "cat > /dev/null\nsleep 30");
        let reviewer = CliReviewer::new(script, "sonnet", Duration::from_millis(200));
        let chunk = test_chunk("c1", "s1", 0, &[]);

        let err = reviewer
            .review(&chunk, "review this", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ReviewerError::Timeout(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn review_without_result_event_is_an_error() {
        let dir = TempDir::new().unwrap();
        let script = fake_reviewer_script(
            dir.path(),
            "cat > /dev/null\necho '{\"type\":\"system\"}'\nexit 3",
        );
        let reviewer = CliReviewer::new(script, "sonnet", Duration::from_secs(10));
        let chunk = test_chunk("c1", "s1", 0, &[]);

        let err = reviewer
            .review(&chunk, "review this", dir.path())
            .await
            .unwrap_err();
        match err {
            ReviewerError::Agent(message) => assert!(message.contains("code 3")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
