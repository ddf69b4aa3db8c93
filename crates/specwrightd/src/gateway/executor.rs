//! Executor agent client speaking the opencode local protocol.
//!
//! Sessions are created per chunk against the agent's HTTP server; progress
//! arrives on a server-sent event stream (`tool.update`, `text.chunk`,
//! `session.complete`, `error`). The stream is opened before the prompt is
//! sent so no early events are lost.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use specwright_core::{Chunk, Id, ToolCallStatus};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    executor_prompt, ExecutionOutcome, ExecutionStatus, ExecutorAgent, ExecutorError,
    ExecutorResult, ToolCallUpdate,
};

struct ExecSession {
    session_id: String,
    /// SSE response, consumed once by `await_completion`.
    events: Option<reqwest::Response>,
}

/// HTTP + SSE client for the Executor agent.
pub struct OpencodeExecutor {
    client: reqwest::Client,
    base_url: String,
    model: String,
    execute_timeout: Duration,
    sessions: Mutex<HashMap<Id, ExecSession>>,
}

impl std::fmt::Debug for OpencodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpencodeExecutor")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpencodeExecutor {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, execute_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            execute_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Health probe; used to gate daemon startup diagnostics.
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn take_session(&self, chunk_id: &Id) -> ExecutorResult<(String, reqwest::Response)> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions
            .get_mut(chunk_id)
            .ok_or_else(|| ExecutorError::NoSession(chunk_id.to_string()))?;
        let events = session
            .events
            .take()
            .ok_or_else(|| ExecutorError::Protocol("event stream already consumed".to_string()))?;
        Ok((session.session_id.clone(), events))
    }

    fn session_id(&self, chunk_id: &Id) -> ExecutorResult<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(chunk_id)
            .map(|s| s.session_id.clone())
            .ok_or_else(|| ExecutorError::NoSession(chunk_id.to_string()))
    }

    fn drop_session(&self, chunk_id: &Id) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(chunk_id);
    }

    /// Consume the SSE stream until the session finishes.
    async fn consume_events(
        session_id: &str,
        events: reqwest::Response,
        tool_calls: &mpsc::Sender<ToolCallUpdate>,
    ) -> ExecutorResult<ExecutionOutcome> {
        let mut stream = events.bytes_stream();
        let mut buffer = String::new();
        let mut text_output = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // SSE frames are separated by a blank line.
            while let Some(frame_end) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..frame_end + 2).collect();
                let Some(event) = parse_sse_frame(&frame) else {
                    continue;
                };
                if event
                    .get("sessionID")
                    .and_then(Value::as_str)
                    .is_some_and(|id| id != session_id)
                {
                    continue;
                }

                match event.get("type").and_then(Value::as_str) {
                    Some("tool.update") => {
                        if let Some(update) = parse_tool_update(&event) {
                            // Receiver gone means the runner stopped listening;
                            // keep draining so completion is still observed.
                            let _ = tool_calls.send(update).await;
                        }
                    }
                    Some("text.chunk") => {
                        if let Some(text) = event.get("text").and_then(Value::as_str) {
                            text_output.push_str(text);
                        }
                    }
                    Some("session.complete") => {
                        let output = event
                            .get("output")
                            .and_then(Value::as_str)
                            .map(String::from)
                            .or_else(|| {
                                (!text_output.is_empty()).then(|| text_output.clone())
                            });
                        return Ok(ExecutionOutcome {
                            status: ExecutionStatus::Completed,
                            output,
                            error: None,
                        });
                    }
                    Some("error") => {
                        let message = event
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("executor reported an error")
                            .to_string();
                        return Ok(ExecutionOutcome {
                            status: ExecutionStatus::Failed,
                            output: None,
                            error: Some(message),
                        });
                    }
                    _ => {}
                }
            }
        }

        // Stream ended without a terminal event: the agent went away.
        Ok(ExecutionOutcome {
            status: ExecutionStatus::Failed,
            output: None,
            error: Some("executor event stream closed unexpectedly".to_string()),
        })
    }
}

fn parse_sse_frame(frame: &str) -> Option<Value> {
    let data: String = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join("\n");
    if data.is_empty() {
        return None;
    }
    serde_json::from_str(&data).ok()
}

fn parse_tool_update(event: &Value) -> Option<ToolCallUpdate> {
    let call_id = event.get("callID").and_then(Value::as_str)?.to_string();
    let tool = event
        .get("tool")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let state = match event.get("state").and_then(Value::as_str) {
        Some("completed") => ToolCallStatus::Completed,
        Some("error") => ToolCallStatus::Error,
        _ => ToolCallStatus::Running,
    };
    let as_json_string = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(ToolCallUpdate {
        call_id,
        tool,
        state,
        input: event.get("input").map(as_json_string),
        output: event.get("output").map(as_json_string),
    })
}

#[async_trait]
impl ExecutorAgent for OpencodeExecutor {
    async fn start_execution(&self, chunk: &Chunk, workdir: &Path) -> ExecutorResult<String> {
        let url = format!("{}/session", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "directory": workdir.to_string_lossy() }))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        let session_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::Protocol("session response missing id".to_string()))?
            .to_string();

        // Subscribe to events before prompting so nothing is missed.
        let events_url = format!("{}/events", self.base_url);
        let events = self
            .client
            .get(&events_url)
            .send()
            .await?
            .error_for_status()?;

        {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.insert(
                chunk.id.clone(),
                ExecSession {
                    session_id: session_id.clone(),
                    events: Some(events),
                },
            );
        }

        let prompt_url = format!("{}/session/{}/prompt", self.base_url, session_id);
        let prompt_body = serde_json::json!({
            "parts": [{ "type": "text", "text": executor_prompt(chunk) }],
            "model": self.model,
        });
        let client = self.client.clone();
        let chunk_id = chunk.id.clone();
        // The prompt call blocks until the agent finishes; completion is
        // observed on the event stream instead.
        tokio::spawn(async move {
            if let Err(e) = client.post(&prompt_url).json(&prompt_body).send().await {
                warn!(chunk_id = %chunk_id, error = %e, "executor prompt request failed");
            }
        });

        debug!(chunk_id = %chunk.id, session_id = %session_id, "execution started");
        Ok(session_id)
    }

    async fn await_completion(
        &self,
        chunk_id: &Id,
        tool_calls: mpsc::Sender<ToolCallUpdate>,
    ) -> ExecutorResult<ExecutionOutcome> {
        let (session_id, events) = self.take_session(chunk_id)?;

        let outcome = match tokio::time::timeout(
            self.execute_timeout,
            Self::consume_events(&session_id, events, &tool_calls),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    chunk_id = %chunk_id,
                    timeout_sec = self.execute_timeout.as_secs(),
                    "execution timed out"
                );
                let _ = self.abort(chunk_id).await;
                ExecutionOutcome {
                    status: ExecutionStatus::Timeout,
                    output: None,
                    error: Some(format!(
                        "execution timed out after {}s",
                        self.execute_timeout.as_secs()
                    )),
                }
            }
        };

        self.drop_session(chunk_id);
        Ok(outcome)
    }

    async fn abort(&self, chunk_id: &Id) -> ExecutorResult<()> {
        let session_id = self.session_id(chunk_id)?;
        let url = format!("{}/session/{}/abort", self.base_url, session_id);
        self.client.post(&url).send().await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sse_frame_extracts_data_lines() {
        let frame = "event: message\ndata: {\"type\": \"session.complete\", \
                     \"sessionID\": \"s1\"}\n\n";
        let value = parse_sse_frame(frame).unwrap();
        assert_eq!(value["type"], "session.complete");
        assert_eq!(value["sessionID"], "s1");
    }

    #[test]
    fn parse_sse_frame_ignores_non_data() {
        assert!(parse_sse_frame(": keep-alive\n\n").is_none());
        assert!(parse_sse_frame("data: not json\n\n").is_none());
    }

    #[test]
    fn parse_tool_update_maps_states() {
        let event = serde_json::json!({
            "type": "tool.update",
            "callID": "call-7",
            "tool": "bash",
            "state": "completed",
            "input": {"command": "ls"},
            "output": "src",
        });
        let update = parse_tool_update(&event).unwrap();
        assert_eq!(update.call_id, "call-7");
        assert_eq!(update.tool, "bash");
        assert_eq!(update.state, ToolCallStatus::Completed);
        assert_eq!(update.input.as_deref(), Some("{\"command\":\"ls\"}"));
        assert_eq!(update.output.as_deref(), Some("src"));
    }

    #[test]
    fn parse_tool_update_requires_call_id() {
        let event = serde_json::json!({ "type": "tool.update", "tool": "bash" });
        assert!(parse_tool_update(&event).is_none());
    }

    #[test]
    fn parse_tool_update_defaults_state_to_running() {
        let event = serde_json::json!({
            "type": "tool.update",
            "callID": "call-1",
            "tool": "edit",
            "state": "pending",
        });
        let update = parse_tool_update(&event).unwrap();
        assert_eq!(update.state, ToolCallStatus::Running);
    }
}
