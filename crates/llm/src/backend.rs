//! Streaming dialogue backend
//!
//! Speaks the engine's chunked-JSON protocol: each line of the response body
//! is one event object (`text`, `tool_call`, `done`). SSE framing
//! (`data: …` prefixes) is tolerated. Cancellation is observed by watching
//! the consumer side of the event channel; an abandoned stream aborts the
//! request well inside the 200 ms bound.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

use callweave_core::{DialogueEvent, DialogueRequest, DialogueStream};

use crate::LlmError;

/// Dialogue service configuration
#[derive(Debug, Clone)]
pub struct DialogueConfig {
    pub endpoint: String,
    /// Wall-clock bound for the whole stream
    pub timeout: Duration,
    /// Connect retries before the request is reported failed
    pub max_retries: u32,
    /// Initial backoff, doubled each retry
    pub initial_backoff: Duration,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9003".to_string(),
            timeout: Duration::from_secs(60),
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Wire format of one streamed chunk
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Text {
        delta: String,
    },
    ToolCall {
        name: String,
        arguments: Value,
    },
    Done {
        #[serde(default)]
        usage: Option<Value>,
    },
}

/// HTTP dialogue backend
pub struct DialogueBackend {
    client: Client,
    config: DialogueConfig,
}

impl DialogueBackend {
    pub fn new(config: DialogueConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn stream_url(&self) -> String {
        format!("{}/chat/stream", self.config.endpoint)
    }

    fn tool_result_url(&self) -> String {
        format!("{}/chat/tool_result", self.config.endpoint)
    }

    /// Open the stream, retrying connect failures with backoff
    async fn connect(&self, request: &DialogueRequest) -> Result<reqwest::Response, LlmError> {
        let mut backoff = self.config.initial_backoff;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tracing::warn!(
                    attempt,
                    max = self.config.max_retries,
                    "Dialogue connect failed, retrying after {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self
                .client
                .post(self.stream_url())
                .json(request)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if !status.is_server_error() {
                        return Err(LlmError::Request(format!("dialogue returned {}", status)));
                    }
                    // 5xx: retry
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    // retry
                    tracing::debug!(error = %e, "Dialogue connect error");
                }
                Err(e) => return Err(LlmError::Request(e.to_string())),
            }
        }

        Err(LlmError::Request("dialogue connect retries exhausted".to_string()))
    }
}

/// Strip optional SSE framing and return the JSON payload of a line
fn payload_of(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let line = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if line == "[DONE]" {
        return None;
    }
    Some(line)
}

#[async_trait]
impl DialogueStream for DialogueBackend {
    async fn chat_stream(
        &self,
        request: DialogueRequest,
        tx: mpsc::Sender<DialogueEvent>,
    ) -> callweave_core::Result<()> {
        let response = self
            .connect(&request)
            .await
            .map_err(callweave_core::Error::from)?;

        let mut body = response.bytes_stream();
        let mut buffer = String::new();

        loop {
            let chunk = tokio::select! {
                // Consumer went away: abort the upstream request immediately
                _ = tx.closed() => {
                    tracing::debug!(
                        conversation_id = %request.conversation_id,
                        "Dialogue consumer dropped, aborting stream"
                    );
                    return Ok(());
                }
                chunk = body.next() => chunk,
            };

            let chunk = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    return Err(LlmError::Request(format!("stream error: {}", e)).into());
                }
                None => break,
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete lines; keep the partial tail buffered
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].to_string();
                buffer.drain(..=pos);

                let Some(payload) = payload_of(&line) else {
                    continue;
                };

                let event: WireEvent = serde_json::from_str(payload)
                    .map_err(|e| LlmError::Decode(format!("{}: {}", e, payload)))?;

                let event = match event {
                    WireEvent::Text { delta } => DialogueEvent::Text { delta },
                    WireEvent::ToolCall { name, arguments } => {
                        DialogueEvent::ToolCall { name, arguments }
                    }
                    WireEvent::Done { usage } => {
                        let _ = tx.send(DialogueEvent::Done { usage }).await;
                        return Ok(());
                    }
                };

                if tx.send(event).await.is_err() {
                    // Receiver dropped mid-send: treat as cancellation
                    return Ok(());
                }
            }
        }

        // Stream ended without an explicit done marker
        let _ = tx.send(DialogueEvent::Done { usage: None }).await;
        Ok(())
    }

    async fn submit_tool_result(
        &self,
        conversation_id: &str,
        name: &str,
        result: Value,
    ) -> callweave_core::Result<()> {
        let body = serde_json::json!({
            "conversation_id": conversation_id,
            "name": name,
            "result": result,
        });

        let response = self
            .client
            .post(self.tool_result_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))
            .map_err(callweave_core::Error::from)?;

        if !response.status().is_success() {
            return Err(
                LlmError::Request(format!("tool_result returned {}", response.status())).into(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_stripping() {
        assert_eq!(payload_of("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(payload_of("{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(payload_of(""), None);
        assert_eq!(payload_of("data: [DONE]"), None);
    }

    #[test]
    fn test_wire_event_decoding() {
        let e: WireEvent = serde_json::from_str(r#"{"type":"text","delta":"hola"}"#).unwrap();
        assert!(matches!(e, WireEvent::Text { ref delta } if delta == "hola"));

        let e: WireEvent = serde_json::from_str(
            r#"{"type":"tool_call","name":"lookup_customer","arguments":{"customer_id":"42"}}"#,
        )
        .unwrap();
        assert!(matches!(e, WireEvent::ToolCall { ref name, .. } if name == "lookup_customer"));

        let e: WireEvent = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert!(matches!(e, WireEvent::Done { usage: None }));
    }
}
