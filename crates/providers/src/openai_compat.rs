//! OpenAI-compatible chat-completion adapter.
//!
//! Works with: OpenAI, OpenRouter, Anthropic (via proxy), Ollama, vLLM, and
//! any endpoint exposing `/chat/completions`.
//!
//! Supports:
//! - Non-streaming completions
//! - Streaming SSE with usage reporting (`stream_options`)
//! - Reasoning deltas (`thinking` / `reasoning_content`), surfaced wrapped
//!   in `<think>` tags so downstream filters can strip or keep them
//! - Cooperative cancellation between SSE lines

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use storyloom_core::adapter::{ChatTurn, GenerationParams, ModelEndpoint, StreamChunk, Usage};
use storyloom_core::{AdapterError, CancelToken, LlmAdapter, Role};
use tracing::{debug, trace, warn};

/// An OpenAI-compatible LLM adapter.
pub struct OpenAiCompatAdapter {
    name: String,
    client: reqwest::Client,
}

impl OpenAiCompatAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            name: name.into(),
            client,
        }
    }

    fn role_str(role: Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    fn build_body(
        messages: &[ChatTurn],
        endpoint: &ModelEndpoint,
        params: &GenerationParams,
        stream: bool,
    ) -> serde_json::Value {
        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": Self::role_str(m.role),
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": endpoint.model,
            "messages": api_messages,
            "temperature": params.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if let Some(max_tokens) = params.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(top_p) = params.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(fp) = params.frequency_penalty {
            body["frequency_penalty"] = serde_json::json!(fp);
        }
        if let Some(pp) = params.presence_penalty {
            body["presence_penalty"] = serde_json::json!(pp);
        }
        if params.enable_thinking {
            // Vendor-specific passthrough honored by reasoning-capable backends.
            body["enable_thinking"] = serde_json::json!(true);
        }

        body
    }

    fn map_status(status: u16, body: String) -> AdapterError {
        match status {
            429 => AdapterError::RateLimited {
                retry_after_secs: 5,
            },
            401 | 403 => AdapterError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ),
            _ => AdapterError::ApiError {
                status_code: status,
                message: body,
            },
        }
    }
}

#[async_trait]
impl LlmAdapter for OpenAiCompatAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        messages: &[ChatTurn],
        endpoint: &ModelEndpoint,
        params: &GenerationParams,
    ) -> std::result::Result<String, AdapterError> {
        let url = format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/'));
        let body = Self::build_body(messages, endpoint, params, false);

        debug!(adapter = %self.name, model = %endpoint.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", endpoint.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Completion request failed");
            return Err(Self::map_status(status, error_body));
        }

        let api_response: ApiResponse =
            response.json().await.map_err(|e| AdapterError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AdapterError::ApiError {
                status_code: 200,
                message: "No choices in response".into(),
            })
    }

    async fn stream(
        &self,
        messages: &[ChatTurn],
        endpoint: &ModelEndpoint,
        params: &GenerationParams,
        cancel: CancelToken,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, AdapterError>>,
        AdapterError,
    > {
        let url = format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/'));
        let body = Self::build_body(messages, endpoint, params, true);

        debug!(adapter = %self.name, model = %endpoint.model, "Sending streaming request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", endpoint.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Streaming request failed");
            return Err(Self::map_status(status, error_body));
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let adapter_name = self.name.clone();

        // Read the SSE byte stream and re-emit parsed chunks.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                if cancel.is_cancelled() {
                    debug!(adapter = %adapter_name, "Stream cancelled, stopping consumption");
                    let _ = tx.send(Ok(done_chunk(None))).await;
                    return;
                }

                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(AdapterError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Process complete lines
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let data = data.trim();

                    if data == "[DONE]" {
                        let _ = tx.send(Ok(done_chunk(None))).await;
                        return;
                    }

                    match serde_json::from_str::<StreamResponse>(data) {
                        Ok(stream_resp) => {
                            if let Some(choice) = stream_resp.choices.first() {
                                // Reasoning deltas arrive on their own keys;
                                // surface them wrapped so filters can act.
                                let thinking = choice
                                    .delta
                                    .thinking
                                    .as_deref()
                                    .or(choice.delta.reasoning_content.as_deref());
                                if let Some(t) = thinking {
                                    let wrapped = format!("<think>{t}</think>");
                                    if tx
                                        .send(Ok(StreamChunk {
                                            content: Some(wrapped),
                                            done: false,
                                            usage: None,
                                        }))
                                        .await
                                        .is_err()
                                    {
                                        return; // receiver dropped
                                    }
                                }

                                if let Some(content) = &choice.delta.content {
                                    if !content.is_empty()
                                        && tx
                                            .send(Ok(StreamChunk {
                                                content: Some(content.clone()),
                                                done: false,
                                                usage: None,
                                            }))
                                            .await
                                            .is_err()
                                    {
                                        return;
                                    }
                                }
                            }

                            // Usage arrives on the final chunk when
                            // stream_options is honored.
                            if let Some(usage) = stream_resp.usage {
                                let _ = tx
                                    .send(Ok(done_chunk(Some(Usage {
                                        prompt_tokens: usage.prompt_tokens,
                                        completion_tokens: usage.completion_tokens,
                                        total_tokens: usage.total_tokens,
                                    }))))
                                    .await;
                                return;
                            }
                        }
                        Err(e) => {
                            trace!(
                                adapter = %adapter_name,
                                data = %data,
                                error = %e,
                                "Ignoring unparseable SSE chunk"
                            );
                        }
                    }
                }
            }

            // Stream ended without [DONE]
            let _ = tx.send(Ok(done_chunk(None))).await;
        });

        Ok(rx)
    }
}

fn done_chunk(usage: Option<Usage>) -> StreamChunk {
    StreamChunk {
        content: None,
        done: true,
        usage,
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ModelEndpoint {
        ModelEndpoint {
            id: "ep".into(),
            name: "main".into(),
            base_url: "https://api.example.com/v1".into(),
            api_key: "sk-test".into(),
            model: "gpt-4o".into(),
        }
    }

    #[test]
    fn body_includes_optional_params() {
        let params = GenerationParams {
            temperature: 0.9,
            max_tokens: Some(2048),
            top_p: Some(0.95),
            frequency_penalty: None,
            presence_penalty: None,
            enable_thinking: true,
        };
        let messages = vec![ChatTurn::system("sys"), ChatTurn::user("hi")];
        let body = OpenAiCompatAdapter::build_body(&messages, &endpoint(), &params, true);

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 2048);
        assert_eq!(body["enable_thinking"], true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("frequency_penalty").is_none());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn non_streaming_body_omits_stream_options() {
        let body = OpenAiCompatAdapter::build_body(
            &[ChatTurn::user("hi")],
            &endpoint(),
            &GenerationParams::default(),
            false,
        );
        assert_eq!(body["stream"], false);
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            OpenAiCompatAdapter::map_status(429, String::new()),
            AdapterError::RateLimited { .. }
        ));
        assert!(matches!(
            OpenAiCompatAdapter::map_status(401, String::new()),
            AdapterError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            OpenAiCompatAdapter::map_status(500, "oops".into()),
            AdapterError::ApiError {
                status_code: 500,
                ..
            }
        ));
    }

    #[test]
    fn parse_stream_content_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        let parsed: StreamResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.choices[0].delta.content.as_deref(), Some("Hello"));
    }

    #[test]
    fn parse_stream_thinking_delta() {
        let data = r#"{"choices":[{"delta":{"reasoning_content":"hmm"},"finish_reason":null}]}"#;
        let parsed: StreamResponse = serde_json::from_str(data).unwrap();
        assert_eq!(
            parsed.choices[0].delta.reasoning_content.as_deref(),
            Some("hmm")
        );
        assert!(parsed.choices[0].delta.content.is_none());
    }

    #[test]
    fn parse_stream_usage() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let parsed: StreamResponse = serde_json::from_str(data).unwrap();
        let usage = parsed.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn parse_full_response() {
        let data = r#"{"choices":[{"message":{"role":"assistant","content":"done"}}]}"#;
        let parsed: ApiResponse = serde_json::from_str(data).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("done")
        );
    }
}
