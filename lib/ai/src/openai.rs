//! Client for OpenAI-compatible chat completion endpoints.

use crate::backend::{
    ChunkStream, Choice, CompletionRequest, CompletionResponse, CompletionService, FinishReason,
    TokenUsage,
};
use crate::error::CompletionError;
use crate::sse::completion_chunks;
use async_trait::async_trait;
use colloquy_conversation::{Message, MessageBody, ToolCallRequest, ToolDefinition};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use tracing::{debug, instrument, warn};

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL, without the `/chat/completions` suffix.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token, if the endpoint needs one.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Whole-request timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Completion service backed by an OpenAI-compatible HTTP API.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self, Report<CompletionError>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CompletionError::InvalidConfig {
                reason: e.to_string(),
            })?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
        })
    }

    /// Returns the chat completions URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, body: &JsonValue) -> Result<reqwest::Response, Report<CompletionError>> {
        let mut request = self.http.post(&self.endpoint).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            warn!(error = %e, endpoint = %self.endpoint, "completion request failed");
            if e.is_timeout() {
                CompletionError::Timeout
            } else {
                CompletionError::ProviderUnavailable {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(CompletionError::RateLimited { retry_after_secs }.into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "completion endpoint returned error");
            return Err(CompletionError::RequestFailed {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionService for OpenAiClient {
    #[instrument(skip(self, request), fields(model = %request.options.model, messages = request.messages.len()))]
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, Report<CompletionError>> {
        let body = request_body(request, false);
        let response = self.send(&body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| CompletionError::ResponseParseFailed {
                reason: e.to_string(),
            })?;
        let parsed = parse_response(&text)?;
        debug!(
            tokens = parsed.usage.total(),
            has_choice = parsed.choice.is_some(),
            "completion received"
        );
        Ok(parsed)
    }

    #[instrument(skip(self, request), fields(model = %request.options.model, messages = request.messages.len()))]
    async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, Report<CompletionError>> {
        let body = request_body(request, true);
        let response = self.send(&body).await?;

        Ok(completion_chunks(response.bytes_stream()))
    }
}

/// Builds the JSON request body.
#[must_use]
pub fn request_body(request: &CompletionRequest, stream: bool) -> JsonValue {
    let mut body = json!({
        "model": request.options.model,
        "messages": request.messages.iter().map(wire_message).collect::<Vec<_>>(),
        "stream": stream,
    });
    if !request.tools.is_empty() {
        body["tools"] = JsonValue::Array(request.tools.iter().map(wire_tool).collect());
        body["tool_choice"] = json!("auto");
    }
    if let Some(max_tokens) = request.options.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.options.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.options.top_p {
        body["top_p"] = json!(top_p);
    }
    body
}

fn wire_message(message: &Message) -> JsonValue {
    match &message.body {
        MessageBody::System { content } => json!({ "role": "system", "content": content }),
        MessageBody::User { content } => json!({ "role": "user", "content": content }),
        MessageBody::Assistant {
            content,
            tool_calls,
        } => {
            let mut wire = json!({ "role": "assistant", "content": content });
            if !tool_calls.is_empty() {
                wire["tool_calls"] = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": { "name": call.name, "arguments": call.arguments },
                        })
                    })
                    .collect();
            }
            wire
        }
        MessageBody::Tool {
            tool_call_id,
            content,
        } => json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content }),
    }
}

fn wire_tool(tool: &ToolDefinition) -> JsonValue {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        },
    })
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Parses a blocking completion response body.
///
/// # Errors
///
/// Returns an error if the body is not a completion response.
pub fn parse_response(body: &str) -> Result<CompletionResponse, Report<CompletionError>> {
    let wire: WireResponse =
        serde_json::from_str(body).map_err(|e| CompletionError::ResponseParseFailed {
            reason: e.to_string(),
        })?;

    let choice = wire.choices.into_iter().next().map(|choice| Choice {
        text: choice.message.content.unwrap_or_default(),
        tool_calls: choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCallRequest::new(tc.id, tc.function.name, tc.function.arguments))
            .collect(),
        finish_reason: choice
            .finish_reason
            .as_deref()
            .map_or(FinishReason::Stop, FinishReason::parse),
    });

    Ok(CompletionResponse {
        choice,
        usage: wire
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default(),
        model: wire.model,
    })
}
