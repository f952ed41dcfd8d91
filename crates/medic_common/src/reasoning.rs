//! Reasoning Service Abstraction
//!
//! The remote model is an opaque capability:
//! `converse(turns, system, tools) -> response`.
//! Supports a real HTTP backend (messages-style JSON API) and a scripted
//! fake that replays canned tool-use / final-answer sequences for testing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::ReasoningSettings;

const API_VERSION: &str = "2023-06-01";

/// Conversation roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

impl Role {
    /// Roles that travel as `user` messages
    pub fn is_user_side(&self) -> bool {
        matches!(self, Role::User | Role::ToolResult)
    }
}

/// One block of turn content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Tool schema advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Why the model stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ToolUse,
    End,
}

/// Token counts, opaque to the core
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One round-trip request
#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    pub system: String,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolSchema>,
}

/// One round-trip response
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningResponse {
    pub stop_reason: StopReason,
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
}

impl ReasoningResponse {
    /// Final answer made of one text block
    pub fn text(text: &str) -> Self {
        Self {
            stop_reason: StopReason::End,
            content: vec![ContentBlock::text(text)],
            usage: Usage::default(),
        }
    }

    /// Tool-use response; each call is `(id, name, input)`
    pub fn tool_use(calls: Vec<(&str, &str, serde_json::Value)>) -> Self {
        Self {
            stop_reason: StopReason::ToolUse,
            content: calls
                .into_iter()
                .map(|(id, name, input)| ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input,
                })
                .collect(),
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Usage {
            input_tokens,
            output_tokens,
        };
        self
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// All text blocks, concatenated
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Reasoning service errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReasoningError {
    #[error("No API key: set the {0} environment variable")]
    MissingApiKey(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timeout after {0} seconds")]
    Timeout(u64),
}

/// The remote model
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn converse(&self, request: &ReasoningRequest)
        -> Result<ReasoningResponse, ReasoningError>;
}

// ============================================================================
// HTTP backend
// ============================================================================

/// Messages-style HTTP client
pub struct HttpReasoningService {
    settings: ReasoningSettings,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSchema>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct WireError {
    error: WireErrorBody,
}

#[derive(Deserialize)]
struct WireErrorBody {
    message: String,
}

impl HttpReasoningService {
    pub fn new(settings: ReasoningSettings) -> Result<Self, ReasoningError> {
        let api_key = settings
            .api_key()
            .ok_or_else(|| ReasoningError::MissingApiKey(settings.api_key_env.clone()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| ReasoningError::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            settings,
            api_key,
            client,
        })
    }

    /// Tool results travel as user messages with string content
    fn to_wire(turn: &Turn) -> WireMessage {
        let role = match turn.role {
            Role::Assistant => "assistant",
            Role::User | Role::ToolResult => "user",
        };
        let content = turn
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let text = match content {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": text,
                        "is_error": is_error,
                    })
                }
                other => serde_json::to_value(other).unwrap_or(serde_json::Value::Null),
            })
            .collect();
        WireMessage { role, content }
    }
}

#[async_trait]
impl ReasoningService for HttpReasoningService {
    async fn converse(
        &self,
        request: &ReasoningRequest,
    ) -> Result<ReasoningResponse, ReasoningError> {
        let body = WireRequest {
            model: &self.settings.model,
            max_tokens: self.settings.max_tokens,
            system: &request.system,
            messages: request.turns.iter().map(Self::to_wire).collect(),
            tools: request.tools.clone(),
        };

        let response = self
            .client
            .post(&self.settings.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReasoningError::Timeout(self.settings.request_timeout_secs)
                } else {
                    ReasoningError::Http(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ReasoningError::Http(format!("Failed to read body: {}", e)))?;

        if !status.is_success() {
            let message = serde_json::from_str::<WireError>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(ReasoningError::Api {
                status: status.as_u16(),
                message,
            });
        }

        parse_wire_response(&text)
    }
}

fn parse_wire_response(text: &str) -> Result<ReasoningResponse, ReasoningError> {
    let wire: WireResponse = serde_json::from_str(text)
        .map_err(|e| ReasoningError::InvalidResponse(format!("{}", e)))?;

    let has_tool_calls = wire
        .content
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
    let stop_reason = match wire.stop_reason.as_deref() {
        Some("tool_use") if has_tool_calls => StopReason::ToolUse,
        _ => StopReason::End,
    };

    Ok(ReasoningResponse {
        stop_reason,
        content: wire.content,
        usage: wire.usage,
    })
}

// ============================================================================
// Scripted fake
// ============================================================================

/// Replays canned responses in order and records every request
pub struct ScriptedReasoningService {
    responses: Mutex<VecDeque<Result<ReasoningResponse, ReasoningError>>>,
    repeat_last: bool,
    delay: Option<Duration>,
    requests: Mutex<Vec<ReasoningRequest>>,
}

impl ScriptedReasoningService {
    pub fn new(responses: Vec<Result<ReasoningResponse, ReasoningError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            repeat_last: false,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Convenience for all-successful scripts
    pub fn replies(responses: Vec<ReasoningResponse>) -> Self {
        Self::new(responses.into_iter().map(Ok).collect())
    }

    /// Keep returning the last response once the script runs out
    pub fn repeating(response: ReasoningResponse) -> Self {
        let mut service = Self::replies(vec![response]);
        service.repeat_last = true;
        service
    }

    /// Sleep before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<ReasoningRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoningService {
    async fn converse(
        &self,
        request: &ReasoningRequest,
    ) -> Result<ReasoningResponse, ReasoningError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut responses = self
            .responses
            .lock()
            .map_err(|_| ReasoningError::InvalidResponse("script poisoned".to_string()))?;
        if self.repeat_last && responses.len() == 1 {
            return responses[0].clone();
        }
        responses
            .pop_front()
            .unwrap_or_else(|| Err(ReasoningError::InvalidResponse("script exhausted".to_string())))
    }
}
