//! Messages API backend.
//!
//! One HTTP client serves all four model roles. Requests are throttled by a
//! token-bucket limiter; failures are classified into [`LlmError`] so the
//! retry policy in the core can tell transient errors from permanent ones.
//! This adapter never retries on its own.

mod prompts;
mod types;

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{header, Client as ReqwestClient, Response, StatusCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::domain::errors::LlmError;
use crate::domain::models::{
    Diagnosis, FixSuggestion, Graph, LlmConfig, Message, MetricResult, MetricSpec, PromptChange,
    RateLimitConfig, ToolDefinition,
};
use crate::domain::ports::{
    AgentModel, AgentReply, AgentRequest, ConditionJudge, ConditionRequest, DiagnosisRequest,
    Judge, RequestedToolCall, SimulatorRequest, SimulatorTurn, UserSimulator,
};

pub use prompts::extract_json_object;
use prompts::{ConditionVerdict, MetricVerdict, SimulatorReply};
use types::{
    ApiErrorBody, ApiMessage, ApiTool, ContentBlock, Delta, MessagesRequest, MessagesResponse,
    StreamEvent,
};

/// Simulator and judges run cold so verdicts are stable across retries.
const JUDGE_TEMPERATURE: f32 = 0.0;

/// Language-model backend speaking the Anthropic Messages API.
pub struct AnthropicBackend {
    http_client: ReqwestClient,
    api_key: String,
    base_url: String,
    api_version: String,
    max_tokens: u32,
    rate_limiter: DefaultDirectRateLimiter,
}

impl std::fmt::Debug for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicBackend")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl AnthropicBackend {
    /// Build a backend from configuration. Fails when no API key is configured.
    pub fn new(config: &LlmConfig, rate_limit: &RateLimitConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                LlmError::Authentication(
                    "no API key configured (set llm.api_key or ANTHROPIC_API_KEY)".to_string(),
                )
            })?;

        let http_client = ReqwestClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| LlmError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            max_tokens: config.max_tokens,
            rate_limiter: build_rate_limiter(rate_limit),
        })
    }

    async fn post(&self, request: &MessagesRequest) -> Result<Response, LlmError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .http_client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header(header::CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(&response);
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "failed to read error response".to_string());
        let error = classify_status(status, &body, retry_after);
        warn!(status = status.as_u16(), kind = error.kind(), "model request failed");
        Err(error)
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn send(&self, request: &MessagesRequest) -> Result<MessagesResponse, LlmError> {
        let response = self.post(request).await?;
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(format!("failed to decode response: {e}")))?;
        debug!(id = %parsed.id, stop_reason = ?parsed.stop_reason, "model response received");
        Ok(parsed)
    }

    /// Stream a response, forwarding text deltas as they arrive and
    /// reassembling the full content at the end.
    async fn send_streaming(
        &self,
        request: &MessagesRequest,
        tokens: &mpsc::UnboundedSender<String>,
    ) -> Result<Vec<ContentBlock>, LlmError> {
        let mut response = self.post(request).await?;
        let mut assembler = StreamAssembler::default();
        let mut buffer = String::new();

        while let Some(chunk) = response.chunk().await.map_err(classify_transport_error)? {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                if let Some(event) = parse_sse_line(&line)? {
                    if assembler.apply(event, tokens)? {
                        return Ok(assembler.finish());
                    }
                }
            }
        }
        if let Some(event) = parse_sse_line(&buffer)? {
            assembler.apply(event, tokens)?;
        }
        Ok(assembler.finish())
    }

    async fn complete_json<T: serde::de::DeserializeOwned>(
        &self,
        model: &str,
        system: String,
        user: String,
    ) -> Result<T, LlmError> {
        let request = MessagesRequest {
            model: model.to_string(),
            messages: vec![ApiMessage::user(user)],
            max_tokens: self.max_tokens,
            system: Some(system),
            temperature: Some(JUDGE_TEMPERATURE),
            ..Default::default()
        };
        let response = self.send(&request).await?;
        prompts::parse_json_reply(&response.text())
    }

    fn agent_request(&self, request: &AgentRequest, stream: bool) -> MessagesRequest {
        MessagesRequest {
            model: request.model.clone(),
            messages: prompts::agent_messages(&request.transcript),
            max_tokens: self.max_tokens,
            system: Some(prompts::agent_system_prompt(request)),
            temperature: None,
            tools: request.tools.iter().map(api_tool).collect(),
            stream,
        }
    }
}

fn build_rate_limiter(config: &RateLimitConfig) -> DefaultDirectRateLimiter {
    let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
    let period = Duration::from_secs_f64(1.0 / config.requests_per_second.max(0.001));
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(burst);
    RateLimiter::direct(quota)
}

fn api_tool(tool: &ToolDefinition) -> ApiTool {
    ApiTool {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool
            .parameters
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    }
}

fn agent_reply(blocks: Vec<ContentBlock>) -> AgentReply {
    let mut reply = AgentReply::default();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => reply.content.push_str(&text),
            ContentBlock::ToolUse { name, input, .. } => reply.tool_calls.push(RequestedToolCall {
                name,
                arguments: input,
            }),
            ContentBlock::Other => {}
        }
    }
    reply.content = reply.content.trim().to_string();
    reply
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Map an HTTP error status onto the retry classification.
pub fn classify_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> LlmError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.to_string());
    match status.as_u16() {
        429 => LlmError::RateLimited { retry_after },
        401 | 403 => LlmError::Authentication(message),
        400 | 404 | 413 | 422 => LlmError::InvalidRequest(message),
        408 => LlmError::Timeout,
        code if code >= 500 => LlmError::ServerError {
            status: code,
            message,
        },
        code => LlmError::Other(format!("unexpected status {code}: {message}")),
    }
}

fn classify_transport_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else if err.is_decode() {
        LlmError::MalformedResponse(err.to_string())
    } else {
        LlmError::Network(err.to_string())
    }
}

fn parse_sse_line(line: &str) -> Result<Option<StreamEvent>, LlmError> {
    let Some(data) = line.trim_end().strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    serde_json::from_str(data)
        .map(Some)
        .map_err(|e| LlmError::MalformedResponse(format!("bad stream event: {e}")))
}

/// Accumulates streamed content blocks by index.
#[derive(Default)]
struct StreamAssembler {
    blocks: BTreeMap<usize, PartialBlock>,
}

enum PartialBlock {
    Text(String),
    ToolUse { name: String, json: String },
    Other,
}

impl StreamAssembler {
    /// Returns true once the message is complete.
    fn apply(
        &mut self,
        event: StreamEvent,
        tokens: &mpsc::UnboundedSender<String>,
    ) -> Result<bool, LlmError> {
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let partial = match content_block {
                    ContentBlock::Text { text } => {
                        if !text.is_empty() {
                            let _ = tokens.send(text.clone());
                        }
                        PartialBlock::Text(text)
                    }
                    ContentBlock::ToolUse { name, .. } => PartialBlock::ToolUse {
                        name,
                        json: String::new(),
                    },
                    ContentBlock::Other => PartialBlock::Other,
                };
                self.blocks.insert(index, partial);
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                match (self.blocks.get_mut(&index), delta) {
                    (Some(PartialBlock::Text(buffer)), Delta::TextDelta { text }) => {
                        buffer.push_str(&text);
                        let _ = tokens.send(text);
                    }
                    (Some(PartialBlock::ToolUse { json, .. }), Delta::InputJsonDelta { partial_json }) => {
                        json.push_str(&partial_json);
                    }
                    _ => {}
                }
            }
            StreamEvent::Ignored => {}
            StreamEvent::MessageStop => return Ok(true),
            StreamEvent::Error { error } => {
                return Err(if error.error_type == "overloaded_error" {
                    LlmError::ServerError {
                        status: 529,
                        message: error.message,
                    }
                } else {
                    LlmError::Other(format!("{}: {}", error.error_type, error.message))
                });
            }
        }
        Ok(false)
    }

    fn finish(self) -> Vec<ContentBlock> {
        self.blocks
            .into_values()
            .filter_map(|block| match block {
                PartialBlock::Text(text) => Some(ContentBlock::Text { text }),
                PartialBlock::ToolUse { name, json } => Some(ContentBlock::ToolUse {
                    id: String::new(),
                    input: if json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&json).unwrap_or(Value::String(json))
                    },
                    name,
                }),
                PartialBlock::Other => None,
            })
            .collect()
    }
}

#[async_trait]
impl AgentModel for AnthropicBackend {
    async fn reply(&self, request: &AgentRequest) -> Result<AgentReply, LlmError> {
        let response = self.send(&self.agent_request(request, false)).await?;
        Ok(agent_reply(response.content))
    }

    async fn reply_streaming(
        &self,
        request: &AgentRequest,
        tokens: mpsc::UnboundedSender<String>,
    ) -> Result<AgentReply, LlmError> {
        let blocks = self
            .send_streaming(&self.agent_request(request, true), &tokens)
            .await?;
        Ok(agent_reply(blocks))
    }
}

#[async_trait]
impl UserSimulator for AnthropicBackend {
    async fn next_turn(&self, request: &SimulatorRequest) -> Result<SimulatorTurn, LlmError> {
        let (system, user) = prompts::simulator_prompt(request);
        let reply: SimulatorReply = self.complete_json(&request.model, system, user).await?;
        Ok(SimulatorTurn {
            content: reply.message.trim().to_string(),
            finished: reply.finished,
        })
    }
}

#[async_trait]
impl ConditionJudge for AnthropicBackend {
    async fn holds(&self, request: &ConditionRequest) -> Result<bool, LlmError> {
        let (system, user) = prompts::condition_prompt(request);
        let verdict: ConditionVerdict = self.complete_json(&request.model, system, user).await?;
        Ok(verdict.holds)
    }
}

#[async_trait]
impl Judge for AnthropicBackend {
    async fn evaluate(
        &self,
        model: &str,
        transcript: &[Message],
        metric: &MetricSpec,
    ) -> Result<MetricResult, LlmError> {
        let (system, user) = prompts::metric_prompt(transcript, metric);
        let verdict: MetricVerdict = self.complete_json(model, system, user).await?;
        verdict.into_result(metric)
    }

    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis, LlmError> {
        let (system, user) = prompts::diagnosis_prompt(request)?;
        self.complete_json(&request.model, system, user).await
    }

    async fn suggest_fix(
        &self,
        model: &str,
        graph: &Graph,
        diagnosis: &Diagnosis,
        failed_metrics: &[MetricResult],
    ) -> Result<FixSuggestion, LlmError> {
        let (system, user) = prompts::fix_prompt(graph, diagnosis, failed_metrics)?;
        let fix: FixSuggestion = self.complete_json(model, system, user).await?;
        Ok(fix.normalized())
    }

    async fn revise_fix(
        &self,
        model: &str,
        graph: &Graph,
        diagnosis: &Diagnosis,
        previous_changes: &[PromptChange],
        new_metrics: &[MetricResult],
    ) -> Result<FixSuggestion, LlmError> {
        let (system, user) =
            prompts::revision_prompt(graph, diagnosis, previous_changes, new_metrics)?;
        let fix: FixSuggestion = self.complete_json(model, system, user).await?;
        Ok(fix.normalized())
    }
}
