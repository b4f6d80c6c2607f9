//! Prompt construction for each model role and lenient parsing of the JSON
//! objects the simulator and judges are asked to return.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::domain::errors::LlmError;
use crate::domain::models::message::{format_transcript, TOOL_NAME_KEY};
use crate::domain::models::{
    Diagnosis, Graph, Message, MetricResult, MetricSpec, PromptChange, Role,
};
use crate::domain::ports::{AgentRequest, ConditionRequest, DiagnosisRequest, SimulatorRequest};

use super::types::ApiMessage;

/// Placeholder first turn when a transcript opens with the agent.
const CALL_CONNECTED: &str = "(call connected)";

/// General prompt followed by the current node's instructions.
pub fn agent_system_prompt(request: &AgentRequest) -> String {
    let mut prompt = String::new();
    if let Some(general) = request.general_instructions.as_deref() {
        prompt.push_str(general.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str("## Current step\n");
    prompt.push_str(request.node_instructions.trim());
    prompt.push_str(
        "\n\nReply with what you say next to the caller. Call a tool when the step requires it.",
    );
    prompt
}

/// Map a transcript onto alternating user/assistant turns. Tool responses are
/// folded into the user side; consecutive turns from one side are merged.
pub fn agent_messages(transcript: &[Message]) -> Vec<ApiMessage> {
    let mut messages: Vec<ApiMessage> = Vec::new();
    for message in transcript {
        let (role, content) = match message.role {
            Role::User => ("user", message.content.clone()),
            Role::Assistant => ("assistant", message.content.clone()),
            Role::System => {
                let tool = message
                    .metadata
                    .get(TOOL_NAME_KEY)
                    .and_then(|v| v.as_str())
                    .unwrap_or("system");
                ("user", format!("[{tool} result] {}", message.content))
            }
        };
        if content.trim().is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some(last) if last.role == role => {
                last.content.push('\n');
                last.content.push_str(&content);
            }
            _ => messages.push(ApiMessage { role, content }),
        }
    }
    if messages.first().map_or(true, |m| m.role != "user") {
        messages.insert(0, ApiMessage::user(CALL_CONNECTED));
    }
    messages
}

/// System prompt and user message for the next caller turn. The caller
/// speaks as `user` in the rendered transcript.
pub fn simulator_prompt(request: &SimulatorRequest) -> (String, String) {
    let system = format!(
        "You are role-playing a caller talking to a voice agent. Stay in character.\n\n\
         ## Your scenario\n{}\n\n\
         Respond with a JSON object only: {{\"message\": \"what you say next\", \"finished\": false}}. \
         Set \"finished\" to true when your goal is met or the conversation has clearly ended; \
         \"message\" may then be empty.",
        request.scenario.trim()
    );
    let user = if request.transcript.is_empty() {
        "The call has just connected. Say your opening line.".to_string()
    } else {
        format!(
            "Conversation so far (you are \"user\"):\n{}\n\nWhat do you say next?",
            format_transcript(&request.transcript)
        )
    };
    (system, user)
}

/// Yes/no question about one transition condition.
pub fn condition_prompt(request: &ConditionRequest) -> (String, String) {
    let system = "You decide whether a condition holds for a conversation between a caller \
                  (\"user\") and an agent (\"assistant\"). Respond with a JSON object only: \
                  {\"holds\": true|false, \"reasoning\": \"one sentence\"}."
        .to_string();
    let user = format!(
        "## Agent instructions for the current step\n{}\n\n## Conversation\n{}\n\n## Condition\n{}",
        request.node_instructions.trim(),
        format_transcript(&request.transcript),
        request.condition.trim()
    );
    (system, user)
}

/// Scoring prompt for one metric.
pub fn metric_prompt(transcript: &[Message], metric: &MetricSpec) -> (String, String) {
    let scale = match metric.threshold {
        Some(threshold) => format!(
            "Also give a \"score\" between 0.0 and 1.0; the metric passes at {threshold:.2} or above."
        ),
        None => "A \"score\" between 0.0 and 1.0 is optional.".to_string(),
    };
    let system = format!(
        "You evaluate a conversation between a caller (\"user\") and an agent (\"assistant\") \
         against one criterion. {scale} Respond with a JSON object only: \
         {{\"passed\": true|false, \"score\": 0.0, \"reasoning\": \"...\", \"confidence\": 0.0}}."
    );
    let user = format!(
        "## Criterion\n{}\n\n## Conversation\n{}",
        metric.criteria.trim(),
        format_transcript(transcript)
    );
    (system, user)
}

pub fn diagnosis_prompt(request: &DiagnosisRequest) -> Result<(String, String), LlmError> {
    let system = "You debug conversational agents defined as graphs of prompt nodes. Find where \
                  the graph's prompts caused the failed metrics. Respond with a JSON object only: \
                  {\"fault_locations\": [{\"kind\": \"general_instruction|node_instruction|transition|missing_transition\", \
                  \"node_id\": \"...\", \"quoted_text\": \"...\"}], \"root_cause\": \"...\", \
                  \"transcript_excerpt\": \"...\"}."
        .to_string();
    let user = format!(
        "## Scenario\n{}\n\n## Graph\n{}\n\n## Nodes visited\n{}\n\n## Conversation\n{}\n\n## Failed metrics\n{}",
        request.scenario.trim(),
        graph_json(&request.graph)?,
        request.nodes_visited.join(" -> "),
        format_transcript(&request.transcript),
        describe_metrics(&request.failed_metrics)
    );
    Ok((system, user))
}

const FIX_FORMAT: &str = "Respond with a JSON object only: {\"changes\": [{\"location_kind\": \
    \"general_instruction|node_instruction|transition|missing_transition\", \"node_id\": \"...\", \
    \"transition_target_id\": \"...\", \"original_text\": \"...\", \"proposed_text\": \"...\", \
    \"rationale\": \"...\"}], \"summary\": \"...\", \"confidence\": 0.0}. Proposed text replaces \
    the whole instruction or condition at that location.";

pub fn fix_prompt(
    graph: &Graph,
    diagnosis: &Diagnosis,
    failed_metrics: &[MetricResult],
) -> Result<(String, String), LlmError> {
    let system = format!(
        "You repair conversational agent graphs by rewriting prompt text. Make the smallest \
         change that fixes the diagnosed fault. {FIX_FORMAT}"
    );
    let user = format!(
        "## Graph\n{}\n\n## Diagnosis\n{}\n\n## Failed metrics\n{}",
        graph_json(graph)?,
        to_json(diagnosis)?,
        describe_metrics(failed_metrics)
    );
    Ok((system, user))
}

pub fn revision_prompt(
    graph: &Graph,
    diagnosis: &Diagnosis,
    previous_changes: &[PromptChange],
    new_metrics: &[MetricResult],
) -> Result<(String, String), LlmError> {
    let system = format!(
        "You repair conversational agent graphs by rewriting prompt text. A previous fix was \
         applied and the test still fails. Propose a revised fix against the original graph. \
         {FIX_FORMAT}"
    );
    let user = format!(
        "## Original graph\n{}\n\n## Diagnosis\n{}\n\n## Previous changes\n{}\n\n## Metrics after the previous fix\n{}",
        graph_json(graph)?,
        to_json(diagnosis)?,
        to_json(previous_changes)?,
        describe_metrics(new_metrics)
    );
    Ok((system, user))
}

fn describe_metrics(metrics: &[MetricResult]) -> String {
    metrics
        .iter()
        .map(|m| {
            let score = m.score.map(|s| format!(" (score {s:.2})")).unwrap_or_default();
            let verdict = if m.passed { "passed" } else { "failed" };
            format!("- {}: {verdict}{score}. {}", m.metric, m.reasoning)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn graph_json(graph: &Graph) -> Result<String, LlmError> {
    to_json(graph)
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, LlmError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| LlmError::InvalidRequest(format!("failed to encode prompt context: {e}")))
}

/// The first balanced `{...}` block in `text`, ignoring braces inside strings.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the first JSON object in a model reply, tolerating prose or code fences around it.
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let object = extract_json_object(text)
        .ok_or_else(|| LlmError::MalformedResponse(format!("no JSON object in reply: {text}")))?;
    serde_json::from_str(object)
        .map_err(|e| LlmError::MalformedResponse(format!("{e}: {object}")))
}

/// `{"message": ..., "finished": ...}` from the simulator.
#[derive(Debug, Deserialize)]
pub struct SimulatorReply {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub finished: bool,
}

/// `{"holds": ...}` from the condition judge.
#[derive(Debug, Deserialize)]
pub struct ConditionVerdict {
    pub holds: bool,
}

/// Metric judgement. Either `passed` or `score` must be present.
#[derive(Debug, Deserialize)]
pub struct MetricVerdict {
    #[serde(default)]
    pub passed: Option<bool>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl MetricVerdict {
    /// A verdict with only a score passes at the metric's threshold, or 0.5 without one.
    pub fn into_result(self, metric: &MetricSpec) -> Result<MetricResult, LlmError> {
        let passed = match (self.passed, self.score) {
            (Some(passed), _) => passed,
            (None, Some(score)) => score >= metric.threshold.unwrap_or(0.5),
            (None, None) => {
                return Err(LlmError::MalformedResponse(
                    "metric verdict has neither \"passed\" nor \"score\"".to_string(),
                ))
            }
        };
        Ok(MetricResult {
            metric: metric.name.clone(),
            passed,
            score: self.score,
            threshold: metric.threshold,
            reasoning: self.reasoning,
            confidence: self.confidence,
        })
    }
}
