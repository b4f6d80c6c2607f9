//! Language-model port traits.
//!
//! The core talks to four roles: the agent under test, the simulated caller,
//! the condition judge that decides natural-language transitions, and the
//! metric judge that scores transcripts and proposes repairs. A backend may
//! implement any subset; the same backend usually implements all four.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::domain::errors::LlmError;
use crate::domain::models::{
    Diagnosis, FixSuggestion, Graph, Message, MetricResult, MetricSpec, PromptChange,
    ToolDefinition,
};

/// Everything the agent model needs to produce one in-character reply.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Model id to call.
    pub model: String,
    /// General prompt, already expanded.
    pub general_instructions: Option<String>,
    /// Node the agent is in.
    pub node_id: String,
    /// Node instructions with snippets and variables substituted.
    pub node_instructions: String,
    /// Tools available in this node.
    pub tools: Vec<ToolDefinition>,
    /// Conversation so far.
    pub transcript: Vec<Message>,
}

/// A tool invocation requested by the agent model.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestedToolCall {
    /// Tool name.
    pub name: String,
    /// Arguments as a JSON object.
    pub arguments: Value,
}

/// The agent's reply for one turn: text plus any tool calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentReply {
    /// Spoken text. May be empty when the reply is only tool calls.
    pub content: String,
    /// Tool calls, in the order the model made them.
    pub tool_calls: Vec<RequestedToolCall>,
}

impl AgentReply {
    /// Reply with no tool calls.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    /// Add a tool call.
    pub fn with_tool_call(mut self, name: impl Into<String>, arguments: Value) -> Self {
        self.tool_calls.push(RequestedToolCall {
            name: name.into(),
            arguments,
        });
        self
    }

    /// True if the reply calls `tool_name`.
    pub fn invoked(&self, tool_name: &str) -> bool {
        self.tool_calls.iter().any(|c| c.name == tool_name)
    }
}

/// Plays the agent under test.
#[async_trait]
pub trait AgentModel: Send + Sync {
    /// Produce the agent's next reply.
    async fn reply(&self, request: &AgentRequest) -> Result<AgentReply, LlmError>;

    /// Like [`AgentModel::reply`], forwarding text fragments as they arrive.
    /// The sender is dropped when the call returns.
    ///
    /// Backends without streaming send the whole reply as one fragment.
    async fn reply_streaming(
        &self,
        request: &AgentRequest,
        tokens: mpsc::UnboundedSender<String>,
    ) -> Result<AgentReply, LlmError> {
        let reply = self.reply(request).await?;
        if !reply.content.is_empty() {
            let _ = tokens.send(reply.content.clone());
        }
        Ok(reply)
    }
}

/// Input for one simulated caller turn.
#[derive(Debug, Clone)]
pub struct SimulatorRequest {
    /// Model id to call.
    pub model: String,
    /// Persona and goal from the test case.
    pub scenario: String,
    /// Conversation so far, from the agent's point of view.
    pub transcript: Vec<Message>,
}

/// What the simulated caller says next.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorTurn {
    /// Caller text. Empty when `finished` is set.
    pub content: String,
    /// The persona considers the scenario complete.
    pub finished: bool,
}

impl SimulatorTurn {
    /// Caller says `content`.
    pub fn say(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finished: false,
        }
    }

    /// Caller ends the scenario without speaking.
    pub fn finished() -> Self {
        Self {
            content: String::new(),
            finished: true,
        }
    }
}

/// Plays the caller persona described by a test case.
#[async_trait]
pub trait UserSimulator: Send + Sync {
    /// Produce the caller's next turn.
    async fn next_turn(&self, request: &SimulatorRequest) -> Result<SimulatorTurn, LlmError>;
}

/// Input for judging one `llm_prompt` transition.
#[derive(Debug, Clone)]
pub struct ConditionRequest {
    /// Model id to call.
    pub model: String,
    /// Condition text to judge.
    pub condition: String,
    /// Instructions of the node the transition leaves.
    pub node_instructions: String,
    /// Conversation so far.
    pub transcript: Vec<Message>,
}

/// Decides whether a natural-language transition condition holds.
#[async_trait]
pub trait ConditionJudge: Send + Sync {
    /// True if the condition holds for the transcript.
    async fn holds(&self, request: &ConditionRequest) -> Result<bool, LlmError>;
}

/// Inputs to a failure diagnosis.
#[derive(Debug, Clone)]
pub struct DiagnosisRequest {
    /// Model id to call.
    pub model: String,
    /// Graph the failing test ran against.
    pub graph: Graph,
    /// Transcript of the failing test.
    pub transcript: Vec<Message>,
    /// Nodes the failing test entered.
    pub nodes_visited: Vec<String>,
    /// Metrics that failed.
    pub failed_metrics: Vec<MetricResult>,
    /// Scenario the simulator played.
    pub scenario: String,
}

/// Scores transcripts and diagnoses failures.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Score `transcript` against one metric.
    async fn evaluate(
        &self,
        model: &str,
        transcript: &[Message],
        metric: &MetricSpec,
    ) -> Result<MetricResult, LlmError>;

    /// Locate the cause of a failure in the graph.
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis, LlmError>;

    /// Propose prompt changes for a diagnosed failure.
    async fn suggest_fix(
        &self,
        model: &str,
        graph: &Graph,
        diagnosis: &Diagnosis,
        failed_metrics: &[MetricResult],
    ) -> Result<FixSuggestion, LlmError>;

    /// Revise an earlier fix that did not make the test pass.
    async fn revise_fix(
        &self,
        model: &str,
        graph: &Graph,
        diagnosis: &Diagnosis,
        previous_changes: &[PromptChange],
        new_metrics: &[MetricResult],
    ) -> Result<FixSuggestion, LlmError>;
}
