//! Deterministic in-process model backend.
//!
//! Replays queued replies for every model role. When a queue runs dry the
//! backend falls back to a neutral default: the agent says "Okay.", the
//! simulator finishes the scenario, conditions do not hold, metrics pass.
//! Used by tests and by `rehearse run --dry-run`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::errors::LlmError;
use crate::domain::models::{
    Diagnosis, FixSuggestion, Graph, Message, MetricResult, MetricSpec, PromptChange,
};
use crate::domain::ports::{
    AgentModel, AgentReply, AgentRequest, ConditionJudge, ConditionRequest, DiagnosisRequest,
    Judge, SimulatorRequest, SimulatorTurn, UserSimulator,
};

const DEFAULT_AGENT_REPLY: &str = "Okay.";

#[derive(Default)]
struct Script {
    agent_replies: VecDeque<Result<AgentReply, LlmError>>,
    simulator_turns: VecDeque<Result<SimulatorTurn, LlmError>>,
    condition_verdicts: VecDeque<Result<bool, LlmError>>,
    metric_verdicts: VecDeque<Result<MetricResult, LlmError>>,
    diagnoses: VecDeque<Result<Diagnosis, LlmError>>,
    fixes: VecDeque<Result<FixSuggestion, LlmError>>,
    agent_requests: Vec<AgentRequest>,
    simulator_calls: usize,
    judge_calls: usize,
    revise_calls: usize,
}

/// Model backend that replays scripted responses.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
    agent_delay: Option<Duration>,
}

impl ScriptedBackend {
    /// Backend with empty queues; every role answers with its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before every agent reply.
    pub fn with_agent_delay(mut self, delay: Duration) -> Self {
        self.agent_delay = Some(delay);
        self
    }

    /// Queue plain-text agent replies.
    pub fn with_agent_replies<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for reply in replies {
            self.push_agent_reply(AgentReply::text(reply));
        }
        self
    }

    /// Queue simulated caller lines.
    pub fn with_user_turns<I, S>(self, turns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for turn in turns {
            self.push_user_turn(turn);
        }
        self
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue one agent reply.
    pub fn push_agent_reply(&self, reply: AgentReply) {
        self.script().agent_replies.push_back(Ok(reply));
    }

    /// Make the next agent call fail.
    pub fn push_agent_error(&self, error: LlmError) {
        self.script().agent_replies.push_back(Err(error));
    }

    /// Queue one caller line.
    pub fn push_user_turn(&self, content: impl Into<String>) {
        self.script()
            .simulator_turns
            .push_back(Ok(SimulatorTurn::say(content)));
    }

    /// Queue a caller turn that ends the scenario.
    pub fn push_simulator_finished(&self) {
        self.script()
            .simulator_turns
            .push_back(Ok(SimulatorTurn::finished()));
    }

    /// Make the next simulator call fail.
    pub fn push_simulator_error(&self, error: LlmError) {
        self.script().simulator_turns.push_back(Err(error));
    }

    /// Queue a transition verdict.
    pub fn push_condition(&self, holds: bool) {
        self.script().condition_verdicts.push_back(Ok(holds));
    }

    /// Queue a metric verdict. The metric name and threshold are filled in
    /// from the metric being evaluated.
    pub fn push_metric(&self, passed: bool, score: Option<f64>) {
        let mut verdict = MetricResult::new("", passed, "scripted verdict");
        verdict.score = score;
        self.script().metric_verdicts.push_back(Ok(verdict));
    }

    /// Make the next metric evaluation fail.
    pub fn push_judge_error(&self, error: LlmError) {
        self.script().metric_verdicts.push_back(Err(error));
    }

    /// Queue a diagnosis.
    pub fn push_diagnosis(&self, diagnosis: Diagnosis) {
        self.script().diagnoses.push_back(Ok(diagnosis));
    }

    /// Queue a fix. Shared by first suggestions and revisions.
    pub fn push_fix(&self, fix: FixSuggestion) {
        self.script().fixes.push_back(Ok(fix));
    }

    /// Every agent request received so far.
    pub fn agent_requests(&self) -> Vec<AgentRequest> {
        self.script().agent_requests.clone()
    }

    /// Number of simulator calls so far.
    pub fn simulator_calls(&self) -> usize {
        self.script().simulator_calls
    }

    /// Number of metric evaluations so far.
    pub fn judge_calls(&self) -> usize {
        self.script().judge_calls
    }

    /// Number of fix revisions so far.
    pub fn revise_calls(&self) -> usize {
        self.script().revise_calls
    }
}

#[async_trait]
impl AgentModel for ScriptedBackend {
    async fn reply(&self, request: &AgentRequest) -> Result<AgentReply, LlmError> {
        if let Some(delay) = self.agent_delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script();
        script.agent_requests.push(request.clone());
        script
            .agent_replies
            .pop_front()
            .unwrap_or_else(|| Ok(AgentReply::text(DEFAULT_AGENT_REPLY)))
    }
}

#[async_trait]
impl UserSimulator for ScriptedBackend {
    async fn next_turn(&self, _request: &SimulatorRequest) -> Result<SimulatorTurn, LlmError> {
        let mut script = self.script();
        script.simulator_calls += 1;
        script
            .simulator_turns
            .pop_front()
            .unwrap_or_else(|| Ok(SimulatorTurn::finished()))
    }
}

#[async_trait]
impl ConditionJudge for ScriptedBackend {
    async fn holds(&self, _request: &ConditionRequest) -> Result<bool, LlmError> {
        self.script()
            .condition_verdicts
            .pop_front()
            .unwrap_or(Ok(false))
    }
}

#[async_trait]
impl Judge for ScriptedBackend {
    async fn evaluate(
        &self,
        _model: &str,
        _transcript: &[Message],
        metric: &MetricSpec,
    ) -> Result<MetricResult, LlmError> {
        let mut script = self.script();
        script.judge_calls += 1;
        let verdict = script
            .metric_verdicts
            .pop_front()
            .unwrap_or_else(|| Ok(MetricResult::new("", true, "scripted verdict")))?;
        Ok(MetricResult {
            metric: metric.name.clone(),
            threshold: metric.threshold,
            ..verdict
        })
    }

    async fn diagnose(&self, _request: &DiagnosisRequest) -> Result<Diagnosis, LlmError> {
        self.script().diagnoses.pop_front().unwrap_or_else(|| {
            Ok(Diagnosis {
                fault_locations: Vec::new(),
                root_cause: "no scripted diagnosis".to_string(),
                transcript_excerpt: String::new(),
            })
        })
    }

    async fn suggest_fix(
        &self,
        _model: &str,
        _graph: &Graph,
        _diagnosis: &Diagnosis,
        _failed_metrics: &[MetricResult],
    ) -> Result<FixSuggestion, LlmError> {
        self.script()
            .fixes
            .pop_front()
            .unwrap_or_else(|| Ok(FixSuggestion::new(Vec::new(), "no scripted fix", 0.0)))
    }

    async fn revise_fix(
        &self,
        _model: &str,
        _graph: &Graph,
        _diagnosis: &Diagnosis,
        _previous_changes: &[PromptChange],
        _new_metrics: &[MetricResult],
    ) -> Result<FixSuggestion, LlmError> {
        let mut script = self.script();
        script.revise_calls += 1;
        script
            .fixes
            .pop_front()
            .unwrap_or_else(|| Ok(FixSuggestion::new(Vec::new(), "no scripted fix", 0.0)))
    }
}
