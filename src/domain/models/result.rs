//! Test results and metric scores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::message::Message;

/// Lifecycle status of one test result.
///
/// `running` is the only non-terminal state; a result enters exactly one
/// terminal state exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// Placeholder state while the test executes.
    #[default]
    Running,
    /// Every metric passed.
    Pass,
    /// At least one metric failed.
    Fail,
    /// The test could not be executed or scored.
    Error,
    /// Cancelled before it started, or stopped by shutdown.
    Cancelled,
}

impl TestStatus {
    /// Lowercase label used in storage and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a stored label. Accepts `passed`, `failed` and `canceled` spellings.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" => Some(Self::Running),
            "pass" | "passed" => Some(Self::Pass),
            "fail" | "failed" => Some(Self::Fail),
            "error" => Some(Self::Error),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// True for every status except `running`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Only `running` may move, and only to a terminal status.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(self, Self::Running) && next.is_terminal()
    }
}

/// Why a simulated conversation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The agent invoked the end-call tool.
    AgentEndedCall,
    /// The simulator reported the scenario complete.
    SimulatorFinished,
    /// The turn limit was reached.
    MaxTurns,
    /// The per-test time limit expired.
    Timeout,
    /// The cancellation token tripped mid-conversation.
    Cancelled,
    /// A model or graph error stopped the conversation.
    Error,
}

impl EndReason {
    /// Snake_case label used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentEndedCall => "agent_ended_call",
            Self::SimulatorFinished => "simulator_finished",
            Self::MaxTurns => "max_turns",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Parse a stored label.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "agent_ended_call" => Some(Self::AgentEndedCall),
            "simulator_finished" => Some(Self::SimulatorFinished),
            "max_turns" => Some(Self::MaxTurns),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Score for one metric of one test execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    /// Metric name, or a rule label such as `includes: 7pm`.
    pub metric: String,
    /// Whether the metric passed.
    pub passed: bool,
    /// Judge score in [0, 1], when the judge gave one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Pass threshold the score was compared against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Judge's explanation.
    #[serde(default)]
    pub reasoning: String,
    /// Judge's confidence in the verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl MetricResult {
    /// Unscored result.
    pub fn new(metric: impl Into<String>, passed: bool, reasoning: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            passed,
            score: None,
            threshold: None,
            reasoning: reasoning.into(),
            confidence: None,
        }
    }

    /// Attach a score.
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Numeric value used when averaging scores: the score when present,
    /// otherwise 1.0 for a pass and 0.0 for a fail.
    pub fn effective_score(&self) -> f64 {
        self.score
            .unwrap_or(if self.passed { 1.0 } else { 0.0 })
    }
}

/// A tool invocation made by the agent during a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Tool name as called by the agent.
    pub name: String,
    /// Arguments passed by the agent.
    #[serde(default)]
    pub arguments: Value,
    /// Node the agent was in when it made the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// What one test execution produced, before it is attached to a stored result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Terminal status.
    pub status: TestStatus,
    /// Full conversation, including tool results.
    pub transcript: Vec<Message>,
    /// Metric and rule scores, in evaluation order.
    pub metric_results: Vec<MetricResult>,
    /// Nodes entered, starting with the entry node.
    pub nodes_visited: Vec<String>,
    /// Tool calls in the order they were made.
    pub tools_called: Vec<ToolCallRecord>,
    /// Wall-clock duration of the execution.
    pub duration_ms: u64,
    /// Why the conversation stopped.
    pub end_reason: EndReason,
    /// Error text for `error` outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TestOutcome {
    /// Metrics that did not pass.
    pub fn failed_metrics(&self) -> Vec<MetricResult> {
        self.metric_results
            .iter()
            .filter(|m| !m.passed)
            .cloned()
            .collect()
    }
}

/// The stored, scored outcome of one test case within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Result id, assigned when the placeholder is created.
    pub id: Uuid,
    /// Run this result belongs to.
    pub run_id: Uuid,
    /// Id of the test case that produced it.
    pub test_case_id: String,
    /// Test case name at the time of the run.
    pub test_name: String,
    /// Current status. Starts as `running`.
    pub status: TestStatus,
    /// Conversation so far. Updated after every turn.
    #[serde(default)]
    pub transcript: Vec<Message>,
    /// Metric and rule scores.
    #[serde(default)]
    pub metric_results: Vec<MetricResult>,
    /// Nodes entered, starting with the entry node.
    #[serde(default)]
    pub nodes_visited: Vec<String>,
    /// Tool calls the agent made.
    #[serde(default)]
    pub tools_called: Vec<ToolCallRecord>,
    /// Duration of the execution; 0 until it finishes.
    pub duration_ms: u64,
    /// Set once the result is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    /// Error text for `error` results, and for orphaned runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the placeholder was created.
    pub created_at: DateTime<Utc>,
    /// Last write to this result.
    pub updated_at: DateTime<Utc>,
}

impl TestResult {
    /// Empty `running` placeholder.
    pub fn pending(run_id: Uuid, test_case_id: impl Into<String>, test_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            run_id,
            test_case_id: test_case_id.into(),
            test_name: test_name.into(),
            status: TestStatus::Running,
            transcript: Vec::new(),
            metric_results: Vec::new(),
            nodes_visited: Vec::new(),
            tools_called: Vec::new(),
            duration_ms: 0,
            end_reason: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once the result has left `running`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Copy an execution outcome onto this result.
    pub fn apply_outcome(&mut self, outcome: &TestOutcome) {
        self.status = outcome.status;
        self.transcript.clone_from(&outcome.transcript);
        self.metric_results.clone_from(&outcome.metric_results);
        self.nodes_visited.clone_from(&outcome.nodes_visited);
        self.tools_called.clone_from(&outcome.tools_called);
        self.duration_ms = outcome.duration_ms;
        self.end_reason = Some(outcome.end_reason);
        self.error_message.clone_from(&outcome.error_message);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [
            TestStatus::Running,
            TestStatus::Pass,
            TestStatus::Fail,
            TestStatus::Error,
            TestStatus::Cancelled,
        ] {
            assert_eq!(TestStatus::from_str(status.as_str()), Some(status));
        }
        assert!(!TestStatus::Running.is_terminal());
        assert!(TestStatus::Cancelled.is_terminal());
        assert_eq!(TestStatus::from_str("canceled"), Some(TestStatus::Cancelled));
    }

    #[test]
    fn test_only_running_can_transition() {
        assert!(TestStatus::Running.can_transition_to(TestStatus::Pass));
        assert!(!TestStatus::Running.can_transition_to(TestStatus::Running));
        assert!(!TestStatus::Pass.can_transition_to(TestStatus::Error));
        assert!(!TestStatus::Cancelled.can_transition_to(TestStatus::Pass));
    }

    #[test]
    fn test_effective_score() {
        assert!((MetricResult::new("m", true, "").effective_score() - 1.0).abs() < f64::EPSILON);
        assert!(MetricResult::new("m", false, "").effective_score().abs() < f64::EPSILON);
        let scored = MetricResult::new("m", false, "").with_score(0.4);
        assert!((scored.effective_score() - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_apply_outcome() {
        let mut result = TestResult::pending(Uuid::new_v4(), "t1", "first");
        let outcome = TestOutcome {
            status: TestStatus::Fail,
            transcript: vec![Message::user("hi")],
            metric_results: vec![MetricResult::new("m", false, "no")],
            nodes_visited: vec!["a".into()],
            tools_called: vec![],
            duration_ms: 12,
            end_reason: EndReason::MaxTurns,
            error_message: None,
        };
        result.apply_outcome(&outcome);
        assert_eq!(result.status, TestStatus::Fail);
        assert_eq!(result.end_reason, Some(EndReason::MaxTurns));
        assert_eq!(result.transcript.len(), 1);
        assert_eq!(outcome.failed_metrics().len(), 1);
    }
}
