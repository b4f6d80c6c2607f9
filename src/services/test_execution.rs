//! Test execution: runs one test case to a terminal outcome.
//!
//! Alternates simulated-user turns with conversation-engine turns until the
//! agent ends the call, the simulator finishes, the turn cap is reached, or
//! the timeout elapses. Then scores the transcript: deterministic rule checks
//! first, then one judge call per metric.

use std::time::{Duration, Instant};

use regex::RegexBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    EndReason, GlobalMetric, Graph, Message, MetricResult, MetricSpec, Role, RuleChecks,
    RunOptions, TestCase, TestOutcome, TestStatus,
};
use crate::domain::ports::SimulatorRequest;
use crate::services::conversation_engine::ConversationEngine;
use crate::services::model_gateway::{EventSink, ModelGateway, ModelSet, TestEvent};
use crate::services::retry_policy::RetryPolicy;

/// Inputs for one test execution.
pub struct TestExecution<'a> {
    /// Graph the agent runs on.
    pub graph: &'a Graph,
    /// Scenario to play.
    pub test_case: &'a TestCase,
    /// Agent-wide metrics scored after the per-test ones.
    pub global_metrics: &'a [GlobalMetric],
    /// Models and limits. The test case may override the limits.
    pub options: &'a RunOptions,
    /// Sink for transcript, token and retry events.
    pub events: Option<&'a EventSink>,
    /// Tripping this stops the conversation with a `cancelled` outcome.
    pub cancel: CancellationToken,
}

impl<'a> TestExecution<'a> {
    /// Execution with no global metrics, no event sink and a fresh cancellation token.
    pub fn new(graph: &'a Graph, test_case: &'a TestCase, options: &'a RunOptions) -> Self {
        Self {
            graph,
            test_case,
            global_metrics: &[],
            options,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Score these agent-wide metrics too. Disabled ones are skipped.
    pub fn with_global_metrics(mut self, metrics: &'a [GlobalMetric]) -> Self {
        self.global_metrics = metrics;
        self
    }

    /// Report progress to `events`.
    pub fn with_events(mut self, events: &'a EventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Share an existing cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn max_turns(&self) -> u32 {
        self.test_case.max_turns.unwrap_or(self.options.max_turns)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.test_case.timeout_secs.unwrap_or(self.options.timeout_secs))
    }

    /// Per-test metrics followed by the agent's enabled global metrics.
    fn metric_specs(&self) -> Vec<MetricSpec> {
        self.test_case
            .metrics
            .iter()
            .map(|text| MetricSpec::from_text(text))
            .chain(
                self.global_metrics
                    .iter()
                    .filter(|m| m.enabled)
                    .map(MetricSpec::from),
            )
            .collect()
    }
}

/// Runs test cases against a set of models.
#[derive(Debug, Clone)]
pub struct TestRunner {
    models: ModelSet,
    retry: RetryPolicy,
}

impl TestRunner {
    /// Runner calling `models` through `retry`.
    pub fn new(models: ModelSet, retry: RetryPolicy) -> Self {
        Self { models, retry }
    }

    /// Models in use.
    pub fn models(&self) -> &ModelSet {
        &self.models
    }

    /// Retry policy applied to every model call.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run one test to completion. Never fails: errors become an `error`
    /// outcome carrying the partial transcript.
    #[instrument(skip_all, fields(test_id = %execution.test_case.id, test_name = %execution.test_case.name))]
    pub async fn execute(&self, execution: TestExecution<'_>) -> TestOutcome {
        let started = Instant::now();
        let gateway = ModelGateway::new(&self.models, &self.retry, execution.events);
        let mut engine = ConversationEngine::new(
            execution.graph,
            execution.test_case.dynamic_variables.clone(),
        )
        .with_tool_mocks(&execution.test_case.tool_mocks);

        let ending = tokio::select! {
            biased;
            () = execution.cancel.cancelled() => Ok(EndReason::Cancelled),
            () = tokio::time::sleep(execution.timeout()) => Ok(EndReason::Timeout),
            ending = simulate(&mut engine, &gateway, &execution) => ending,
        };

        let mut outcome = TestOutcome {
            status: TestStatus::Running,
            transcript: engine.transcript().to_vec(),
            metric_results: Vec::new(),
            nodes_visited: engine.nodes_visited().to_vec(),
            tools_called: engine.tools_called().to_vec(),
            duration_ms: 0,
            end_reason: EndReason::Error,
            error_message: None,
        };

        match ending {
            Ok(EndReason::Cancelled) => {
                info!("test cancelled mid-conversation");
                outcome.status = TestStatus::Cancelled;
                outcome.end_reason = EndReason::Cancelled;
            }
            Ok(end_reason) => {
                outcome.end_reason = end_reason;
                let scored = tokio::select! {
                    biased;
                    () = execution.cancel.cancelled() => None,
                    scored = score(&gateway, &execution, &outcome.transcript) => Some(scored),
                };
                match scored {
                    None => {
                        outcome.status = TestStatus::Cancelled;
                        outcome.end_reason = EndReason::Cancelled;
                    }
                    Some(Ok(metric_results)) => {
                        outcome.status = if metric_results.iter().all(|m| m.passed) {
                            TestStatus::Pass
                        } else {
                            TestStatus::Fail
                        };
                        outcome.metric_results = metric_results;
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "metric evaluation failed");
                        outcome.status = TestStatus::Error;
                        outcome.error_message = Some(format!("metric evaluation failed: {err}"));
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "test execution failed");
                outcome.status = TestStatus::Error;
                outcome.end_reason = EndReason::Error;
                outcome.error_message = Some(err.to_string());
            }
        }

        outcome.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            status = outcome.status.as_str(),
            end_reason = outcome.end_reason.as_str(),
            turns = outcome.transcript.iter().filter(|m| m.role == Role::User).count(),
            duration_ms = outcome.duration_ms,
            "test finished"
        );
        outcome
    }
}

async fn simulate(
    engine: &mut ConversationEngine<'_>,
    gateway: &ModelGateway<'_>,
    execution: &TestExecution<'_>,
) -> DomainResult<EndReason> {
    let max_turns = execution.max_turns();

    for turn in 1..=max_turns {
        let request = SimulatorRequest {
            model: execution.options.simulator_model.clone(),
            scenario: execution.test_case.user_prompt.clone(),
            transcript: engine.transcript().to_vec(),
        };
        let user_turn = gateway.simulator_turn(&request).await?;
        if user_turn.finished && user_turn.content.trim().is_empty() {
            debug!(turn, "simulator finished the scenario");
            return Ok(EndReason::SimulatorFinished);
        }

        let outcome = engine
            .process_turn(&user_turn.content, gateway, execution.options)
            .await?;
        gateway.emit(TestEvent::Turn {
            transcript: engine.transcript().to_vec(),
        });
        debug!(turn, node_id = engine.current_node_id(), "turn complete");

        if outcome.ended {
            return Ok(EndReason::AgentEndedCall);
        }
        if user_turn.finished {
            return Ok(EndReason::SimulatorFinished);
        }
    }

    debug!(max_turns, "turn cap reached");
    Ok(EndReason::MaxTurns)
}

async fn score(
    gateway: &ModelGateway<'_>,
    execution: &TestExecution<'_>,
    transcript: &[Message],
) -> DomainResult<Vec<MetricResult>> {
    let mut results = match &execution.test_case.rules {
        Some(rules) => evaluate_rules(rules, transcript)?,
        None => Vec::new(),
    };

    for spec in execution.metric_specs() {
        let verdict = gateway
            .evaluate(&execution.options.judge_model, transcript, &spec)
            .await?;
        results.push(apply_threshold(verdict, &spec));
    }
    Ok(results)
}

/// A numeric score with a threshold decides the verdict; otherwise the
/// judge's boolean stands.
fn apply_threshold(mut verdict: MetricResult, spec: &MetricSpec) -> MetricResult {
    verdict.metric.clone_from(&spec.name);
    if verdict.threshold.is_none() {
        verdict.threshold = spec.threshold;
    }
    if let (Some(score), Some(threshold)) = (verdict.score, verdict.threshold) {
        verdict.passed = score >= threshold;
    }
    verdict
}

/// Deterministic checks over everything the agent said.
pub fn evaluate_rules(rules: &RuleChecks, transcript: &[Message]) -> DomainResult<Vec<MetricResult>> {
    let spoken = transcript
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let lowered = spoken.to_lowercase();
    let mut results = Vec::new();

    for text in &rules.includes {
        let found = lowered.contains(&text.to_lowercase());
        let reasoning = if found {
            format!("agent said '{text}'")
        } else {
            format!("agent never said '{text}'")
        };
        results.push(MetricResult::new(format!("includes: {text}"), found, reasoning));
    }

    for text in &rules.excludes {
        let found = lowered.contains(&text.to_lowercase());
        let reasoning = if found {
            format!("agent said forbidden text '{text}'")
        } else {
            format!("agent avoided '{text}'")
        };
        results.push(MetricResult::new(format!("excludes: {text}"), !found, reasoning));
    }

    for pattern in &rules.patterns {
        let regex = RegexBuilder::new(pattern)
            .multi_line(true)
            .build()
            .map_err(|e| DomainError::ValidationFailed(format!("invalid rule pattern '{pattern}': {e}")))?;
        let matched = regex.is_match(&spoken);
        let reasoning = if matched {
            format!("pattern /{pattern}/ matched")
        } else {
            format!("pattern /{pattern}/ did not match")
        };
        results.push(MetricResult::new(format!("pattern: {pattern}"), matched, reasoning));
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::llm::ScriptedBackend;
    use crate::domain::errors::LlmError;
    use crate::domain::models::{Condition, Node, Transition};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn options(max_turns: u32) -> RunOptions {
        RunOptions {
            agent_model: "agent".into(),
            simulator_model: "sim".into(),
            judge_model: "judge".into(),
            max_turns,
            timeout_secs: 60,
        }
    }

    fn looping_graph() -> Graph {
        Graph::new("loop")
            .with_node(Node::new("loop", "Keep talking.").with_transition(Transition::always("loop")))
    }

    fn runner(backend: &Arc<ScriptedBackend>) -> TestRunner {
        TestRunner::new(
            ModelSet::from_backend(backend.clone()),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    #[tokio::test]
    async fn test_turn_cap_halts_conversation() {
        let backend = Arc::new(ScriptedBackend::new().with_user_turns(["a", "b", "c", "d", "e"]));
        let graph = looping_graph();
        let test_case = TestCase::new("t1", "cap", "chat forever");
        let options = options(2);

        let outcome = runner(&backend)
            .execute(TestExecution::new(&graph, &test_case, &options))
            .await;

        assert_eq!(outcome.end_reason, EndReason::MaxTurns);
        assert_eq!(outcome.status, TestStatus::Pass);
        assert_eq!(backend.simulator_calls(), 2);
        assert_eq!(outcome.transcript.len(), 4);
        assert_eq!(outcome.nodes_visited, ["loop", "loop", "loop"]);
    }

    #[tokio::test]
    async fn test_per_test_turn_cap_overrides_options() {
        let backend = Arc::new(ScriptedBackend::new().with_user_turns(["a", "b", "c"]));
        let graph = looping_graph();
        let test_case = TestCase::new("t1", "cap", "chat").with_max_turns(1);
        let options = options(10);

        let outcome = runner(&backend)
            .execute(TestExecution::new(&graph, &test_case, &options))
            .await;
        assert_eq!(outcome.end_reason, EndReason::MaxTurns);
        assert_eq!(backend.simulator_calls(), 1);
    }

    #[tokio::test]
    async fn test_dynamic_variables_drive_text_and_equations() {
        let backend = Arc::new(ScriptedBackend::new().with_user_turns(["hi"]));
        backend.push_simulator_finished();
        let graph = Graph::new("start")
            .with_node(
                Node::new("start", "Hello {{name}}.")
                    .with_transition(Transition::new("vip", Condition::equation("tier == gold"))),
            )
            .with_node(Node::new("vip", "VIP desk."));
        let test_case = TestCase::new("t1", "vip", "you are a gold member")
            .with_variable("name", serde_json::json!("Ada"))
            .with_variable("tier", serde_json::json!("gold"));
        let options = options(5);

        let outcome = runner(&backend)
            .execute(TestExecution::new(&graph, &test_case, &options))
            .await;

        assert_eq!(outcome.end_reason, EndReason::SimulatorFinished);
        assert_eq!(outcome.nodes_visited, ["start", "vip"]);
        assert_eq!(backend.simulator_calls(), 2);
        let requests = backend.agent_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].node_instructions, "Hello Ada.");
    }

    #[tokio::test]
    async fn test_missing_target_yields_error_with_partial_transcript() {
        let backend = Arc::new(ScriptedBackend::new().with_user_turns(["hello"]));
        let graph = Graph::new("start")
            .with_node(Node::new("start", "Hi").with_transition(Transition::always("ghost")));
        let test_case = TestCase::new("t1", "ghost", "say hi").with_metric("polite");
        let options = options(5);

        let outcome = runner(&backend)
            .execute(TestExecution::new(&graph, &test_case, &options))
            .await;

        assert_eq!(outcome.status, TestStatus::Error);
        assert_eq!(outcome.end_reason, EndReason::Error);
        assert!(outcome.error_message.unwrap().contains("ghost"));
        assert_eq!(outcome.transcript.len(), 2);
        assert_eq!(backend.judge_calls(), 0);
    }

    #[tokio::test]
    async fn test_failing_metric_fails_test() {
        let backend = Arc::new(ScriptedBackend::new().with_user_turns(["hello"]));
        backend.push_metric(true, None);
        backend.push_metric(false, None);
        let graph = looping_graph();
        let test_case = TestCase::new("t1", "metrics", "greet")
            .with_metric("greets the caller")
            .with_metric("offers help");
        let options = options(5);

        let outcome = runner(&backend)
            .execute(TestExecution::new(&graph, &test_case, &options))
            .await;

        assert_eq!(outcome.status, TestStatus::Fail);
        assert_eq!(outcome.end_reason, EndReason::SimulatorFinished);
        assert_eq!(outcome.metric_results.len(), 2);
        assert_eq!(outcome.failed_metrics()[0].metric, "offers help");
    }

    #[tokio::test]
    async fn test_global_metric_threshold_overrides_verdict() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_metric(true, Some(0.4));
        let graph = looping_graph();
        let test_case = TestCase::new("t1", "threshold", "greet");
        let globals = [
            GlobalMetric {
                name: "tone".into(),
                criteria: "warm tone".into(),
                threshold: Some(0.7),
                enabled: true,
            },
            GlobalMetric {
                name: "disabled".into(),
                criteria: "never evaluated".into(),
                threshold: None,
                enabled: false,
            },
        ];
        let options = options(5);

        let outcome = runner(&backend)
            .execute(TestExecution::new(&graph, &test_case, &options).with_global_metrics(&globals))
            .await;

        assert_eq!(backend.judge_calls(), 1);
        assert_eq!(outcome.status, TestStatus::Fail);
        assert_eq!(outcome.metric_results[0].threshold, Some(0.7));
    }

    #[tokio::test]
    async fn test_retries_are_reported_and_recovered() {
        let backend = Arc::new(ScriptedBackend::new().with_user_turns(["hi"]));
        backend.push_agent_error(LlmError::RateLimited { retry_after: None });
        backend.push_agent_reply(crate::domain::ports::AgentReply::text("hello there"));
        let graph = looping_graph();
        let test_case = TestCase::new("t1", "retry", "greet");
        let options = options(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = runner(&backend)
            .execute(TestExecution::new(&graph, &test_case, &options).with_events(&tx))
            .await;
        drop(tx);

        assert_eq!(outcome.status, TestStatus::Pass);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(&events[0], TestEvent::Retry(n) if n.attempt == 1 && n.error_kind == "rate_limited"));
        assert!(events
            .iter()
            .any(|e| matches!(e, TestEvent::Token { token, .. } if token == "hello there")));
        assert!(matches!(events.last(), Some(TestEvent::Turn { transcript }) if transcript.len() == 2));
    }

    #[tokio::test]
    async fn test_exhausted_judge_retries_become_error() {
        let backend = Arc::new(ScriptedBackend::new());
        for _ in 0..3 {
            backend.push_judge_error(LlmError::Network("down".into()));
        }
        let graph = looping_graph();
        let test_case = TestCase::new("t1", "judge down", "greet").with_metric("polite");
        let options = options(2);

        let outcome = runner(&backend)
            .execute(TestExecution::new(&graph, &test_case, &options))
            .await;
        assert_eq!(outcome.status, TestStatus::Error);
        assert!(outcome.error_message.unwrap().starts_with("metric evaluation failed"));
    }

    #[tokio::test]
    async fn test_cancellation_token_yields_cancelled() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_agent_delay(Duration::from_secs(30))
                .with_user_turns(["hi"]),
        );
        let graph = looping_graph();
        let test_case = TestCase::new("t1", "cancel", "greet");
        let options = options(5);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = runner(&backend)
            .execute(TestExecution::new(&graph, &test_case, &options).with_cancellation(cancel))
            .await;
        assert_eq!(outcome.status, TestStatus::Cancelled);
        assert_eq!(outcome.end_reason, EndReason::Cancelled);
        assert_eq!(outcome.transcript.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_ends_conversation_and_scores() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_agent_delay(Duration::from_secs(120))
                .with_user_turns(["hi"]),
        );
        let graph = looping_graph();
        let mut test_case = TestCase::new("t1", "slow", "greet").with_metric("polite");
        test_case.timeout_secs = Some(5);
        let options = options(5);

        let outcome = runner(&backend)
            .execute(TestExecution::new(&graph, &test_case, &options))
            .await;
        assert_eq!(outcome.end_reason, EndReason::Timeout);
        assert_eq!(outcome.status, TestStatus::Pass);
        assert_eq!(backend.judge_calls(), 1);
    }

    #[test]
    fn test_rule_checks() {
        let transcript = vec![
            Message::user("what's my balance?"),
            Message::assistant("Your balance is $42. Anything else?"),
        ];
        let rules = RuleChecks {
            includes: vec!["balance".into()],
            excludes: vec!["password".into()],
            patterns: vec![r"\$\d+".into(), r"^Goodbye".into()],
        };

        let results = evaluate_rules(&rules, &transcript).unwrap();
        let verdicts: Vec<_> = results.iter().map(|r| (r.metric.as_str(), r.passed)).collect();
        assert_eq!(
            verdicts,
            [
                ("includes: balance", true),
                ("excludes: password", true),
                (r"pattern: \$\d+", true),
                ("pattern: ^Goodbye", false),
            ]
        );

        let bad = RuleChecks {
            patterns: vec!["(unclosed".into()],
            ..RuleChecks::default()
        };
        assert!(matches!(
            evaluate_rules(&bad, &transcript),
            Err(DomainError::ValidationFailed(_))
        ));
    }
}
