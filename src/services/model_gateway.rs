//! Model gateway: the single path from the core to language-model backends.
//!
//! Every call goes through the [`RetryPolicy`] and reports retries and
//! streamed agent tokens as [`TestEvent`]s on an optional sink.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::domain::errors::LlmError;
use crate::domain::models::{
    Diagnosis, FixSuggestion, Graph, Message, MetricResult, MetricSpec, PromptChange, TokenSource,
};
use crate::domain::ports::{
    AgentModel, AgentReply, AgentRequest, ConditionJudge, ConditionRequest, DiagnosisRequest,
    Judge, SimulatorRequest, SimulatorTurn, UserSimulator,
};
use crate::services::retry_policy::{RetryNotice, RetryPolicy};

/// Progress produced while one test executes.
#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    /// Full transcript after a turn completed.
    Turn { transcript: Vec<Message> },
    /// A streamed fragment of an in-progress reply.
    Token { token: String, source: TokenSource },
    /// A model call failed transiently and is about to be retried.
    Retry(RetryNotice),
}

/// Where a running test sends its [`TestEvent`]s.
pub type EventSink = mpsc::UnboundedSender<TestEvent>;

/// The four model roles used by test execution and repair.
#[derive(Clone)]
pub struct ModelSet {
    /// Plays the agent under test.
    pub agent: Arc<dyn AgentModel>,
    /// Plays the caller.
    pub simulator: Arc<dyn UserSimulator>,
    /// Judges `llm_prompt` transitions.
    pub conditions: Arc<dyn ConditionJudge>,
    /// Scores metrics and proposes repairs.
    pub judge: Arc<dyn Judge>,
}

impl ModelSet {
    /// Use one backend for every role.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: AgentModel + UserSimulator + ConditionJudge + Judge + 'static,
    {
        Self {
            agent: backend.clone(),
            simulator: backend.clone(),
            conditions: backend.clone(),
            judge: backend,
        }
    }
}

impl std::fmt::Debug for ModelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSet").finish_non_exhaustive()
    }
}

/// Retry-wrapped access to a [`ModelSet`] for one caller.
pub struct ModelGateway<'a> {
    models: &'a ModelSet,
    retry: &'a RetryPolicy,
    events: Option<&'a EventSink>,
}

impl<'a> ModelGateway<'a> {
    /// Gateway that reports retries to `events` when given.
    pub fn new(models: &'a ModelSet, retry: &'a RetryPolicy, events: Option<&'a EventSink>) -> Self {
        Self {
            models,
            retry,
            events,
        }
    }

    /// Send an event to the sink, if one is attached.
    pub fn emit(&self, event: TestEvent) {
        if let Some(sink) = self.events {
            // receiver gone means nobody is watching; the test still runs
            let _ = sink.send(event);
        }
    }

    fn report_retry(&self, notice: &RetryNotice) {
        self.emit(TestEvent::Retry(notice.clone()));
    }

    /// Agent reply, streaming tokens to the sink when one is attached.
    ///
    /// Each attempt forwards all of its tokens before it resolves, so a retry
    /// notice always follows the partial text of the attempt it abandons.
    /// Observers discard that text when the notice arrives.
    pub async fn agent_reply(&self, request: &AgentRequest) -> Result<AgentReply, LlmError> {
        let agent = &self.models.agent;
        let Some(sink) = self.events else {
            return self.retry.execute(|| agent.reply(request), |_| {}).await;
        };

        self.retry
            .execute(
                || stream_attempt(agent.as_ref(), request, sink),
                |notice| self.report_retry(notice),
            )
            .await
    }

    /// Next simulated caller turn.
    pub async fn simulator_turn(&self, request: &SimulatorRequest) -> Result<SimulatorTurn, LlmError> {
        let simulator = &self.models.simulator;
        self.retry
            .execute(
                || simulator.next_turn(request),
                |notice| self.report_retry(notice),
            )
            .await
    }

    /// Judge an `llm_prompt` transition.
    pub async fn condition_holds(&self, request: &ConditionRequest) -> Result<bool, LlmError> {
        let conditions = &self.models.conditions;
        self.retry
            .execute(|| conditions.holds(request), |notice| self.report_retry(notice))
            .await
    }

    /// Score a transcript against one metric.
    pub async fn evaluate(
        &self,
        model: &str,
        transcript: &[Message],
        metric: &MetricSpec,
    ) -> Result<MetricResult, LlmError> {
        let judge = &self.models.judge;
        self.retry
            .execute(
                || judge.evaluate(model, transcript, metric),
                |notice| self.report_retry(notice),
            )
            .await
    }

    /// Diagnose a failed test.
    pub async fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis, LlmError> {
        let judge = &self.models.judge;
        self.retry
            .execute(|| judge.diagnose(request), |notice| self.report_retry(notice))
            .await
    }

    /// Propose a fix for a diagnosed failure.
    pub async fn suggest_fix(
        &self,
        model: &str,
        graph: &Graph,
        diagnosis: &Diagnosis,
        failed_metrics: &[MetricResult],
    ) -> Result<FixSuggestion, LlmError> {
        let judge = &self.models.judge;
        self.retry
            .execute(
                || judge.suggest_fix(model, graph, diagnosis, failed_metrics),
                |notice| self.report_retry(notice),
            )
            .await
    }

    /// Revise a fix after an unsuccessful retest.
    pub async fn revise_fix(
        &self,
        model: &str,
        graph: &Graph,
        diagnosis: &Diagnosis,
        previous_changes: &[PromptChange],
        new_metrics: &[MetricResult],
    ) -> Result<FixSuggestion, LlmError> {
        let judge = &self.models.judge;
        self.retry
            .execute(
                || judge.revise_fix(model, graph, diagnosis, previous_changes, new_metrics),
                |notice| self.report_retry(notice),
            )
            .await
    }
}

/// One streaming attempt, forwarding its tokens as they arrive.
async fn stream_attempt(
    agent: &dyn AgentModel,
    request: &AgentRequest,
    sink: &EventSink,
) -> Result<AgentReply, LlmError> {
    let (tokens, mut received) = mpsc::unbounded_channel::<String>();
    let call = agent.reply_streaming(request, tokens);
    let forward = async {
        while let Some(token) = received.recv().await {
            let _ = sink.send(TestEvent::Token {
                token,
                source: TokenSource::Agent,
            });
        }
    };
    let (reply, ()) = tokio::join!(call, forward);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::llm::ScriptedBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Streams part of a reply, then times out, on its first attempt.
    struct DropsFirstStream {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl AgentModel for DropsFirstStream {
        async fn reply(&self, _request: &AgentRequest) -> Result<AgentReply, LlmError> {
            Ok(AgentReply::text("Hello"))
        }

        async fn reply_streaming(
            &self,
            _request: &AgentRequest,
            tokens: mpsc::UnboundedSender<String>,
        ) -> Result<AgentReply, LlmError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = tokens.send("Hel".to_string());
                return Err(LlmError::Timeout);
            }
            let _ = tokens.send("Hello".to_string());
            Ok(AgentReply::text("Hello"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_notice_follows_abandoned_tokens() {
        let models = ModelSet {
            agent: Arc::new(DropsFirstStream {
                attempts: AtomicU32::new(0),
            }),
            ..ModelSet::from_backend(Arc::new(ScriptedBackend::new()))
        };
        let retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let (sink, mut events) = mpsc::unbounded_channel();
        let gateway = ModelGateway::new(&models, &retry, Some(&sink));
        let request = AgentRequest {
            model: "agent".into(),
            general_instructions: None,
            node_id: "greet".into(),
            node_instructions: "Say hello.".into(),
            tools: Vec::new(),
            transcript: Vec::new(),
        };

        let reply = gateway.agent_reply(&request).await.unwrap();
        assert_eq!(reply.content, "Hello");

        let token = |text: &str| TestEvent::Token {
            token: text.to_string(),
            source: TokenSource::Agent,
        };
        assert_eq!(events.try_recv().ok(), Some(token("Hel")));
        assert!(matches!(events.try_recv(), Ok(TestEvent::Retry(notice)) if notice.attempt == 1));
        assert_eq!(events.try_recv().ok(), Some(token("Hello")));
        assert!(events.try_recv().is_err());
    }
}
