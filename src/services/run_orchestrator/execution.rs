//! Per-run execution: the cancellation gate, running one test, and closing the run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::models::{
    AgentDefinition, ProgressMessage, RunOptions, TestCase, TestOutcome, TestStatus,
};
use crate::domain::ports::RunRepository;
use crate::services::model_gateway::TestEvent;
pub use crate::services::run_registry::Admission;
use crate::services::run_registry::{ActiveRunState, RunRegistry};
use crate::services::test_execution::{TestExecution, TestRunner};

/// One queued test and the placeholder result it will complete.
#[derive(Debug, Clone)]
pub struct QueuedTest {
    /// Placeholder result created when the run started.
    pub result_id: Uuid,
    /// Scenario to execute.
    pub test_case: TestCase,
}

/// Everything an executor needs to run one run's tests.
pub struct RunJob {
    /// Run being executed.
    pub run_id: Uuid,
    /// Agent under test.
    pub agent: Arc<AgentDefinition>,
    /// In execution order.
    pub tests: Vec<QueuedTest>,
    /// Models and limits for every test in the run.
    pub options: RunOptions,
    /// Live state: cancel flags, observers and the replay queue.
    pub state: Arc<ActiveRunState>,
}

impl RunJob {
    /// Id of the agent under test.
    pub fn agent_id(&self) -> &str {
        &self.agent.id
    }
}

/// Collaborators shared by the tasks executing one run.
pub struct RunContext {
    pub(super) repository: Arc<dyn RunRepository>,
    pub(super) registry: Arc<RunRegistry>,
    pub(super) runner: TestRunner,
    pub(super) teardown_grace: Duration,
}

impl RunContext {
    /// Gate a queued test. Once admitted it can no longer be cancelled.
    pub async fn admit(&self, job: &RunJob, result_id: Uuid) -> Admission {
        job.state.admit(result_id).await
    }

    /// Mark a queued test cancelled and tell observers.
    pub async fn skip_test(&self, job: &RunJob, result_id: Uuid) {
        match self.repository.mark_cancelled(result_id).await {
            Ok(true) => {
                debug!(run_id = %job.run_id, %result_id, "queued test cancelled");
                job.state
                    .broadcast(ProgressMessage::TestCancelled { result_id })
                    .await;
            }
            Ok(false) => debug!(%result_id, "test already terminal, not cancelling"),
            Err(err) => error!(%result_id, error = %err, "failed to mark test cancelled"),
        }
    }

    /// Cancel every test from `tests` onward.
    pub async fn skip_remaining(&self, job: &RunJob, tests: &[QueuedTest]) {
        info!(run_id = %job.run_id, remaining = tests.len(), "run cancelled, skipping queued tests");
        for test in tests {
            self.skip_test(job, test.result_id).await;
        }
    }

    /// Execute one test in its own task, forwarding progress as it happens,
    /// then persist and announce the terminal status.
    pub async fn run_test(self: Arc<Self>, job: Arc<RunJob>, test: QueuedTest) {
        let result_id = test.result_id;
        job.state
            .broadcast(ProgressMessage::TestStarted {
                result_id,
                test_case_id: test.test_case.id.clone(),
                test_name: test.test_case.name.clone(),
            })
            .await;

        let (events, mut received) = mpsc::unbounded_channel();
        let task = {
            let runner = self.runner.clone();
            let job = Arc::clone(&job);
            let test_case = test.test_case.clone();
            tokio::spawn(async move {
                let execution = TestExecution::new(&job.agent.graph, &test_case, &job.options)
                    .with_global_metrics(&job.agent.global_metrics)
                    .with_events(&events)
                    .with_cancellation(job.state.abort_token());
                runner.execute(execution).await
            })
        };

        let forward = async {
            while let Some(event) = received.recv().await {
                self.forward_event(&job, result_id, event).await;
            }
        };

        let (joined, ()) = tokio::join!(task, forward);
        match joined {
            Ok(outcome) => self.record_outcome(&job, result_id, &outcome).await,
            Err(err) => {
                error!(run_id = %job.run_id, %result_id, error = %err, "test task failed");
                self.fail_test(&job, result_id, &format!("test task failed: {err}"))
                    .await;
            }
        }
    }

    async fn forward_event(&self, job: &RunJob, result_id: Uuid, event: TestEvent) {
        let message = match event {
            TestEvent::Turn { transcript } => {
                if let Err(err) = self.repository.update_transcript(result_id, &transcript).await {
                    warn!(%result_id, error = %err, "failed to persist transcript");
                }
                ProgressMessage::TranscriptUpdate {
                    result_id,
                    transcript,
                }
            }
            TestEvent::Token { token, source } => ProgressMessage::TokenUpdate {
                result_id,
                token,
                source,
            },
            TestEvent::Retry(notice) => ProgressMessage::RetryError {
                result_id,
                error_kind: notice.error_kind,
                message: notice.message,
                attempt: notice.attempt,
                max_attempts: notice.max_attempts,
                retry_after: notice.delay.as_secs_f64(),
            },
        };
        job.state.broadcast(message).await;
    }

    async fn record_outcome(&self, job: &RunJob, result_id: Uuid, outcome: &TestOutcome) {
        match self.repository.complete_result(result_id, outcome).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%result_id, "result was already terminal, outcome discarded");
                return;
            }
            Err(err) => {
                error!(%result_id, error = %err, "failed to persist test outcome");
                self.fail_test(job, result_id, &format!("failed to persist outcome: {err}"))
                    .await;
                return;
            }
        }

        let message = match outcome.status {
            TestStatus::Cancelled => ProgressMessage::TestCancelled { result_id },
            TestStatus::Error => ProgressMessage::TestError {
                result_id,
                error: outcome
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "test failed with an unknown error".to_string()),
            },
            status => ProgressMessage::TestCompleted { result_id, status },
        };
        job.state.broadcast(message).await;
    }

    async fn fail_test(&self, job: &RunJob, result_id: Uuid, message: &str) {
        if let Err(err) = self.repository.mark_error(result_id, message).await {
            error!(%result_id, error = %err, "failed to mark test as error");
        }
        job.state
            .broadcast(ProgressMessage::TestError {
                result_id,
                error: message.to_string(),
            })
            .await;
    }

    /// Close the run: error out anything left running, set the completion
    /// time, announce it, and tear down the live state after the grace period.
    pub async fn finish_run(&self, job: &RunJob) {
        let run_id = job.run_id;
        match self.repository.get_run_with_results(run_id).await {
            Ok(Some(run)) => {
                for result in run.results.iter().filter(|r| !r.is_terminal()) {
                    warn!(%run_id, result_id = %result.id, "result still running at run end");
                    self.fail_test(job, result.id, "test did not reach a terminal status")
                        .await;
                }
            }
            Ok(None) => warn!(%run_id, "run vanished before completion"),
            Err(err) => error!(%run_id, error = %err, "failed to load run for completion"),
        }

        if let Err(err) = self.repository.complete_run(run_id).await {
            error!(%run_id, error = %err, "failed to mark run complete");
        }
        job.state.broadcast(ProgressMessage::RunCompleted {}).await;
        job.state.mark_completed();
        info!(%run_id, "run completed");

        let registry = Arc::clone(&self.registry);
        let grace = self.teardown_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.unregister(run_id).await;
        });
    }
}
