//! Run orchestrator: starts runs, streams their progress, and keeps stored
//! runs consistent.
//!
//! - **execution**: the per-run context (cancellation gate, test execution,
//!   progress forwarding, run completion)
//! - **executor**: sequential and parallel execution strategies
//!
//! A run is registered in the [`RunRegistry`] for as long as it executes plus
//! a short grace period. A stored run that is incomplete but not registered
//! was abandoned by an earlier process and is healed the next time it is read.

mod execution;
mod executor;

pub use execution::{Admission, QueuedTest, RunContext, RunJob};
pub use executor::{ParallelExecutor, RunExecutor, SequentialExecutor};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AgentDefinition, ClientCommand, ExecutorKind, Run, RunConfig, RunOptions, RunSummary,
    RunWithResults, TestCase, TestResult,
};
use crate::domain::ports::RunRepository;
use crate::services::run_registry::{Observer, RunRegistry};
use crate::services::test_execution::TestRunner;

/// Error message given to results of a run abandoned mid-flight.
pub const ABANDONED_RUN_MESSAGE: &str =
    "run was abandoned before this test finished (the process running it exited)";

const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Entry point for starting, observing, cancelling and reading runs.
///
/// Each run executes in its own task through the configured [`RunExecutor`].
/// Progress goes to the run's observers through the [`RunRegistry`]; every
/// status change is written to the repository first.
pub struct RunOrchestrator {
    repository: Arc<dyn RunRepository>,
    registry: Arc<RunRegistry>,
    runner: TestRunner,
    executor: Arc<dyn RunExecutor>,
    teardown_grace: Duration,
}

impl RunOrchestrator {
    /// Sequential orchestrator with the default teardown grace.
    pub fn new(repository: Arc<dyn RunRepository>, runner: TestRunner) -> Self {
        Self {
            repository,
            registry: Arc::new(RunRegistry::new()),
            runner,
            executor: Arc::new(SequentialExecutor),
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
        }
    }

    /// Executor and teardown grace from configuration.
    pub fn from_config(repository: Arc<dyn RunRepository>, runner: TestRunner, config: &RunConfig) -> Self {
        let executor: Arc<dyn RunExecutor> = match config.executor {
            ExecutorKind::Sequential => Arc::new(SequentialExecutor),
            ExecutorKind::Parallel => Arc::new(ParallelExecutor::new(config.max_parallel)),
        };
        Self::new(repository, runner)
            .with_executor(executor)
            .with_teardown_grace(Duration::from_millis(config.teardown_grace_ms))
    }

    /// Replace the executor.
    pub fn with_executor(mut self, executor: Arc<dyn RunExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// How long a finished run stays registered after `run_completed`.
    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    /// Registry of active runs.
    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Backing store.
    pub fn repository(&self) -> &Arc<dyn RunRepository> {
        &self.repository
    }

    /// Runner used for every test.
    pub fn runner(&self) -> &TestRunner {
        &self.runner
    }

    fn context(&self) -> Arc<RunContext> {
        Arc::new(RunContext {
            repository: Arc::clone(&self.repository),
            registry: Arc::clone(&self.registry),
            runner: self.runner.clone(),
            teardown_grace: self.teardown_grace,
        })
    }

    /// Create the run and a `running` placeholder for every test, then
    /// execute in the background. Returns once the placeholders exist.
    #[instrument(skip_all, fields(agent_id = %agent.id, tests = tests.len()))]
    pub async fn start_run(
        &self,
        agent: Arc<AgentDefinition>,
        tests: Vec<TestCase>,
        options: RunOptions,
    ) -> DomainResult<RunWithResults> {
        let mut seen = HashSet::new();
        if let Some(duplicate) = tests.iter().find(|t| !seen.insert(t.id.as_str())) {
            return Err(DomainError::ValidationFailed(format!(
                "test id '{}' appears more than once",
                duplicate.id
            )));
        }

        let run = Run::new(&agent.id, &agent.name);
        let state = self.registry.register(run.id).await;

        let results = match self.create_placeholders(&run, &tests).await {
            Ok(results) => results,
            Err(err) => {
                self.registry.unregister(run.id).await;
                return Err(err);
            }
        };

        let queued = results
            .iter()
            .zip(tests)
            .map(|(result, test_case)| QueuedTest {
                result_id: result.id,
                test_case,
            })
            .collect();
        let job = Arc::new(RunJob {
            run_id: run.id,
            agent,
            tests: queued,
            options,
            state,
        });

        info!(run_id = %run.id, executor = self.executor.name(), "run started");
        let executor = Arc::clone(&self.executor);
        let context = self.context();
        let span = info_span!("run", run_id = %run.id);
        tokio::spawn(async move { executor.execute(job, context).await }.instrument(span));

        Ok(RunWithResults { run, results })
    }

    async fn create_placeholders(&self, run: &Run, tests: &[TestCase]) -> DomainResult<Vec<TestResult>> {
        self.repository.create_run(run).await?;
        let mut results = Vec::with_capacity(tests.len());
        for (position, test) in tests.iter().enumerate() {
            let result = TestResult::pending(run.id, &test.id, &test.name);
            self.repository.create_pending_result(&result, position).await?;
            results.push(result);
        }
        Ok(results)
    }

    /// Subscribe to a run: a `state` snapshot first, then queued and live
    /// messages. For a run that is no longer executing the observer gets the
    /// snapshot and then end of stream.
    pub async fn connect(&self, run_id: Uuid) -> DomainResult<Observer> {
        let repository = Arc::clone(&self.repository);
        let attached = self
            .registry
            .attach(run_id, || async move {
                repository
                    .get_run_with_results(run_id)
                    .await?
                    .ok_or(DomainError::RunNotFound(run_id))
            })
            .await?;

        match attached {
            Some(observer) => Ok(observer),
            None => Ok(Observer::finished(self.get_run(run_id).await?)),
        }
    }

    /// Stop delivering progress to `observer`.
    pub async fn disconnect(&self, observer: &Observer) {
        self.registry.detach(observer.run_id, observer.id).await;
    }

    /// Apply a command sent by an observer. Returns whether it took effect.
    pub async fn handle_command(&self, run_id: Uuid, command: ClientCommand) -> DomainResult<bool> {
        match command {
            ClientCommand::CancelTest { result_id } => self.cancel_test(run_id, result_id).await,
            ClientCommand::CancelRun {} => self.cancel_run(run_id).await,
        }
    }

    /// Cancel a queued test. Returns `false` once the test has started or
    /// finished; a started test always runs to completion.
    pub async fn cancel_test(&self, run_id: Uuid, result_id: Uuid) -> DomainResult<bool> {
        let result = self
            .repository
            .get_result(result_id)
            .await?
            .filter(|r| r.run_id == run_id)
            .ok_or(DomainError::ResultNotFound(result_id))?;
        if result.is_terminal() {
            return Ok(false);
        }

        let accepted = self.registry.cancel_test(run_id, result_id).await;
        if accepted {
            info!(%run_id, %result_id, "test cancellation requested");
        }
        Ok(accepted)
    }

    /// Cancel every test that has not started yet.
    pub async fn cancel_run(&self, run_id: Uuid) -> DomainResult<bool> {
        let accepted = self.registry.cancel_run(run_id).await;
        if accepted {
            info!(%run_id, "run cancellation requested");
        } else if self.repository.get_run_with_results(run_id).await?.is_none() {
            return Err(DomainError::RunNotFound(run_id));
        }
        Ok(accepted)
    }

    /// Load a run, healing it first if it was abandoned.
    pub async fn get_run(&self, run_id: Uuid) -> DomainResult<RunWithResults> {
        let run = self
            .repository
            .get_run_with_results(run_id)
            .await?
            .ok_or(DomainError::RunNotFound(run_id))?;

        if run.run.is_complete() || self.registry.contains(run_id).await {
            return Ok(run);
        }

        self.heal_orphan(&run).await;
        match self.repository.get_run_with_results(run_id).await {
            Ok(Some(healed)) => Ok(healed),
            Ok(None) => Err(DomainError::RunNotFound(run_id)),
            Err(err) => {
                warn!(%run_id, error = %err, "failed to reload healed run");
                Ok(run)
            }
        }
    }

    /// Close an abandoned run. Failures are logged, never returned.
    async fn heal_orphan(&self, run: &RunWithResults) {
        let run_id = run.run.id;
        warn!(%run_id, "healing abandoned run");
        for result in run.results.iter().filter(|r| !r.is_terminal()) {
            if let Err(err) = self.repository.mark_error(result.id, ABANDONED_RUN_MESSAGE).await {
                error!(%run_id, result_id = %result.id, error = %err, "failed to heal abandoned result");
            }
        }
        if let Err(err) = self.repository.complete_run(run_id).await {
            error!(%run_id, error = %err, "failed to close abandoned run");
        }
    }

    /// Newest runs first, optionally for one agent.
    pub async fn list_runs(&self, agent_id: Option<&str>, limit: usize) -> DomainResult<Vec<RunSummary>> {
        self.repository.list_runs(agent_id, limit).await
    }

    /// Delete a stored run. Active runs cannot be deleted.
    pub async fn delete_run(&self, run_id: Uuid) -> DomainResult<()> {
        if self.registry.contains(run_id).await {
            return Err(DomainError::ValidationFailed(format!(
                "run {run_id} is still active"
            )));
        }
        self.repository.delete_run(run_id).await
    }

    /// Wait until the run is closed, then return it.
    pub async fn wait_for_completion(&self, run_id: Uuid) -> DomainResult<RunWithResults> {
        if let Some(state) = self.registry.get(run_id).await {
            state.wait_completed().await;
        }
        self.get_run(run_id).await
    }

    /// Ids of runs still registered.
    pub async fn active_runs(&self) -> Vec<Uuid> {
        self.registry.active_run_ids().await
    }

    /// Interrupt in-flight tests of every active run. Their results become
    /// `cancelled` and each run still closes normally.
    pub fn shutdown(&self) {
        info!("shutting down run orchestrator");
        self.registry.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::llm::ScriptedBackend;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteRunRepository};
    use crate::domain::models::{
        EndReason, Graph, Node, ProgressMessage, TestOutcome, TestStatus,
    };
    use crate::services::model_gateway::ModelSet;
    use crate::services::retry_policy::RetryPolicy;

    fn agent() -> Arc<AgentDefinition> {
        let graph = Graph::new("start").with_node(Node::new("start", "Help the caller."));
        Arc::new(AgentDefinition::new("agent-1", "Front desk", graph))
    }

    fn options() -> RunOptions {
        RunOptions {
            max_turns: 2,
            timeout_secs: 30,
            ..RunOptions::default()
        }
    }

    async fn orchestrator(backend: Arc<ScriptedBackend>) -> (RunOrchestrator, Arc<SqliteRunRepository>) {
        let pool = create_migrated_test_pool().await.unwrap();
        let repository = Arc::new(SqliteRunRepository::new(pool));
        let runner = TestRunner::new(ModelSet::from_backend(backend), RetryPolicy::no_retry());
        let orchestrator = RunOrchestrator::new(repository.clone(), runner)
            .with_teardown_grace(Duration::from_millis(10));
        (orchestrator, repository)
    }

    #[tokio::test]
    async fn test_start_run_creates_placeholders_and_completes() {
        let (orchestrator, _) = orchestrator(Arc::new(ScriptedBackend::new())).await;
        let tests = vec![
            TestCase::new("a", "first", "say hi"),
            TestCase::new("b", "second", "say bye"),
        ];

        let started = orchestrator.start_run(agent(), tests, options()).await.unwrap();
        assert_eq!(started.results.len(), 2);
        assert!(started.results.iter().all(|r| r.status == TestStatus::Running));
        assert_eq!(started.results[0].test_case_id, "a");

        let finished = orchestrator.wait_for_completion(started.run.id).await.unwrap();
        assert!(finished.run.is_complete());
        assert!(finished.results.iter().all(|r| r.status == TestStatus::Pass));
    }

    #[tokio::test]
    async fn test_duplicate_test_ids_rejected() {
        let (orchestrator, _) = orchestrator(Arc::new(ScriptedBackend::new())).await;
        let tests = vec![TestCase::new("a", "one", "x"), TestCase::new("a", "two", "y")];
        let err = orchestrator.start_run(agent(), tests, options()).await.unwrap_err();
        assert!(matches!(err, DomainError::ValidationFailed(_)));
        assert!(orchestrator.active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_orphan_is_healed_on_read() {
        let (orchestrator, repository) = orchestrator(Arc::new(ScriptedBackend::new())).await;
        let run = Run::new("agent-1", "Front desk");
        repository.create_run(&run).await.unwrap();
        let stale = TestResult::pending(run.id, "a", "stale");
        repository.create_pending_result(&stale, 0).await.unwrap();
        let done = TestResult::pending(run.id, "b", "done");
        repository.create_pending_result(&done, 1).await.unwrap();
        let outcome = TestOutcome {
            status: TestStatus::Pass,
            transcript: Vec::new(),
            metric_results: Vec::new(),
            nodes_visited: vec!["start".into()],
            tools_called: Vec::new(),
            duration_ms: 5,
            end_reason: EndReason::SimulatorFinished,
            error_message: None,
        };
        repository.complete_result(done.id, &outcome).await.unwrap();

        let healed = orchestrator.get_run(run.id).await.unwrap();

        assert!(healed.run.is_complete());
        assert_eq!(healed.results[0].status, TestStatus::Error);
        assert!(healed.results[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("abandoned"));
        assert_eq!(healed.results[1].status, TestStatus::Pass);
    }

    #[tokio::test]
    async fn test_delete_refuses_active_run() {
        let backend = Arc::new(ScriptedBackend::new().with_agent_delay(Duration::from_millis(200)));
        backend.push_user_turn("hello");
        let (orchestrator, _) = orchestrator(backend).await;
        let started = orchestrator
            .start_run(agent(), vec![TestCase::new("a", "slow", "x")], options())
            .await
            .unwrap();

        let err = orchestrator.delete_run(started.run.id).await.unwrap_err();
        assert!(matches!(err, DomainError::ValidationFailed(_)));

        orchestrator.wait_for_completion(started.run.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.delete_run(started.run.id).await.unwrap();
        assert!(matches!(
            orchestrator.get_run(started.run.id).await,
            Err(DomainError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_to_finished_run_gets_snapshot_only() {
        let (orchestrator, _) = orchestrator(Arc::new(ScriptedBackend::new())).await;
        let started = orchestrator
            .start_run(agent(), vec![TestCase::new("a", "quick", "x")], options())
            .await
            .unwrap();
        orchestrator.wait_for_completion(started.run.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut observer = orchestrator.connect(started.run.id).await.unwrap();
        let Some(ProgressMessage::State { run }) = observer.recv().await else {
            panic!("expected state snapshot first");
        };
        assert!(run.run.is_complete());
        assert_eq!(observer.recv().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_test() {
        let backend = Arc::new(ScriptedBackend::new().with_agent_delay(Duration::from_secs(30)));
        backend.push_user_turn("hello");
        let (orchestrator, _) = orchestrator(backend).await;
        let started = orchestrator
            .start_run(agent(), vec![TestCase::new("a", "stuck", "x")], options())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.shutdown();
        let finished = orchestrator.wait_for_completion(started.run.id).await.unwrap();
        assert_eq!(finished.results[0].status, TestStatus::Cancelled);
        assert!(finished.run.is_complete());
    }

    #[tokio::test]
    async fn test_unknown_run_errors() {
        let (orchestrator, _) = orchestrator(Arc::new(ScriptedBackend::new())).await;
        let missing = Uuid::new_v4();
        assert!(matches!(orchestrator.get_run(missing).await, Err(DomainError::RunNotFound(_))));
        assert!(matches!(orchestrator.connect(missing).await, Err(DomainError::RunNotFound(_))));
        assert!(matches!(orchestrator.cancel_run(missing).await, Err(DomainError::RunNotFound(_))));
    }
}
