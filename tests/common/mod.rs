//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use rehearse::adapters::llm::ScriptedBackend;
use rehearse::adapters::sqlite::{create_migrated_test_pool, initialize_database, SqliteRunRepository};
use rehearse::domain::models::{AgentDefinition, DatabaseConfig, Graph, Node, RunOptions};
use rehearse::domain::ports::{RunRepository, SimulatorRequest, SimulatorTurn, UserSimulator};
use rehearse::domain::LlmError;
use rehearse::services::{ModelSet, RetryPolicy, RunOrchestrator, TestRunner};

pub fn front_desk() -> Arc<AgentDefinition> {
    let graph = Graph::new("greet").with_node(Node::new("greet", "Greet the caller and help them."));
    Arc::new(AgentDefinition::new("front-desk", "Front desk", graph))
}

pub fn options() -> RunOptions {
    RunOptions {
        max_turns: 3,
        timeout_secs: 30,
        ..RunOptions::default()
    }
}

/// Simulator whose first call waits until the gate is opened.
pub struct GatedSimulator {
    inner: Arc<ScriptedBackend>,
    gate: Arc<Notify>,
    passed: AtomicBool,
}

impl GatedSimulator {
    pub fn new(inner: Arc<ScriptedBackend>) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let simulator = Self {
            inner,
            gate: Arc::clone(&gate),
            passed: AtomicBool::new(false),
        };
        (simulator, gate)
    }
}

#[async_trait]
impl UserSimulator for GatedSimulator {
    async fn next_turn(&self, request: &SimulatorRequest) -> Result<SimulatorTurn, LlmError> {
        if !self.passed.swap(true, Ordering::SeqCst) {
            self.gate.notified().await;
        }
        self.inner.next_turn(request).await
    }
}

/// Models backed by `backend`, with the first simulator call held at a gate.
/// `notify_one` on the gate releases it, before or after the call arrives.
pub fn gated_models(backend: Arc<ScriptedBackend>) -> (ModelSet, Arc<Notify>) {
    let (simulator, gate) = GatedSimulator::new(Arc::clone(&backend));
    let mut models = ModelSet::from_backend(backend);
    models.simulator = Arc::new(simulator);
    (models, gate)
}

pub fn runner(models: ModelSet) -> TestRunner {
    TestRunner::new(models, RetryPolicy::no_retry())
}

pub async fn memory_repository() -> Arc<dyn RunRepository> {
    let pool = create_migrated_test_pool().await.unwrap();
    Arc::new(SqliteRunRepository::new(pool))
}

pub async fn file_repository(path: &Path) -> Arc<dyn RunRepository> {
    let config = DatabaseConfig {
        path: path.display().to_string(),
        max_connections: 2,
    };
    let pool = initialize_database(&config).await.unwrap();
    Arc::new(SqliteRunRepository::new(pool))
}

pub fn orchestrator(repository: Arc<dyn RunRepository>, models: ModelSet) -> Arc<RunOrchestrator> {
    Arc::new(
        RunOrchestrator::new(repository, runner(models)).with_teardown_grace(Duration::from_millis(20)),
    )
}
