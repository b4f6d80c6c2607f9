//! Shared wiring for commands: configuration, database, models and the run
//! orchestrator.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::adapters::llm::{AnthropicBackend, ScriptedBackend};
use crate::adapters::sqlite::{initialize_database, SqliteRunRepository};
use crate::domain::models::Config;
use crate::domain::ports::RunRepository;
use crate::infrastructure::config::ConfigLoader;
use crate::services::{ModelSet, RetryPolicy, RunOrchestrator, TestRunner};

/// Load configuration from an explicit file, or from the project files and
/// environment.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Where model calls go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    /// The configured Messages API backend.
    Live,
    /// The scripted in-process backend; no network access.
    DryRun,
}

/// One backend for every model role.
pub fn build_models(config: &Config, mode: ModelMode) -> Result<ModelSet> {
    match mode {
        ModelMode::Live => {
            let backend = AnthropicBackend::new(&config.llm, &config.rate_limit)
                .context("Failed to create language-model backend")?;
            Ok(ModelSet::from_backend(Arc::new(backend)))
        }
        ModelMode::DryRun => Ok(ModelSet::from_backend(Arc::new(ScriptedBackend::new()))),
    }
}

/// Test runner over [`build_models`] with the configured retry policy.
pub fn build_runner(config: &Config, mode: ModelMode) -> Result<TestRunner> {
    Ok(TestRunner::new(
        build_models(config, mode)?,
        RetryPolicy::from_config(&config.retry),
    ))
}

/// Open and migrate the configured run store.
pub async fn open_repository(config: &Config) -> Result<Arc<dyn RunRepository>> {
    let pool = initialize_database(&config.database)
        .await
        .with_context(|| format!("Failed to open database at {}", config.database.path))?;
    Ok(Arc::new(SqliteRunRepository::new(pool)))
}

/// Orchestrator over the configured database.
pub async fn open_orchestrator(config: &Config, runner: TestRunner) -> Result<RunOrchestrator> {
    let repository = open_repository(config).await?;
    Ok(RunOrchestrator::from_config(repository, runner, &config.run))
}

/// Orchestrator for commands that only read or delete stored runs. Its
/// models are never called.
pub async fn open_store(config: &Config) -> Result<RunOrchestrator> {
    open_orchestrator(config, build_runner(config, ModelMode::DryRun)?).await
}
