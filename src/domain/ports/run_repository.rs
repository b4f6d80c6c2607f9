//! Run store port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Message, Run, RunSummary, RunWithResults, TestOutcome, TestResult};

/// Durable storage for runs and their results.
///
/// Terminal writes (`complete_result`, `mark_error`, `mark_cancelled`) only
/// apply to results that are still `running`; they return whether the write
/// took effect so a result is completed exactly once.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create_run(&self, run: &Run) -> DomainResult<()>;

    /// Insert a `running` placeholder at the given position within its run.
    async fn create_pending_result(&self, result: &TestResult, position: usize) -> DomainResult<()>;

    async fn update_transcript(&self, result_id: Uuid, transcript: &[Message]) -> DomainResult<()>;

    async fn complete_result(&self, result_id: Uuid, outcome: &TestOutcome) -> DomainResult<bool>;

    async fn mark_error(&self, result_id: Uuid, message: &str) -> DomainResult<bool>;

    async fn mark_cancelled(&self, result_id: Uuid) -> DomainResult<bool>;

    /// Set the completion timestamp if unset.
    async fn complete_run(&self, run_id: Uuid) -> DomainResult<()>;

    async fn get_run_with_results(&self, run_id: Uuid) -> DomainResult<Option<RunWithResults>>;

    async fn get_result(&self, result_id: Uuid) -> DomainResult<Option<TestResult>>;

    /// Most recent first.
    async fn list_runs(&self, agent_id: Option<&str>, limit: usize) -> DomainResult<Vec<RunSummary>>;

    async fn delete_run(&self, run_id: Uuid) -> DomainResult<()>;
}
