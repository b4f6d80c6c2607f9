//! SQLite implementation of the RunRepository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{parse_datetime, parse_json_or_default, parse_optional_datetime, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    EndReason, Message, Run, RunSummary, RunWithResults, TestOutcome, TestResult, TestStatus,
};
use crate::domain::ports::RunRepository;

const RESULT_COLUMNS: &str = "id, run_id, test_case_id, test_name, status, transcript, metric_results, \
    nodes_visited, tools_called, duration_ms, end_reason, error_message, created_at, updated_at";

/// [`RunRepository`] on SQLite. Results keep their insertion order through a
/// `position` column, and terminal writes only touch results still `running`.
#[derive(Clone)]
pub struct SqliteRunRepository {
    pool: SqlitePool,
}

impl SqliteRunRepository {
    /// Repository over a migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn get_run(&self, run_id: Uuid) -> DomainResult<Option<Run>> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT id, agent_id, agent_name, started_at, completed_at FROM runs WHERE id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn results_for(&self, run_id: Uuid) -> DomainResult<Vec<TestResult>> {
        let rows: Vec<ResultRow> = sqlx::query_as(&format!(
            "SELECT {RESULT_COLUMNS} FROM results WHERE run_id = ? ORDER BY position ASC"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Set a terminal status on a result that is still running.
    async fn finish(
        &self,
        result_id: Uuid,
        status: TestStatus,
        end_reason: EndReason,
        error_message: Option<&str>,
    ) -> DomainResult<bool> {
        let result = sqlx::query(
            r"UPDATE results SET status = ?, end_reason = COALESCE(end_reason, ?), error_message = ?, updated_at = ?
               WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(end_reason.as_str())
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(result_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.ensure_result_exists(result_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn ensure_result_exists(&self, result_id: Uuid) -> DomainResult<()> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM results WHERE id = ?")
            .bind(result_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        exists
            .map(|_| ())
            .ok_or(DomainError::ResultNotFound(result_id))
    }
}

#[async_trait]
impl RunRepository for SqliteRunRepository {
    async fn create_run(&self, run: &Run) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO runs (id, agent_id, agent_name, started_at, completed_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(&run.agent_id)
        .bind(&run.agent_name)
        .bind(run.started_at.to_rfc3339())
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_pending_result(&self, result: &TestResult, position: usize) -> DomainResult<()> {
        let position = i64::try_from(position)
            .map_err(|_| DomainError::ValidationFailed("result position out of range".to_string()))?;

        sqlx::query(
            r"INSERT INTO results (id, run_id, test_case_id, test_name, position, status, transcript,
               metric_results, nodes_visited, tools_called, duration_ms, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, 'running', '[]', '[]', '[]', '[]', 0, ?, ?)",
        )
        .bind(result.id.to_string())
        .bind(result.run_id.to_string())
        .bind(&result.test_case_id)
        .bind(&result.test_name)
        .bind(position)
        .bind(result.created_at.to_rfc3339())
        .bind(result.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_transcript(&self, result_id: Uuid, transcript: &[Message]) -> DomainResult<()> {
        let transcript_json = serde_json::to_string(transcript)?;

        sqlx::query(
            "UPDATE results SET transcript = ?, updated_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(&transcript_json)
        .bind(Utc::now().to_rfc3339())
        .bind(result_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_result(&self, result_id: Uuid, outcome: &TestOutcome) -> DomainResult<bool> {
        if !outcome.status.is_terminal() {
            return Err(DomainError::InvalidStateTransition {
                from: TestStatus::Running.as_str().to_string(),
                to: outcome.status.as_str().to_string(),
                reason: "a result can only be completed with a terminal status".to_string(),
            });
        }

        let duration_ms = i64::try_from(outcome.duration_ms).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r"UPDATE results SET status = ?, transcript = ?, metric_results = ?, nodes_visited = ?,
               tools_called = ?, duration_ms = ?, end_reason = ?, error_message = ?, updated_at = ?
               WHERE id = ? AND status = 'running'",
        )
        .bind(outcome.status.as_str())
        .bind(serde_json::to_string(&outcome.transcript)?)
        .bind(serde_json::to_string(&outcome.metric_results)?)
        .bind(serde_json::to_string(&outcome.nodes_visited)?)
        .bind(serde_json::to_string(&outcome.tools_called)?)
        .bind(duration_ms)
        .bind(outcome.end_reason.as_str())
        .bind(outcome.error_message.as_deref())
        .bind(Utc::now().to_rfc3339())
        .bind(result_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.ensure_result_exists(result_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn mark_error(&self, result_id: Uuid, message: &str) -> DomainResult<bool> {
        self.finish(result_id, TestStatus::Error, EndReason::Error, Some(message))
            .await
    }

    async fn mark_cancelled(&self, result_id: Uuid) -> DomainResult<bool> {
        self.finish(result_id, TestStatus::Cancelled, EndReason::Cancelled, None)
            .await
    }

    async fn complete_run(&self, run_id: Uuid) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE runs SET completed_at = COALESCE(completed_at, ?) WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::RunNotFound(run_id));
        }
        Ok(())
    }

    async fn get_run_with_results(&self, run_id: Uuid) -> DomainResult<Option<RunWithResults>> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        let results = self.results_for(run_id).await?;
        Ok(Some(RunWithResults { run, results }))
    }

    async fn get_result(&self, result_id: Uuid) -> DomainResult<Option<TestResult>> {
        let row: Option<ResultRow> = sqlx::query_as(&format!(
            "SELECT {RESULT_COLUMNS} FROM results WHERE id = ?"
        ))
        .bind(result_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_runs(&self, agent_id: Option<&str>, limit: usize) -> DomainResult<Vec<RunSummary>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut query = String::from(
            r"SELECT r.id, r.agent_id, r.agent_name, r.started_at, r.completed_at,
                COUNT(res.id) AS total,
                COALESCE(SUM(CASE WHEN res.status = 'pass' THEN 1 ELSE 0 END), 0) AS passed,
                COALESCE(SUM(CASE WHEN res.status = 'fail' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN res.status = 'error' THEN 1 ELSE 0 END), 0) AS errored,
                COALESCE(SUM(CASE WHEN res.status = 'cancelled' THEN 1 ELSE 0 END), 0) AS cancelled,
                COALESCE(SUM(CASE WHEN res.status = 'running' THEN 1 ELSE 0 END), 0) AS running
              FROM runs r LEFT JOIN results res ON res.run_id = r.id",
        );
        if agent_id.is_some() {
            query.push_str(" WHERE r.agent_id = ?");
        }
        query.push_str(" GROUP BY r.id ORDER BY r.started_at DESC LIMIT ?");

        let mut q = sqlx::query_as::<_, RunSummaryRow>(&query);
        if let Some(agent_id) = agent_id {
            q = q.bind(agent_id);
        }
        let rows: Vec<RunSummaryRow> = q.bind(limit).fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_run(&self, run_id: Uuid) -> DomainResult<()> {
        let result = sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::RunNotFound(run_id));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    agent_id: String,
    agent_name: String,
    started_at: String,
    completed_at: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = DomainError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: parse_uuid("runs.id", &row.id)?,
            agent_id: row.agent_id,
            agent_name: row.agent_name,
            started_at: parse_datetime("runs.started_at", &row.started_at)?,
            completed_at: parse_optional_datetime("runs.completed_at", row.completed_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    id: String,
    run_id: String,
    test_case_id: String,
    test_name: String,
    status: String,
    transcript: Option<String>,
    metric_results: Option<String>,
    nodes_visited: Option<String>,
    tools_called: Option<String>,
    duration_ms: i64,
    end_reason: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ResultRow> for TestResult {
    type Error = DomainError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        let status = TestStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;
        let end_reason = row
            .end_reason
            .as_deref()
            .map(|s| {
                EndReason::from_str(s)
                    .ok_or_else(|| DomainError::SerializationError(format!("Invalid end reason: {s}")))
            })
            .transpose()?;

        Ok(TestResult {
            id: parse_uuid("results.id", &row.id)?,
            run_id: parse_uuid("results.run_id", &row.run_id)?,
            test_case_id: row.test_case_id,
            test_name: row.test_name,
            status,
            transcript: parse_json_or_default("results.transcript", row.transcript)?,
            metric_results: parse_json_or_default("results.metric_results", row.metric_results)?,
            nodes_visited: parse_json_or_default("results.nodes_visited", row.nodes_visited)?,
            tools_called: parse_json_or_default("results.tools_called", row.tools_called)?,
            duration_ms: u64::try_from(row.duration_ms).unwrap_or(0),
            end_reason,
            error_message: row.error_message,
            created_at: parse_datetime("results.created_at", &row.created_at)?,
            updated_at: parse_datetime("results.updated_at", &row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunSummaryRow {
    id: String,
    agent_id: String,
    agent_name: String,
    started_at: String,
    completed_at: Option<String>,
    total: i64,
    passed: i64,
    failed: i64,
    errored: i64,
    cancelled: i64,
    running: i64,
}

impl TryFrom<RunSummaryRow> for RunSummary {
    type Error = DomainError;

    fn try_from(row: RunSummaryRow) -> Result<Self, Self::Error> {
        let count = |n: i64| usize::try_from(n).unwrap_or(0);
        Ok(RunSummary {
            id: parse_uuid("runs.id", &row.id)?,
            agent_id: row.agent_id,
            agent_name: row.agent_name,
            started_at: parse_datetime("runs.started_at", &row.started_at)?,
            completed_at: parse_optional_datetime("runs.completed_at", row.completed_at)?,
            total: count(row.total),
            passed: count(row.passed),
            failed: count(row.failed),
            errored: count(row.errored),
            cancelled: count(row.cancelled),
            running: count(row.running),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use crate::domain::models::{MetricResult, ToolCallRecord};

    async fn setup() -> SqliteRunRepository {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteRunRepository::new(pool)
    }

    async fn seeded_run(repo: &SqliteRunRepository, tests: &[&str]) -> (Run, Vec<TestResult>) {
        let run = Run::new("agent-1", "Receptionist");
        repo.create_run(&run).await.unwrap();
        let mut results = Vec::new();
        for (position, name) in tests.iter().enumerate() {
            let result = TestResult::pending(run.id, *name, *name);
            repo.create_pending_result(&result, position).await.unwrap();
            results.push(result);
        }
        (run, results)
    }

    fn outcome(status: TestStatus) -> TestOutcome {
        TestOutcome {
            status,
            transcript: vec![Message::user("hi"), Message::assistant("hello").with_node("greet")],
            metric_results: vec![MetricResult::new("polite", status == TestStatus::Pass, "ok")],
            nodes_visited: vec!["greet".to_string()],
            tools_called: vec![ToolCallRecord {
                name: "lookup".to_string(),
                arguments: serde_json::json!({"id": 7}),
                node_id: Some("greet".to_string()),
            }],
            duration_ms: 1500,
            end_reason: EndReason::MaxTurns,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_results_come_back_in_position_order() {
        let repo = setup().await;
        let (run, results) = seeded_run(&repo, &["c", "a", "b"]).await;

        let loaded = repo.get_run_with_results(run.id).await.unwrap().unwrap();
        let names: Vec<_> = loaded.results.iter().map(|r| r.test_name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert!(loaded.results.iter().all(|r| r.status == TestStatus::Running));
        assert_eq!(loaded.results[0].id, results[0].id);
        assert!(loaded.run.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_complete_result_persists_outcome_once() {
        let repo = setup().await;
        let (_, results) = seeded_run(&repo, &["a"]).await;
        let id = results[0].id;

        assert!(repo.complete_result(id, &outcome(TestStatus::Pass)).await.unwrap());
        assert!(!repo.complete_result(id, &outcome(TestStatus::Fail)).await.unwrap());
        assert!(!repo.mark_error(id, "late").await.unwrap());

        let stored = repo.get_result(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TestStatus::Pass);
        assert_eq!(stored.transcript.len(), 2);
        assert_eq!(stored.transcript[1].node_id(), Some("greet"));
        assert_eq!(stored.tools_called[0].name, "lookup");
        assert_eq!(stored.duration_ms, 1500);
        assert_eq!(stored.end_reason, Some(EndReason::MaxTurns));
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_complete_result_rejects_running_status() {
        let repo = setup().await;
        let (_, results) = seeded_run(&repo, &["a"]).await;
        let err = repo
            .complete_result(results[0].id, &outcome(TestStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_mark_error_and_cancelled() {
        let repo = setup().await;
        let (_, results) = seeded_run(&repo, &["a", "b"]).await;

        assert!(repo.mark_error(results[0].id, "boom").await.unwrap());
        assert!(repo.mark_cancelled(results[1].id).await.unwrap());

        let errored = repo.get_result(results[0].id).await.unwrap().unwrap();
        assert_eq!(errored.status, TestStatus::Error);
        assert_eq!(errored.error_message.as_deref(), Some("boom"));
        assert_eq!(errored.end_reason, Some(EndReason::Error));

        let cancelled = repo.get_result(results[1].id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, TestStatus::Cancelled);
        assert_eq!(cancelled.end_reason, Some(EndReason::Cancelled));
    }

    #[tokio::test]
    async fn test_terminal_write_on_unknown_result() {
        let repo = setup().await;
        let err = repo.mark_cancelled(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DomainError::ResultNotFound(_)));
    }

    #[tokio::test]
    async fn test_update_transcript_only_while_running() {
        let repo = setup().await;
        let (_, results) = seeded_run(&repo, &["a"]).await;
        let id = results[0].id;

        repo.update_transcript(id, &[Message::user("one")]).await.unwrap();
        assert_eq!(repo.get_result(id).await.unwrap().unwrap().transcript.len(), 1);

        repo.mark_cancelled(id).await.unwrap();
        repo.update_transcript(id, &[Message::user("one"), Message::user("two")])
            .await
            .unwrap();
        assert_eq!(repo.get_result(id).await.unwrap().unwrap().transcript.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_run_is_idempotent() {
        let repo = setup().await;
        let (run, _) = seeded_run(&repo, &[]).await;

        repo.complete_run(run.id).await.unwrap();
        let first = repo.get_run_with_results(run.id).await.unwrap().unwrap().run.completed_at;
        repo.complete_run(run.id).await.unwrap();
        let second = repo.get_run_with_results(run.id).await.unwrap().unwrap().run.completed_at;
        assert!(first.is_some());
        assert_eq!(first, second);

        assert!(matches!(
            repo.complete_run(Uuid::new_v4()).await,
            Err(DomainError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_runs_with_counts_and_filter() {
        let repo = setup().await;
        let (run, results) = seeded_run(&repo, &["a", "b"]).await;
        repo.complete_result(results[0].id, &outcome(TestStatus::Pass)).await.unwrap();

        let other = Run::new("agent-2", "Other");
        repo.create_run(&other).await.unwrap();

        let all = repo.list_runs(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = repo.list_runs(Some("agent-1"), 10).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, run.id);
        assert_eq!(filtered[0].total, 2);
        assert_eq!(filtered[0].passed, 1);
        assert_eq!(filtered[0].running, 1);

        assert_eq!(repo.list_runs(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_run_cascades() {
        let repo = setup().await;
        let (run, results) = seeded_run(&repo, &["a"]).await;

        repo.delete_run(run.id).await.unwrap();
        assert!(repo.get_run_with_results(run.id).await.unwrap().is_none());
        assert!(repo.get_result(results[0].id).await.unwrap().is_none());
        assert!(matches!(repo.delete_run(run.id).await, Err(DomainError::RunNotFound(_))));
    }
}
