use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::domain::errors::DomainError;
use crate::domain::models::{select_tests, RunOptions, RunSummary, RunWithResults, TestCase};

/// Body of `POST /runs`.
#[derive(Debug, Default, Deserialize)]
pub struct StartRunRequest {
    /// Tests to run; the server's suite when empty.
    #[serde(default)]
    pub tests: Vec<TestCase>,
    /// Ids or names selecting a subset of the tests.
    #[serde(default)]
    pub only: Vec<String>,
    /// Overrides the server's turn limit.
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Overrides the server's time limit.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Overrides the agent model.
    #[serde(default)]
    pub agent_model: Option<String>,
    /// Overrides the simulator model.
    #[serde(default)]
    pub simulator_model: Option<String>,
    /// Overrides the judge model.
    #[serde(default)]
    pub judge_model: Option<String>,
}

impl StartRunRequest {
    fn options(&self, defaults: &RunOptions) -> RunOptions {
        let mut options = defaults.clone();
        if let Some(max_turns) = self.max_turns {
            options.max_turns = max_turns;
        }
        if let Some(timeout_secs) = self.timeout_secs {
            options.timeout_secs = timeout_secs;
        }
        if let Some(model) = &self.agent_model {
            options.agent_model.clone_from(model);
        }
        if let Some(model) = &self.simulator_model {
            options.simulator_model.clone_from(model);
        }
        if let Some(model) = &self.judge_model {
            options.judge_model.clone_from(model);
        }
        options
    }
}

/// Query string of `GET /runs`.
#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    /// Only runs of this agent.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Most runs to return. Defaults to 50.
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub error: String,
    /// Stable error code, such as `NOT_FOUND` or `RUN_ACTIVE`.
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

impl From<DomainError> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: DomainError) -> Self {
        let (status, code) = match &err {
            DomainError::RunNotFound(_) | DomainError::ResultNotFound(_) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            DomainError::ValidationFailed(_) => (StatusCode::BAD_REQUEST, "VALIDATION_FAILED"),
            DomainError::InvalidGraph(_) | DomainError::MissingNode(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_GRAPH")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        api_error(status, code, err.to_string())
    }
}

/// GET /health
pub async fn health_check() -> &'static str {
    "OK"
}

/// POST /runs - start a run against the served agent
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<RunWithResults>), ApiError> {
    let options = request.options(&state.defaults);
    let suite = if request.tests.is_empty() {
        state.suite.clone()
    } else {
        request.tests
    };
    let tests = select_tests(suite, &request.only)?;
    if tests.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            "no tests to run",
        ));
    }

    let run = state
        .orchestrator
        .start_run(Arc::clone(&state.agent), tests, options)
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// GET /runs - newest first
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunSummary>>, ApiError> {
    let runs = state
        .orchestrator
        .list_runs(query.agent_id.as_deref(), query.limit)
        .await?;
    Ok(Json(runs))
}

/// GET /runs/{id} - heals abandoned runs before returning
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunWithResults>, ApiError> {
    Ok(Json(state.orchestrator.get_run(id).await?))
}

/// DELETE /runs/{id} - 409 while the run is active
pub async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.orchestrator.active_runs().await.contains(&id) {
        return Err(api_error(
            StatusCode::CONFLICT,
            "RUN_ACTIVE",
            format!("run {id} is still active"),
        ));
    }
    state.orchestrator.get_run(id).await?;
    state.orchestrator.delete_run(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
