//! HTTP and WebSocket surface for one served agent.
//!
//! Runs are started over `POST /runs` and followed live over
//! `GET /runs/{id}/ws`, which carries the progress protocol in both
//! directions.

mod handlers;
mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::domain::models::{AgentDefinition, RunOptions, ServerConfig, TestCase};
use crate::services::RunOrchestrator;

pub use handlers::{ErrorResponse, ListRunsQuery, StartRunRequest};

/// Shared state for the HTTP server.
pub struct AppState {
    /// Orchestrator executing the runs.
    pub orchestrator: Arc<RunOrchestrator>,
    /// The served agent.
    pub agent: Arc<AgentDefinition>,
    /// Suite used when a start request carries no tests of its own.
    pub suite: Vec<TestCase>,
    /// Options used when a request does not override them.
    pub defaults: RunOptions,
}

/// HTTP server exposing runs of the served agent.
pub struct HttpServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Server for `state`, bound to the configured host and port.
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/runs", post(handlers::start_run).get(handlers::list_runs))
            .route(
                "/runs/{id}",
                get(handlers::get_run).delete(handlers::delete_run),
            )
            .route("/runs/{id}/ws", get(websocket::run_socket))
            .route("/health", get(handlers::health_check))
            .with_state(Arc::clone(&self.state))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
    }

    /// Socket address from the configured host and port.
    pub fn address(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.config.host, self.config.port).parse()
    }

    /// Serve until `shutdown` resolves, then interrupt in-flight tests.
    pub async fn serve_with_shutdown<F>(
        self,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = self.address()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on<F>(
        self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        tracing::info!(
            addr = %listener.local_addr()?,
            agent_id = %self.state.agent.id,
            "HTTP server listening"
        );
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        self.state.orchestrator.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::llm::ScriptedBackend;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteRunRepository};
    use crate::domain::models::{Graph, Node, RunWithResults, TestStatus};
    use crate::services::{ModelSet, RetryPolicy, TestRunner};
    use serde_json::json;

    async fn spawn_server() -> (String, tokio::sync::oneshot::Sender<()>) {
        let pool = create_migrated_test_pool().await.unwrap();
        let backend = Arc::new(ScriptedBackend::new().with_user_turns(["Hi"]));
        let runner = TestRunner::new(ModelSet::from_backend(backend), RetryPolicy::no_retry());
        let orchestrator = RunOrchestrator::new(Arc::new(SqliteRunRepository::new(pool)), runner)
            .with_teardown_grace(std::time::Duration::ZERO);

        let graph = Graph::new("greet").with_node(Node::new("greet", "Greet the caller."));
        let state = AppState {
            orchestrator: Arc::new(orchestrator),
            agent: Arc::new(AgentDefinition::new("front-desk", "Front desk", graph)),
            suite: vec![
                TestCase::new("t1", "says hello", "You call to say hi."),
                TestCase::new("t2", "asks hours", "You want the opening hours."),
            ],
            defaults: RunOptions {
                max_turns: 2,
                ..RunOptions::default()
            },
        };
        let server = HttpServer::new(ServerConfig::default(), state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            server
                .serve_on(listener, async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });
        (base, stop)
    }

    #[tokio::test]
    async fn test_health() {
        let (base, _stop) = spawn_server().await;
        let body = reqwest::get(format!("{base}/health")).await.unwrap().text().await.unwrap();
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_start_run_with_filter_then_fetch_and_delete() {
        let (base, _stop) = spawn_server().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/runs"))
            .json(&json!({"only": ["asks hours"]}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let started: RunWithResults = response.json().await.unwrap();
        assert_eq!(started.results.len(), 1);
        assert_eq!(started.results[0].test_case_id, "t2");

        let run_id = started.run.id;
        let mut finished = None;
        for _ in 0..100 {
            let run: RunWithResults = client
                .get(format!("{base}/runs/{run_id}"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if run.run.is_complete() {
                finished = Some(run);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let finished = finished.expect("run did not complete");
        assert_eq!(finished.results[0].status, TestStatus::Pass);

        let listed: serde_json::Value = client
            .get(format!("{base}/runs?limit=10"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        // teardown runs in its own task right after completion
        let mut deleted = None;
        for _ in 0..100 {
            let response = client
                .delete(format!("{base}/runs/{run_id}"))
                .send()
                .await
                .unwrap();
            if response.status() != reqwest::StatusCode::CONFLICT {
                deleted = Some(response.status());
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(deleted, Some(reqwest::StatusCode::NO_CONTENT));

        let missing = client
            .get(format!("{base}/runs/{run_id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_test_name_is_bad_request() {
        let (base, _stop) = spawn_server().await;
        let response = reqwest::Client::new()
            .post(format!("{base}/runs"))
            .json(&json!({"only": ["does not exist"]}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.code, "VALIDATION_FAILED");
    }
}
