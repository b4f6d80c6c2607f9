//! Configuration model loaded from YAML and `REHEARSE_` environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure for rehearse
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Run store location and pool size
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Model identifiers for the agent, simulator and judge roles
    #[serde(default)]
    pub models: ModelsConfig,

    /// Language-model API client configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Throttle applied to every model request
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Backoff for transient model failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Run execution defaults
    #[serde(default)]
    pub run: RunConfig,

    /// Repair loop configuration
    #[serde(default)]
    pub repair: RepairConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Where runs and results are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// `SQLite` file holding the run store
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Pool size; in-memory stores always use one connection
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".rehearse/rehearse.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Minimum level; `RUST_LOG` overrides it
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Console format, `json` or `pretty`
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stderr only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// File rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// Model identifiers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelsConfig {
    /// Model that plays the agent under test
    #[serde(default = "default_agent_model")]
    pub agent_model: String,

    /// Model that plays the simulated caller
    #[serde(default = "default_simulator_model")]
    pub simulator_model: String,

    /// Model that scores metrics, judges conditions and proposes fixes
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
}

fn default_agent_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_simulator_model() -> String {
    "claude-haiku-4-5".to_string()
}

fn default_judge_model() -> String {
    "claude-sonnet-4-5".to_string()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            agent_model: default_agent_model(),
            simulator_model: default_simulator_model(),
            judge_model: default_judge_model(),
        }
    }
}

/// Language-model API client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LlmConfig {
    /// Base URL of the Messages API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key; falls back to `ANTHROPIC_API_KEY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Value of the `anthropic-version` header
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Maximum tokens per completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_api_version() -> String {
    "2023-06-01".to_string()
}

const fn default_max_tokens() -> u32 {
    1024
}

const fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_version: default_api_version(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Token-bucket throttle shared by all model roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
    /// Sustained request rate
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Requests allowed back to back before throttling
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

const fn default_requests_per_second() -> f64 {
    5.0
}

const fn default_burst_size() -> u32 {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

/// Exponential backoff for transient model failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of calls, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff growth factor
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Randomization factor in [0, 1)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    60_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_jitter() -> f64 {
    0.25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Test execution strategy within a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Sequential,
    Parallel,
}

/// Run execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunConfig {
    /// Default turn cap per test
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// Default wall-clock cap per test in seconds
    #[serde(default = "default_run_timeout_secs")]
    pub timeout_secs: u64,

    /// Sequential or parallel test execution
    #[serde(default)]
    pub executor: ExecutorKind,

    /// Concurrency bound for the parallel executor
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Delay between run completion and registry teardown
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
}

const fn default_max_turns() -> u32 {
    20
}

const fn default_run_timeout_secs() -> u64 {
    300
}

const fn default_max_parallel() -> usize {
    4
}

const fn default_teardown_grace_ms() -> u64 {
    2_000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            timeout_secs: default_run_timeout_secs(),
            executor: ExecutorKind::default(),
            max_parallel: default_max_parallel(),
            teardown_grace_ms: default_teardown_grace_ms(),
        }
    }
}

/// Repair loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RepairConfig {
    /// Upper bound on fix attempts
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

const fn default_max_iterations() -> u32 {
    3
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8420
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Config {
    /// Run options derived from the configured models and run defaults.
    pub fn run_options(&self) -> super::test_case::RunOptions {
        super::test_case::RunOptions {
            agent_model: self.models.agent_model.clone(),
            simulator_model: self.models.simulator_model.clone(),
            judge_model: self.models.judge_model.clone(),
            max_turns: self.run.max_turns,
            timeout_secs: self.run.timeout_secs,
        }
    }
}
