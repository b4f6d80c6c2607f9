//! Domain types shared by every layer.

pub mod config;
pub mod graph;
pub mod message;
pub mod progress;
pub mod repair;
pub mod result;
pub mod run;
pub mod template;
pub mod test_case;

pub use config::{
    Config, DatabaseConfig, ExecutorKind, LlmConfig, LoggingConfig, ModelsConfig, RateLimitConfig,
    RepairConfig, RetryConfig, RunConfig, ServerConfig,
};
pub use graph::{Condition, Graph, GraphFormat, Node, ToolDefinition, Transition, END_CALL_TOOL};
pub use message::{Message, Role};
pub use progress::{ClientCommand, ProgressMessage, TokenSource};
pub use repair::{Diagnosis, FaultLocation, FixAttemptResult, FixSuggestion, LocationKind, PromptChange};
pub use result::{EndReason, MetricResult, TestOutcome, TestResult, TestStatus, ToolCallRecord};
pub use run::{Run, RunSummary, RunWithResults};
pub use test_case::{
    select_tests, AgentDefinition, GlobalMetric, MetricSpec, RuleChecks, RunOptions, TestCase,
    ToolMock,
};
