//! Rehearse - conversation simulation, scoring and repair for graph-based agents
//!
//! An agent is a graph of prompt nodes joined by conditional transitions. A
//! test case describes a caller persona; rehearse plays that caller against
//! the agent with a simulator model, walks the graph as the conversation
//! unfolds, and scores the transcript with a judge model. Failing tests can
//! be diagnosed and repaired by iterating on prompt changes.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): graph, test, result and progress models, and
//!   the ports adapters implement
//! - **Service Layer** (`services`): conversation engine, test execution, run
//!   orchestration with live progress, retry policy, repair loop
//! - **Adapters** (`adapters`): SQLite persistence, model backends, HTTP and
//!   WebSocket surface
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rehearse::adapters::llm::ScriptedBackend;
//! use rehearse::services::{ModelSet, RetryPolicy, TestExecution, TestRunner};
//!
//! let runner = TestRunner::new(
//!     ModelSet::from_backend(Arc::new(ScriptedBackend::new())),
//!     RetryPolicy::default(),
//! );
//! let outcome = runner
//!     .execute(TestExecution::new(&agent.graph, &test_case, &options))
//!     .await;
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::models::{
    AgentDefinition, Config, Graph, RunOptions, RunWithResults, TestCase, TestOutcome, TestStatus,
};
pub use domain::{DomainError, DomainResult, LlmError};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{RepairLoop, RunOrchestrator, TestRunner};
