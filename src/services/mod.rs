//! Application services: conversation traversal, test execution, repair,
//! and the run orchestration that ties them to storage and observers.

pub mod conversation_engine;
pub mod equation;
pub mod model_gateway;
pub mod repair_loop;
pub mod retry_policy;
pub mod run_orchestrator;
pub mod run_registry;
pub mod test_execution;

pub use conversation_engine::{ConversationEngine, TurnOutcome};
pub use equation::Equation;
pub use model_gateway::{EventSink, ModelGateway, ModelSet, TestEvent};
pub use repair_loop::{
    apply_fix_to_graph, mean_metric_score, FixApplication, RepairLoop, RepairOutcome, RepairRequest,
};
pub use retry_policy::{RetryNotice, RetryPolicy};
pub use run_orchestrator::{
    ParallelExecutor, RunExecutor, RunOrchestrator, SequentialExecutor, ABANDONED_RUN_MESSAGE,
};
pub use run_registry::{ActiveRunState, Observer, RunRegistry};
pub use test_execution::{evaluate_rules, TestExecution, TestRunner};
