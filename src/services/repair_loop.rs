//! Diagnose, fix and retest a failing test.
//!
//! The judge diagnoses the failure and proposes prompt changes. Each
//! iteration applies the current changes to a fresh copy of the original
//! graph, reruns the test, and compares mean metric scores. The loop stops at
//! the first passing retest or after `max_iterations` attempts. Nothing here
//! is persisted; callers decide whether to keep the repaired graph.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    AgentDefinition, Condition, Diagnosis, FixAttemptResult, FixSuggestion, Graph, LocationKind,
    MetricResult, PromptChange, RunOptions, TestCase, TestOutcome, TestStatus, Transition,
};
use crate::domain::ports::DiagnosisRequest;
use crate::services::model_gateway::ModelGateway;
use crate::services::test_execution::{TestExecution, TestRunner};

/// A modified copy of a graph and which changes made it in.
#[derive(Debug, Clone, PartialEq)]
pub struct FixApplication {
    /// Graph with every applicable change made.
    pub graph: Graph,
    /// Changes that were made, in input order.
    pub applied: Vec<PromptChange>,
    /// Changes whose node or transition no longer exists.
    pub skipped: Vec<PromptChange>,
}

/// Apply `changes` to a copy of `graph`. The input is never modified.
pub fn apply_fix_to_graph(graph: &Graph, changes: &[PromptChange]) -> FixApplication {
    let mut modified = graph.clone();
    let mut applied = Vec::new();
    let mut skipped = Vec::new();

    for change in changes {
        if apply_change(&mut modified, change) {
            applied.push(change.clone());
        } else {
            debug!(
                kind = change.location_kind.as_str(),
                node_id = change.node_id.as_deref().unwrap_or(""),
                target = change.transition_target_id.as_deref().unwrap_or(""),
                "skipping change that no longer matches the graph"
            );
            skipped.push(change.clone());
        }
    }

    FixApplication {
        graph: modified,
        applied,
        skipped,
    }
}

fn apply_change(graph: &mut Graph, change: &PromptChange) -> bool {
    let proposed = change.proposed_text.clone();
    match change.location_kind {
        LocationKind::GeneralInstruction => {
            graph.set_general_prompt(proposed);
            true
        }
        LocationKind::NodeInstruction => {
            let Some(node) = change.node_id.as_deref().and_then(|id| graph.node_mut(id)) else {
                return false;
            };
            node.instructions = proposed;
            true
        }
        LocationKind::Transition => {
            let (Some(node_id), Some(target)) = (&change.node_id, &change.transition_target_id) else {
                return false;
            };
            let Some(transition) = graph
                .node_mut(node_id)
                .and_then(|node| node.transition_to_mut(target))
            else {
                return false;
            };
            transition.set_condition_text(proposed);
            true
        }
        LocationKind::MissingTransition => {
            let (Some(node_id), Some(target)) = (&change.node_id, &change.transition_target_id) else {
                return false;
            };
            if !graph.contains(target) {
                return false;
            }
            match graph.node_mut(node_id) {
                Some(node) if node.transition_to(target).is_none() => {
                    node.transitions
                        .push(Transition::new(target.clone(), Condition::llm_prompt(proposed)));
                    true
                }
                _ => false,
            }
        }
    }
}

/// Mean of effective metric scores; 0.0 when there are none.
pub fn mean_metric_score(results: &[MetricResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let count = results.len() as f64;
    results.iter().map(MetricResult::effective_score).sum::<f64>() / count
}

fn score_map(results: &[MetricResult]) -> BTreeMap<String, f64> {
    results
        .iter()
        .map(|m| (m.metric.clone(), m.effective_score()))
        .collect()
}

/// A failing test and the budget for repairing it.
pub struct RepairRequest<'a> {
    /// Agent whose graph is repaired.
    pub agent: &'a AgentDefinition,
    /// The failing test case.
    pub test_case: &'a TestCase,
    /// The failing execution being repaired.
    pub failed: &'a TestOutcome,
    /// Models and limits used for the retests.
    pub options: &'a RunOptions,
    /// Most apply-and-retest rounds to try. Zero only diagnoses.
    pub max_iterations: u32,
}

/// What a repair attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    /// Judge's account of the original failure.
    pub diagnosis: Diagnosis,
    /// First fix proposed, before any revision.
    pub suggestion: FixSuggestion,
    /// One record per apply-and-retest round.
    pub attempts: Vec<FixAttemptResult>,
    /// The repaired graph, when a retest passed.
    pub final_graph: Option<Graph>,
    /// True when some retest passed.
    pub succeeded: bool,
}

/// Diagnose a failing test, then apply fixes and retest until it passes or
/// the iteration budget runs out.
///
/// Every iteration applies its fix to the original graph. Retest results are
/// never persisted.
pub struct RepairLoop {
    runner: TestRunner,
}

impl RepairLoop {
    /// Repair loop running retests through `runner`.
    pub fn new(runner: TestRunner) -> Self {
        Self { runner }
    }

    fn gateway(&self) -> ModelGateway<'_> {
        ModelGateway::new(self.runner.models(), self.runner.retry_policy(), None)
    }

    /// Diagnose the failure and propose a first fix, without applying it.
    pub async fn diagnose_and_suggest(
        &self,
        request: &RepairRequest<'_>,
    ) -> DomainResult<(Diagnosis, FixSuggestion)> {
        let gateway = self.gateway();
        let judge_model = &request.options.judge_model;
        let failed_metrics = request.failed.failed_metrics();

        let diagnosis = gateway
            .diagnose(&DiagnosisRequest {
                model: judge_model.clone(),
                graph: request.agent.graph.clone(),
                transcript: request.failed.transcript.clone(),
                nodes_visited: request.failed.nodes_visited.clone(),
                failed_metrics: failed_metrics.clone(),
                scenario: request.test_case.user_prompt.clone(),
            })
            .await?;
        info!(
            root_cause = %diagnosis.root_cause,
            faults = diagnosis.fault_locations.len(),
            "failure diagnosed"
        );

        let suggestion = gateway
            .suggest_fix(judge_model, &request.agent.graph, &diagnosis, &failed_metrics)
            .await?
            .normalized();
        Ok((diagnosis, suggestion))
    }

    /// Diagnose, then apply-and-retest up to `max_iterations` times. Each failed
    /// retest asks the judge to revise the previous fix.
    #[instrument(skip_all, fields(test_name = %request.test_case.name, max_iterations = request.max_iterations))]
    pub async fn run(&self, request: &RepairRequest<'_>) -> DomainResult<RepairOutcome> {
        let (diagnosis, first_suggestion) = self.diagnose_and_suggest(request).await?;
        let gateway = self.gateway();
        let original = &request.agent.graph;

        let mut suggestion = first_suggestion.clone();
        let mut previous_metrics = request.failed.metric_results.clone();
        let mut attempts = Vec::new();
        let mut final_graph = None;

        for iteration in 1..=request.max_iterations {
            let application = apply_fix_to_graph(original, &suggestion.changes);
            info!(
                iteration,
                applied = application.applied.len(),
                skipped = application.skipped.len(),
                "retesting with fix"
            );

            let execution = TestExecution::new(&application.graph, request.test_case, request.options)
                .with_global_metrics(&request.agent.global_metrics);
            let retest = self.runner.execute(execution).await;

            let before = mean_metric_score(&previous_metrics);
            let after = mean_metric_score(&retest.metric_results);
            let passed = retest.status == TestStatus::Pass;
            attempts.push(FixAttemptResult {
                iteration,
                changes_applied: application.applied.clone(),
                test_passed: passed,
                metrics_before: score_map(&previous_metrics),
                metrics_after: score_map(&retest.metric_results),
                improved: after > before,
            });
            info!(iteration, passed, before, after, "fix attempt finished");

            if passed {
                final_graph = Some(application.graph);
                break;
            }
            if iteration < request.max_iterations {
                suggestion = gateway
                    .revise_fix(
                        &request.options.judge_model,
                        original,
                        &diagnosis,
                        &suggestion.changes,
                        &retest.metric_results,
                    )
                    .await?
                    .normalized();
            }
            previous_metrics = retest.metric_results;
        }

        Ok(RepairOutcome {
            diagnosis,
            suggestion: first_suggestion,
            succeeded: final_graph.is_some(),
            attempts,
            final_graph,
        })
    }
}
