//! Runs: one batch execution of test cases against one agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::result::{TestResult, TestStatus};

/// One batch execution of test cases against one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run id.
    pub id: Uuid,
    /// Agent under test.
    pub agent_id: String,
    /// Agent name at the time of the run.
    pub agent_name: String,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// Set once every result is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// New, incomplete run.
    pub fn new(agent_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// True once the run has a completion time.
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// A run and its results in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWithResults {
    /// The run itself, flattened into the JSON object.
    #[serde(flatten)]
    pub run: Run,
    /// Results in the order the tests were given.
    pub results: Vec<TestResult>,
}

impl RunWithResults {
    /// Result by id.
    pub fn result(&self, result_id: Uuid) -> Option<&TestResult> {
        self.results.iter().find(|r| r.id == result_id)
    }

    /// Status counts for this run.
    pub fn summary(&self) -> RunSummary {
        RunSummary::from_results(&self.run, &self.results)
    }

    /// True when every result ended in `pass`.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.status == TestStatus::Pass)
    }
}

/// Aggregate counts for run listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run id.
    pub id: Uuid,
    /// Agent under test.
    pub agent_id: String,
    /// Agent name at the time of the run.
    pub agent_name: String,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// When the run completed, if it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of results.
    pub total: usize,
    /// Results with status `pass`.
    pub passed: usize,
    /// Results with status `fail`.
    pub failed: usize,
    /// Results with status `error`.
    pub errored: usize,
    /// Results with status `cancelled`.
    pub cancelled: usize,
    /// Results still `running`.
    pub running: usize,
}

impl RunSummary {
    /// Count `results` by status.
    pub fn from_results(run: &Run, results: &[TestResult]) -> Self {
        let count = |status: TestStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            id: run.id,
            agent_id: run.agent_id.clone(),
            agent_name: run.agent_name.clone(),
            started_at: run.started_at,
            completed_at: run.completed_at,
            total: results.len(),
            passed: count(TestStatus::Pass),
            failed: count(TestStatus::Fail),
            errored: count(TestStatus::Error),
            cancelled: count(TestStatus::Cancelled),
            running: count(TestStatus::Running),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let run = Run::new("agent", "Agent");
        let mut results = vec![
            TestResult::pending(run.id, "a", "a"),
            TestResult::pending(run.id, "b", "b"),
            TestResult::pending(run.id, "c", "c"),
        ];
        results[0].status = TestStatus::Pass;
        results[1].status = TestStatus::Cancelled;
        let with_results = RunWithResults { run, results };

        let summary = with_results.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.running, 1);
        assert!(!with_results.all_passed());
    }

    #[test]
    fn test_run_serializes_flat() {
        let run = Run::new("agent", "Agent");
        let value = serde_json::to_value(RunWithResults { run: run.clone(), results: vec![] }).unwrap();
        assert_eq!(value["agent_id"], "agent");
        assert_eq!(value["id"], run.id.to_string());
        assert!(value["results"].as_array().unwrap().is_empty());
    }
}
