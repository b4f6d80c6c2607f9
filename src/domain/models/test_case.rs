//! Test scenarios, agent definitions and run options.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::graph::{Graph, GraphFormat};
use crate::domain::errors::{DomainError, DomainResult};

/// Canned response returned when the agent invokes a tool during a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMock {
    /// Tool the mock answers for.
    pub tool_name: String,
    /// Text returned to the agent as the tool result.
    pub response: String,
}

/// Deterministic checks against the agent's side of the transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleChecks {
    /// Text that must appear in some agent message (case-insensitive).
    #[serde(default)]
    pub includes: Vec<String>,
    /// Text that must not appear in any agent message (case-insensitive).
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Regular expressions that must match the agent's messages.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl RuleChecks {
    /// True when no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty() && self.patterns.is_empty()
    }
}

/// One simulated-caller scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Stable id, used to select tests.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Persona and goal the simulator plays.
    pub user_prompt: String,
    /// Natural-language metrics the judge scores the transcript against.
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Values substituted into `{{name}}` references and read by equation conditions.
    #[serde(default)]
    pub dynamic_variables: HashMap<String, Value>,
    /// Canned tool responses, matched by tool name.
    #[serde(default)]
    pub tool_mocks: Vec<ToolMock>,
    /// Overrides the run's turn limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Overrides the run's time limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Deterministic transcript checks, scored alongside the metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<RuleChecks>,
}

impl TestCase {
    /// Scenario with no metrics, variables or mocks.
    pub fn new(id: impl Into<String>, name: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            user_prompt: user_prompt.into(),
            metrics: Vec::new(),
            dynamic_variables: HashMap::new(),
            tool_mocks: Vec::new(),
            max_turns: None,
            timeout_secs: None,
            rules: None,
        }
    }

    /// Add a judged metric.
    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.metrics.push(metric.into());
        self
    }

    /// Set a dynamic variable.
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.dynamic_variables.insert(name.into(), value);
        self
    }

    /// Answer calls to `tool_name` with `response`.
    pub fn with_tool_mock(mut self, tool_name: impl Into<String>, response: impl Into<String>) -> Self {
        self.tool_mocks.push(ToolMock {
            tool_name: tool_name.into(),
            response: response.into(),
        });
        self
    }

    /// Override the turn limit.
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    /// Attach rule checks.
    pub fn with_rules(mut self, rules: RuleChecks) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Mock for `tool_name`, if any.
    pub fn tool_mock(&self, tool_name: &str) -> Option<&ToolMock> {
        self.tool_mocks.iter().find(|m| m.tool_name == tool_name)
    }

    /// Parse a list of test cases from JSON or YAML text.
    pub fn parse_many(content: &str, format: GraphFormat) -> DomainResult<Vec<Self>> {
        let tests: Vec<Self> = match format {
            GraphFormat::Json => serde_json::from_str(content)?,
            GraphFormat::Yaml => serde_yaml::from_str(content)?,
        };
        Ok(tests)
    }

    /// Load a list of test cases from a JSON or YAML file.
    pub fn load_many(path: &Path) -> DomainResult<Vec<Self>> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DomainError::ValidationFailed(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse_many(&content, GraphFormat::from_path(path))
    }
}

/// Pick tests by id or name, keeping suite order. An empty selection keeps every test.
pub fn select_tests(tests: Vec<TestCase>, selection: &[String]) -> DomainResult<Vec<TestCase>> {
    if selection.is_empty() {
        return Ok(tests);
    }
    let matches = |test: &TestCase, wanted: &str| test.id == wanted || test.name == wanted;
    if let Some(unknown) = selection
        .iter()
        .find(|wanted| !tests.iter().any(|t| matches(t, wanted)))
    {
        return Err(DomainError::ValidationFailed(format!(
            "no test with id or name '{unknown}'"
        )));
    }
    Ok(tests
        .into_iter()
        .filter(|t| selection.iter().any(|wanted| matches(t, wanted)))
        .collect())
}

/// Metric applied to every test of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalMetric {
    /// Metric name, used as the result label.
    pub name: String,
    /// What the judge checks for.
    pub criteria: String,
    /// Minimum score to pass. Without one the judge's verdict decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Disabled metrics are kept but never scored.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

/// A metric as handed to the judge.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    /// Label for the resulting score.
    pub name: String,
    /// What the judge checks for.
    pub criteria: String,
    /// Minimum score to pass.
    pub threshold: Option<f64>,
}

impl MetricSpec {
    /// Per-test metric: the text is both name and criteria.
    pub fn from_text(text: &str) -> Self {
        Self {
            name: text.to_string(),
            criteria: text.to_string(),
            threshold: None,
        }
    }
}

impl From<&GlobalMetric> for MetricSpec {
    fn from(metric: &GlobalMetric) -> Self {
        Self {
            name: metric.name.clone(),
            criteria: metric.criteria.clone(),
            threshold: metric.threshold,
        }
    }
}

/// An agent under test: its graph plus agent-wide metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Agent id, used to group runs.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Conversation graph.
    pub graph: Graph,
    /// Metrics scored on every test.
    #[serde(default)]
    pub global_metrics: Vec<GlobalMetric>,
}

impl AgentDefinition {
    /// Agent with no global metrics.
    pub fn new(id: impl Into<String>, name: impl Into<String>, graph: Graph) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            graph,
            global_metrics: Vec::new(),
        }
    }

    /// Add a global metric.
    pub fn with_global_metric(mut self, metric: GlobalMetric) -> Self {
        self.global_metrics.push(metric);
        self
    }

    /// Global metrics that are switched on.
    pub fn enabled_metrics(&self) -> impl Iterator<Item = &GlobalMetric> {
        self.global_metrics.iter().filter(|m| m.enabled)
    }

    /// Load an agent file. A file holding a bare graph is accepted too; its id
    /// and name are taken from the file stem.
    pub fn load(path: &Path) -> DomainResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DomainError::InvalidGraph(format!("cannot read {}: {e}", path.display()))
        })?;
        let format = GraphFormat::from_path(path);
        let value: Value = match format {
            GraphFormat::Json => serde_json::from_str(&content)?,
            GraphFormat::Yaml => serde_yaml::from_str(&content)?,
        };

        let agent = if value.get("graph").is_some() {
            serde_json::from_value(value)?
        } else {
            let graph: Graph = serde_json::from_value(value)?;
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("agent")
                .to_string();
            Self::new(stem.clone(), stem, graph)
        };

        agent.graph.validate()?;
        Ok(agent)
    }
}

/// Model identifiers and limits for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Model the agent under test runs on.
    pub agent_model: String,
    /// Model playing the caller.
    pub simulator_model: String,
    /// Model scoring metrics and diagnosing failures.
    pub judge_model: String,
    /// Turn limit for tests that do not set their own.
    pub max_turns: u32,
    /// Time limit in seconds for tests that do not set their own.
    pub timeout_secs: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            agent_model: "claude-sonnet-4-5".to_string(),
            simulator_model: "claude-haiku-4-5".to_string(),
            judge_model: "claude-sonnet-4-5".to_string(),
            max_turns: 20,
            timeout_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::graph::Node;

    #[test]
    fn test_parse_test_cases_yaml() {
        let yaml = r"
- id: t1
  name: books appointment
  user_prompt: You want a haircut on Friday.
  metrics:
    - Agent confirms the booking time.
  dynamic_variables:
    name: Ada
  tool_mocks:
    - tool_name: check_calendar
      response: Friday 3pm is free
  max_turns: 6
  rules:
    includes: [friday]
";
        let tests = TestCase::parse_many(yaml, GraphFormat::Yaml).unwrap();
        assert_eq!(tests.len(), 1);
        let test = &tests[0];
        assert_eq!(test.max_turns, Some(6));
        assert_eq!(test.tool_mock("check_calendar").unwrap().response, "Friday 3pm is free");
        assert_eq!(test.rules.as_ref().unwrap().includes, vec!["friday"]);
        assert!(test.timeout_secs.is_none());
    }

    #[test]
    fn test_global_metric_enabled_by_default() {
        let metric: GlobalMetric =
            serde_json::from_str(r#"{"name": "tone", "criteria": "Polite"}"#).unwrap();
        assert!(metric.enabled);
        assert_eq!(metric.threshold, None);

        let agent = AgentDefinition::new("a", "A", Graph::new("n").with_node(Node::new("n", "")))
            .with_global_metric(metric)
            .with_global_metric(GlobalMetric {
                name: "off".into(),
                criteria: "x".into(),
                threshold: None,
                enabled: false,
            });
        let names: Vec<_> = agent.enabled_metrics().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["tone"]);
    }

    #[test]
    fn test_load_agent_accepts_bare_graph() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receptionist.json");
        let graph = Graph::new("n").with_node(Node::new("n", "hello"));
        std::fs::write(&path, serde_json::to_string(&graph).unwrap()).unwrap();

        let agent = AgentDefinition::load(&path).unwrap();
        assert_eq!(agent.id, "receptionist");
        assert_eq!(agent.graph, graph);
    }

    #[test]
    fn test_select_tests_by_id_or_name() {
        let suite = vec![
            TestCase::new("t1", "books appointment", "..."),
            TestCase::new("t2", "cancels appointment", "..."),
            TestCase::new("t3", "asks for hours", "..."),
        ];
        let picked = select_tests(
            suite.clone(),
            &["asks for hours".to_string(), "t1".to_string()],
        )
        .unwrap();
        let ids: Vec<_> = picked.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["t1", "t3"]);

        assert_eq!(select_tests(suite.clone(), &[]).unwrap().len(), 3);
        assert!(matches!(
            select_tests(suite, &["t9".to_string()]),
            Err(DomainError::ValidationFailed(_))
        ));
    }
}
