//! `rehearse repair`: run one test and, if it fails, iterate on prompt fixes.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use serde::Serialize;

use crate::cli::context::{build_runner, ModelMode};
use crate::cli::output::{create_spinner, output, truncate, CommandOutput, TableFormatter};
use crate::domain::models::{
    select_tests, AgentDefinition, Config, Diagnosis, FixAttemptResult, FixSuggestion,
    GraphFormat, TestCase, TestStatus,
};
use crate::services::{RepairLoop, RepairRequest, TestExecution};

#[derive(Args, Debug)]
pub struct RepairArgs {
    /// Agent definition file (JSON or YAML)
    pub agent: PathBuf,

    /// Test case file (JSON or YAML list)
    pub suite: PathBuf,

    /// Id or name of the test to repair
    #[arg(short = 't', long = "test", value_name = "NAME")]
    pub test: String,

    /// Upper bound on fix attempts
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_iterations: Option<u32>,

    /// Write the repaired agent here (format by extension)
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Use the scripted backend instead of calling the model API
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
pub struct RepairReport {
    pub test_name: String,
    pub initial_status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<FixSuggestion>,
    pub attempts: Vec<FixAttemptResult>,
    pub repaired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written_to: Option<PathBuf>,
}

impl RepairReport {
    /// The test passes now, either from the start or after a fix.
    pub fn passing(&self) -> bool {
        self.initial_status == TestStatus::Pass || self.repaired
    }
}

impl CommandOutput for RepairReport {
    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        match self.initial_status {
            TestStatus::Pass => {
                lines.push(format!(
                    "{} '{}' already passes; nothing to repair",
                    style("✓").green(),
                    self.test_name
                ));
                return lines.join("\n");
            }
            TestStatus::Fail => {}
            other => {
                lines.push(format!(
                    "{} '{}' ended with status {}; only failing tests can be repaired",
                    style("!").red(),
                    self.test_name,
                    other.as_str()
                ));
                if let Some(error) = &self.initial_error {
                    lines.push(format!("  {error}"));
                }
                return lines.join("\n");
            }
        }

        if let Some(diagnosis) = &self.diagnosis {
            lines.push(format!("Root cause: {}", diagnosis.root_cause));
            for location in &diagnosis.fault_locations {
                let node = location.node_id.as_deref().unwrap_or("-");
                lines.push(format!(
                    "  {} [{}] {}",
                    location.kind.as_str(),
                    node,
                    truncate(&location.quoted_text, 80)
                ));
            }
        }
        if let Some(suggestion) = &self.suggestion {
            lines.push(format!(
                "Suggested fix ({:.0}% confidence): {}",
                suggestion.confidence * 100.0,
                suggestion.summary
            ));
        }
        if !self.attempts.is_empty() {
            lines.push(TableFormatter::new().format_attempts(&self.attempts));
        }

        if self.repaired {
            lines.push(format!(
                "{} repaired after {} attempt(s)",
                style("✓").green(),
                self.attempts.len()
            ));
            if let Some(path) = &self.written_to {
                lines.push(format!("Repaired agent written to {}", path.display()));
            }
        } else {
            lines.push(format!(
                "{} not repaired after {} attempt(s)",
                style("✗").red(),
                self.attempts.len()
            ));
        }
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Run one test and, if it fails, repair it. Exits 1 unless the test passed
/// or a repaired graph passed its retest.
pub async fn execute(args: RepairArgs, json_mode: bool, config: Config) -> Result<ExitCode> {
    let agent = AgentDefinition::load(&args.agent)
        .with_context(|| format!("Failed to load agent from {}", args.agent.display()))?;
    let suite = TestCase::load_many(&args.suite)
        .with_context(|| format!("Failed to load tests from {}", args.suite.display()))?;
    let test_case = select_tests(suite, std::slice::from_ref(&args.test))?
        .into_iter()
        .next()
        .with_context(|| format!("No test named '{}'", args.test))?;

    let mode = if args.dry_run {
        ModelMode::DryRun
    } else {
        ModelMode::Live
    };
    let runner = build_runner(&config, mode)?;
    let options = config.run_options();

    let spinner = (!json_mode).then(create_spinner);
    if let Some(spinner) = &spinner {
        spinner.set_message(format!("running '{}'", test_case.name));
    }
    let execution = TestExecution::new(&agent.graph, &test_case, &options)
        .with_global_metrics(&agent.global_metrics);
    let initial = runner.execute(execution).await;

    let mut report = RepairReport {
        test_name: test_case.name.clone(),
        initial_status: initial.status,
        initial_error: initial.error_message.clone(),
        diagnosis: None,
        suggestion: None,
        attempts: Vec::new(),
        repaired: false,
        written_to: None,
    };

    if initial.status == TestStatus::Fail {
        if let Some(spinner) = &spinner {
            spinner.set_message(format!("repairing '{}'", test_case.name));
        }
        let request = RepairRequest {
            agent: &agent,
            test_case: &test_case,
            failed: &initial,
            options: &options,
            max_iterations: args.max_iterations.unwrap_or(config.repair.max_iterations),
        };
        let outcome = RepairLoop::new(runner)
            .run(&request)
            .await
            .context("Repair loop failed")?;

        if let (Some(graph), Some(path)) = (&outcome.final_graph, &args.output) {
            let repaired = AgentDefinition {
                graph: graph.clone(),
                ..agent.clone()
            };
            write_agent(&repaired, path)?;
            report.written_to = Some(path.clone());
        }
        report.diagnosis = Some(outcome.diagnosis);
        report.suggestion = Some(outcome.suggestion);
        report.attempts = outcome.attempts;
        report.repaired = outcome.succeeded;
    }

    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    output(&report, json_mode);

    Ok(if report.passing() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Serialize an agent in the format implied by the file extension.
fn write_agent(agent: &AgentDefinition, path: &Path) -> Result<()> {
    let content = match GraphFormat::from_path(path) {
        GraphFormat::Json => serde_json::to_string_pretty(agent)?,
        GraphFormat::Yaml => serde_yaml::to_string(agent)?,
    };
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write repaired agent to {}", path.display()))
}
