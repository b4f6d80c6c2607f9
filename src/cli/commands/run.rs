//! `rehearse run`: execute test cases against an agent with live progress.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use serde::Serialize;

use crate::cli::context::{build_runner, open_orchestrator, ModelMode};
use crate::cli::output::{output, CommandOutput, RunProgress, TableFormatter};
use crate::domain::models::{
    select_tests, AgentDefinition, Config, ExecutorKind, RunOptions, RunWithResults, TestCase,
};
use crate::services::RunOrchestrator;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Agent definition file (JSON or YAML)
    pub agent: PathBuf,

    /// Test case file (JSON or YAML list)
    pub suite: PathBuf,

    /// Run every test in the file (the default when no --test is given)
    #[arg(long, conflicts_with = "tests")]
    pub all: bool,

    /// Id or name of a test to run; repeatable
    #[arg(short = 't', long = "test", value_name = "NAME")]
    pub tests: Vec<String>,

    /// Turn cap per test
    #[arg(long)]
    pub max_turns: Option<u32>,

    /// Wall-clock cap per test in seconds
    #[arg(long = "timeout", value_name = "SECONDS")]
    pub timeout_secs: Option<u64>,

    /// Run up to N tests concurrently
    #[arg(short, long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    pub parallel: Option<u16>,

    /// Use the scripted backend instead of calling the model API
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    pub(crate) fn options(&self, config: &Config) -> RunOptions {
        let mut options = config.run_options();
        if let Some(max_turns) = self.max_turns {
            options.max_turns = max_turns;
        }
        if let Some(timeout_secs) = self.timeout_secs {
            options.timeout_secs = timeout_secs;
        }
        options
    }

    fn selected_tests(&self) -> Result<Vec<TestCase>> {
        let suite = TestCase::load_many(&self.suite)
            .with_context(|| format!("Failed to load tests from {}", self.suite.display()))?;
        let selection = if self.all { &[][..] } else { &self.tests[..] };
        let tests = select_tests(suite, selection)?;
        if tests.is_empty() {
            anyhow::bail!("{} contains no tests", self.suite.display());
        }
        Ok(tests)
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    #[serde(flatten)]
    pub run: RunWithResults,
}

impl CommandOutput for RunReport {
    fn to_human(&self) -> String {
        let summary = self.run.summary();
        let mut lines = vec![
            format!(
                "Run {} for {}",
                style(self.run.run.id).bold(),
                self.run.run.agent_name
            ),
            TableFormatter::new().format_results(&self.run.results),
            format!(
                "{} passed, {} failed, {} errored, {} cancelled",
                summary.passed, summary.failed, summary.errored, summary.cancelled
            ),
        ];
        if self.run.all_passed() {
            lines.push(style("All tests passed").green().to_string());
        }
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Run the selected tests and print the report. Exits 1 unless every test passed.
pub async fn execute(args: RunArgs, json_mode: bool, mut config: Config) -> Result<ExitCode> {
    let agent = AgentDefinition::load(&args.agent)
        .with_context(|| format!("Failed to load agent from {}", args.agent.display()))?;
    let tests = args.selected_tests()?;
    let options = args.options(&config);

    if let Some(parallel) = args.parallel {
        config.run.executor = ExecutorKind::Parallel;
        config.run.max_parallel = usize::from(parallel);
    }
    let mode = if args.dry_run {
        ModelMode::DryRun
    } else {
        ModelMode::Live
    };
    let runner = build_runner(&config, mode)?;
    let orchestrator = Arc::new(open_orchestrator(&config, runner).await?);

    let started = orchestrator
        .start_run(Arc::new(agent), tests, options)
        .await
        .context("Failed to start run")?;
    let run_id = started.run.id;

    let progress = if json_mode {
        RunProgress::hidden(&started)
    } else {
        RunProgress::new(&started)
    };
    follow(&orchestrator, &started, progress).await?;

    let finished = orchestrator
        .wait_for_completion(run_id)
        .await
        .context("Failed to load finished run")?;
    let passed = finished.all_passed();
    output(&RunReport { run: finished }, json_mode);

    Ok(if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Render progress until the run completes. The first Ctrl-C cancels tests
/// that have not started; the second interrupts the ones in flight.
async fn follow(
    orchestrator: &RunOrchestrator,
    started: &RunWithResults,
    mut progress: RunProgress,
) -> Result<()> {
    let run_id = started.run.id;
    let mut observer = orchestrator.connect(run_id).await?;
    let mut interrupts = 0u8;

    loop {
        tokio::select! {
            message = observer.recv() => {
                let Some(message) = message else { break };
                if !progress.handle(&message) {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c(), if interrupts < 2 => {
                signal.context("Failed to listen for Ctrl-C")?;
                interrupts += 1;
                if interrupts == 1 {
                    eprintln!("{} cancelling remaining tests (Ctrl-C again to interrupt)", style("!").yellow());
                    orchestrator.cancel_run(run_id).await?;
                } else {
                    eprintln!("{} interrupting running tests", style("!").yellow());
                    orchestrator.shutdown();
                }
            }
        }
    }

    progress.clear();
    orchestrator.disconnect(&observer).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    fn parse(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            crate::cli::Commands::Run(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_overrides_apply_to_configured_options() {
        let args = parse(&["rehearse", "run", "a.yaml", "t.yaml", "--max-turns", "3", "--timeout", "9"]);
        let options = args.options(&Config::default());
        assert_eq!(options.max_turns, 3);
        assert_eq!(options.timeout_secs, 9);
        assert_eq!(options.judge_model, Config::default().models.judge_model);
    }

    #[test]
    fn test_parallel_must_be_positive() {
        assert!(Cli::try_parse_from(["rehearse", "run", "a.yaml", "t.yaml", "--parallel", "0"]).is_err());
    }

    #[test]
    fn test_selection_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let suite = dir.path().join("tests.yaml");
        std::fs::write(
            &suite,
            "- id: t1\n  name: books a table\n  user_prompt: Book for two.\n\
             - id: t2\n  name: asks hours\n  user_prompt: When do you open?\n",
        )
        .unwrap();
        let suite = suite.display().to_string();

        let args = parse(&["rehearse", "run", "a.yaml", &suite, "--test", "asks hours"]);
        let tests = args.selected_tests().unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].id, "t2");

        let args = parse(&["rehearse", "run", "a.yaml", &suite]);
        assert_eq!(args.selected_tests().unwrap().len(), 2);

        let args = parse(&["rehearse", "run", "a.yaml", &suite, "--test", "nope"]);
        assert!(args.selected_tests().is_err());
    }
}
