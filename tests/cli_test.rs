//! End-to-end command runs against the scripted backend.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;

use rehearse::cli::{dispatch, Cli};
use rehearse::domain::models::Config;

const AGENT: &str = r#"
id: front-desk
name: Front desk
graph:
  entry_node_id: greet
  nodes:
    greet:
      id: greet
      instructions: Greet the caller and help them.
"#;

const SUITE: &str = r"
- id: t1
  name: says hello
  user_prompt: You call to say hi.
- id: t2
  name: wants refund
  user_prompt: You want a refund.
  rules:
    includes: [refund]
";

fn workspace() -> (tempfile::TempDir, Config) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("agent.yaml"), AGENT).unwrap();
    std::fs::write(dir.path().join("tests.yaml"), SUITE).unwrap();
    let mut config = Config::default();
    config.database.path = dir.path().join("rehearse.db").display().to_string();
    config.run.teardown_grace_ms = 10;
    (dir, config)
}

fn arg(dir: &Path, name: &str) -> String {
    dir.join(name).display().to_string()
}

fn same(code: ExitCode, expected: ExitCode) -> bool {
    format!("{code:?}") == format!("{expected:?}")
}

async fn rehearse(args: &[&str], config: &Config) -> ExitCode {
    let cli = Cli::try_parse_from(std::iter::once("rehearse").chain(args.iter().copied())).unwrap();
    dispatch(cli, config.clone()).await.unwrap()
}

#[tokio::test]
async fn test_dry_run_exit_code_reflects_results() {
    let (dir, config) = workspace();
    let agent = arg(dir.path(), "agent.yaml");
    let suite = arg(dir.path(), "tests.yaml");

    let code = rehearse(&["--json", "run", &agent, &suite, "--test", "t1", "--dry-run"], &config).await;
    assert!(same(code, ExitCode::SUCCESS));

    let code = rehearse(&["--json", "run", &agent, &suite, "--all", "--dry-run", "--parallel", "2"], &config).await;
    assert!(same(code, ExitCode::FAILURE));

    let code = rehearse(&["--json", "runs", "list", "--agent", "front-desk"], &config).await;
    assert!(same(code, ExitCode::SUCCESS));
}

#[tokio::test]
async fn test_repair_of_unfixable_failure_fails() {
    let (dir, config) = workspace();
    let agent = arg(dir.path(), "agent.yaml");
    let suite = arg(dir.path(), "tests.yaml");
    let output = arg(dir.path(), "fixed.yaml");

    let code = rehearse(
        &[
            "--json", "repair", &agent, &suite, "--test", "wants refund", "--max-iterations", "2",
            "--output", &output, "--dry-run",
        ],
        &config,
    )
    .await;
    assert!(same(code, ExitCode::FAILURE));
    assert!(!dir.path().join("fixed.yaml").exists());

    let code = rehearse(&["--json", "repair", &agent, &suite, "--test", "t1", "--dry-run"], &config).await;
    assert!(same(code, ExitCode::SUCCESS));
}

#[tokio::test]
async fn test_unknown_run_is_an_error() {
    let (_dir, config) = workspace();
    let cli = Cli::try_parse_from([
        "rehearse",
        "runs",
        "show",
        "6f1c2b9e-4a4f-4d61-9f77-0c2b7f0d5a10",
    ])
    .unwrap();
    let err = dispatch(cli, config).await.unwrap_err();
    assert!(format!("{err:#}").contains("6f1c2b9e-4a4f-4d61-9f77-0c2b7f0d5a10"));
}
