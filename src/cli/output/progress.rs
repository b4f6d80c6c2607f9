//! Live run progress for the terminal.
//!
//! [`RunProgress`] consumes progress messages from an observer and renders a
//! spinner for the test in flight plus one line per finished test.

use std::collections::HashMap;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use uuid::Uuid;

use crate::domain::models::{ProgressMessage, RunWithResults, TestStatus};

const SPINNER_TEMPLATE: &str = "[{elapsed_precise}] {spinner:.green} {msg}";
const SPINNER_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// Create a spinner for indeterminate operations.
pub fn create_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template(SPINNER_TEMPLATE) {
        spinner.set_style(style.tick_chars(SPINNER_CHARS));
    }
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Terminal renderer for one run.
pub struct RunProgress {
    spinner: ProgressBar,
    names: HashMap<Uuid, String>,
    finished: usize,
    total: usize,
}

impl RunProgress {
    /// Tracker for `run` on a fresh spinner.
    pub fn new(run: &RunWithResults) -> Self {
        Self::with_spinner(run, create_spinner())
    }

    /// Renderer that draws nothing.
    pub fn hidden(run: &RunWithResults) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_draw_target(ProgressDrawTarget::hidden());
        Self::with_spinner(run, spinner)
    }

    fn with_spinner(run: &RunWithResults, spinner: ProgressBar) -> Self {
        let names = run
            .results
            .iter()
            .map(|r| (r.id, r.test_name.clone()))
            .collect();
        let progress = Self {
            spinner,
            names,
            finished: 0,
            total: run.results.len(),
        };
        progress.spinner.set_message(progress.counter());
        progress
    }

    fn counter(&self) -> String {
        format!("{}/{} tests finished", self.finished, self.total)
    }

    fn name(&self, result_id: Uuid) -> &str {
        self.names.get(&result_id).map_or("unknown test", String::as_str)
    }

    /// Apply one message. Returns `false` once the run has completed.
    pub fn handle(&mut self, message: &ProgressMessage) -> bool {
        match message {
            ProgressMessage::State { run } => {
                self.finished = run.results.iter().filter(|r| r.is_terminal()).count();
                self.spinner.set_message(self.counter());
            }
            ProgressMessage::TestStarted { test_name, .. } => {
                self.spinner
                    .set_message(format!("{} - running {test_name}", self.counter()));
            }
            ProgressMessage::TranscriptUpdate {
                result_id,
                transcript,
            } => {
                self.spinner.set_message(format!(
                    "{} - {} ({} messages)",
                    self.counter(),
                    self.name(*result_id),
                    transcript.len()
                ));
            }
            ProgressMessage::TokenUpdate { .. } => {}
            ProgressMessage::RetryError {
                result_id,
                error_kind,
                attempt,
                max_attempts,
                retry_after,
                ..
            } => {
                self.spinner.println(format!(
                    "  {} {}: {error_kind}, retry {attempt}/{max_attempts} in {retry_after:.1}s",
                    style("!").yellow(),
                    self.name(*result_id)
                ));
            }
            ProgressMessage::TestCompleted { result_id, status } => {
                let mark = match status {
                    TestStatus::Pass => style("✓").green(),
                    TestStatus::Fail => style("✗").red(),
                    _ => style("•").dim(),
                };
                let line = format!("{mark} {} {}", self.name(*result_id), status.as_str());
                self.finish_line(line);
            }
            ProgressMessage::TestCancelled { result_id } => {
                let line = format!("{} {} cancelled", style("-").dim(), self.name(*result_id));
                self.finish_line(line);
            }
            ProgressMessage::TestError { result_id, error } => {
                let line = format!("{} {} error: {error}", style("!").red(), self.name(*result_id));
                self.finish_line(line);
            }
            ProgressMessage::RunCompleted {} => {
                self.spinner.finish_and_clear();
                return false;
            }
            ProgressMessage::Error { message } => {
                self.spinner
                    .println(format!("{} {message}", style("error:").red()));
            }
        }
        true
    }

    fn finish_line(&mut self, line: String) {
        self.finished += 1;
        self.spinner.println(line);
        self.spinner.set_message(self.counter());
    }

    /// Tests that have reached a terminal message.
    pub fn finished(&self) -> usize {
        self.finished
    }

    /// Remove the spinner from the terminal.
    pub fn clear(&self) {
        self.spinner.finish_and_clear();
    }
}
