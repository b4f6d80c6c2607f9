//! comfy-table rendering of results, runs and repair attempts.
//!
//! Renders test results, stored runs and repair attempts with comfy-table.
//! Colors are dropped when `NO_COLOR` is set or the terminal is dumb.

use std::env;

use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};

use super::truncate;
use crate::domain::models::{FixAttemptResult, RunSummary, TestResult, TestStatus};

/// Renders command output as terminal tables.
pub struct TableFormatter {
    use_colors: bool,
    /// Fixed table width; terminal width when unset
    max_width: Option<u16>,
}

impl TableFormatter {
    /// Formatter using colors when the terminal supports them.
    pub fn new() -> Self {
        Self {
            use_colors: supports_color(),
            max_width: None,
        }
    }

    /// Formatter with explicit color and width settings.
    pub fn with_config(use_colors: bool, max_width: Option<u16>) -> Self {
        Self {
            use_colors,
            max_width,
        }
    }

    /// Results of one run, in execution order.
    pub fn format_results(&self, results: &[TestResult]) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&["Test", "Status", "Metrics", "Turns", "Duration", "Detail"]));

        for result in results {
            let passed = result.metric_results.iter().filter(|m| m.passed).count();
            let metrics = if result.metric_results.is_empty() {
                "-".to_string()
            } else {
                format!("{passed}/{}", result.metric_results.len())
            };
            let detail = result
                .error_message
                .clone()
                .or_else(|| {
                    result
                        .metric_results
                        .iter()
                        .find(|m| !m.passed)
                        .map(|m| format!("{}: {}", m.metric, m.reasoning))
                })
                .or_else(|| result.end_reason.map(|r| r.as_str().to_string()))
                .unwrap_or_default();

            table.add_row(vec![
                Cell::new(truncate(&result.test_name, 40)),
                self.status_cell(result.status),
                Cell::new(metrics),
                Cell::new(result.transcript.len()),
                Cell::new(format_duration_ms(result.duration_ms)),
                Cell::new(truncate(&detail, 60)),
            ]);
        }
        table.to_string()
    }

    /// Stored run summaries.
    pub fn format_runs(&self, runs: &[RunSummary]) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&["ID", "Agent", "Started", "Pass", "Fail", "Error", "Cancelled", "State"]));

        for run in runs {
            let state = if run.running > 0 {
                self.colored(format!("{} running", run.running), Color::Cyan)
            } else if run.completed_at.is_some() {
                Cell::new("complete")
            } else {
                self.colored("incomplete", Color::Yellow)
            };
            table.add_row(vec![
                Cell::new(run.id.to_string()),
                Cell::new(truncate(&run.agent_name, 30)),
                Cell::new(format_relative_time(&run.started_at)),
                self.colored(run.passed, Color::Green),
                self.colored(run.failed, Color::Red),
                self.colored(run.errored, Color::Red),
                Cell::new(run.cancelled),
                state,
            ]);
        }
        table.to_string()
    }

    /// One row per fix attempt of a repair loop.
    pub fn format_attempts(&self, attempts: &[FixAttemptResult]) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&["#", "Changes", "Passed", "Mean before", "Mean after", "Improved"]));

        for attempt in attempts {
            let passed = if attempt.test_passed {
                self.colored("yes", Color::Green)
            } else {
                self.colored("no", Color::Red)
            };
            table.add_row(vec![
                Cell::new(attempt.iteration),
                Cell::new(attempt.changes_applied.len()),
                passed,
                Cell::new(format!("{:.2}", mean(&attempt.metrics_before))),
                Cell::new(format!("{:.2}", mean(&attempt.metrics_after))),
                Cell::new(if attempt.improved { "yes" } else { "no" }),
            ]);
        }
        table.to_string()
    }

    fn status_cell(&self, status: TestStatus) -> Cell {
        if self.use_colors {
            Cell::new(status.as_str()).fg(status_color(status))
        } else {
            Cell::new(format!("{} {}", status_icon(status), status.as_str()))
        }
    }

    fn colored(&self, content: impl ToString, color: Color) -> Cell {
        let cell = Cell::new(content);
        if self.use_colors {
            cell.fg(color)
        } else {
            cell
        }
    }

    fn create_base_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);
        if let Some(width) = self.max_width {
            table.set_width(width);
        }
        table
    }
}

impl Default for TableFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn header(titles: &[&str]) -> Vec<Cell> {
    titles
        .iter()
        .map(|t| Cell::new(t).add_attribute(Attribute::Bold))
        .collect()
}

fn supports_color() -> bool {
    if env::var("NO_COLOR").is_ok() {
        return false;
    }
    !matches!(env::var("TERM").as_deref(), Ok("dumb"))
}

fn status_color(status: TestStatus) -> Color {
    match status {
        TestStatus::Pass => Color::Green,
        TestStatus::Fail | TestStatus::Error => Color::Red,
        TestStatus::Running => Color::Cyan,
        TestStatus::Cancelled => Color::DarkGrey,
    }
}

fn status_icon(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Pass => "✓",
        TestStatus::Fail => "✗",
        TestStatus::Error => "!",
        TestStatus::Running => "⟳",
        TestStatus::Cancelled => "-",
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(scores: &std::collections::BTreeMap<String, f64>) -> f64 {
    if scores.is_empty() {
        0.0
    } else {
        scores.values().sum::<f64>() / scores.len() as f64
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1_000.0)
    }
}

/// "just now", "5 mins ago" and so on, or the date once a month old.
fn format_relative_time(datetime: &chrono::DateTime<chrono::Utc>) -> String {
    let duration = chrono::Utc::now().signed_duration_since(*datetime);

    if duration.num_seconds() < 60 {
        "just now".to_string()
    } else if duration.num_minutes() < 60 {
        let mins = duration.num_minutes();
        format!("{mins} min{} ago", if mins == 1 { "" } else { "s" })
    } else if duration.num_hours() < 24 {
        let hours = duration.num_hours();
        format!("{hours} hour{} ago", if hours == 1 { "" } else { "s" })
    } else if duration.num_days() < 30 {
        let days = duration.num_days();
        format!("{days} day{} ago", if days == 1 { "" } else { "s" })
    } else {
        datetime.format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{MetricResult, Run};
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    #[test]
    fn test_format_results_shows_failed_metric() {
        let run = Run::new("agent", "Agent");
        let mut result = TestResult::pending(run.id, "t1", "books a table");
        result.status = TestStatus::Fail;
        result.metric_results = vec![
            MetricResult::new("polite", true, "fine"),
            MetricResult::new("confirms time", false, "never repeated the time"),
        ];

        let output = TableFormatter::with_config(false, None).format_results(&[result]);
        assert!(output.contains("books a table"));
        assert!(output.contains("✗ fail"));
        assert!(output.contains("1/2"));
        assert!(output.contains("confirms time"));
    }

    #[test]
    fn test_format_runs() {
        let run = Run::new("front-desk", "Front desk");
        let summary = RunSummary::from_results(&run, &[]);
        let output = TableFormatter::with_config(false, None).format_runs(&[summary]);
        assert!(output.contains("Front desk"));
        assert!(output.contains(&run.id.to_string()));
        assert!(output.contains("incomplete"));
    }

    #[test]
    fn test_format_attempts() {
        let attempt = FixAttemptResult {
            iteration: 1,
            changes_applied: Vec::new(),
            test_passed: true,
            metrics_before: BTreeMap::from([("a".to_string(), 0.0), ("b".to_string(), 0.5)]),
            metrics_after: BTreeMap::from([("a".to_string(), 1.0), ("b".to_string(), 1.0)]),
            improved: true,
        };
        let output = TableFormatter::with_config(false, None).format_attempts(&[attempt]);
        assert!(output.contains("0.25"));
        assert!(output.contains("1.00"));
    }

    #[test]
    fn test_format_relative_time() {
        let now = Utc::now();
        assert_eq!(format_relative_time(&now), "just now");
        assert_eq!(format_relative_time(&(now - Duration::minutes(5))), "5 mins ago");
        assert_eq!(format_relative_time(&(now - Duration::hours(1))), "1 hour ago");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration_ms(250), "250ms");
        assert_eq!(format_duration_ms(1_500), "1.5s");
    }
}
