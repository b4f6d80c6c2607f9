//! Output formatting utilities for the CLI.
//!
//! Every command result implements [`CommandOutput`] and is rendered either
//! as human-readable text or as JSON, depending on `--json`.

pub mod progress;
pub mod table;

use serde::Serialize;

pub use progress::{create_spinner, RunProgress};
pub use table::TableFormatter;

/// Result of a command, printable as text or JSON.
pub trait CommandOutput: Serialize {
    fn to_human(&self) -> String;
    fn to_json(&self) -> serde_json::Value;
}

/// Print `result` as pretty JSON or human-readable text.
pub fn output<T: CommandOutput>(result: &T, json_mode: bool) {
    if json_mode {
        println!(
            "{}",
            serde_json::to_string_pretty(&result.to_json()).unwrap_or_default()
        );
    } else {
        println!("{}", result.to_human());
    }
}

/// Truncate a string to at most `max_len` characters, appending "..." if
/// truncated.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
