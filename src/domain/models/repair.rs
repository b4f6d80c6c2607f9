//! Diagnosis and fix types produced by the judge during repair.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Part of the graph a fault or change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    GeneralInstruction,
    NodeInstruction,
    Transition,
    MissingTransition,
}

impl LocationKind {
    /// Stable snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeneralInstruction => "general_instruction",
            Self::NodeInstruction => "node_instruction",
            Self::Transition => "transition",
            Self::MissingTransition => "missing_transition",
        }
    }
}

/// Where in the graph a fault was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultLocation {
    /// Kind of text at fault.
    pub kind: LocationKind,
    /// Node holding the text, when the kind is node-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// The offending text as quoted by the judge.
    #[serde(default)]
    pub quoted_text: String,
}

/// Judge's account of why a test failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    /// Places in the graph the failure traces back to.
    #[serde(default)]
    pub fault_locations: Vec<FaultLocation>,
    /// One-paragraph explanation of the failure.
    pub root_cause: String,
    /// Transcript lines that show the failure.
    #[serde(default)]
    pub transcript_excerpt: String,
}

/// One proposed text edit to the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptChange {
    /// Kind of text being changed.
    pub location_kind: LocationKind,
    /// Node owning the text. Required for node and transition changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Target of the transition whose condition text changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_target_id: Option<String>,
    /// Text expected before the change. Informational only.
    #[serde(default)]
    pub original_text: String,
    /// Replacement text.
    pub proposed_text: String,
    /// Why the judge proposed this change.
    #[serde(default)]
    pub rationale: String,
}

impl PromptChange {
    /// Change to the general prompt.
    pub fn general(proposed_text: impl Into<String>) -> Self {
        Self {
            location_kind: LocationKind::GeneralInstruction,
            node_id: None,
            transition_target_id: None,
            original_text: String::new(),
            proposed_text: proposed_text.into(),
            rationale: String::new(),
        }
    }

    /// Change to a node's instructions.
    pub fn node(node_id: impl Into<String>, proposed_text: impl Into<String>) -> Self {
        Self {
            location_kind: LocationKind::NodeInstruction,
            node_id: Some(node_id.into()),
            ..Self::general(proposed_text)
        }
    }

    /// Change to the condition text of the transition from `node_id` to `target_id`.
    pub fn transition(
        node_id: impl Into<String>,
        target_id: impl Into<String>,
        proposed_text: impl Into<String>,
    ) -> Self {
        Self {
            location_kind: LocationKind::Transition,
            node_id: Some(node_id.into()),
            transition_target_id: Some(target_id.into()),
            ..Self::general(proposed_text)
        }
    }
}

/// Set of changes proposed to fix a failing test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixSuggestion {
    /// Edits to apply together.
    #[serde(default)]
    pub changes: Vec<PromptChange>,
    /// Short description of the fix.
    #[serde(default)]
    pub summary: String,
    /// Judge's confidence in the fix, in [0, 1].
    #[serde(default)]
    pub confidence: f64,
}

impl FixSuggestion {
    /// Suggestion with `confidence` clamped into [0, 1].
    pub fn new(changes: Vec<PromptChange>, summary: impl Into<String>, confidence: f64) -> Self {
        Self {
            changes,
            summary: summary.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Clamp confidence into [0, 1]. Judges occasionally return percentages.
    pub fn normalized(mut self) -> Self {
        if self.confidence > 1.0 && self.confidence <= 100.0 {
            self.confidence /= 100.0;
        }
        self.confidence = if self.confidence.is_nan() { 0.0 } else { self.confidence.clamp(0.0, 1.0) };
        self
    }
}

/// Record of one apply-and-retest iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixAttemptResult {
    /// 1-based iteration number.
    pub iteration: u32,
    /// Changes that were actually applied; skipped changes are omitted.
    pub changes_applied: Vec<PromptChange>,
    /// Whether the retest passed.
    pub test_passed: bool,
    /// Metric scores of the previous run, by metric name.
    pub metrics_before: BTreeMap<String, f64>,
    /// Metric scores of the retest, by metric name.
    pub metrics_after: BTreeMap<String, f64>,
    /// True when the mean retest score beats the previous mean.
    pub improved: bool,
}
