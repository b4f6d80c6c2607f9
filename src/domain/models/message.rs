//! Transcript messages.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata key recording the node that was active when a message was produced.
pub const NODE_ID_KEY: &str = "node_id";

/// Metadata key recording which tool a system message answers.
pub const TOOL_NAME_KEY: &str = "tool_name";

/// Speaker of a transcript message. Tool results are `System` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Assistant,
    User,
    System,
}

impl Role {
    /// Lowercase label used in prompts and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::User => "user",
            Self::System => "system",
        }
    }
}

/// One entry in a transcript. Transcripts are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced the message.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Annotations such as the active node or the answered tool.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Message {
    /// Message with no metadata.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Agent message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Simulated-user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// System message, used for tool results.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Record the node that was active.
    pub fn with_node(mut self, node_id: &str) -> Self {
        self.metadata
            .insert(NODE_ID_KEY.to_string(), Value::String(node_id.to_string()));
        self
    }

    /// Record the tool this message answers.
    pub fn with_tool(mut self, tool_name: &str) -> Self {
        self.metadata
            .insert(TOOL_NAME_KEY.to_string(), Value::String(tool_name.to_string()));
        self
    }

    /// Node that was active when the message was produced.
    pub fn node_id(&self) -> Option<&str> {
        self.metadata.get(NODE_ID_KEY).and_then(Value::as_str)
    }
}

/// Render a transcript as `role: content` lines for prompts and excerpts.
pub fn format_transcript(transcript: &[Message]) -> String {
    transcript
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
