//! Agent graph domain model.
//!
//! A graph is a set of conversational nodes keyed by id, an entry node, free-form
//! metadata and a table of reusable text snippets. Transitions between nodes are
//! guarded by conditions evaluated after every agent reply.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::template;
use crate::domain::errors::{DomainError, DomainResult};

/// Metadata key holding the instruction prefix applied to every node.
pub const GENERAL_PROMPT_KEY: &str = "general_prompt";

/// Name of the tool that ends a call.
pub const END_CALL_TOOL: &str = "end_call";

/// A tool the agent may invoke while in a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Name the agent uses to call the tool.
    pub name: String,
    /// What the tool does, shown to the agent model.
    #[serde(default)]
    pub description: String,
    /// JSON schema for the tool's arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    /// Tool type tag. `end_call` marks the end-call tool.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ToolDefinition {
    /// Tool with no argument schema.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            kind: None,
        }
    }

    /// The end-call tool, which terminates the conversation when invoked.
    pub fn end_call() -> Self {
        Self::new(END_CALL_TOOL, "End the call when the conversation is finished")
    }

    /// True for the end-call tool, matched by name or by type tag.
    pub fn is_end_call(&self) -> bool {
        self.name == END_CALL_TOOL || self.kind.as_deref() == Some(END_CALL_TOOL)
    }
}

/// Predicate guarding a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Natural-language predicate judged by a language model.
    LlmPrompt { prompt: String },
    /// Deterministic formula over dynamic variables.
    Equation { expression: String },
    /// Holds when the agent invoked the named tool on this turn.
    ToolCall { tool_name: String },
    /// Unconditional.
    Always,
}

impl Condition {
    /// Condition judged by a language model.
    pub fn llm_prompt(prompt: impl Into<String>) -> Self {
        Self::LlmPrompt { prompt: prompt.into() }
    }

    /// Condition over dynamic variables, such as `tier == "gold"`.
    pub fn equation(expression: impl Into<String>) -> Self {
        Self::Equation { expression: expression.into() }
    }

    /// Condition that holds when the agent called `tool_name`.
    pub fn tool_call(tool_name: impl Into<String>) -> Self {
        Self::ToolCall { tool_name: tool_name.into() }
    }

    /// Stable label for the condition kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmPrompt { .. } => "llm_prompt",
            Self::Equation { .. } => "equation",
            Self::ToolCall { .. } => "tool_call",
            Self::Always => "always",
        }
    }

    /// Human-readable text of the condition, if it has any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::LlmPrompt { prompt } => Some(prompt),
            Self::Equation { expression } => Some(expression),
            Self::ToolCall { tool_name } => Some(tool_name),
            Self::Always => None,
        }
    }
}

/// Directed edge out of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Node entered when the condition holds.
    pub target_node_id: String,
    /// Guard evaluated after each agent reply.
    pub condition: Condition,
    /// Reviewer-facing description. Editable text for non-prompt conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Transition {
    /// Transition to `target_node_id` guarded by `condition`.
    pub fn new(target_node_id: impl Into<String>, condition: Condition) -> Self {
        Self {
            target_node_id: target_node_id.into(),
            condition,
            description: None,
        }
    }

    /// Unconditional transition.
    pub fn always(target_node_id: impl Into<String>) -> Self {
        Self::new(target_node_id, Condition::Always)
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Text a reviewer would edit to change when this transition fires.
    ///
    /// Language-model conditions expose their prompt; every other kind exposes
    /// the description.
    pub fn condition_text(&self) -> Option<&str> {
        match &self.condition {
            Condition::LlmPrompt { prompt } => Some(prompt),
            _ => self.description.as_deref(),
        }
    }

    /// Rewrite the editable condition text (see [`Transition::condition_text`]).
    pub fn set_condition_text(&mut self, text: impl Into<String>) {
        match &mut self.condition {
            Condition::LlmPrompt { prompt } => *prompt = text.into(),
            _ => self.description = Some(text.into()),
        }
    }
}

/// One conversational state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique id within the graph.
    pub id: String,
    /// Instructions for the agent while in this node. May reference snippets and variables.
    #[serde(default, alias = "prompt")]
    pub instructions: String,
    /// Tools the agent may call in this node.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    /// Outgoing transitions, checked in order.
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl Node {
    /// Node with no tools and no transitions.
    pub fn new(id: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instructions: instructions.into(),
            tools: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Add a tool.
    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    /// Add an outgoing transition.
    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    /// First transition leading to `target_node_id`.
    pub fn transition_to(&self, target_node_id: &str) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.target_node_id == target_node_id)
    }

    /// Mutable variant of [`Node::transition_to`].
    pub fn transition_to_mut(&mut self, target_node_id: &str) -> Option<&mut Transition> {
        self.transitions
            .iter_mut()
            .find(|t| t.target_node_id == target_node_id)
    }
}

/// The full agent definition as a node/transition state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    /// Node the conversation starts in.
    pub entry_node_id: String,
    /// Nodes keyed by id.
    pub nodes: BTreeMap<String, Node>,
    /// Free-form metadata. Holds the general prompt under [`GENERAL_PROMPT_KEY`].
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Reusable text blocks referenced from instructions as `{%name%}`.
    #[serde(default)]
    pub snippets: BTreeMap<String, String>,
}

impl Graph {
    /// Empty graph starting at `entry_node_id`.
    pub fn new(entry_node_id: impl Into<String>) -> Self {
        Self {
            entry_node_id: entry_node_id.into(),
            nodes: BTreeMap::new(),
            metadata: HashMap::new(),
            snippets: BTreeMap::new(),
        }
    }

    /// Add a node, replacing any node with the same id.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    /// Add a named snippet.
    pub fn with_snippet(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.snippets.insert(name.into(), text.into());
        self
    }

    /// Set the general prompt.
    pub fn with_general_prompt(mut self, text: impl Into<String>) -> Self {
        self.set_general_prompt(text);
        self
    }

    /// Node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Mutable node by id.
    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// True if a node with this id exists.
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Instruction prefix applied to every node.
    pub fn general_prompt(&self) -> Option<&str> {
        self.metadata.get(GENERAL_PROMPT_KEY).and_then(Value::as_str)
    }

    /// Replace the instruction prefix applied to every node.
    pub fn set_general_prompt(&mut self, text: impl Into<String>) {
        self.metadata
            .insert(GENERAL_PROMPT_KEY.to_string(), Value::String(text.into()));
    }

    /// Node instructions with snippets and dynamic variables substituted.
    pub fn resolve_instructions(
        &self,
        node_id: &str,
        variables: &HashMap<String, Value>,
    ) -> DomainResult<String> {
        let node = self
            .node(node_id)
            .ok_or_else(|| DomainError::MissingNode(node_id.to_string()))?;
        Ok(template::render(&node.instructions, &self.snippets, variables))
    }

    /// General prompt with snippets and dynamic variables substituted.
    pub fn resolve_general_prompt(&self, variables: &HashMap<String, Value>) -> Option<String> {
        self.general_prompt()
            .map(|text| template::render(text, &self.snippets, variables))
    }

    /// Check the load-time invariants: the entry node and every transition
    /// target exist in the node map, and node keys match node ids.
    pub fn validate(&self) -> DomainResult<()> {
        if self.nodes.is_empty() {
            return Err(DomainError::InvalidGraph("graph has no nodes".to_string()));
        }
        if !self.contains(&self.entry_node_id) {
            return Err(DomainError::InvalidGraph(format!(
                "entry node '{}' does not exist",
                self.entry_node_id
            )));
        }
        for (key, node) in &self.nodes {
            if key != &node.id {
                return Err(DomainError::InvalidGraph(format!(
                    "node stored under '{key}' has id '{}'",
                    node.id
                )));
            }
            for transition in &node.transitions {
                if !self.contains(&transition.target_node_id) {
                    return Err(DomainError::InvalidGraph(format!(
                        "transition from '{}' targets unknown node '{}'",
                        node.id, transition.target_node_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Parse a graph from JSON or YAML text without checking invariants.
    pub fn parse_unchecked(content: &str, format: GraphFormat) -> DomainResult<Self> {
        let graph = match format {
            GraphFormat::Json => serde_json::from_str(content)?,
            GraphFormat::Yaml => serde_yaml::from_str(content)?,
        };
        Ok(graph)
    }

    /// Parse and validate a graph.
    pub fn parse(content: &str, format: GraphFormat) -> DomainResult<Self> {
        let graph = Self::parse_unchecked(content, format)?;
        graph.validate()?;
        Ok(graph)
    }

    /// Load a graph file without checking invariants.
    pub fn load_unchecked(path: &Path) -> DomainResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DomainError::InvalidGraph(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse_unchecked(&content, GraphFormat::from_path(path))
    }

    /// Load and validate a graph file.
    pub fn load(path: &Path) -> DomainResult<Self> {
        let graph = Self::load_unchecked(path)?;
        graph.validate()?;
        Ok(graph)
    }
}

/// Serialized representation of graph and test files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Json,
    Yaml,
}

impl GraphFormat {
    /// YAML for `.yaml`/`.yml`, JSON otherwise.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Self::Yaml
            }
            _ => Self::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_node_graph() -> Graph {
        Graph::new("greet")
            .with_general_prompt("You are {%persona%}.")
            .with_snippet("persona", "a polite receptionist")
            .with_node(
                Node::new("greet", "Greet {{name}}.")
                    .with_transition(Transition::new("book", Condition::llm_prompt("caller wants a booking"))),
            )
            .with_node(Node::new("book", "Book the appointment.").with_tool(ToolDefinition::end_call()))
    }

    #[test]
    fn test_valid_graph_passes_validation() {
        assert!(two_node_graph().validate().is_ok());
    }

    #[test]
    fn test_missing_entry_node_rejected() {
        let mut graph = two_node_graph();
        graph.entry_node_id = "nowhere".to_string();
        assert!(matches!(graph.validate(), Err(DomainError::InvalidGraph(_))));
    }

    #[test]
    fn test_dangling_transition_rejected() {
        let graph = Graph::new("a")
            .with_node(Node::new("a", "x").with_transition(Transition::always("ghost")));
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_resolve_instructions_substitutes() {
        let graph = two_node_graph();
        let vars = HashMap::from([("name".to_string(), json!("Ada"))]);
        assert_eq!(graph.resolve_instructions("greet", &vars).unwrap(), "Greet Ada.");
        assert_eq!(
            graph.resolve_general_prompt(&vars).as_deref(),
            Some("You are a polite receptionist.")
        );
        assert!(matches!(
            graph.resolve_instructions("ghost", &vars),
            Err(DomainError::MissingNode(_))
        ));
    }

    #[test]
    fn test_parse_yaml_and_json() {
        let yaml = r"
entry_node_id: start
metadata:
  general_prompt: Be brief.
nodes:
  start:
    id: start
    instructions: Say hi.
    tools:
      - name: hang_up
        type: end_call
    transitions:
      - target_node_id: start
        condition:
          type: equation
          expression: attempts > 2
";
        let graph = Graph::parse(yaml, GraphFormat::Yaml).unwrap();
        assert_eq!(graph.general_prompt(), Some("Be brief."));
        let node = graph.node("start").unwrap();
        assert!(node.tools[0].is_end_call());
        assert_eq!(node.transitions[0].condition, Condition::equation("attempts > 2"));

        let json = serde_json::to_string(&graph).unwrap();
        assert_eq!(Graph::parse(&json, GraphFormat::Json).unwrap(), graph);
    }

    #[test]
    fn test_condition_text_editing() {
        let mut llm = Transition::new("b", Condition::llm_prompt("old"));
        llm.set_condition_text("new");
        assert_eq!(llm.condition, Condition::llm_prompt("new"));

        let mut eq = Transition::new("b", Condition::equation("x == 1")).with_description("when x is one");
        assert_eq!(eq.condition_text(), Some("when x is one"));
        eq.set_condition_text("when x is set");
        assert_eq!(eq.condition, Condition::equation("x == 1"));
        assert_eq!(eq.description.as_deref(), Some("when x is set"));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(GraphFormat::from_path(Path::new("a.yml")), GraphFormat::Yaml);
        assert_eq!(GraphFormat::from_path(Path::new("a.YAML")), GraphFormat::Yaml);
        assert_eq!(GraphFormat::from_path(Path::new("a.json")), GraphFormat::Json);
    }
}
