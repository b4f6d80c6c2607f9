//! Conversation engine: walks an agent graph one exchange at a time.
//!
//! Each call to [`ConversationEngine::process_turn`] takes one user utterance,
//! asks the agent model for a reply using the current node's resolved
//! instructions, records any tool calls, and then follows the first
//! transition whose condition holds. A transition into a node that does not
//! exist is a fatal error for the conversation.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Condition, Graph, Message, Node, RunOptions, ToolCallRecord, ToolMock, END_CALL_TOOL,
};
use crate::domain::ports::{AgentReply, AgentRequest, ConditionRequest};
use crate::services::equation;
use crate::services::model_gateway::ModelGateway;

/// What happened during one exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// The agent's reply, including any tool calls it made.
    pub reply: AgentReply,
    /// Node moved to, if a transition fired.
    pub transitioned_to: Option<String>,
    /// The agent invoked the end-call tool.
    pub ended: bool,
}

/// Per-conversation traversal state. Holds no state shared across conversations.
#[derive(Debug, Clone)]
pub struct ConversationEngine<'g> {
    graph: &'g Graph,
    variables: HashMap<String, Value>,
    tool_mocks: HashMap<String, String>,
    current_node_id: String,
    transcript: Vec<Message>,
    nodes_visited: Vec<String>,
    tools_called: Vec<ToolCallRecord>,
    ended: bool,
}

impl<'g> ConversationEngine<'g> {
    /// Engine positioned at the graph's entry node. `variables` feed instruction
    /// templates and equation conditions for the whole conversation.
    pub fn new(graph: &'g Graph, variables: HashMap<String, Value>) -> Self {
        Self {
            graph,
            variables,
            tool_mocks: HashMap::new(),
            current_node_id: graph.entry_node_id.clone(),
            transcript: Vec::new(),
            nodes_visited: vec![graph.entry_node_id.clone()],
            tools_called: Vec::new(),
            ended: false,
        }
    }

    /// Answer tool calls with these canned responses. Calls to tools without a
    /// mock are recorded but get no system message.
    pub fn with_tool_mocks(mut self, mocks: &[ToolMock]) -> Self {
        self.tool_mocks = mocks
            .iter()
            .map(|m| (m.tool_name.clone(), m.response.clone()))
            .collect();
        self
    }

    /// Start over from the entry node with an empty transcript.
    pub fn reset(&mut self) {
        self.current_node_id.clone_from(&self.graph.entry_node_id);
        self.transcript.clear();
        self.nodes_visited = vec![self.graph.entry_node_id.clone()];
        self.tools_called.clear();
        self.ended = false;
    }

    /// Node the conversation is in.
    pub fn current_node_id(&self) -> &str {
        &self.current_node_id
    }

    /// Conversation so far.
    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    /// Nodes entered, in order, starting with the entry node.
    pub fn nodes_visited(&self) -> &[String] {
        &self.nodes_visited
    }

    /// Every tool call the agent has made.
    pub fn tools_called(&self) -> &[ToolCallRecord] {
        &self.tools_called
    }

    /// True once the agent has invoked the end-call tool.
    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// Dynamic variables of the conversation.
    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    fn current_node(&self) -> DomainResult<&'g Node> {
        self.graph
            .node(&self.current_node_id)
            .ok_or_else(|| DomainError::MissingNode(self.current_node_id.clone()))
    }

    /// Run one exchange: record `utterance`, get the agent's reply, then
    /// evaluate the current node's transitions.
    pub async fn process_turn(
        &mut self,
        utterance: &str,
        gateway: &ModelGateway<'_>,
        options: &RunOptions,
    ) -> DomainResult<TurnOutcome> {
        let node = self.current_node()?;
        self.transcript
            .push(Message::user(utterance).with_node(&node.id));

        let node_instructions = self.graph.resolve_instructions(&node.id, &self.variables)?;
        let request = AgentRequest {
            model: options.agent_model.clone(),
            general_instructions: self.graph.resolve_general_prompt(&self.variables),
            node_id: node.id.clone(),
            node_instructions: node_instructions.clone(),
            tools: node.tools.clone(),
            transcript: self.transcript.clone(),
        };
        let reply = gateway.agent_reply(&request).await?;

        if !reply.content.is_empty() {
            self.transcript
                .push(Message::assistant(&reply.content).with_node(&node.id));
        }
        self.record_tool_calls(node, &reply);

        if self.ended {
            debug!(node_id = %node.id, "agent ended the call");
            return Ok(TurnOutcome {
                reply,
                transitioned_to: None,
                ended: true,
            });
        }

        let transitioned_to = self
            .follow_transitions(node, &node_instructions, &reply, gateway, options)
            .await?;

        Ok(TurnOutcome {
            reply,
            transitioned_to,
            ended: false,
        })
    }

    fn record_tool_calls(&mut self, node: &Node, reply: &AgentReply) {
        for call in &reply.tool_calls {
            self.tools_called.push(ToolCallRecord {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                node_id: Some(node.id.clone()),
            });

            if let Some(response) = self.tool_mocks.get(&call.name) {
                self.transcript.push(
                    Message::system(response.clone())
                        .with_node(&node.id)
                        .with_tool(&call.name),
                );
            }

            let declared_end_call = node
                .tools
                .iter()
                .any(|tool| tool.name == call.name && tool.is_end_call());
            if call.name == END_CALL_TOOL || declared_end_call {
                self.ended = true;
            }
        }
    }

    async fn follow_transitions(
        &mut self,
        node: &Node,
        node_instructions: &str,
        reply: &AgentReply,
        gateway: &ModelGateway<'_>,
        options: &RunOptions,
    ) -> DomainResult<Option<String>> {
        for transition in &node.transitions {
            let holds = match &transition.condition {
                Condition::Always => true,
                Condition::Equation { expression } => {
                    equation::evaluate(expression, &self.variables)?
                }
                Condition::ToolCall { tool_name } => reply.invoked(tool_name),
                Condition::LlmPrompt { prompt } => {
                    let request = ConditionRequest {
                        model: options.judge_model.clone(),
                        condition: prompt.clone(),
                        node_instructions: node_instructions.to_string(),
                        transcript: self.transcript.clone(),
                    };
                    gateway.condition_holds(&request).await?
                }
            };

            if !holds {
                continue;
            }

            let target = &transition.target_node_id;
            if !self.graph.contains(target) {
                return Err(DomainError::MissingNode(target.clone()));
            }
            debug!(
                from = %node.id,
                to = %target,
                condition = transition.condition.as_str(),
                "transition selected"
            );
            self.current_node_id.clone_from(target);
            self.nodes_visited.push(target.clone());
            return Ok(Some(target.clone()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::llm::ScriptedBackend;
    use crate::domain::models::{ToolDefinition, Transition};
    use crate::services::model_gateway::ModelSet;
    use crate::services::retry_policy::RetryPolicy;
    use serde_json::json;
    use std::sync::Arc;

    fn options() -> RunOptions {
        RunOptions {
            agent_model: "agent".into(),
            simulator_model: "sim".into(),
            judge_model: "judge".into(),
            max_turns: 10,
            timeout_secs: 30,
        }
    }

    fn routing_graph() -> Graph {
        Graph::new("greet")
            .with_general_prompt("You work for {%company%}.")
            .with_snippet("company", "Acme {{not_a_var}}")
            .with_node(
                Node::new("greet", "Greet {{caller}}.")
                    .with_transition(Transition::new(
                        "billing",
                        Condition::equation("topic == billing"),
                    ))
                    .with_transition(Transition::new(
                        "support",
                        Condition::llm_prompt("caller needs technical help"),
                    )),
            )
            .with_node(
                Node::new("billing", "Handle billing.")
                    .with_tool(ToolDefinition::end_call())
                    .with_tool(ToolDefinition::new("lookup_invoice", "Find an invoice")),
            )
            .with_node(Node::new("support", "Handle support."))
    }

    #[tokio::test]
    async fn test_equation_transition_and_substitution() {
        let backend = Arc::new(ScriptedBackend::new().with_agent_replies(["Hello Ada"]));
        let models = ModelSet::from_backend(backend.clone());
        let retry = RetryPolicy::no_retry();
        let gateway = ModelGateway::new(&models, &retry, None);
        let graph = routing_graph();
        let vars = HashMap::from([
            ("caller".to_string(), json!("Ada")),
            ("topic".to_string(), json!("billing")),
        ]);
        let mut engine = ConversationEngine::new(&graph, vars);

        let outcome = engine.process_turn("hi", &gateway, &options()).await.unwrap();

        assert_eq!(outcome.transitioned_to.as_deref(), Some("billing"));
        assert_eq!(engine.current_node_id(), "billing");
        assert_eq!(engine.nodes_visited(), ["greet", "billing"]);

        let request = &backend.agent_requests()[0];
        assert_eq!(request.node_instructions, "Greet Ada.");
        // unknown variables inside snippet text stay verbatim
        assert_eq!(
            request.general_instructions.as_deref(),
            Some("You work for Acme {{not_a_var}}.")
        );
        assert_eq!(engine.transcript().len(), 2);
        assert_eq!(engine.transcript()[1].node_id(), Some("greet"));
    }

    #[tokio::test]
    async fn test_llm_condition_consulted_in_order() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_condition(true);
        let models = ModelSet::from_backend(backend);
        let retry = RetryPolicy::no_retry();
        let gateway = ModelGateway::new(&models, &retry, None);
        let graph = routing_graph();
        let mut engine = ConversationEngine::new(&graph, HashMap::new());

        let outcome = engine
            .process_turn("my router is broken", &gateway, &options())
            .await
            .unwrap();
        assert_eq!(outcome.transitioned_to.as_deref(), Some("support"));
    }

    #[tokio::test]
    async fn test_tool_mock_and_end_call() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_agent_reply(
            AgentReply::text("Let me check.").with_tool_call("lookup_invoice", json!({"id": 7})),
        );
        backend.push_agent_reply(AgentReply::text("Goodbye.").with_tool_call(END_CALL_TOOL, json!({})));
        let models = ModelSet::from_backend(backend);
        let retry = RetryPolicy::no_retry();
        let gateway = ModelGateway::new(&models, &retry, None);
        let mut graph = routing_graph();
        graph.entry_node_id = "billing".into();
        let mocks = [ToolMock {
            tool_name: "lookup_invoice".into(),
            response: "{\"amount\": 42}".into(),
        }];
        let mut engine = ConversationEngine::new(&graph, HashMap::new()).with_tool_mocks(&mocks);

        let first = engine.process_turn("invoice?", &gateway, &options()).await.unwrap();
        assert!(!first.ended);
        let mock_message = &engine.transcript()[2];
        assert_eq!(mock_message.content, "{\"amount\": 42}");

        let second = engine.process_turn("thanks", &gateway, &options()).await.unwrap();
        assert!(second.ended);
        assert!(engine.has_ended());
        let names: Vec<_> = engine.tools_called().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["lookup_invoice", END_CALL_TOOL]);
    }

    #[tokio::test]
    async fn test_missing_target_is_fatal() {
        let backend = Arc::new(ScriptedBackend::new());
        let models = ModelSet::from_backend(backend);
        let retry = RetryPolicy::no_retry();
        let gateway = ModelGateway::new(&models, &retry, None);
        let graph = Graph::new("start")
            .with_node(Node::new("start", "Hi").with_transition(Transition::always("ghost")));
        let mut engine = ConversationEngine::new(&graph, HashMap::new());

        let err = engine.process_turn("hello", &gateway, &options()).await.unwrap_err();
        assert!(matches!(err, DomainError::MissingNode(ref id) if id == "ghost"));
        assert_eq!(engine.current_node_id(), "start");
    }

    #[tokio::test]
    async fn test_reset_restarts_from_entry() {
        let backend = Arc::new(ScriptedBackend::new());
        let models = ModelSet::from_backend(backend);
        let retry = RetryPolicy::no_retry();
        let gateway = ModelGateway::new(&models, &retry, None);
        let graph = Graph::new("a")
            .with_node(Node::new("a", "A").with_transition(Transition::always("b")))
            .with_node(Node::new("b", "B"));
        let mut engine = ConversationEngine::new(&graph, HashMap::new());

        engine.process_turn("x", &gateway, &options()).await.unwrap();
        assert_eq!(engine.current_node_id(), "b");
        engine.reset();
        assert_eq!(engine.current_node_id(), "a");
        assert!(engine.transcript().is_empty());
        assert_eq!(engine.nodes_visited(), ["a"]);
    }
}
