//! Function-call registry for LLM tool use.
//!
//! Tools are registered with their wire schema and a handler over the
//! caller's identity ([`ToolContext`]); what a tool wants to happen is
//! expressed as data ([`ToolAction`]) and the connection interprets it, so
//! handlers never reach into session state.

pub mod builtin;

use crate::error::{DialogueError, Result};
use crate::llm::FunctionSpec;
use std::collections::HashMap;
use tracing::info;

/// What the dialogue should do with a tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolAction {
    /// Speak this text directly, no further model round.
    Respond(String),
    /// Feed this result back to the model for a follow-up round.
    RequeryLlm(String),
    /// End the conversation after saying goodbye.
    Exit { farewell: String },
    /// Switch the active assistant role.
    SwitchRole { role: String },
}

/// Caller identity forwarded to every handler, so privileged tools can
/// refuse speakers that are not the device owner.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Speaker attributed to the utterance that triggered the call.
    pub speaker_id: Option<String>,
    /// Whether that speaker is the enrolled device owner.
    pub is_admin: bool,
}

type Handler = Box<dyn Fn(&ToolContext, &serde_json::Value) -> Result<ToolAction> + Send + Sync>;

struct RegisteredFunction {
    spec: FunctionSpec,
    handler: Handler,
}

/// Registered tools for one connection.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RegisteredFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. The spec's `name` field keys dispatch.
    pub fn register(
        &mut self,
        spec: FunctionSpec,
        handler: impl Fn(&ToolContext, &serde_json::Value) -> Result<ToolAction> + Send + Sync + 'static,
    ) {
        let Some(name) = spec.get("name").and_then(|n| n.as_str()) else {
            return;
        };
        self.functions.insert(
            name.to_owned(),
            RegisteredFunction {
                spec,
                handler: Box::new(handler),
            },
        );
    }

    /// Function descriptors to advertise to the model.
    pub fn specs(&self) -> Vec<FunctionSpec> {
        self.functions.values().map(|f| f.spec.clone()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Invoke a tool with raw JSON arguments on behalf of `context`.
    ///
    /// # Errors
    ///
    /// `ToolCall` errors for unknown names, unparsable arguments, and
    /// handler failures. The caller turns these into an apologetic tool
    /// result rather than dropping the turn.
    pub fn invoke(&self, name: &str, arguments: &str, context: &ToolContext) -> Result<ToolAction> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| DialogueError::ToolCall(format!("unknown function: {name}")))?;
        let args: serde_json::Value = if arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(arguments).map_err(|e| {
                DialogueError::ToolCall(format!("bad arguments for {name}: {e}"))
            })?
        };
        info!("invoking function {name} with {args}");
        (function.handler)(context, &args)
    }
}
