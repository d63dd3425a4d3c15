//! In-process agents.
//!
//! An agent owns a set of tools. Before the upstream call, the registry
//! injects the descriptors of every registered agent into `body.tools` and
//! records the owning agent names on the request context; when the upstream
//! answers with a `tool_use` block naming one of those tools, the stream
//! loop executes it locally and splices the result back in as a new turn.

pub mod stream;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::Config;
use crate::context::RequestContext;

/// Execution context handed to a tool handler.
pub struct AgentContext {
    pub config: Arc<Config>,
    pub session_id: Option<String>,
    /// Project directory the session belongs to, when it could be resolved
    pub project_dir: Option<PathBuf>,
}

/// One tool as advertised to the model.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    fn to_wire(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema,
        })
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    fn tools(&self) -> Vec<ToolDescriptor>;
    async fn handle(
        &self,
        tool_name: &str,
        args: Value,
        ctx: &AgentContext,
    ) -> Result<String, String>;
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Which of the request's allowed agents owns tool `tool_name`.
    pub fn owner_of(&self, allowed: &[String], tool_name: &str) -> Option<Arc<dyn Agent>> {
        allowed
            .iter()
            .filter_map(|name| self.agents.get(name))
            .find(|agent| agent.tools().iter().any(|t| t.name == tool_name))
            .cloned()
    }

    /// Add every registered agent's tool descriptors to `body.tools` and
    /// record the agent names on the context. Runs in the pre-handler chain.
    pub fn inject_tools(&self, body: &mut Value, ctx: &mut RequestContext) {
        if self.agents.is_empty() {
            return;
        }
        let tools = body
            .as_object_mut()
            .map(|obj| {
                obj.entry("tools")
                    .or_insert_with(|| Value::Array(Vec::new()))
            })
            .and_then(Value::as_array_mut);
        let Some(tools) = tools else {
            return;
        };
        for (name, agent) in &self.agents {
            for tool in agent.tools() {
                if !tools.iter().any(|t| t.get("name") == Some(&json!(tool.name))) {
                    tools.push(tool.to_wire());
                }
            }
            if !ctx.agents.contains(name) {
                ctx.agents.push(name.clone());
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::EchoAgent;
    use super::*;

    fn registry() -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(EchoAgent {
            agent_name: "memo".to_string(),
            tool_name: "memo_store".to_string(),
        }));
        registry
    }

    #[test]
    fn test_inject_tools_creates_array_and_records_agent() {
        let registry = registry();
        let mut body = json!({"model": "m"});
        let mut ctx = RequestContext::default();
        registry.inject_tools(&mut body, &mut ctx);

        assert_eq!(body["tools"][0]["name"], "memo_store");
        assert_eq!(ctx.agents, vec!["memo"]);
    }

    #[test]
    fn test_inject_tools_does_not_duplicate() {
        let registry = registry();
        let mut body = json!({"model": "m", "tools": [{"name": "memo_store"}]});
        let mut ctx = RequestContext::default();
        registry.inject_tools(&mut body, &mut ctx);
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_owner_of_respects_allowed_list() {
        let registry = registry();
        assert!(
            registry
                .owner_of(&["memo".to_string()], "memo_store")
                .is_some()
        );
        assert!(registry.owner_of(&[], "memo_store").is_none());
        assert!(
            registry
                .owner_of(&["memo".to_string()], "unknown_tool")
                .is_none()
        );
    }
}
