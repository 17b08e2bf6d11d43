//! Pluggable resource executors.
//!
//! An executor is registered under a type tag (`"chat"`, `"http"`, `"sql"`,
//! `"python"`, `"exec"`, `"tts"`) and implements a uniform contract. The two
//! capability hooks default to no-ops so most executors — anything that
//! doesn't itself dispatch sub-tools or care about offline mode — need not
//! know they exist.

use crate::context::ExecutionContext;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// `execute(ctx, config) -> output`, expressed as the usual `Result`
/// return since Rust doesn't need an explicit error-output pair.
#[async_trait]
pub trait ResourceExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext, config: &Value) -> Result<Value>;

    /// Lets an executor (typically `chat`) reach back into the registry to
    /// dispatch a tool call it decided to make mid-execution. Most
    /// executors never call tools and can ignore this.
    fn set_tool_executor(&self, _tool_executor: Arc<dyn ToolExecutor>) {}

    /// Lets an executor switch to a local/offline code path (e.g. a cached
    /// or stubbed response) when the workflow is run disconnected. Most
    /// executors have no offline mode and can ignore this.
    fn set_offline_mode(&self, _offline: bool) {}
}

/// The back-reference a tool-capable executor holds to invoke another
/// registered executor as a tool call, without depending on the full
/// registry or the engine.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute_tool(
        &self,
        resource_type: &str,
        ctx: &ExecutionContext,
        config: &Value,
    ) -> Result<Value>;
}

/// The set of registered executors, keyed by resource type tag.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn ResourceExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource_type: impl Into<String>, executor: Arc<dyn ResourceExecutor>) {
        self.executors.insert(resource_type.into(), executor);
    }

    pub fn get(&self, resource_type: &str) -> Result<Arc<dyn ResourceExecutor>> {
        self.executors
            .get(resource_type)
            .cloned()
            .ok_or_else(|| crate::error::EngineError::ExecutorUnavailable(resource_type.to_string()))
    }

    pub fn set_offline_mode(&self, offline: bool) {
        for executor in self.executors.values() {
            executor.set_offline_mode(offline);
        }
    }

    /// Gives every registered executor a back-reference to dispatch other
    /// registered types as tool calls.
    pub fn wire_tool_executor(self: &Arc<Self>) {
        let tool_executor: Arc<dyn ToolExecutor> = self.clone();
        for executor in self.executors.values() {
            executor.set_tool_executor(tool_executor.clone());
        }
    }
}

#[async_trait]
impl ToolExecutor for ExecutorRegistry {
    async fn execute_tool(
        &self,
        resource_type: &str,
        ctx: &ExecutionContext,
        config: &Value,
    ) -> Result<Value> {
        self.get(resource_type)?.execute(ctx, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemorySessionStore, InMemoryStore};
    use std::path::PathBuf;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl ResourceExecutor for Echo {
        async fn execute(&self, _ctx: &ExecutionContext, config: &Value) -> Result<Value> {
            Ok(config.clone())
        }
    }

    #[tokio::test]
    async fn registers_and_dispatches_by_type() {
        let mut registry = ExecutorRegistry::new();
        registry.register("exec", Arc::new(Echo));

        let ctx = ExecutionContext::new(
            None,
            None,
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemorySessionStore::new(Duration::from_secs(60))),
            PathBuf::from("."),
            false,
        );
        let out = registry.get("exec").unwrap().execute(&ctx, &Value::from("cmd")).await.unwrap();
        assert_eq!(out, Value::from("cmd"));

        assert!(registry.get("python").is_err());
    }
}
