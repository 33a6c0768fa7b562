//! Tool handler registry
//!
//! One handler per kind; execution is validated, timeout-wrapped, and
//! recorded. When a turn is cancelled mid-invocation the call is allowed to
//! finish but the caller discards its textual result; compensation of
//! external side effects is the handler's concern.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::catalog::{ToolArguments, ToolInvocation, ToolKind};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    Arguments(String),

    #[error("no handler registered for {0:?}")]
    NoHandler(ToolKind),

    #[error("tool {0:?} timed out after {1:?}")]
    Timeout(ToolKind, Duration),

    #[error("tool execution failed: {0}")]
    Execution(String),
}

/// Result of a tool execution
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Value appended to the dialogue stream per the engine protocol
    pub result: Value,
    pub duration_ms: u64,
}

/// A registered handler for one tool kind
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, arguments: &ToolArguments) -> Result<Value, ToolError>;

    /// Per-handler execution budget
    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Registry with exactly one handler slot per kind
pub struct ToolRegistry {
    handlers: HashMap<ToolKind, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register (or replace) the handler for a kind
    pub fn register(&mut self, kind: ToolKind, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn has(&self, kind: ToolKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Catalog entries for every kind with a registered handler
    pub fn catalog(&self) -> Vec<Value> {
        ToolKind::ALL
            .iter()
            .filter(|k| self.handlers.contains_key(k))
            .map(|k| k.catalog_entry())
            .collect()
    }

    /// Execute a validated invocation with its handler's timeout
    pub async fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        let handler = self
            .handlers
            .get(&invocation.kind)
            .ok_or(ToolError::NoHandler(invocation.kind))?;

        let timeout = handler.timeout();
        let start = Instant::now();

        tracing::debug!(tool = invocation.kind.name(), ?timeout, "Executing tool");

        let result = tokio::time::timeout(timeout, handler.execute(&invocation.arguments))
            .await
            .map_err(|_| ToolError::Timeout(invocation.kind, timeout))??;

        Ok(ToolOutput {
            result,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn execute(&self, arguments: &ToolArguments) -> Result<Value, ToolError> {
            Ok(json!({"kind": arguments.kind().name()}))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl ToolHandler for SlowHandler {
        async fn execute(&self, _arguments: &ToolArguments) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(20)
        }
    }

    #[tokio::test]
    async fn test_execute_registered_handler() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolKind::GetAccountBalance, Arc::new(EchoHandler));

        let invocation = ToolInvocation::parse("get_account_balance", json!({})).unwrap();
        let output = registry.execute(&invocation).await.unwrap();
        assert_eq!(output.result["kind"], "get_account_balance");
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let registry = ToolRegistry::new();
        let invocation = ToolInvocation::parse("get_account_balance", json!({})).unwrap();
        let err = registry.execute(&invocation).await.unwrap_err();
        assert!(matches!(err, ToolError::NoHandler(ToolKind::GetAccountBalance)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolKind::GetAccountBalance, Arc::new(SlowHandler));

        let invocation = ToolInvocation::parse("get_account_balance", json!({})).unwrap();
        let err = registry.execute(&invocation).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(ToolKind::GetAccountBalance, _)));
    }

    #[test]
    fn test_catalog_only_lists_registered() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolKind::TransferToAgent, Arc::new(EchoHandler));

        let catalog = registry.catalog();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0]["name"], "transfer_to_agent");
    }
}
