//! Chat tool surface for the Deckhand agent loop.
//!
//! Built-in tools wrap the sandbox gates; plugin tools are adapted from the
//! lifecycle registry so the aggregate catalog is uniform for the caller.

mod builtin;
mod context;
mod plugin_tool;
mod rate_limit;

pub use builtin::*;
pub use context::*;
pub use plugin_tool::*;
pub use rate_limit::*;

use std::sync::Arc;

use async_trait::async_trait;
use deckhand_plugins::PluginHost;
use deckhand_sandbox::{CommandGate, PathGate};
use deckhand_store::SharedStore;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
/// Public struct `ToolDefinition` used across Deckhand components.
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
/// Public struct `ToolExecutionResult` used across Deckhand components.
pub struct ToolExecutionResult {
    pub content: Value,
    pub is_error: bool,
}

impl ToolExecutionResult {
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(content: Value) -> Self {
        Self {
            content,
            is_error: true,
        }
    }
}

#[async_trait]
/// A tool exposed to the agent loop: a JSON-schema definition plus an
/// executor taking JSON arguments.
pub trait ChatTool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, arguments: Value) -> ToolExecutionResult;
}

/// Builds the full catalog handed to the agent loop: built-in sandboxed
/// tools first, then every plugin tool currently in the registry.
pub fn build_tool_catalog(
    command_gate: Arc<CommandGate>,
    path_gate: Arc<PathGate>,
    limits: ToolLimits,
    store: SharedStore,
    host: &PluginHost,
) -> Vec<Box<dyn ChatTool>> {
    let rate_limiter = Arc::new(ToolRateLimiter::default());
    let mut catalog: Vec<Box<dyn ChatTool>> = vec![
        Box::new(RunCommandTool::new(
            command_gate,
            store,
            limits.clone(),
            rate_limiter,
        )),
        Box::new(ReadFileTool::new(path_gate, limits)),
    ];
    for tool in host.tools() {
        if let Some(loaded) = host.plugin(&tool.plugin) {
            catalog.push(Box::new(PluginChatTool::new(tool, loaded.store().clone())));
        }
    }
    catalog
}

pub(crate) fn required_string(arguments: &Value, key: &str) -> Result<String, String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(|value| value.to_string())
        .ok_or_else(|| format!("missing required string argument '{key}'"))
}

/// Replaces values of secret-shaped environment variables before any tool
/// output leaves the process.
pub(crate) fn redact_secrets(text: &str) -> String {
    let mut redacted = text.to_string();

    for (name, value) in std::env::vars() {
        let upper = name.to_ascii_uppercase();
        let is_sensitive = upper.ends_with("_KEY")
            || upper.ends_with("_TOKEN")
            || upper.ends_with("_SECRET")
            || upper.ends_with("_PASSWORD");
        if !is_sensitive || value.trim().len() < 6 {
            continue;
        }

        redacted = redacted.replace(&value, "[REDACTED]");
    }

    redacted
}

pub(crate) fn resolve_local_principal() -> String {
    std::env::var("USER")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

pub(crate) fn current_unix_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests;
