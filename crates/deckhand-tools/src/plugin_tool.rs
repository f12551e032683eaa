//! Adapter exposing registry plugin tools through the `ChatTool` trait.

use async_trait::async_trait;
use deckhand_plugins::{execute_plugin_tool, RegisteredPluginTool};
use deckhand_store::PluginStore;
use serde_json::{json, Value};

use crate::{ChatTool, ToolDefinition, ToolExecutionResult};

/// Public struct `PluginChatTool` used across Deckhand components.
pub struct PluginChatTool {
    registration: RegisteredPluginTool,
    store: PluginStore,
}

impl PluginChatTool {
    pub fn new(registration: RegisteredPluginTool, store: PluginStore) -> Self {
        Self {
            registration,
            store,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.registration.plugin
    }
}

#[async_trait]
impl ChatTool for PluginChatTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.registration.name.clone(),
            description: self.registration.description.clone(),
            parameters: self.registration.parameters.clone(),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        match execute_plugin_tool(&self.registration, &self.store, &arguments) {
            Ok(result) => ToolExecutionResult {
                content: result.content,
                is_error: result.is_error,
            },
            Err(error) => ToolExecutionResult::error(json!({
                "tool": self.registration.name,
                "plugin": self.registration.plugin,
                "plugin_version": self.registration.plugin_version,
                "error": format!("{error:#}"),
            })),
        }
    }
}
