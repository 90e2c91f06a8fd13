//! Tools implemented by the hub itself.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use mcphub_core::protocol::{CallToolResult, ToolDefinition};
use mcphub_core::tools::{ToolError, ToolHandler, ToolsRegistry};
use serde_json::{Value, json};

use crate::mux::MuxServer;

/// Provider id of the hub's own tools.
pub const HUB_PROVIDER_ID: &str = "hub";

pub const LIST_PROXIES_TOOL: &str = "hub_proxies";

/// Reports the proxy sessions connected to the multiplexer.
pub struct ListProxiesTool {
    mux: Weak<MuxServer>,
}

impl ListProxiesTool {
    pub fn new(mux: &Arc<MuxServer>) -> Self {
        Self {
            mux: Arc::downgrade(mux),
        }
    }
}

#[async_trait]
impl ToolHandler for ListProxiesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            LIST_PROXIES_TOOL,
            "List the proxy sessions connected to this hub and how many tools each provides",
            json!({"type": "object", "properties": {}}),
        )
    }

    async fn invoke(&self, _arguments: Value) -> Result<CallToolResult, ToolError> {
        let mux = self.mux.upgrade().ok_or_else(|| ToolError::Execution {
            name: LIST_PROXIES_TOOL.to_string(),
            reason: "proxy multiplexer has shut down".to_string(),
        })?;
        let text = serde_json::to_string_pretty(&json!({ "sessions": mux.sessions() }))
            .map_err(|e| ToolError::Execution {
                name: LIST_PROXIES_TOOL.to_string(),
                reason: e.to_string(),
            })?;
        Ok(CallToolResult::text(text))
    }
}

/// Register and prepare the hub's own tools.
pub fn register_builtin_tools(
    registry: &ToolsRegistry,
    mux: Option<&Arc<MuxServer>>,
) -> Result<(), ToolError> {
    let provider = registry.register_local_tool_provider(HUB_PROVIDER_ID, "mcphub")?;
    if let Some(mux) = mux {
        provider.add_tool(Arc::new(ListProxiesTool::new(mux)))?;
    }
    registry.prepare_tool_provider(&provider)
}
