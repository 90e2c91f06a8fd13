//! Tools registry shared by every hub session.
//!
//! Tools are contributed by providers: one per connected proxy, plus local
//! providers for tools the hub implements itself. Registration is two-phase.
//! Adding a tool reserves its name globally right away, so duplicates are
//! rejected at the point of registration. Added tools stay staged, hidden from
//! listing and lookup, until their provider is prepared again, so a client
//! never observes a half-registered batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::protocol::{CallToolResult, ToolDefinition};

/// Errors raised by the tools registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("tool '{name}' already exists (provided by '{provider}')")]
    AlreadyExists { name: String, provider: String },

    #[error("tool '{name}' not found")]
    NotFound { name: String },

    #[error("tool provider '{provider}' not found")]
    ProviderNotFound { provider: String },

    #[error("tool provider '{provider}' is already registered as a {kind} provider")]
    ProviderKindMismatch { provider: String, kind: ProviderKind },

    #[error("tool '{name}' is served by proxy '{proxy_id}' and must be forwarded")]
    RemoteTool { name: String, proxy_id: String },

    #[error("invalid arguments for '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("tool '{name}' failed: {reason}")]
    Execution { name: String, reason: String },

    #[error("tool '{name}' was cancelled")]
    Cancelled { name: String },
}

/// A tool implemented inside the hub process.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn invoke(&self, arguments: Value) -> Result<CallToolResult, ToolError>;
}

/// Whether a provider's tools run locally or behind a proxy session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Local,
    Proxy,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProviderKind::Local => "local",
            ProviderKind::Proxy => "proxy",
        })
    }
}

/// How to invoke a registered tool.
#[derive(Clone)]
pub enum ToolTarget {
    Local(Arc<dyn ToolHandler>),
    Proxy { proxy_id: String },
}

impl std::fmt::Debug for ToolTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolTarget::Local(_) => f.write_str("Local"),
            ToolTarget::Proxy { proxy_id } => {
                f.debug_struct("Proxy").field("proxy_id", proxy_id).finish()
            }
        }
    }
}

/// A tool as stored in the registry.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub provider: String,
    pub target: ToolTarget,
}

#[derive(Debug)]
struct ProviderEntry {
    name: String,
    kind: ProviderKind,
    tools: Vec<String>,
    /// Added since the last prepare.
    staged: Vec<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    providers: HashMap<String, ProviderEntry>,
    tools: BTreeMap<String, RegisteredTool>,
}

impl RegistryState {
    fn is_visible(&self, tool: &RegisteredTool) -> bool {
        self.providers
            .get(&tool.provider)
            .is_some_and(|p| !p.staged.contains(&tool.definition.name))
    }
}

/// Cheaply cloneable handle to the shared registry.
#[derive(Debug, Clone, Default)]
pub struct ToolsRegistry {
    state: Arc<RwLock<RegistryState>>,
}

/// Handle to one provider, used to add its tools.
#[derive(Debug, Clone)]
pub struct ToolProvider {
    registry: ToolsRegistry,
    id: String,
    kind: ProviderKind,
}

impl ToolsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the provider for a proxy.
    pub fn register_proxy_tool_provider(
        &self,
        proxy_id: &str,
        proxy_name: &str,
    ) -> Result<ToolProvider, ToolError> {
        self.register_provider(proxy_id, proxy_name, ProviderKind::Proxy)
    }

    /// Get or create a provider for tools implemented in-process.
    pub fn register_local_tool_provider(
        &self,
        provider_id: &str,
        name: &str,
    ) -> Result<ToolProvider, ToolError> {
        self.register_provider(provider_id, name, ProviderKind::Local)
    }

    fn register_provider(
        &self,
        id: &str,
        name: &str,
        kind: ProviderKind,
    ) -> Result<ToolProvider, ToolError> {
        let mut state = self.state.write();
        let entry = state
            .providers
            .entry(id.to_string())
            .or_insert_with(|| ProviderEntry {
                name: name.to_string(),
                kind,
                tools: Vec::new(),
                staged: Vec::new(),
            });
        if entry.kind != kind {
            return Err(ToolError::ProviderKindMismatch {
                provider: id.to_string(),
                kind: entry.kind,
            });
        }
        Ok(ToolProvider {
            registry: self.clone(),
            id: id.to_string(),
            kind,
        })
    }

    /// Make every tool the provider has staged visible. Preparing with nothing
    /// staged is a no-op.
    pub fn prepare_tool_provider(&self, provider: &ToolProvider) -> Result<(), ToolError> {
        let mut state = self.state.write();
        let entry =
            state
                .providers
                .get_mut(&provider.id)
                .ok_or_else(|| ToolError::ProviderNotFound {
                    provider: provider.id.clone(),
                })?;
        if !entry.staged.is_empty() {
            let promoted = std::mem::take(&mut entry.staged);
            tracing::debug!(
                provider = %provider.id,
                name = %entry.name,
                promoted = promoted.len(),
                tools = entry.tools.len(),
                "tool provider prepared"
            );
        }
        Ok(())
    }

    /// Remove a provider and every tool it contributed. Returns the names of
    /// the removed tools.
    pub fn remove_provider(&self, provider_id: &str) -> Vec<String> {
        let mut state = self.state.write();
        let Some(entry) = state.providers.remove(provider_id) else {
            return Vec::new();
        };
        for name in &entry.tools {
            state.tools.remove(name);
        }
        tracing::debug!(provider = %provider_id, removed = entry.tools.len(), "tool provider removed");
        entry.tools
    }

    /// Visible tools, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let state = self.state.read();
        state
            .tools
            .values()
            .filter(|t| state.is_visible(t))
            .map(|t| t.definition.clone())
            .collect()
    }

    /// Look up a visible tool.
    pub fn lookup(&self, name: &str) -> Option<RegisteredTool> {
        let state = self.state.read();
        state
            .tools
            .get(name)
            .filter(|t| state.is_visible(t))
            .cloned()
    }

    /// Number of tools a provider has added, visible or not.
    pub fn provider_tool_count(&self, provider_id: &str) -> usize {
        self.state
            .read()
            .providers
            .get(provider_id)
            .map_or(0, |p| p.tools.len())
    }

    /// Invoke a visible local tool.
    ///
    /// Proxy tools are not callable here; they yield
    /// [`ToolError::RemoteTool`] so the caller can forward them.
    pub async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, ToolError> {
        let tool = self.lookup(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        let handler = match tool.target {
            ToolTarget::Local(handler) => handler,
            ToolTarget::Proxy { proxy_id } => {
                return Err(ToolError::RemoteTool {
                    name: name.to_string(),
                    proxy_id,
                });
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled { name: name.to_string() }),
            result = handler.invoke(arguments) => result,
        }
    }

    fn insert_tool(&self, provider: &ToolProvider, tool: RegisteredTool) -> Result<(), ToolError> {
        let mut state = self.state.write();
        if let Some(existing) = state.tools.get(&tool.definition.name) {
            return Err(ToolError::AlreadyExists {
                name: tool.definition.name.clone(),
                provider: existing.provider.clone(),
            });
        }
        let entry =
            state
                .providers
                .get_mut(&provider.id)
                .ok_or_else(|| ToolError::ProviderNotFound {
                    provider: provider.id.clone(),
                })?;
        entry.tools.push(tool.definition.name.clone());
        entry.staged.push(tool.definition.name.clone());
        state.tools.insert(tool.definition.name.clone(), tool);
        Ok(())
    }
}

impl ToolProvider {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Add a tool served by this provider's proxy.
    pub fn add_proxy_tool(&self, definition: ToolDefinition) -> Result<(), ToolError> {
        if self.kind != ProviderKind::Proxy {
            return Err(ToolError::ProviderKindMismatch {
                provider: self.id.clone(),
                kind: self.kind,
            });
        }
        self.registry.insert_tool(
            self,
            RegisteredTool {
                definition,
                provider: self.id.clone(),
                target: ToolTarget::Proxy {
                    proxy_id: self.id.clone(),
                },
            },
        )
    }

    /// Add an in-process tool.
    pub fn add_tool(&self, handler: Arc<dyn ToolHandler>) -> Result<(), ToolError> {
        if self.kind != ProviderKind::Local {
            return Err(ToolError::ProviderKindMismatch {
                provider: self.id.clone(),
                kind: self.kind,
            });
        }
        self.registry.insert_tool(
            self,
            RegisteredTool {
                definition: handler.definition(),
                provider: self.id.clone(),
                target: ToolTarget::Local(handler),
            },
        )
    }
}
