//! Client-facing MCP server.
//!
//! Answers `initialize`, `ping`, `tools/list` and `tools/call` on the client
//! transport. Local tools run on their own task so a slow tool never stalls
//! the receive loop; proxy tools are forwarded through the [`CallRouter`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use mcphub_core::inspector::Inspector;
use mcphub_core::jsonrpc::Request;
use mcphub_core::protocol::{
    CANCELLED, CallToolParams, CallToolResult, INITIALIZE, INITIALIZED, InitializeParams,
    InitializeResult, MCP_PROTOCOL_VERSION, PING, ServerCapabilities, ServerInfo, TOOLS_CALL,
    TOOLS_LIST, TOOLS_LIST_CHANGED, ToolsCapability, ToolsListResult,
};
use mcphub_core::tools::{ToolError, ToolTarget, ToolsRegistry};
use mcphub_core::{
    Incoming, JsonRpcTransport, McpError, MessageHandler, RequestId, RpcError, Transport,
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::mux::MuxServer;
use crate::router::CallRouter;

pub struct McpServer {
    info: ServerInfo,
    registry: ToolsRegistry,
    router: Arc<CallRouter>,
    mux: Option<Arc<MuxServer>>,
    client: OnceLock<Arc<JsonRpcTransport>>,
    initialized: AtomicBool,
    local_calls: TaskTracker,
    local_cancel: CancellationToken,
}

impl McpServer {
    pub fn new(
        info: ServerInfo,
        registry: ToolsRegistry,
        router: Arc<CallRouter>,
        mux: Option<Arc<MuxServer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            registry,
            router,
            mux,
            client: OnceLock::new(),
            initialized: AtomicBool::new(false),
            local_calls: TaskTracker::new(),
            local_cancel: CancellationToken::new(),
        })
    }

    /// Serve the client on `transport` until it disconnects or `cancel` fires.
    /// Local tool calls still running are cancelled and awaited.
    pub async fn serve(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        inspector: Option<Arc<dyn Inspector>>,
        cancel: CancellationToken,
    ) -> Result<(), RpcError> {
        let rpc = Arc::new(JsonRpcTransport::new(transport).with_inspector(inspector));
        info!(transport = %rpc.name(), "serving MCP client");

        let result = rpc.run(self.clone(), cancel).await;

        self.local_cancel.cancel();
        self.local_calls.close();
        self.local_calls.wait().await;
        info!(transport = %rpc.name(), "MCP client disconnected");
        result
    }

    /// Tell the client its tool list changed. Dropped before the client has
    /// finished initialization.
    pub async fn notify_tools_changed(&self) {
        if !self.initialized.load(Ordering::Acquire) {
            debug!("client not initialized, skipping tools/list_changed");
            return;
        }
        let Some(rpc) = self.client.get() else {
            return;
        };
        if let Err(e) = rpc.send_notification(TOOLS_LIST_CHANGED, None).await {
            warn!(error = %e, "failed to send tools/list_changed");
        }
    }

    fn initialize(&self, request: &Request) -> Result<Value, McpError> {
        let params: InitializeParams = request.params_as()?;
        if let Some(client) = &params.client_info {
            info!(client = %client.name, version = %client.version, "client initializing");
        }
        let result = InitializeResult {
            protocol_version: params
                .protocol_version
                .unwrap_or_else(|| MCP_PROTOCOL_VERSION.to_string()),
            capabilities: ServerCapabilities {
                tools: ToolsCapability { list_changed: true },
            },
            server_info: self.info.clone(),
        };
        to_result(&result)
    }

    fn list_tools(&self) -> Result<Value, McpError> {
        to_result(&ToolsListResult {
            tools: self.registry.list_tools(),
        })
    }

    /// Dispatch a `tools/call`. Answers the client itself, possibly later.
    async fn call_tool(&self, rpc: &Arc<JsonRpcTransport>, request: &Request) {
        let id = request.id.clone();
        let params: CallToolParams = match request.params_as() {
            Ok(params) => params,
            Err(e) => return reply(rpc, id, Err(e)).await,
        };
        let Some(tool) = self.registry.lookup(&params.name) else {
            let error = McpError::invalid_params(format!("unknown tool '{}'", params.name));
            return reply(rpc, id, Err(error)).await;
        };

        match tool.target {
            ToolTarget::Local(_) => {
                let registry = self.registry.clone();
                let cancel = self.local_cancel.clone();
                let rpc = rpc.clone();
                self.local_calls.spawn(async move {
                    let outcome = registry
                        .call_tool(&cancel, &params.name, params.arguments)
                        .await;
                    reply(&rpc, id, local_outcome(outcome)).await;
                });
            }
            ToolTarget::Proxy { proxy_id } => {
                let session = self
                    .mux
                    .as_ref()
                    .and_then(|mux| mux.session_for_proxy(&proxy_id));
                let Some(session) = session else {
                    let error = McpError::internal(format!("proxy '{proxy_id}' is not connected"));
                    return reply(rpc, id, Err(error)).await;
                };
                if let Err(e) = self.router.forward(&session, rpc, id.clone(), params).await {
                    reply(rpc, id, Err(e)).await;
                }
            }
        }
    }
}

/// Tool failures are results the model should see; everything else is a
/// protocol error.
fn local_outcome(outcome: Result<CallToolResult, ToolError>) -> Result<Value, McpError> {
    match outcome {
        Ok(result) => to_result(&result),
        Err(ToolError::Execution { reason, .. }) => to_result(&CallToolResult::error(reason)),
        Err(e @ ToolError::InvalidArguments { .. }) => Err(McpError::invalid_params(e.to_string())),
        Err(e) => Err(McpError::internal(e.to_string())),
    }
}

fn to_result<T: Serialize>(value: &T) -> Result<Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::internal(e.to_string()))
}

async fn reply(rpc: &JsonRpcTransport, id: RequestId, outcome: Result<Value, McpError>) {
    let sent = match outcome {
        Ok(result) => rpc.send_result(id, result).await,
        Err(e) => {
            debug!(id = %id, error = %e, "client request failed");
            rpc.send_error(Some(id), e).await
        }
    };
    if let Err(e) = sent {
        warn!(error = %e, "failed to answer client");
    }
}

#[async_trait]
impl MessageHandler for McpServer {
    async fn on_ready(&self, rpc: &Arc<JsonRpcTransport>) -> Result<(), RpcError> {
        if self.client.set(rpc.clone()).is_err() {
            warn!("MCP server already bound to a client transport");
        }
        Ok(())
    }

    async fn handle(&self, rpc: &Arc<JsonRpcTransport>, incoming: Incoming) {
        match incoming {
            Incoming::Request(request) => {
                let id = request.id.clone();
                let outcome = match request.method.as_str() {
                    INITIALIZE => self.initialize(&request),
                    PING => Ok(json!({})),
                    TOOLS_LIST => self.list_tools(),
                    TOOLS_CALL => return self.call_tool(rpc, &request).await,
                    method => Err(McpError::MethodNotFound {
                        method: method.to_string(),
                    }),
                };
                reply(rpc, id, outcome).await;
            }
            Incoming::Notification(notification) => match notification.method.as_str() {
                INITIALIZED => {
                    self.initialized.store(true, Ordering::Release);
                    info!("client initialized");
                }
                CANCELLED => {
                    debug!(params = ?notification.params, "client cancelled a request");
                }
                method => debug!(method, "ignoring client notification"),
            },
            Incoming::Response { method, .. } => {
                debug!(method = %method, "ignoring client response");
            }
        }
    }
}
