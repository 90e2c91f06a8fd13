//! One proxy connection.
//!
//! A session owns its JSON-RPC transport and walks a small state machine:
//!
//! ```text
//! Connected -> AwaitingRegistration -> Registered -> Active -> Closed
//!                       |                  |
//!                       +---- denied ------+-----------------> Closed
//! ```
//!
//! `proxy/register` establishes the proxy's identity, after which
//! `tools/register` may add tools any number of times. Replies to forwarded
//! `tools/call` requests are handed to the [`CallRouter`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcphub_core::events::{EventBus, HubEvent};
use mcphub_core::jsonrpc::Request;
use mcphub_core::protocol::{
    PING, PROXY_REGISTER, ProxyRegisterParams, ProxyRegisterResult, TOOLS_CALL, TOOLS_REGISTER,
    ToolsRegisterParams,
};
use mcphub_core::tools::ToolsRegistry;
use mcphub_core::{Incoming, JsonRpcTransport, McpError, MessageHandler, RpcError};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SessionSet;
use crate::error::SessionError;
use crate::router::CallRouter;

/// Lifecycle of a proxy session. Ordered: later states compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connected,
    AwaitingRegistration,
    Registered,
    Active,
    Closed,
}

/// Identity a proxy claimed in `proxy/register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyIdentity {
    pub proxy_id: String,
    pub proxy_name: String,
    pub persistent: bool,
}

/// Hub components a session talks to.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: ToolsRegistry,
    pub events: EventBus,
    pub router: Arc<CallRouter>,
    pub sessions: Arc<SessionSet>,
    pub registration_timeout: Option<Duration>,
}

#[cfg(test)]
impl SessionContext {
    pub(crate) fn for_tests(router: Arc<CallRouter>) -> Self {
        Self {
            registry: ToolsRegistry::new(),
            events: EventBus::default(),
            router,
            sessions: Arc::new(SessionSet::default()),
            registration_timeout: None,
        }
    }
}

pub struct Session {
    id: String,
    rpc: Arc<JsonRpcTransport>,
    state: watch::Sender<SessionState>,
    identity: RwLock<Option<ProxyIdentity>>,
    ctx: SessionContext,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session in the `Connected` state. The session stops when
    /// `parent` is cancelled.
    pub fn new(
        id: String,
        rpc: Arc<JsonRpcTransport>,
        ctx: SessionContext,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Connected);
        Arc::new(Self {
            id,
            rpc,
            state,
            identity: RwLock::new(None),
            ctx,
            cancel: parent.child_token(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rpc(&self) -> &Arc<JsonRpcTransport> {
        &self.rpc
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn identity(&self) -> Option<ProxyIdentity> {
        self.identity.read().clone()
    }

    pub fn proxy_id(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.proxy_id.clone())
    }

    pub(crate) fn mark_closed(&self) {
        self.set_state(SessionState::Closed);
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(session_id = %self.id, from = ?previous, to = ?next, "session state changed");
        }
    }

    /// Serve the connection until the proxy disconnects, the session is
    /// closed, or registration times out.
    pub async fn run(self: Arc<Self>) -> Result<(), SessionError> {
        let handler: Arc<dyn MessageHandler> = self.clone();
        let serve = self.rpc.run(handler, self.cancel.clone());
        tokio::pin!(serve);

        let mut timed_out = false;
        let result = tokio::select! {
            result = &mut serve => result,
            () = self.registration_watchdog() => {
                timed_out = true;
                self.cancel.cancel();
                serve.await
            }
        };
        self.mark_closed();

        if timed_out {
            let timeout_secs = self.ctx.registration_timeout.map_or(0, |t| t.as_secs());
            return Err(SessionError::RegistrationTimeout {
                session_id: self.id.clone(),
                timeout_secs,
            });
        }
        result.map_err(SessionError::from)
    }

    /// Stop the session and close its transport. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.mark_closed();
        self.rpc.close().await;
    }

    /// Resolves only if the registration deadline passes first.
    async fn registration_watchdog(&self) {
        let Some(timeout) = self.ctx.registration_timeout else {
            return std::future::pending().await;
        };
        let mut rx = self.state.subscribe();
        let registered = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| *s >= SessionState::Registered).await.is_ok()
        })
        .await;

        if registered.is_ok() {
            return std::future::pending().await;
        }
        warn!(
            session_id = %self.id,
            timeout_secs = timeout.as_secs(),
            "proxy did not register in time, closing session"
        );
    }

    async fn handle_request(&self, request: &Request) -> Result<Value, McpError> {
        match request.method.as_str() {
            PING => Ok(json!({})),
            PROXY_REGISTER => self.register_proxy(request),
            TOOLS_REGISTER
                if matches!(
                    self.state(),
                    SessionState::Registered | SessionState::Active
                ) =>
            {
                self.register_tools(request)
            }
            method => Err(McpError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }

    fn register_proxy(&self, request: &Request) -> Result<Value, McpError> {
        if matches!(
            self.state(),
            SessionState::Registered | SessionState::Active
        ) {
            return Err(McpError::InvalidRequest {
                details: format!("session {} is already registered", self.id),
            });
        }

        let params: ProxyRegisterParams = request.params_as()?;
        if params.proxy_id.is_empty() {
            return Err(McpError::invalid_params("proxyId must not be empty"));
        }

        let claimed = self.ctx.sessions.claim_proxy(&params.proxy_id, &self.id);
        let result = ProxyRegisterResult {
            session_id: self.id.clone(),
            proxy_id: params.proxy_id.clone(),
            persistent: params.persistent,
            denied: !claimed,
        };

        if !claimed {
            warn!(
                session_id = %self.id,
                proxy_id = %params.proxy_id,
                "proxy id already connected, denying registration"
            );
            self.mark_closed();
            return to_result(&result);
        }

        *self.identity.write() = Some(ProxyIdentity {
            proxy_id: params.proxy_id.clone(),
            proxy_name: params.server_info.name.clone(),
            persistent: params.persistent,
        });
        self.set_state(SessionState::Registered);

        info!(
            session_id = %self.id,
            proxy_id = %params.proxy_id,
            proxy_name = %params.server_info.name,
            protocol_version = %params.protocol_version,
            command = %params.proxy.command,
            persistent = params.persistent,
            "proxy registered"
        );
        self.ctx.events.publish(HubEvent::SessionRegistered {
            session_id: self.id.clone(),
            proxy_id: params.proxy_id,
            proxy_name: params.server_info.name,
        });
        to_result(&result)
    }

    fn register_tools(&self, request: &Request) -> Result<Value, McpError> {
        let identity = self
            .identity()
            .ok_or_else(|| McpError::internal("registered session has no identity"))?;
        let params: ToolsRegisterParams = request.params_as()?;

        let provider = self
            .ctx
            .registry
            .register_proxy_tool_provider(&identity.proxy_id, &identity.proxy_name)
            .map_err(|e| McpError::invalid_params(e.to_string()))?;

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for tool in params.tools {
            let name = tool.name.clone();
            match provider.add_proxy_tool(tool) {
                Ok(()) => accepted.push(name),
                Err(e) => {
                    warn!(
                        session_id = %self.id,
                        proxy_id = %identity.proxy_id,
                        tool = %name,
                        error = %e,
                        "tool rejected"
                    );
                    rejected.push(json!({ "name": name, "reason": e.to_string() }));
                }
            }
        }

        // Whatever was accepted becomes visible, even on partial failure.
        self.ctx
            .registry
            .prepare_tool_provider(&provider)
            .map_err(|e| McpError::internal(e.to_string()))?;
        self.set_state(SessionState::Active);

        info!(
            session_id = %self.id,
            proxy_id = %identity.proxy_id,
            accepted = accepted.len(),
            rejected = rejected.len(),
            "tools registered"
        );
        if !accepted.is_empty() {
            self.ctx.events.publish(HubEvent::ToolsChanged {
                provider: identity.proxy_id.clone(),
            });
        }

        if rejected.is_empty() {
            Ok(json!({ "registered": accepted }))
        } else {
            Err(McpError::InvalidParams {
                details: format!("{} tool(s) rejected", rejected.len()),
                data: Some(json!({ "registered": accepted, "rejected": rejected })),
            })
        }
    }
}

fn to_result<T: Serialize>(value: &T) -> Result<Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::internal(e.to_string()))
}

#[async_trait]
impl MessageHandler for Session {
    async fn on_ready(&self, _rpc: &Arc<JsonRpcTransport>) -> Result<(), RpcError> {
        self.set_state(SessionState::AwaitingRegistration);
        info!(session_id = %self.id, transport = %self.rpc.name(), "proxy session started");
        Ok(())
    }

    async fn handle(&self, rpc: &Arc<JsonRpcTransport>, incoming: Incoming) {
        match incoming {
            Incoming::Request(request) => {
                let reply = match self.handle_request(&request).await {
                    Ok(result) => rpc.send_result(request.id.clone(), result).await,
                    Err(e) => {
                        debug!(
                            session_id = %self.id,
                            method = %request.method,
                            error = %e,
                            "proxy request failed"
                        );
                        rpc.send_error(Some(request.id.clone()), e).await
                    }
                };
                if let Err(e) = reply {
                    warn!(session_id = %self.id, error = %e, "failed to answer proxy");
                }
                // A denied registration is answered, then the connection dropped.
                if self.is_closed() {
                    self.cancel.cancel();
                }
            }
            Incoming::Notification(notification) => {
                debug!(
                    session_id = %self.id,
                    method = %notification.method,
                    "ignoring proxy notification"
                );
            }
            Incoming::Response { method, response } if method == TOOLS_CALL => {
                self.ctx.router.complete(&self.id, response).await;
            }
            Incoming::Response { method, .. } => {
                debug!(session_id = %self.id, method = %method, "ignoring proxy response");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcphub_core::RequestId;
    use mcphub_core::jsonrpc::Params;
    use mcphub_core::transport::LineTransport;

    fn session_with(
        sessions: &Arc<SessionSet>,
        registry: &ToolsRegistry,
        id: &str,
    ) -> Arc<Session> {
        let (ours, _theirs) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(ours);
        let rpc = Arc::new(JsonRpcTransport::new(Arc::new(LineTransport::new(id, r, w))));
        let mut ctx = SessionContext::for_tests(Arc::new(CallRouter::new(None)));
        ctx.sessions = sessions.clone();
        ctx.registry = registry.clone();
        let session = Session::new(id.to_string(), rpc, ctx, &CancellationToken::new());
        sessions.insert(session.clone());
        session
    }

    fn session_in(sessions: Arc<SessionSet>, id: &str) -> Arc<Session> {
        session_with(&sessions, &ToolsRegistry::new(), id)
    }

    fn request(method: &str, params: Value) -> Request {
        Request::new(RequestId::Number(1), method, Some(Params::from(params)))
    }

    fn register(proxy_id: &str) -> Request {
        request(
            PROXY_REGISTER,
            json!({
                "protocolVersion": "2025-06-18",
                "proxyId": proxy_id,
                "serverInfo": {"name": "files", "version": "1.0"}
            }),
        )
    }

    fn tools(names: &[&str]) -> Request {
        let tools: Vec<Value> = names
            .iter()
            .map(|n| json!({"name": n, "description": "", "inputSchema": {"type": "object"}}))
            .collect();
        request(TOOLS_REGISTER, json!({ "tools": tools }))
    }

    #[tokio::test]
    async fn test_tools_register_before_registration_is_method_not_found() {
        let session = session_in(Arc::new(SessionSet::default()), "s-001");
        let err = session.handle_request(&tools(&["a"])).await.unwrap_err();
        assert!(matches!(err, McpError::MethodNotFound { .. }));
    }

    #[tokio::test]
    async fn test_ping_in_any_state() {
        let session = session_in(Arc::new(SessionSet::default()), "s-001");
        let ping = Request::new(RequestId::Number(9), PING, None);
        assert_eq!(session.handle_request(&ping).await.unwrap(), json!({}));
        session.handle_request(&register("p")).await.unwrap();
        assert_eq!(session.handle_request(&ping).await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_register_then_tools_become_visible() {
        let session = session_in(Arc::new(SessionSet::default()), "s-001");
        let result = session.handle_request(&register("p1")).await.unwrap();
        assert_eq!(result["sessionId"], "s-001");
        assert_eq!(result["denied"], false);
        assert_eq!(session.state(), SessionState::Registered);

        let result = session.handle_request(&tools(&["b", "a"])).await.unwrap();
        assert_eq!(result["registered"], json!(["b", "a"]));
        assert_eq!(session.state(), SessionState::Active);

        let names: Vec<_> = session
            .ctx
            .registry
            .list_tools()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_register_twice_is_invalid_request() {
        let session = session_in(Arc::new(SessionSet::default()), "s-001");
        session.handle_request(&register("p1")).await.unwrap();
        let err = session.handle_request(&register("p1")).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_register_without_proxy_id_is_invalid_params() {
        let session = session_in(Arc::new(SessionSet::default()), "s-001");
        let err = session
            .handle_request(&request(PROXY_REGISTER, json!({"serverInfo": {"name": "x"}})))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidParams { .. }));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_duplicate_proxy_id_is_denied() {
        let sessions = Arc::new(SessionSet::default());
        let first = session_in(sessions.clone(), "s-001");
        let second = session_in(sessions.clone(), "s-002");

        first.handle_request(&register("p1")).await.unwrap();
        let result = second.handle_request(&register("p1")).await.unwrap();
        assert_eq!(result["denied"], true);
        assert!(second.is_closed());
        assert!(second.identity().is_none());
        assert_eq!(sessions.by_proxy("p1").unwrap().id(), "s-001");
    }

    #[tokio::test]
    async fn test_partial_tool_rejection_reports_names() {
        let sessions = Arc::new(SessionSet::default());
        let registry = ToolsRegistry::new();
        let first = session_with(&sessions, &registry, "s-001");
        let second = session_with(&sessions, &registry, "s-002");

        first.handle_request(&register("a")).await.unwrap();
        first.handle_request(&tools(&["shared"])).await.unwrap();
        second.handle_request(&register("b")).await.unwrap();

        let err = second
            .handle_request(&tools(&["shared", "own"]))
            .await
            .unwrap_err();
        let McpError::InvalidParams { data: Some(data), .. } = err else {
            panic!("expected InvalidParams with data, got {err:?}");
        };
        assert_eq!(data["registered"], json!(["own"]));
        assert_eq!(data["rejected"][0]["name"], "shared");

        let names: Vec<_> = registry.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["own", "shared"]);
        assert_eq!(registry.lookup("shared").unwrap().provider, "a");
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let session = session_in(Arc::new(SessionSet::default()), "s-001");
        let err = session
            .handle_request(&request("resources/list", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.to_jsonrpc_code(), -32601);
    }

    #[tokio::test]
    async fn test_registration_timeout_closes_session() {
        let sessions = Arc::new(SessionSet::default());
        let (ours, _theirs) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(ours);
        let rpc = Arc::new(JsonRpcTransport::new(Arc::new(LineTransport::new("t", r, w))));
        let mut ctx = SessionContext::for_tests(Arc::new(CallRouter::new(None)));
        ctx.sessions = sessions;
        ctx.registration_timeout = Some(Duration::from_millis(50));
        let session = Session::new("s-001".into(), rpc, ctx, &CancellationToken::new());

        let err = tokio::time::timeout(Duration::from_secs(5), session.clone().run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SessionError::RegistrationTimeout { .. }));
        assert!(session.is_closed());
    }
}
