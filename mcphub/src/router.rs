//! Call routing for tool calls forwarded to proxies.
//!
//! Request ids are local to one JSON-RPC transport, so a client's `tools/call`
//! cannot be replayed on a proxy session under the client's id. The router
//! issues the call on the proxy session under a fresh proxy-local id and
//! remembers `(session, proxy id) -> (client, client id)`. When the proxy
//! answers, the reply is re-addressed to the client's original id.
//!
//! Every route ends in exactly one client reply: the proxy's answer, an
//! `InternalError` when the session goes away, or an `InternalError` when
//! the call outlives the configured timeout.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mcphub_core::jsonrpc::{Params, RequestId, Response};
use mcphub_core::protocol::{CallToolParams, TOOLS_CALL};
use mcphub_core::{JsonRpcTransport, McpError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mux::session::Session;

/// Upper bound on how often overdue calls are swept.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    session_id: String,
    proxy_request_id: RequestId,
}

struct ForwardedCall {
    client_request_id: RequestId,
    client: Arc<JsonRpcTransport>,
    proxy: Arc<JsonRpcTransport>,
    tool: String,
    deadline: Option<Instant>,
}

/// Routes forwarded `tools/call` requests and their replies.
pub struct CallRouter {
    routes: DashMap<RouteKey, ForwardedCall>,
    call_timeout: Option<Duration>,
}

impl CallRouter {
    pub fn new(call_timeout: Option<Duration>) -> Self {
        Self {
            routes: DashMap::new(),
            call_timeout,
        }
    }

    /// Number of forwarded calls awaiting a proxy reply.
    pub fn in_flight(&self) -> usize {
        self.routes.len()
    }

    /// Forward a client's `tools/call` to `session`.
    ///
    /// On `Ok` the client will be answered later by [`complete`],
    /// [`fail_session`] or the expiry sweep. On `Err` nothing was recorded
    /// and the caller must answer the client itself.
    ///
    /// [`complete`]: Self::complete
    /// [`fail_session`]: Self::fail_session
    pub async fn forward(
        &self,
        session: &Session,
        client: &Arc<JsonRpcTransport>,
        client_request_id: RequestId,
        params: CallToolParams,
    ) -> Result<RequestId, McpError> {
        let proxy = session.rpc().clone();
        let proxy_request_id = proxy.allocate_id();
        let key = RouteKey {
            session_id: session.id().to_string(),
            proxy_request_id: proxy_request_id.clone(),
        };

        let payload = serde_json::to_value(&params)
            .map_err(|e| McpError::internal(format!("failed to encode tools/call: {e}")))?;

        // Recorded before sending so an immediate reply always finds its route.
        self.routes.insert(
            key.clone(),
            ForwardedCall {
                client_request_id: client_request_id.clone(),
                client: client.clone(),
                proxy: proxy.clone(),
                tool: params.name.clone(),
                deadline: self.call_timeout.map(|t| Instant::now() + t),
            },
        );

        if let Err(e) = proxy
            .send_request_with_id(proxy_request_id.clone(), TOOLS_CALL, Some(Params::from(payload)))
            .await
        {
            if self.routes.remove(&key).is_some() {
                return Err(McpError::internal(format!(
                    "failed to forward '{}' to session {}: {e}",
                    params.name,
                    session.id()
                )));
            }
            // The session was torn down concurrently and already answered.
            return Ok(proxy_request_id);
        }

        debug!(
            session_id = %session.id(),
            tool = %params.name,
            client_id = %client_request_id,
            proxy_id = %proxy_request_id,
            "tools/call forwarded"
        );
        Ok(proxy_request_id)
    }

    /// Deliver a proxy's reply to the client that originated the call.
    pub async fn complete(&self, session_id: &str, response: Response) {
        let Some(proxy_request_id) = response.id.clone() else {
            warn!(session_id, "tools/call reply without id");
            return;
        };
        let key = RouteKey {
            session_id: session_id.to_string(),
            proxy_request_id,
        };
        let Some((key, call)) = self.routes.remove(&key) else {
            debug!(
                session_id,
                id = %key.proxy_request_id,
                "no route for tools/call reply (expired or failed)"
            );
            return;
        };

        let reply = Response {
            id: Some(call.client_request_id.clone()),
            outcome: response.outcome,
        };
        debug!(
            session_id,
            tool = %call.tool,
            client_id = %call.client_request_id,
            proxy_id = %key.proxy_request_id,
            is_error = reply.is_error(),
            "tools/call completed"
        );
        if let Err(e) = call.client.send_response(&reply).await {
            warn!(session_id, error = %e, "failed to deliver tools/call reply to client");
        }
    }

    /// Answer every call routed to `session_id` with an `InternalError`.
    /// Returns the number of calls failed.
    pub async fn fail_session(&self, session_id: &str) -> usize {
        let keys: Vec<RouteKey> = self
            .routes
            .iter()
            .filter(|entry| entry.key().session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for key in keys {
            if let Some((_, call)) = self.routes.remove(&key) {
                let error = McpError::internal(format!(
                    "proxy session {session_id} closed before answering '{}'",
                    call.tool
                ));
                reply_error(&call, error).await;
                failed += 1;
            }
        }
        if failed > 0 {
            info!(session_id, failed, "failed in-flight calls of closed session");
        }
        failed
    }

    /// Fail every call whose deadline is at or before `now`.
    pub async fn expire_overdue(&self, now: Instant) -> usize {
        let keys: Vec<RouteKey> = self
            .routes
            .iter()
            .filter(|entry| entry.value().deadline.is_some_and(|d| d <= now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = 0;
        for key in keys {
            if let Some((key, call)) = self.routes.remove(&key) {
                call.proxy.take_pending(&key.proxy_request_id);
                warn!(
                    session_id = %key.session_id,
                    tool = %call.tool,
                    client_id = %call.client_request_id,
                    "forwarded tools/call timed out"
                );
                let secs = self.call_timeout.map_or(0, |t| t.as_secs());
                let error = McpError::internal(format!(
                    "proxy did not answer '{}' within {secs}s",
                    call.tool
                ));
                reply_error(&call, error).await;
                expired += 1;
            }
        }
        expired
    }

    /// Periodically expire overdue calls until cancelled. Returns immediately
    /// on cancellation; does nothing when no timeout is configured.
    pub async fn run_expiry(&self, cancel: CancellationToken) {
        let Some(timeout) = self.call_timeout else {
            cancel.cancelled().await;
            return;
        };
        let period = (timeout / 4).clamp(Duration::from_millis(10), MAX_SWEEP_INTERVAL);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    self.expire_overdue(Instant::now()).await;
                }
            }
        }
    }
}

async fn reply_error(call: &ForwardedCall, error: McpError) {
    if let Err(e) = call
        .client
        .send_error(Some(call.client_request_id.clone()), error)
        .await
    {
        warn!(error = %e, "failed to deliver tools/call error to client");
    }
}
