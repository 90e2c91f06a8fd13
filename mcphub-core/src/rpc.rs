//! JSON-RPC transport: request correlation over a byte [`Transport`].
//!
//! Responsibilities:
//! - allocate request ids from a per-instance counter (starting at 0)
//! - remember the method of every outbound request in the pending-request
//!   table so that responses, which carry no method, can be dispatched
//! - run the receive loop: classify each inbound message and deliver it to a
//!   [`MessageHandler`] in wire order
//!
//! The receive loop never terminates because of a single bad message.
//! Malformed input is logged and, when it looked like a request, answered with
//! the matching JSON-RPC error. Batches are refused with a single null-id
//! error. Unmatched responses are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{JsonRpcError, McpError};
use crate::inspector::{Direction, Inspector};
use crate::jsonrpc::{
    self, ClassifyError, Nature, Notification, Params, Request, RequestId, Response,
};
use crate::transport::{Transport, TransportError, TransportEvent};

/// Errors raised by the JSON-RPC transport.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Record of an outbound request awaiting its response.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub method: String,
    pub request_id: RequestId,
    pub sent_at: Instant,
}

/// An inbound message as delivered to a [`MessageHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(Request),
    Notification(Notification),
    /// A response whose originating method was recovered from the
    /// pending-request table.
    Response { method: String, response: Response },
}

impl Incoming {
    pub fn method(&self) -> &str {
        match self {
            Incoming::Request(r) => &r.method,
            Incoming::Notification(n) => &n.method,
            Incoming::Response { method, .. } => method,
        }
    }
}

/// Consumer of a JSON-RPC transport's inbound traffic.
///
/// `handle` is awaited before the next message is read, which is what gives
/// in-order delivery. Handlers must therefore hand long-running work to a
/// separate task.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called once, after the transport has started and before the first
    /// inbound message is delivered.
    async fn on_ready(&self, _rpc: &Arc<JsonRpcTransport>) -> Result<(), RpcError> {
        Ok(())
    }

    async fn handle(&self, rpc: &Arc<JsonRpcTransport>, incoming: Incoming);
}

/// JSON-RPC layer wrapping one [`Transport`].
pub struct JsonRpcTransport {
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    inspector: Option<Arc<dyn Inspector>>,
}

impl JsonRpcTransport {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            next_id: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
            inspector: None,
        }
    }

    /// Tap every inbound and outbound frame.
    #[must_use]
    pub fn with_inspector(mut self, inspector: Option<Arc<dyn Inspector>>) -> Self {
        self.inspector = inspector;
        self
    }

    /// Label of the underlying transport.
    pub fn name(&self) -> &str {
        self.transport.name()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────

    /// Reserve the next local request id without sending anything.
    ///
    /// Used when a caller must record its own bookkeeping for the id before
    /// the request can possibly be answered.
    pub fn allocate_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send a request under a fresh id and return that id.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Params>,
    ) -> Result<RequestId, RpcError> {
        let id = self.allocate_id();
        self.send_request_with_id(id.clone(), method, params).await?;
        Ok(id)
    }

    /// Send a request under an id previously obtained from
    /// [`allocate_id`](Self::allocate_id).
    ///
    /// The pending entry is recorded before the bytes leave, so a fast peer
    /// can never answer a request the table does not know about yet.
    pub async fn send_request_with_id(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Params>,
    ) -> Result<(), RpcError> {
        let request = Request::new(id.clone(), method, params);
        let bytes = jsonrpc::encode(&request)?;

        self.pending.lock().insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                request_id: id.clone(),
                sent_at: Instant::now(),
            },
        );

        if let Err(e) = self.send_raw(&bytes).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        Ok(())
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Params>,
    ) -> Result<(), RpcError> {
        self.send_message(&Notification::new(method, params)).await
    }

    pub async fn send_response(&self, response: &Response) -> Result<(), RpcError> {
        self.send_message(response).await
    }

    /// Answer `id` with a successful result.
    pub async fn send_result(&self, id: RequestId, result: Value) -> Result<(), RpcError> {
        self.send_response(&Response::success(id, result)).await
    }

    /// Answer `id` (or `null` when unknown) with an error.
    pub async fn send_error(
        &self,
        id: Option<RequestId>,
        error: impl Into<JsonRpcError>,
    ) -> Result<(), RpcError> {
        self.send_response(&Response::error(id, error.into())).await
    }

    async fn send_message<T: Serialize>(&self, message: &T) -> Result<(), RpcError> {
        let bytes = jsonrpc::encode(message)?;
        self.send_raw(&bytes).await
    }

    async fn send_raw(&self, bytes: &[u8]) -> Result<(), RpcError> {
        if let Some(inspector) = &self.inspector {
            inspector.inspect(self.transport.name(), Direction::Outbound, bytes);
        }
        self.transport.send(bytes).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pending-request table
    // ─────────────────────────────────────────────────────────────────────

    /// Remove and return the pending entry for `id`. Entries are read once.
    pub fn take_pending(&self, id: &RequestId) -> Option<PendingRequest> {
        self.pending.lock().remove(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Receive loop
    // ─────────────────────────────────────────────────────────────────────

    /// Start the transport and deliver inbound messages to `handler` until
    /// EOF, a fatal transport error, or cancellation.
    ///
    /// The transport is closed on every exit path.
    pub async fn run(
        self: &Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), RpcError> {
        let result = self.receive(handler, &cancel).await;

        if let Err(e) = self.transport.close().await {
            debug!(transport = %self.name(), error = %e, "close failed");
        }
        let orphaned = self.pending_count();
        if orphaned > 0 {
            debug!(
                transport = %self.name(),
                orphaned,
                "transport stopped with unanswered requests"
            );
        }
        result
    }

    async fn receive(
        self: &Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        cancel: &CancellationToken,
    ) -> Result<(), RpcError> {
        let mut events = self.transport.start().await?;
        handler.on_ready(self).await?;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(transport = %self.name(), "receive loop cancelled");
                    return Ok(());
                }
                event = events.recv() => event,
            };

            match event {
                Some(TransportEvent::Message(bytes)) => self.dispatch(&handler, &bytes).await,
                Some(TransportEvent::Error(e)) if e.is_recoverable() => {
                    warn!(transport = %self.name(), error = %e, "dropping unreadable message");
                }
                Some(TransportEvent::Error(e)) => {
                    warn!(transport = %self.name(), error = %e, "transport failed");
                    return Err(e.into());
                }
                Some(TransportEvent::Closed) | None => {
                    debug!(transport = %self.name(), "transport closed");
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, handler: &Arc<dyn MessageHandler>, bytes: &[u8]) {
        if let Some(inspector) = &self.inspector {
            inspector.inspect(self.name(), Direction::Inbound, bytes);
        }

        let (nature, value) = match jsonrpc::classify(bytes) {
            Ok(classified) => classified,
            Err(e) => {
                warn!(transport = %self.name(), error = %e, "discarding unclassifiable message");
                // Unparsable JSON gets a null-id ParseError. For anything else
                // only answer when the message looked like a request.
                let reply_id = match &e {
                    ClassifyError::Malformed { .. } => Some(None),
                    _ => serde_json::from_slice::<Value>(bytes)
                        .ok()
                        .filter(|v| v.get("method").is_some())
                        .and_then(|v| jsonrpc::extract_id(&v))
                        .map(Some),
                };
                if let Some(id) = reply_id {
                    self.reply_error(id, McpError::from(e)).await;
                }
                return;
            }
        };

        match nature {
            Nature::Batch => {
                warn!(transport = %self.name(), "rejecting batch message");
                self.reply_error(None, McpError::from(ClassifyError::Batch))
                    .await;
            }
            Nature::Request => {
                let id = jsonrpc::extract_id(&value);
                match jsonrpc::parse_request(value) {
                    Ok(request) => handler.handle(self, Incoming::Request(request)).await,
                    Err(e) => {
                        warn!(transport = %self.name(), error = %e, "invalid request");
                        self.reply_error(id, McpError::from(e)).await;
                    }
                }
            }
            Nature::Notification => match jsonrpc::parse_notification(value) {
                Ok(notification) => {
                    handler
                        .handle(self, Incoming::Notification(notification))
                        .await;
                }
                Err(e) => {
                    warn!(transport = %self.name(), error = %e, "discarding invalid notification");
                }
            },
            Nature::Response => match jsonrpc::parse_response(value) {
                Ok(response) => self.deliver_response(handler, response).await,
                Err(e) => {
                    warn!(transport = %self.name(), error = %e, "discarding invalid response");
                }
            },
        }
    }

    async fn deliver_response(self: &Arc<Self>, handler: &Arc<dyn MessageHandler>, response: Response) {
        let Some(id) = response.id.clone() else {
            warn!(
                transport = %self.name(),
                response = ?response.outcome,
                "discarding response without id"
            );
            return;
        };

        match self.take_pending(&id) {
            Some(pending) => {
                debug!(
                    transport = %self.name(),
                    id = %id,
                    method = %pending.method,
                    elapsed_ms = saturating_millis(pending.sent_at.elapsed()),
                    "response matched"
                );
                handler
                    .handle(
                        self,
                        Incoming::Response {
                            method: pending.method,
                            response,
                        },
                    )
                    .await;
            }
            None => {
                warn!(transport = %self.name(), id = %id, "discarding unmatched response");
            }
        }
    }

    async fn reply_error(&self, id: Option<RequestId>, error: McpError) {
        if let Err(e) = self.send_error(id, error).await {
            debug!(transport = %self.name(), error = %e, "failed to send error reply");
        }
    }

    /// Close the underlying transport, unblocking [`run`](Self::run).
    pub async fn close(&self) {
        if let Err(e) = self.transport.close().await {
            debug!(transport = %self.name(), error = %e, "close failed");
        }
    }
}

fn saturating_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
