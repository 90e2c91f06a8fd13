//! Proxy multiplexer: a TCP listener that turns every accepted connection
//! into a [`Session`] and keeps the live session set.

pub mod session;

use std::collections::{BTreeMap, HashMap, hash_map::Entry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use mcphub_core::JsonRpcTransport;
use mcphub_core::events::{EventBus, HubEvent};
use mcphub_core::inspector::Inspector;
use mcphub_core::tools::ToolsRegistry;
use mcphub_core::transport::stream::TcpTransport;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{MuxError, SessionError};
use crate::router::CallRouter;

pub use session::{ProxyIdentity, Session, SessionContext, SessionState};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ─────────────────────────────────────────────────────────────────────────────
// Live session set
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SessionSetInner {
    sessions: BTreeMap<String, Arc<Session>>,
    /// proxy id -> session id of the session that claimed it
    owners: HashMap<String, String>,
}

/// Sessions currently connected to the multiplexer.
#[derive(Default)]
pub struct SessionSet {
    inner: Mutex<SessionSetInner>,
}

impl SessionSet {
    pub fn insert(&self, session: Arc<Session>) {
        self.inner
            .lock()
            .sessions
            .insert(session.id().to_string(), session);
    }

    /// Remove a session and release any proxy id it claimed.
    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock();
        let removed = inner.sessions.remove(session_id)?;
        inner.owners.retain(|_, owner| owner != session_id);
        Some(removed)
    }

    /// Claim `proxy_id` for a live session. Fails when another session holds
    /// it; claiming again from the owning session succeeds.
    pub fn claim_proxy(&self, proxy_id: &str, session_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(session_id) {
            return false;
        }
        match inner.owners.entry(proxy_id.to_string()) {
            Entry::Occupied(owner) => owner.get() == session_id,
            Entry::Vacant(slot) => {
                slot.insert(session_id.to_string());
                true
            }
        }
    }

    /// The session that claimed `proxy_id`.
    pub fn by_proxy(&self, proxy_id: &str) -> Option<Arc<Session>> {
        let inner = self.inner.lock();
        let session_id = inner.owners.get(proxy_id)?;
        inner.sessions.get(session_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Summary of one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_name: Option<String>,
    pub persistent: bool,
    pub tool_count: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Multiplexer
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a session needs from the rest of the hub.
#[derive(Clone)]
pub struct MuxContext {
    pub registry: ToolsRegistry,
    pub events: EventBus,
    pub router: Arc<CallRouter>,
    pub registration_timeout: Option<Duration>,
    pub inspector: Option<Arc<dyn Inspector>>,
}

pub struct MuxServer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    sessions: Arc<SessionSet>,
    next_session: AtomicU64,
    ctx: MuxContext,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

type SessionExit = (String, Result<(), SessionError>);

impl MuxServer {
    /// Bind the listener. Connections are not accepted until [`run`](Self::run).
    pub async fn bind(address: &str, ctx: MuxContext) -> Result<Arc<Self>, MuxError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| MuxError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Arc::new(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            sessions: Arc::new(SessionSet::default()),
            next_session: AtomicU64::new(1),
            ctx,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The live session serving `proxy_id`, if any.
    pub fn session_for_proxy(&self, proxy_id: &str) -> Option<Arc<Session>> {
        self.sessions.by_proxy(proxy_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .snapshot()
            .into_iter()
            .map(|session| {
                let identity = session.identity();
                let tool_count = identity
                    .as_ref()
                    .map_or(0, |i| self.ctx.registry.provider_tool_count(&i.proxy_id));
                SessionInfo {
                    session_id: session.id().to_string(),
                    state: session.state(),
                    persistent: identity.as_ref().is_some_and(|i| i.persistent),
                    proxy_id: identity.as_ref().map(|i| i.proxy_id.clone()),
                    proxy_name: identity.map(|i| i.proxy_name),
                    tool_count,
                }
            })
            .collect()
    }

    /// Accept proxy connections until `cancel` fires or [`close`](Self::close)
    /// is called, then close every session and wait for them to finish.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), MuxError> {
        let listener = self.listener.lock().take().ok_or(MuxError::AlreadyRunning)?;
        info!(address = %self.local_addr, "proxy multiplexer listening");

        let mut tasks: JoinSet<SessionExit> = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_session_exit(joined),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(&mut tasks, stream, peer),
                    Err(e) => {
                        warn!(error = %e, "failed to accept proxy connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        self.close().await;
        while let Some(joined) = tasks.join_next().await {
            log_session_exit(joined);
        }
        info!("proxy multiplexer stopped");
        Ok(())
    }

    /// Stop accepting and close every live session. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.listener.lock().take());
        self.shutdown.cancel();
        let sessions = self.sessions.snapshot();
        debug!(sessions = sessions.len(), "closing proxy sessions");
        for session in sessions {
            session.close().await;
        }
    }

    fn spawn_session(
        self: &Arc<Self>,
        tasks: &mut JoinSet<SessionExit>,
        stream: TcpStream,
        peer: SocketAddr,
    ) {
        let n = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session_id = format!("s-{n:03}");

        let transport = Arc::new(TcpTransport::tcp(stream));
        let rpc = Arc::new(
            JsonRpcTransport::new(transport).with_inspector(self.ctx.inspector.clone()),
        );
        let ctx = SessionContext {
            registry: self.ctx.registry.clone(),
            events: self.ctx.events.clone(),
            router: self.ctx.router.clone(),
            sessions: self.sessions.clone(),
            registration_timeout: self.ctx.registration_timeout,
        };
        let session = Session::new(session_id.clone(), rpc, ctx, &self.shutdown);
        self.sessions.insert(session.clone());
        info!(session_id = %session_id, peer = %peer, sessions = self.sessions.len(), "proxy connected");

        let mux = self.clone();
        tasks.spawn(async move {
            let result = session.clone().run().await;
            mux.remove_session(&session).await;
            (session_id, result)
        });
    }

    async fn remove_session(&self, session: &Arc<Session>) {
        session.mark_closed();
        let failed = self.ctx.router.fail_session(session.id()).await;

        // Drop the provider while the proxy id is still claimed, so a
        // reconnecting proxy cannot register tools that are then removed.
        let proxy_id = session.proxy_id();
        if let Some(proxy_id) = &proxy_id {
            let removed = self.ctx.registry.remove_provider(proxy_id);
            if !removed.is_empty() {
                self.ctx.events.publish(HubEvent::ToolsChanged {
                    provider: proxy_id.clone(),
                });
            }
        }

        if self.sessions.remove(session.id()).is_none() {
            return;
        }
        info!(
            session_id = %session.id(),
            proxy_id = proxy_id.as_deref().unwrap_or("-"),
            failed_calls = failed,
            sessions = self.sessions.len(),
            "proxy session removed"
        );
        self.ctx.events.publish(HubEvent::SessionClosed {
            session_id: session.id().to_string(),
            proxy_id,
        });
    }
}

fn log_session_exit(joined: Result<SessionExit, JoinError>) {
    match joined {
        Ok((session_id, Ok(()))) => debug!(session_id = %session_id, "session task finished"),
        Ok((session_id, Err(e))) => warn!(session_id = %session_id, error = %e, "session ended with error"),
        Err(e) => error!(error = %e, "session task panicked"),
    }
}
