//! Hub composition root.
//!
//! [`Hub::bind`] wires the registry, event bus, call router, multiplexer and
//! client-facing server together. [`Hub::run`] supervises them as one task
//! group: the first task to finish (client EOF, mux failure, a signal)
//! cancels the rest, every task is drained, and the first error is returned.
//! The configured client transport is opened inside that group, so proxies
//! can register while the hub is still waiting for its client.

use std::net::SocketAddr;
use std::sync::Arc;

use mcphub_core::Transport;
use mcphub_core::config::{Config, ConfigError, TransportConfig, TransportKind, validate};
use mcphub_core::events::{EventBus, HubEvent, Subscription};
use mcphub_core::inspector::{Inspector, TracingInspector};
use mcphub_core::protocol::ServerInfo;
use mcphub_core::tools::ToolsRegistry;
use mcphub_core::transport::stream::{StdioTransport, TcpTransport};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::builtin;
use crate::error::HubError;
use crate::mux::{MuxContext, MuxServer};
use crate::router::CallRouter;
use crate::server::McpServer;

type TaskExit = (&'static str, Result<(), HubError>);

enum ClientSource {
    Ready(Arc<dyn Transport>),
    Open(TransportConfig),
}

pub struct Hub {
    config: Config,
    registry: ToolsRegistry,
    events: EventBus,
    router: Arc<CallRouter>,
    mux: Option<Arc<MuxServer>>,
    server: Arc<McpServer>,
    inspector: Option<Arc<dyn Inspector>>,
}

impl Hub {
    /// Build every component and bind the proxy listener, if enabled.
    pub async fn bind(config: Config) -> Result<Self, HubError> {
        validate(&config)?;

        let registry = ToolsRegistry::new();
        let events = EventBus::default();
        let router = Arc::new(CallRouter::new(config.proxy.call_timeout()));
        let inspector: Option<Arc<dyn Inspector>> = config
            .inspector
            .enabled
            .then(|| Arc::new(TracingInspector) as Arc<dyn Inspector>);

        let mux = if config.proxy.enabled {
            let address =
                config
                    .proxy
                    .listen_address
                    .as_deref()
                    .ok_or(ConfigError::MissingField {
                        field: "proxy.listen_address",
                    })?;
            let ctx = MuxContext {
                registry: registry.clone(),
                events: events.clone(),
                router: router.clone(),
                registration_timeout: config.proxy.registration_timeout(),
                inspector: inspector.clone(),
            };
            Some(MuxServer::bind(address, ctx).await?)
        } else {
            None
        };

        builtin::register_builtin_tools(&registry, mux.as_ref())?;

        let server = McpServer::new(
            ServerInfo {
                name: config.server.name.clone(),
                version: config.server.version.clone(),
            },
            registry.clone(),
            router.clone(),
            mux.clone(),
        );

        info!(
            name = %config.server.name,
            version = %config.server.version,
            mux = ?mux.as_ref().map(|m| m.local_addr()),
            call_timeout_secs = config.proxy.call_timeout_secs,
            inspector = config.inspector.enabled,
            "hub initialized"
        );

        Ok(Self {
            config,
            registry,
            events,
            router,
            mux,
            server,
            inspector,
        })
    }

    /// Address the proxy multiplexer is listening on.
    pub fn mux_addr(&self) -> Option<SocketAddr> {
        self.mux.as_ref().map(|m| m.local_addr())
    }

    pub fn registry(&self) -> &ToolsRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Serve the configured client transport until a signal, client
    /// disconnect, or task failure.
    pub async fn start(self, cancel: CancellationToken) -> Result<(), HubError> {
        let source = ClientSource::Open(self.config.transport.clone());
        let signals = cancel.clone();
        self.supervise(source, cancel, Some(signals)).await
    }

    /// Like [`start`](Self::start), without listening for process signals.
    pub async fn run_configured(self, cancel: CancellationToken) -> Result<(), HubError> {
        let source = ClientSource::Open(self.config.transport.clone());
        self.supervise(source, cancel, None).await
    }

    /// Serve `client` until it disconnects, a task fails, or `cancel` fires.
    pub async fn run(
        self,
        client: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Result<(), HubError> {
        self.supervise(ClientSource::Ready(client), cancel, None).await
    }

    async fn supervise(
        self,
        source: ClientSource,
        cancel: CancellationToken,
        signals: Option<CancellationToken>,
    ) -> Result<(), HubError> {
        let mut tasks: JoinSet<TaskExit> = JoinSet::new();

        if let Some(token) = signals {
            tasks.spawn(async move { ("signals", wait_for_shutdown_signal(token).await) });
        }

        // Subscribed before any task runs so no early event is missed.
        let subscription = self.events.subscribe(&[]);
        {
            let server = self.server.clone();
            let token = cancel.clone();
            tasks.spawn(async move { ("events", dispatch_events(subscription, server, token).await) });
        }
        {
            let server = self.server.clone();
            let inspector = self.inspector.clone();
            let token = cancel.clone();
            tasks.spawn(async move {
                let client = match source {
                    ClientSource::Ready(client) => client,
                    ClientSource::Open(config) => tokio::select! {
                        biased;
                        _ = token.cancelled() => return ("client", Ok(())),
                        opened = open_client_transport(&config) => match opened {
                            Ok(client) => client,
                            Err(e) => return ("client", Err(e)),
                        },
                    },
                };
                let result = server.serve(client, inspector, token).await;
                ("client", result.map_err(HubError::from))
            });
        }
        if let Some(mux) = self.mux.clone() {
            let token = cancel.clone();
            tasks.spawn(async move { ("mux", mux.run(token).await.map_err(HubError::from)) });

            let router = self.router.clone();
            let token = cancel.clone();
            tasks.spawn(async move {
                router.run_expiry(token).await;
                ("call-expiry", Ok(()))
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (task, result) = joined.unwrap_or_else(|e| {
                (
                    "unknown",
                    Err(HubError::TaskFailed {
                        task: "unknown",
                        reason: e.to_string(),
                    }),
                )
            });
            match result {
                Ok(()) => debug!(task, "hub task finished"),
                Err(e) => {
                    error!(task, error = %e, "hub task failed");
                    first_error.get_or_insert(e);
                }
            }
            if !cancel.is_cancelled() {
                info!(task, "shutting down hub");
                cancel.cancel();
            }
        }

        info!("hub stopped");
        first_error.map_or(Ok(()), Err)
    }
}

async fn dispatch_events(
    mut subscription: Subscription,
    server: Arc<McpServer>,
    cancel: CancellationToken,
) -> Result<(), HubError> {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            event = subscription.recv() => event,
        };
        match event {
            Some(HubEvent::ToolsChanged { provider }) => {
                debug!(provider = %provider, "tool set changed");
                server.notify_tools_changed().await;
            }
            Some(HubEvent::SessionRegistered {
                session_id,
                proxy_id,
                proxy_name,
            }) => {
                info!(session_id = %session_id, proxy_id = %proxy_id, proxy_name = %proxy_name, "proxy online");
            }
            Some(HubEvent::SessionClosed {
                session_id,
                proxy_id,
            }) => {
                info!(session_id = %session_id, proxy_id = ?proxy_id, "proxy offline");
            }
            None => return Ok(()),
        }
    }
}

async fn open_client_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>, HubError> {
    match config.kind {
        TransportKind::Stdio => Ok(Arc::new(StdioTransport::stdio())),
        TransportKind::Tcp => {
            let address = config.address.as_deref().ok_or(ConfigError::MissingField {
                field: "transport.address",
            })?;
            let client_error = |source| HubError::ClientTransport {
                address: address.to_string(),
                source,
            };
            let listener = TcpListener::bind(address).await.map_err(client_error)?;
            info!(address = %address, "waiting for MCP client connection");
            let (stream, peer) = listener.accept().await.map_err(client_error)?;
            info!(peer = %peer, "MCP client connected");
            Ok(Arc::new(TcpTransport::tcp(stream)))
        }
    }
}

/// Resolves on SIGINT or SIGTERM, or when `cancel` fires.
async fn wait_for_shutdown_signal(cancel: CancellationToken) -> Result<(), HubError> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(HubError::Signal)?;
    #[cfg(unix)]
    let terminate = async move {
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = tokio::signal::ctrl_c() => {
            result.map_err(HubError::Signal)?;
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            Ok(())
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
            Ok(())
        }
    }
}
