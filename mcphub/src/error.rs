//! Error types for the hub process.
//!
//! `SessionError` ends one proxy session. `MuxError` ends the multiplexer.
//! `HubError` is what the orchestrator returns: any of them reaching the
//! top level cancels the whole hub.

use mcphub_core::RpcError;
use mcphub_core::config::ConfigError;
use mcphub_core::tools::ToolError;

/// Errors that terminate a single proxy session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The underlying transport failed (reset, broken pipe, ...).
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The proxy did not complete `proxy/register` in time.
    #[error("session {session_id} did not register within {timeout_secs}s")]
    RegistrationTimeout {
        session_id: String,
        timeout_secs: u64,
    },
}

/// Errors raised by the proxy multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("failed to bind mux listener on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("mux listener already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("proxy multiplexer failed: {0}")]
    Mux(#[from] MuxError),

    #[error("client connection failed: {0}")]
    Client(#[from] RpcError),

    #[error("failed to install built-in tools: {0}")]
    Tools(#[from] ToolError),

    #[error("failed to listen for shutdown signals: {0}")]
    Signal(std::io::Error),

    #[error("failed to open client transport on {address}: {source}")]
    ClientTransport {
        address: String,
        source: std::io::Error,
    },

    #[error("hub task '{task}' panicked or was aborted: {reason}")]
    TaskFailed { task: &'static str, reason: String },
}

impl HubError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            HubError::Config(_) => 2,
            _ => 1,
        }
    }
}
