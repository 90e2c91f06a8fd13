//! Configuration schema.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Identity reported to the client in `initialize`.
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-facing transport.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Proxy multiplexer.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Frame-level traffic logging.
    #[serde(default)]
    pub inspector: InspectorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,

    #[serde(default = "default_server_version")]
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            version: default_server_version(),
        }
    }
}

fn default_server_name() -> String {
    "mcphub".to_string()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// How the client reaches the hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// JSON-RPC over the process's stdin/stdout.
    #[default]
    Stdio,
    /// JSON-RPC over the first TCP connection accepted on `address`.
    Tcp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    #[serde(rename = "type", default)]
    pub kind: TransportKind,

    /// Listen address, required when `type: tcp`.
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Mux listen address, required when enabled.
    #[serde(default)]
    pub listen_address: Option<String>,

    /// Seconds a new connection may take to send `proxy/register`
    /// (0 disables the limit).
    #[serde(default = "default_registration_timeout_secs")]
    pub registration_timeout_secs: u64,

    /// Seconds a forwarded `tools/call` may wait for its proxy
    /// (0 disables the limit).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: None,
            registration_timeout_secs: default_registration_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_registration_timeout_secs() -> u64 {
    30
}

fn default_call_timeout_secs() -> u64 {
    120
}

impl ProxyConfig {
    pub fn registration_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.registration_timeout_secs)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.call_timeout_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InspectorConfig {
    #[serde(default)]
    pub enabled: bool,
}
