//! Hub configuration.
//!
//! A single YAML file, with `${VAR}` / `${VAR:-default}` environment
//! substitution applied before parsing. Every section is optional: an empty
//! mapping (or no file at all) yields a stdio hub with proxy support off.
//!
//! ```yaml
//! server:
//!   name: mcphub
//! transport:
//!   type: stdio
//! proxy:
//!   enabled: true
//!   listen_address: "127.0.0.1:${MCPHUB_PORT:-7400}"
//!   registration_timeout_secs: 30
//!   call_timeout_secs: 120
//! inspector:
//!   enabled: false
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{
    CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE, find_config_file, load_and_validate, load_config,
    substitute_env_vars, validate,
};
pub use schema::{
    Config, InspectorConfig, ProxyConfig, ServerConfig, TransportConfig, TransportKind,
};
