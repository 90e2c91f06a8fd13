//! Command-line arguments for the `mcphub` binary.
//!
//! Defined in the library so integration tests can parse them directly.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use mcphub_core::config::Config;

/// mcphub: one MCP endpoint for the tools of many proxies.
#[derive(Parser, Debug)]
#[command(name = "mcphub", version, about)]
pub struct Cli {
    /// Configuration file. Defaults to $MCPHUB_CONFIG, then ./mcphub.yaml.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Enable debug logging (overrides RUST_LOG).
    #[arg(long, short)]
    pub verbose: bool,

    /// Log line format on stderr.
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Enable the proxy multiplexer on this address.
    #[arg(long)]
    pub proxy_listen: Option<String>,

    /// Log every JSON-RPC frame at debug level.
    #[arg(long)]
    pub inspect: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Apply flags that take precedence over the configuration file.
    pub fn apply_overrides(&self, mut config: Config) -> Config {
        if let Some(address) = &self.proxy_listen {
            config.proxy.enabled = true;
            config.proxy.listen_address = Some(address.clone());
        }
        if self.inspect {
            config.inspector.enabled = true;
        }
        config
    }
}
