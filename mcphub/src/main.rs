//! mcphub entry point.
//!
//! Loads configuration, binds the hub and serves until the client goes away
//! or a shutdown signal arrives. Logs go to stderr; stdout belongs to the
//! stdio client transport.

use clap::Parser;
use mcphub::Hub;
use mcphub::cli::{Cli, LogFormat};
use mcphub::error::HubError;
use mcphub_core::config::{Config, find_config_file, load_and_validate};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "mcphub failed");
            eprintln!("mcphub: {e}");
            e.exit_code()
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), HubError> {
    let config = match find_config_file(cli.config.as_deref())? {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            load_and_validate(&path)?
        }
        None => {
            info!("no configuration file found, using defaults");
            Config::default()
        }
    };
    let config = cli.apply_overrides(config);

    let hub = Hub::bind(config).await?;
    hub.start(CancellationToken::new()).await
}

fn init_tracing(verbose: bool, format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
