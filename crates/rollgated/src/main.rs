//! rollgated — the rollgate daemon.
//!
//! Single binary that assembles the rollgate subsystems:
//! - State store (redb)
//! - Webhook client
//! - Workload registry (store-backed workloads)
//! - Run controller
//! - REST API
//!
//! # Usage
//!
//! ```text
//! rollgated serve --config /etc/rollgate/rollgate.toml --port 8480
//! rollgated config > rollgate.toml
//! ```

mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rollgate_core::DaemonConfig;
use rollgate_core::config::{LogConfig, LogFormat};

const DEFAULT_FILTER: &str = "info,rollgated=debug,rollgate=debug";

#[derive(Parser)]
#[command(name = "rollgated", about = "rollgate progressive release daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller and the REST API.
    Serve {
        /// Path to rollgate.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on. Overrides the config file.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state. Overrides the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the default configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let config = load_config(config.as_deref(), port, data_dir)?;
            init_tracing(&config.log)?;
            serve::run(config).await
        }
        Command::Config => {
            print!("{}", DaemonConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(
    path: Option<&std::path::Path>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<DaemonConfig> {
    let mut config = match path {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(data_dir) = data_dir {
        config.store.data_dir = data_dir;
    }
    Ok(config)
}

fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = match &log.filter {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}
