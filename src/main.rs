//! CLI for amqp_bridge
//!
//! Subcommands:
//! - `subscribe`: consume the configured topic until ctrl-c
//! - `publish <DATA>`: publish one message and print its id

use std::path::PathBuf;
use std::sync::Arc;

use amqp_bridge::broker::{Backend, MessageBroker};
use amqp_bridge::config::{FileParameterProvider, ParameterProvider, Settings, load_config, load_config_from};
use amqp_bridge::transport::{AmqpTransport, Transport};
use amqp_bridge::utils::{Result, logging};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "amqp-bridge")]
struct Cli {
    /// Configuration file; defaults to config/default.toml when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the configured topic, logging and acknowledging every message
    Subscribe,
    /// Publish one message to the configured topic
    Publish {
        /// Message payload
        data: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match load_settings(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    if let Err(e) = run(cli, settings).await {
        error!(kind = e.kind(), error = %e, "amqp-bridge failed");
        std::process::exit(1);
    }
}

fn load_settings(path: &Option<PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => load_config_from(path.clone()),
        None => load_config(),
    }
}

async fn run(cli: Cli, settings: Settings) -> Result<()> {
    let provider: Arc<dyn ParameterProvider> = Arc::new(FileParameterProvider::new(cli.config));
    let transport: Arc<dyn Transport> = Arc::new(AmqpTransport::new());
    let backend = Backend::from_settings(&settings.broker, provider, transport);

    match cli.command {
        Command::Subscribe => {
            let cancel = CancellationToken::new();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received. Stopping subscription.");
                    shutdown.cancel();
                }
            });
            backend.subscribe(cancel).await
        }
        Command::Publish { data } => {
            let id = backend.publish(data.as_bytes()).await?;
            println!("{id}");
            Ok(())
        }
    }
}
