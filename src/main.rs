/// Wake-word detection service binary
///
/// Serves wake-word detection to Wyoming clients until interrupted.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wyoming_wakeword::{init_logging, Cli, Settings, ToneEngine, WakeEngine, WakeServer};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_format);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::resolve(&cli).context("Failed to load configuration")?;

    let engine = settings
        .custom_keywords
        .iter()
        .fold(ToneEngine::new(settings.access_key.clone()), |engine, name| {
            engine.with_keyword(settings.session.language, name)
        });

    if cli.list_keywords {
        for entry in engine.catalog() {
            println!("{}\t{}", entry.language, entry.name);
        }
        return Ok(());
    }

    info!(
        "Starting wake-word service (language {}, default keywords {:?}, sensitivity {})",
        settings.session.language, settings.session.default_keywords, settings.session.sensitivity
    );

    let server = WakeServer::bind(
        &settings.endpoint,
        Arc::new(engine),
        settings.session.clone(),
        settings.server.clone(),
    )
    .await
    .context("Failed to start server")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                signal.cancel();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    info!("Ready");
    server.run(shutdown).await?;

    info!("Wake-word detection service stopped");
    Ok(())
}
