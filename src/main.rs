use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voltrack::cli::{run_command, Cli, Commands};
use voltrack::config::Config;
use voltrack::db::seed_catalog;
use voltrack::engine::{ConsumptionEngine, EngineSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    // Initialize logging; logs go to stderr so stdout stays valid JSON
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::debug!("Starting voltrack v{}", env!("CARGO_PKG_VERSION"));

    // Initialize document store
    let store = voltrack::db::init(&config.storage).await?;

    // The seed subcommand reports its own stats
    let explicit_seed = matches!(cli.command, Some(Commands::Seed));
    if config.seed.on_startup && !explicit_seed {
        match seed_catalog(store.as_ref()).await {
            Ok(stats) => tracing::debug!(
                categories = stats.categories_written,
                templates_created = stats.templates_created,
                "Catalog seeded"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to seed catalog"),
        }
    }

    let engine = Arc::new(ConsumptionEngine::new(
        store,
        EngineSettings::from_config(&config),
    ));

    voltrack::metrics::describe_metrics();

    run_command(&cli, &config, engine).await
}
