//! CLI module for the voltrack command-line interface.
//!
//! Every subcommand runs against the configured document store in-process:
//! - `seed` - Write built-in categories and preset templates
//! - `categories` / `presets` - Catalog reads
//! - `devices`, `add-device`, `update-device`, `delete-device` - Per-user devices
//! - `sample`, `recompute`, `report`, `purge` - Consumption history
//! - `run` - Hourly sampler daemon (also the default without a subcommand)
//!
//! Results are printed to stdout as JSON.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::db::{seed_catalog, DeviceCategory, DeviceSpec, DeviceUpdate};
use crate::engine::{spawn_sampler_task, ConsumptionEngine, Granularity, HourlySampler};

/// CLI arguments structure
#[derive(Parser, Debug)]
#[command(name = "voltrack")]
#[command(author, version, about = "Household energy consumption aggregation engine", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "VOLTRACK_CONFIG", default_value = "voltrack.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Subcommand to run (if none, starts the sampler daemon)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write built-in categories and preset templates (idempotent)
    Seed,

    /// List device categories
    Categories,

    /// List unclaimed preset templates
    Presets {
        /// Only templates of this category (e.g. water_heating)
        #[arg(long)]
        category: Option<DeviceCategory>,
    },

    /// List a user's devices
    Devices {
        user: String,
    },

    /// Claim a matching preset template or create a new device
    AddDevice {
        user: String,
        #[arg(long)]
        category: DeviceCategory,
        #[arg(long)]
        manufacturer: String,
        #[arg(long)]
        model: String,
        /// Rated power in kW
        #[arg(long)]
        power_kw: f64,
        /// Hours of use per day (0-24)
        #[arg(long)]
        usage_hours: f64,
    },

    /// Edit one of a user's devices
    UpdateDevice {
        user: String,
        device_id: String,
        #[arg(long)]
        category: Option<DeviceCategory>,
        #[arg(long)]
        manufacturer: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        power_kw: Option<f64>,
        #[arg(long)]
        usage_hours: Option<f64>,
    },

    /// Remove one of a user's devices
    DeleteDevice {
        user: String,
        device_id: String,
    },

    /// Rewrite today's totals from the user's devices
    Recompute {
        user: String,
    },

    /// Record the synthetic sample for one hour of today
    Sample {
        user: String,
        /// Hour 0-23 (default: current hour)
        #[arg(long)]
        hour: Option<u8>,
    },

    /// Consumption report for a date range
    Report {
        user: String,
        /// First day, YYYY-MM-DD
        #[arg(long)]
        from: NaiveDate,
        /// Last day (inclusive), YYYY-MM-DD
        #[arg(long)]
        to: NaiveDate,
        /// day, week or month
        #[arg(long, default_value = "day")]
        group: Granularity,
    },

    /// Delete daily records older than a number of days
    Purge {
        user: String,
        /// Days to keep (default: retention.days from config)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Run the hourly sampler until interrupted
    Run,
}

/// Run a CLI command
pub async fn run_command(cli: &Cli, config: &Config, engine: Arc<ConsumptionEngine>) -> Result<()> {
    match &cli.command {
        Some(Commands::Seed) => cmd_seed(&engine).await,
        Some(Commands::Categories) => print_json(&engine.list_categories().await),
        Some(Commands::Presets { category }) => {
            print_json(&engine.list_preset_devices(*category).await)
        }
        Some(Commands::Devices { user }) => {
            let devices = engine
                .try_list_user_devices(user)
                .await
                .context("Failed to list devices")?;
            print_json(&devices)
        }
        Some(Commands::AddDevice {
            user,
            category,
            manufacturer,
            model,
            power_kw,
            usage_hours,
        }) => {
            let spec = DeviceSpec {
                category_id: *category,
                manufacturer: manufacturer.clone(),
                model: model.clone(),
                power_kw: *power_kw,
                usage_hours: *usage_hours,
            };
            let device_id = engine.claim_or_create_device(user, spec).await?;
            print_json(&json!({ "user_id": user, "device_id": device_id }))
        }
        Some(Commands::UpdateDevice {
            user,
            device_id,
            category,
            manufacturer,
            model,
            power_kw,
            usage_hours,
        }) => {
            let update = DeviceUpdate {
                category_id: *category,
                manufacturer: manufacturer.clone(),
                model: model.clone(),
                power_kw: *power_kw,
                usage_hours: *usage_hours,
            };
            let device = engine.update_device(user, device_id, update).await?;
            print_json(&device)
        }
        Some(Commands::DeleteDevice { user, device_id }) => {
            engine.delete_device(user, device_id).await?;
            print_json(&json!({ "user_id": user, "deleted": device_id }))
        }
        Some(Commands::Recompute { user }) => {
            let total = engine.recompute_totals(user).await?;
            print_json(&json!({
                "user_id": user,
                "date": engine.today(),
                "total_consumption": total,
            }))
        }
        Some(Commands::Sample { user, hour }) => {
            let hour = hour.unwrap_or_else(|| engine.current_hour().get());
            let value = engine.record_hour_sample(user, hour).await?;
            print_json(&json!({
                "user_id": user,
                "date": engine.today(),
                "hour": hour,
                "consumption": value,
            }))
        }
        Some(Commands::Report {
            user,
            from,
            to,
            group,
        }) => {
            if from > to {
                anyhow::bail!("--from ({}) must not be after --to ({})", from, to);
            }
            print_json(&engine.report(user, *from, *to, *group).await)
        }
        Some(Commands::Purge { user, days }) => {
            let days = days.unwrap_or(config.retention.days);
            let cutoff = engine.today() - Duration::days(days as i64);
            let stats = engine.purge_older_than(user, cutoff).await?;
            print_json(&json!({
                "user_id": user,
                "cutoff": cutoff,
                "records_removed": stats.records_removed,
                "batches": stats.batches,
            }))
        }
        Some(Commands::Run) | None => cmd_run(config, engine).await,
    }
}

async fn cmd_seed(engine: &ConsumptionEngine) -> Result<()> {
    let stats = seed_catalog(engine.store().as_ref())
        .await
        .context("Failed to seed catalog")?;
    print_json(&json!({
        "categories_written": stats.categories_written,
        "templates_created": stats.templates_created,
        "templates_skipped": stats.templates_skipped,
    }))
}

/// Sample once immediately, then keep sampling on the configured interval until a
/// shutdown signal arrives
async fn cmd_run(config: &Config, engine: Arc<ConsumptionEngine>) -> Result<()> {
    if let Err(e) = engine.warm_up().await {
        tracing::warn!(error = %e, "Failed to warm up category cache");
    }

    if !config.sampler.enabled {
        tracing::info!("Hourly sampler is disabled, nothing to run");
        return Ok(());
    }

    let sampler = spawn_sampler_task(engine.clone(), &config.sampler);

    shutdown_signal().await;
    sampler.abort();

    // Record the hour we stopped in so a restart within the hour loses nothing
    let result = HourlySampler::new(engine, &config.sampler).sample_all().await;
    tracing::info!(
        users = result.users_checked,
        successful = result.successful,
        failed = result.failed,
        "Sampler stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let output = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", output);
    Ok(())
}
