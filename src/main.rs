//! Application entry point for the `civisense` pipeline.
//!
//! This binary orchestrates the full startup sequence shared by all
//! three entry points, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool
//! - Creating the database schema if it does not exist
//! - Dispatching to one of the pipeline roles:
//!   - `consume` – run the long-lived bus-to-store ingestion loop
//!   - `train <air|noise|level|all> [days]` – fit and persist models
//!   - `predict <air|noise|level|all>` – generate and archive forecasts
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `BUS_URL` (**required**) – message bus REST gateway base URL
//! - `DB_POOL_MAX` (optional) – maximum number of DB connections (default: 5)
//! - `LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `LOG_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! This module follows the Explicit Module Boundary Pattern (EMBP) by
//! delegating schema setup to `schema`, configuration parsing to
//! `config`, and all pipeline logic to the library crate.
use std::{env, io::IsTerminal, str::FromStr, sync::Arc};

use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::{bail, Result};

use civisense::artifacts::ModelStore;
use civisense::bus::RestBusSource;
use civisense::config;
use civisense::consumer::StreamConsumer;
use civisense::predictor::Predictor;
use civisense::store::PgEventStore;
use civisense::trainer::Trainer;
use civisense::SensorType;

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("consume");

    tracing::info!("Attempting to connect to database: {}", cfg.db_url);

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database '{}': {}", cfg.db_url, e))?;

    tracing::info!("Successfully connected to database");

    civisense::schema::create_schema(&pool).await?;

    let store = Arc::new(PgEventStore::new(pool));
    let models = ModelStore::new(&cfg.models_dir);

    match command {
        "consume" => {
            // ---
            let source = RestBusSource::connect(&cfg).await?;
            let stats = StreamConsumer::new(store, source, cfg).run().await?;
            tracing::info!(stored = stats.stored, errors = stats.errors, "consumer exited");
        }
        "train" => {
            // ---
            let days = match args.get(2) {
                Some(raw) => raw
                    .parse::<u32>()
                    .map_err(|e| anyhow::anyhow!("Invalid days argument '{}': {}", raw, e))?,
                None => cfg.train_days,
            };
            let trainer = Trainer::new(store, models, cfg.train_fetch_limit);

            match sensor_arg(&args).transpose()? {
                None => {
                    for (sensor, result) in trainer.train_all(days).await {
                        match result {
                            Ok(metrics) => log_metrics(sensor, &metrics),
                            Err(e) => tracing::error!(%sensor, "training failed: {e}"),
                        }
                    }
                }
                Some(sensor) => {
                    let metrics = trainer.train(sensor, days).await?;
                    log_metrics(sensor, &metrics);
                }
            }
        }
        "predict" => {
            // ---
            let sensors = match sensor_arg(&args).transpose()? {
                None => SensorType::ALL.to_vec(),
                Some(sensor) => vec![sensor],
            };
            for sensor in sensors {
                match Predictor::load(store.clone(), &models, sensor) {
                    Ok(predictor) => {
                        let document = predictor.predict_multiple().await?;
                        tracing::info!(
                            %sensor,
                            bundles = document.bundles.len(),
                            "forecasts archived"
                        );
                    }
                    Err(e) => tracing::error!(%sensor, "prediction failed: {e}"),
                }
            }
        }
        other => bail!("unknown command '{other}' (expected consume, train, or predict)"),
    }

    Ok(())
}

/// Sensor selector from argv: `None` means "all".
fn sensor_arg(args: &[String]) -> Option<Result<SensorType>> {
    match args.get(1).map(String::as_str) {
        None | Some("all") => None,
        Some(raw) => Some(SensorType::from_str(raw).map_err(Into::into)),
    }
}

fn log_metrics(
    sensor: SensorType,
    metrics: &std::collections::BTreeMap<String, civisense::models::FieldMetrics>,
) {
    // ---
    for (field, m) in metrics {
        tracing::info!(
            %sensor,
            field,
            test_r2 = format!("{:.4}", m.test_r2),
            test_rmse = format!("{:.4}", m.test_rmse),
            test_mae = format!("{:.4}", m.test_mae),
            samples = m.samples,
            "training metrics"
        );
    }
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `LOG_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() {
    // ---
    let span_events = match env::var("LOG_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
