//! Configuration loader for the `civisense` pipeline.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase. Components
//! never hardcode infrastructure addresses: everything they need arrives
//! through this struct at construction time.

use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

use crate::models::SensorType;

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Parse an optional string environment variable with a default value.
macro_rules! env_or {
    ($var_name:expr, $default:expr) => {
        env::var($var_name).unwrap_or_else(|_| $default.to_string())
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Base URL of the message bus REST gateway.
    pub bus_url: String,

    /// Consumer group shared across consumer instances.
    pub bus_consumer_group: String,

    /// Bus topics, one per sensor type, in [`SensorType::ALL`] order.
    pub topics: [String; 3],

    /// Root directory for versioned model artifacts.
    pub models_dir: PathBuf,

    /// Default history window for training, in days (0 = all history).
    pub train_days: u32,

    /// Retrieval cap when training on all available history.
    pub train_fetch_limit: u32,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
/// - `BUS_URL` – message bus REST gateway base URL
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `BUS_CONSUMER_GROUP` – consumer group name (default: `civisense-consumers`)
/// - `SENSOR_TOPIC_AIR` / `SENSOR_TOPIC_NOISE` / `SENSOR_TOPIC_LEVEL` – topic
///   names (defaults: `sensor-air`, `sensor-noise`, `sensor-level`)
/// - `MODELS_DIR` – model artifact root (default: `models`)
/// - `TRAIN_DAYS` – default training history in days (default: 60)
/// - `TRAIN_FETCH_LIMIT` – cap on readings fetched when training on all
///   history (default: 10000)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let bus_url = require_env!("BUS_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let bus_consumer_group = env_or!("BUS_CONSUMER_GROUP", "civisense-consumers");
    let topics = [
        env_or!("SENSOR_TOPIC_AIR", "sensor-air"),
        env_or!("SENSOR_TOPIC_NOISE", "sensor-noise"),
        env_or!("SENSOR_TOPIC_LEVEL", "sensor-level"),
    ];
    let models_dir = PathBuf::from(env_or!("MODELS_DIR", "models"));
    let train_days = parse_env_u32!("TRAIN_DAYS", 60);
    let train_fetch_limit = parse_env_u32!("TRAIN_FETCH_LIMIT", 10_000);

    Ok(Config {
        db_url,
        db_pool_max,
        bus_url,
        bus_consumer_group,
        topics,
        models_dir,
        train_days,
        train_fetch_limit,
    })
}

impl Config {
    /// Topic name the given sensor type is published on.
    pub fn topic_for(&self, sensor_type: SensorType) -> &str {
        match sensor_type {
            SensorType::Air => &self.topics[0],
            SensorType::Noise => &self.topics[1],
            SensorType::Level => &self.topics[2],
        }
    }

    /// Resolve a bus topic back to a sensor type. Returns `None` for
    /// unknown topics; the consumer fails closed on those.
    pub fn sensor_type_for_topic(&self, topic: &str) -> Option<SensorType> {
        SensorType::ALL
            .into_iter()
            .find(|s| self.topic_for(*s) == topic)
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        // Mask the password in the database URL for security
        let masked_db_url = if let Some(at_pos) = self.db_url.rfind('@') {
            if let Some(colon_pos) = self.db_url[..at_pos].rfind(':') {
                format!(
                    "{}:****{}",
                    &self.db_url[..colon_pos],
                    &self.db_url[at_pos..]
                )
            } else {
                self.db_url.clone()
            }
        } else {
            self.db_url.clone()
        };

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL       : {}", masked_db_url);
        tracing::info!("  DB_POOL_MAX        : {}", self.db_pool_max);
        tracing::info!("  BUS_URL            : {}", self.bus_url);
        tracing::info!("  BUS_CONSUMER_GROUP : {}", self.bus_consumer_group);
        tracing::info!("  TOPICS             : {:?}", self.topics);
        tracing::info!("  MODELS_DIR         : {}", self.models_dir.display());
        tracing::info!("  TRAIN_DAYS         : {}", self.train_days);
        tracing::info!("  TRAIN_FETCH_LIMIT  : {}", self.train_fetch_limit);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn test_config() -> Config {
        Config {
            db_url: "postgres://u:p@localhost/civisense".into(),
            db_pool_max: 5,
            bus_url: "http://localhost:8082".into(),
            bus_consumer_group: "civisense-consumers".into(),
            topics: [
                "sensor-air".into(),
                "sensor-noise".into(),
                "sensor-level".into(),
            ],
            models_dir: PathBuf::from("models"),
            train_days: 60,
            train_fetch_limit: 10_000,
        }
    }

    #[test]
    fn topic_mapping_round_trips() {
        // ---
        let cfg = test_config();
        for sensor in SensorType::ALL {
            let topic = cfg.topic_for(sensor);
            assert_eq!(cfg.sensor_type_for_topic(topic), Some(sensor));
        }
    }

    #[test]
    fn unknown_topic_fails_closed() {
        // ---
        let cfg = test_config();
        assert_eq!(cfg.sensor_type_for_topic("sensor-parking"), None);
    }
}
