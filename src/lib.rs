//! `civisense`: ingestion-to-forecast pipeline for municipal IoT sensors.
//!
//! Readings from air quality, noise, and liquid level sensors arrive on
//! per-type bus topics, are normalized and appended to a PostgreSQL
//! event store, and feed per-field regression models that forecast
//! short horizons ahead. The crate is organized around four roles:
//!
//! - [`consumer`] ingests bus messages into the [`store`];
//! - [`trainer`] fits one model per target field and persists versioned
//!   [`artifacts`];
//! - [`predictor`] serves multi-horizon forecasts from the latest
//!   version and archives them;
//! - [`features`] is the shared timestamp encoding both sides use.
//!
//! Components receive their store, bus, and artifact handles at
//! construction; nothing holds global state.

pub mod artifacts;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod error;
pub mod features;
pub mod models;
pub mod predictor;
pub mod schema;
pub mod store;
pub mod trainer;

pub use config::Config;
pub use error::{PipelineError, Result};
pub use models::{Frequency, PredictionBundle, SensorReading, SensorType};
