//! Error taxonomy for the `civisense` pipeline.
//!
//! Four failure families, recovered at different levels:
//! - transient I/O ([`PipelineError::Store`], [`PipelineError::Bus`]) is
//!   surfaced to the caller/supervisor, never retried inside core logic;
//! - data quality problems are logged, counted and skipped by the consumer;
//! - insufficient training data skips a single field (or fails the whole
//!   run if no field survives);
//! - missing model artifacts fail a prediction call outright.

use crate::models::SensorType;

// ---

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The event store (PostgreSQL) is unreachable or rejected a query.
    #[error("event store failure: {0}")]
    Store(#[from] sqlx::Error),

    /// The message bus gateway is unreachable or returned an error.
    #[error("message bus failure: {0}")]
    Bus(#[from] reqwest::Error),

    /// A message that cannot be turned into a [`crate::SensorReading`].
    /// Recovered locally by the consumer: logged, counted, skipped.
    #[error("malformed message: {0}")]
    DataQuality(String),

    /// Empty historical query, or fewer valid rows than the training
    /// minimum for every field of a sensor type.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// No trained model version exists for the sensor type.
    #[error("no trained models available for sensor type '{0}'")]
    ModelUnavailable(SensorType),

    /// Reading or writing model artifacts on disk failed.
    #[error("model artifact I/O failure: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),

    /// The regressor could not be fitted (smartcore refused the inputs).
    #[error("model fit failed for field '{field}': {reason}")]
    Fit { field: String, reason: String },
}

impl PipelineError {
    pub fn data_quality(msg: impl Into<String>) -> Self {
        PipelineError::DataQuality(msg.into())
    }

    pub fn insufficient_data(msg: impl Into<String>) -> Self {
        PipelineError::InsufficientData(msg.into())
    }

    /// True for conditions the consumer loop recovers from by skipping
    /// the offending message.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::DataQuality(_) | PipelineError::InsufficientData(_)
        )
    }
}
