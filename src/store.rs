//! Event store and prediction archive.
//!
//! The persistence contracts the pipeline core needs are expressed as
//! traits so components receive their store handle by injection: the
//! consumer appends through [`ReadingStore`], the trainer and predictor
//! read through it, and the predictor archives through
//! [`PredictionArchive`]. PostgreSQL ([`PgEventStore`]) is the production
//! implementation; [`MemoryStore`] backs tests and local runs without a
//! database.
//!
//! All writes are appends and all reads are snapshot queries, so readers
//! tolerate concurrent appends without locking. Range and latest queries
//! order by the sensor-declared `time`, which is not guaranteed to match
//! arrival order.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::error::Result;
use crate::models::{PredictionDocument, SensorReading, SensorType};

// ---

/// Read/append access to stored sensor readings.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Append one reading. Appends are independent single writes; no
    /// rollback coordination is needed. Duplicate appends after a
    /// consumer restart are tolerated (at-least-once delivery).
    async fn append(&self, reading: &SensorReading) -> Result<()>;

    /// Latest `limit` readings for a sensor type, newest first.
    async fn latest(&self, sensor_type: SensorType, limit: u32) -> Result<Vec<SensorReading>>;

    /// Readings with `start <= time <= end`, oldest first.
    async fn in_range(
        &self,
        sensor_type: SensorType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>>;

    /// Readings from the last `days` days, oldest first.
    async fn last_days(&self, sensor_type: SensorType, days: u32) -> Result<Vec<SensorReading>> {
        let end = Utc::now();
        self.in_range(sensor_type, end - Duration::days(days as i64), end)
            .await
    }

    /// Total stored readings for a sensor type. Exact only if ingestion
    /// deduplicates; the consumer does not, so treat as an upper bound.
    async fn count(&self, sensor_type: SensorType) -> Result<u64>;

    /// Distinct device ids seen for a sensor type.
    async fn devices(&self, sensor_type: SensorType) -> Result<Vec<String>>;
}

/// Append/fetch access to archived forecast documents.
#[async_trait]
pub trait PredictionArchive: Send + Sync {
    async fn archive(&self, document: &PredictionDocument) -> Result<()>;

    /// Most recent archived document for a sensor type.
    async fn latest_document(&self, sensor_type: SensorType)
        -> Result<Option<PredictionDocument>>;
}

// ---

/// PostgreSQL-backed store. Cheap to clone; wraps the shared pool.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    sensor_type: String,
    device_id: String,
    time: DateTime<Utc>,
    field_values: Json<BTreeMap<String, f64>>,
    metadata: Json<BTreeMap<String, Value>>,
    processed_at: DateTime<Utc>,
}

impl ReadingRow {
    fn into_reading(self) -> Result<SensorReading> {
        Ok(SensorReading {
            sensor_type: self.sensor_type.parse()?,
            device_id: self.device_id,
            time: self.time,
            values: self.field_values.0,
            metadata: self.metadata.0,
            processed_at: self.processed_at,
        })
    }
}

const READING_COLUMNS: &str =
    "sensor_type, device_id, time, field_values, metadata, processed_at";

#[async_trait]
impl ReadingStore for PgEventStore {
    async fn append(&self, reading: &SensorReading) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO sensor_readings (
                sensor_type, device_id, time, field_values, metadata, processed_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(reading.sensor_type.as_str())
        .bind(&reading.device_id)
        .bind(reading.time)
        .bind(Json(&reading.values))
        .bind(Json(&reading.metadata))
        .bind(reading.processed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest(&self, sensor_type: SensorType, limit: u32) -> Result<Vec<SensorReading>> {
        // ---
        let rows: Vec<ReadingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM sensor_readings
            WHERE sensor_type = $1
            ORDER BY time DESC
            LIMIT $2
            "#
        ))
        .bind(sensor_type.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReadingRow::into_reading).collect()
    }

    async fn in_range(
        &self,
        sensor_type: SensorType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>> {
        // ---
        let rows: Vec<ReadingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM sensor_readings
            WHERE sensor_type = $1 AND time >= $2 AND time <= $3
            ORDER BY time ASC
            "#
        ))
        .bind(sensor_type.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReadingRow::into_reading).collect()
    }

    async fn count(&self, sensor_type: SensorType) -> Result<u64> {
        // ---
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sensor_readings WHERE sensor_type = $1")
                .bind(sensor_type.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(count as u64)
    }

    async fn devices(&self, sensor_type: SensorType) -> Result<Vec<String>> {
        // ---
        let devices: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT device_id
            FROM sensor_readings
            WHERE sensor_type = $1
            ORDER BY device_id
            "#,
        )
        .bind(sensor_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(devices)
    }
}

#[async_trait]
impl PredictionArchive for PgEventStore {
    async fn archive(&self, document: &PredictionDocument) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO predictions (sensor_type, created_at, document)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(document.sensor_type.as_str())
        .bind(document.created_at)
        .bind(Json(document))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_document(
        &self,
        sensor_type: SensorType,
    ) -> Result<Option<PredictionDocument>> {
        // ---
        let row: Option<Json<PredictionDocument>> = sqlx::query_scalar(
            r#"
            SELECT document
            FROM predictions
            WHERE sensor_type = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(sensor_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|j| j.0))
    }
}

// ---

/// In-process store with the same contracts as [`PgEventStore`]. Used by
/// the test suite and handy for running the pipeline without Postgres.
#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: Mutex<Vec<SensorReading>>,
    documents: Mutex<Vec<PredictionDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn append(&self, reading: &SensorReading) -> Result<()> {
        self.readings.lock().unwrap().push(reading.clone());
        Ok(())
    }

    async fn latest(&self, sensor_type: SensorType, limit: u32) -> Result<Vec<SensorReading>> {
        // ---
        let mut matching: Vec<SensorReading> = self
            .readings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.sensor_type == sensor_type)
            .cloned()
            .collect();
        matching.sort_by_key(|r| std::cmp::Reverse(r.time));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn in_range(
        &self,
        sensor_type: SensorType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>> {
        // ---
        let mut matching: Vec<SensorReading> = self
            .readings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.sensor_type == sensor_type && r.time >= start && r.time <= end)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.time);
        Ok(matching)
    }

    async fn count(&self, sensor_type: SensorType) -> Result<u64> {
        Ok(self
            .readings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.sensor_type == sensor_type)
            .count() as u64)
    }

    async fn devices(&self, sensor_type: SensorType) -> Result<Vec<String>> {
        let devices: BTreeSet<String> = self
            .readings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.sensor_type == sensor_type)
            .map(|r| r.device_id.clone())
            .collect();
        Ok(devices.into_iter().collect())
    }
}

#[async_trait]
impl PredictionArchive for MemoryStore {
    async fn archive(&self, document: &PredictionDocument) -> Result<()> {
        self.documents.lock().unwrap().push(document.clone());
        Ok(())
    }

    async fn latest_document(
        &self,
        sensor_type: SensorType,
    ) -> Result<Option<PredictionDocument>> {
        Ok(self
            .documents
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.sensor_type == sensor_type)
            .max_by_key(|d| d.created_at)
            .cloned())
    }
}
