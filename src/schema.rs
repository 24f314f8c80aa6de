//! Database schema management for `civisense`.
//!
//! Ensures required tables and indexes exist before the consumer,
//! trainer, or predictor touch the store. Applied once on startup from
//! `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the append-only `sensor_readings` table (one row per ingested
/// measurement, typed value map and passthrough metadata as JSONB) and
/// the `predictions` archive. Safe to call on every startup; no-op if
/// objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Append-only event store. Rows are never updated or deleted by the
    // pipeline; retention is an external concern.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_readings (
            id           BIGSERIAL PRIMARY KEY,
            sensor_type  TEXT        NOT NULL,
            device_id    TEXT        NOT NULL,
            time         TIMESTAMPTZ NOT NULL,
            field_values JSONB       NOT NULL,
            metadata     JSONB       NOT NULL,
            processed_at TIMESTAMPTZ NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Archive of generated forecast documents, newest-first per sensor type.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS predictions (
            id          BIGSERIAL PRIMARY KEY,
            sensor_type TEXT        NOT NULL,
            created_at  TIMESTAMPTZ NOT NULL,
            document    JSONB       NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Secondary indexes on time and device identity for the range /
    // latest-N queries the trainer and predictor issue.
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_readings_type_time
            ON sensor_readings (sensor_type, time);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_readings_device_id
            ON sensor_readings (device_id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_predictions_type_created
            ON predictions (sensor_type, created_at DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
