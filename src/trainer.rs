//! Model training: fits one regressor per target field of a sensor type
//! from historical readings and persists the result as a new artifact
//! version.
//!
//! The split is chronological (no shuffling): the held-out tail of the
//! window is what a forecast actually faces, so test metrics reflect
//! forecasting realism rather than random interpolation. A tree ensemble
//! is used instead of a plain linear model because it captures the
//! non-monotonic daily/weekly cycles in the cyclical features without
//! manual interaction terms.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use smartcore::ensemble::random_forest_regressor::{
    RandomForestRegressor, RandomForestRegressorParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;
use tracing::{info, warn};

use crate::artifacts::{run_version, FieldModel, ModelStore, StandardScaler};
use crate::error::{PipelineError, Result};
use crate::features::{training_features, FEATURE_DIM};
use crate::models::{FieldMetrics, SensorReading, SensorType};
use crate::store::ReadingStore;

// ---

/// Minimum valid rows before a field is worth fitting. Below this the
/// field is skipped with a warning; the run continues for its siblings.
pub const MIN_TRAINING_ROWS: usize = 50;

const TEST_FRACTION: f64 = 0.2;

/// Trains per-field models from the event store and persists them.
pub struct Trainer<S> {
    store: Arc<S>,
    models: ModelStore,
    fetch_limit: u32,
}

impl<S: ReadingStore> Trainer<S> {
    pub fn new(store: Arc<S>, models: ModelStore, fetch_limit: u32) -> Self {
        Self {
            store,
            models,
            fetch_limit,
        }
    }

    /// Train every target field of `sensor_type`.
    ///
    /// `days == 0` uses all available history up to the configured
    /// retrieval cap; `days > 0` uses only the last N days. Returns the
    /// per-field metrics of the fields that trained; fails with
    /// [`PipelineError::InsufficientData`] when the history is empty or
    /// no field reached the row minimum.
    pub async fn train(
        &self,
        sensor_type: SensorType,
        days: u32,
    ) -> Result<BTreeMap<String, FieldMetrics>> {
        // ---
        let readings = if days == 0 {
            info!(%sensor_type, limit = self.fetch_limit, "loading all history for training");
            self.store.latest(sensor_type, self.fetch_limit).await?
        } else {
            info!(%sensor_type, days, "loading training history");
            self.store.last_days(sensor_type, days).await?
        };

        if readings.is_empty() {
            return Err(PipelineError::insufficient_data(format!(
                "no stored readings for sensor type '{sensor_type}'"
            )));
        }
        info!(%sensor_type, rows = readings.len(), "training data loaded");

        let (models, metrics) = fit_models(sensor_type, readings)?;

        let version = run_version(Utc::now());
        self.models
            .save_version(sensor_type, &version, &models, &metrics)?;
        info!(%sensor_type, version, fields = models.len(), "training run persisted");

        Ok(metrics)
    }

    /// Train every sensor type, isolating per-sensor failures: one
    /// sensor with no data does not abort the others.
    pub async fn train_all(
        &self,
        days: u32,
    ) -> BTreeMap<SensorType, Result<BTreeMap<String, FieldMetrics>>> {
        // ---
        let mut results = BTreeMap::new();
        for sensor_type in SensorType::ALL {
            let result = self.train(sensor_type, days).await;
            if let Err(e) = &result {
                warn!(%sensor_type, error = %e, "training failed for sensor type");
            }
            results.insert(sensor_type, result);
        }
        results
    }
}

// ---

/// Fit one model per target field from in-memory readings.
///
/// Readings are sorted by declared timestamp before feature construction,
/// so out-of-order ingestion does not skew the time index.
pub fn fit_models(
    sensor_type: SensorType,
    mut readings: Vec<SensorReading>,
) -> Result<(Vec<FieldModel>, BTreeMap<String, FieldMetrics>)> {
    readings.sort_by_key(|r| r.time);

    let timestamps: Vec<_> = readings.iter().map(|r| r.time).collect();
    let features = training_features(&timestamps);

    let mut models = Vec::new();
    let mut metrics = BTreeMap::new();

    for &field in sensor_type.target_fields() {
        // Rows missing this target are dropped for this field only.
        let rows: Vec<([f64; FEATURE_DIM], f64)> = readings
            .iter()
            .zip(&features)
            .filter_map(|(r, fv)| r.value(field).map(|y| (fv.as_array(), y)))
            .collect();

        if rows.len() < MIN_TRAINING_ROWS {
            warn!(
                field,
                rows = rows.len(),
                min = MIN_TRAINING_ROWS,
                "insufficient data, skipping field"
            );
            continue;
        }

        let (model, field_metrics) = fit_field(field, &rows)?;
        info!(
            field,
            test_r2 = field_metrics.test_r2,
            test_rmse = field_metrics.test_rmse,
            test_mae = field_metrics.test_mae,
            samples = field_metrics.samples,
            "field trained"
        );
        models.push(model);
        metrics.insert(field.to_string(), field_metrics);
    }

    if models.is_empty() {
        return Err(PipelineError::insufficient_data(format!(
            "no field of sensor type '{sensor_type}' reached {MIN_TRAINING_ROWS} valid rows"
        )));
    }

    Ok((models, metrics))
}

fn fit_field(
    field: &str,
    rows: &[([f64; FEATURE_DIM], f64)],
) -> Result<(FieldModel, FieldMetrics)> {
    // Chronological 80/20 split; the tail is held out.
    let n_test = ((rows.len() as f64) * TEST_FRACTION).ceil() as usize;
    let n_train = rows.len() - n_test;
    let (train, test) = rows.split_at(n_train);

    let train_x: Vec<[f64; FEATURE_DIM]> = train.iter().map(|(x, _)| *x).collect();
    let train_y: Vec<f64> = train.iter().map(|(_, y)| *y).collect();
    let test_x: Vec<[f64; FEATURE_DIM]> = test.iter().map(|(x, _)| *x).collect();
    let test_y: Vec<f64> = test.iter().map(|(_, y)| *y).collect();

    // Scaler fitted on the training split only.
    let scaler = StandardScaler::fit(&train_x);
    let x_train = DenseMatrix::from_2d_vec(&scaler.transform(&train_x));
    let x_test = DenseMatrix::from_2d_vec(&scaler.transform(&test_x));

    // 100 shallow trees with a fixed seed: enough capacity for the
    // daily/weekly cycles, reproducible across runs.
    let params = RandomForestRegressorParameters::default()
        .with_n_trees(100)
        .with_max_depth(10)
        .with_seed(42);

    let fit_err = |e: smartcore::error::Failed| PipelineError::Fit {
        field: field.to_string(),
        reason: e.to_string(),
    };

    let regressor = RandomForestRegressor::fit(&x_train, &train_y, params).map_err(fit_err)?;
    let pred_train = regressor.predict(&x_train).map_err(fit_err)?;
    let pred_test = regressor.predict(&x_test).map_err(fit_err)?;

    let metrics = FieldMetrics {
        train_r2: r2_score(&train_y, &pred_train),
        test_r2: r2_score(&test_y, &pred_test),
        train_rmse: rmse(&train_y, &pred_train),
        test_rmse: rmse(&test_y, &pred_test),
        train_mae: mae(&train_y, &pred_train),
        test_mae: mae(&test_y, &pred_test),
        samples: rows.len(),
    };

    let model = FieldModel {
        field: field.to_string(),
        scaler,
        regressor,
    };
    Ok((model, metrics))
}

// ---

/// Coefficient of determination. A constant-actual series with any
/// residual scores 0 rather than dividing by zero.
fn r2_score(actual: &[f64], predicted: &[f64]) -> f64 {
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let ss_tot: f64 = actual.iter().map(|y| (y - mean).powi(2)).sum();
    let ss_res: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    if ss_tot == 0.0 {
        if ss_res == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    }
}

fn rmse(actual: &[f64], predicted: &[f64]) -> f64 {
    let mse: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).powi(2))
        .sum::<f64>()
        / actual.len() as f64;
    mse.sqrt()
}

fn mae(actual: &[f64], predicted: &[f64]) -> f64 {
    actual
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).abs())
        .sum::<f64>()
        / actual.len() as f64
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{DateTime, TimeZone, Timelike, Utc};
    use std::collections::BTreeMap;
    use std::f64::consts::PI;

    fn hourly_timestamps(n: usize) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        (0..n as i64)
            .map(|i| start + chrono::Duration::hours(i))
            .collect()
    }

    /// Air readings where CO2 is a pure sinusoid of hour-of-day and
    /// temperature carries values only for the first `temp_rows` rows.
    fn synthetic_readings(n: usize, temp_rows: usize) -> Vec<SensorReading> {
        hourly_timestamps(n)
            .into_iter()
            .enumerate()
            .map(|(i, time)| {
                let mut values = BTreeMap::new();
                let hour = time.hour() as f64;
                values.insert(
                    "object.co2".to_string(),
                    450.0 + 60.0 * (2.0 * PI * hour / 24.0).sin(),
                );
                if i < temp_rows {
                    values.insert("object.temperature".to_string(), 20.0 + hour / 10.0);
                }
                SensorReading {
                    sensor_type: SensorType::Air,
                    device_id: "air-01".to_string(),
                    time,
                    values,
                    metadata: BTreeMap::new(),
                    processed_at: time,
                }
            })
            .collect()
    }

    #[test]
    fn sinusoid_of_hour_is_captured() {
        // ---
        let readings = synthetic_readings(720, 0);
        let (_, metrics) = fit_models(SensorType::Air, readings).unwrap();

        let co2 = &metrics["object.co2"];
        assert!(
            co2.test_r2 > 0.9,
            "cyclical features must capture an hour-of-day sinusoid, got R2={}",
            co2.test_r2
        );
        assert_eq!(co2.samples, 720);
    }

    #[test]
    fn sparse_field_skipped_sibling_trains() {
        // ---
        // 40 valid temperature rows is below the minimum; CO2 has 200.
        let readings = synthetic_readings(200, 40);
        let (models, metrics) = fit_models(SensorType::Air, readings).unwrap();

        assert!(metrics.contains_key("object.co2"));
        assert!(!metrics.contains_key("object.temperature"));
        assert!(models.iter().all(|m| m.field != "object.temperature"));
    }

    #[test]
    fn all_fields_below_minimum_fails_run() {
        // ---
        let readings = synthetic_readings(30, 0);
        let err = fit_models(SensorType::Air, readings).unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData(_)));
    }

    #[test]
    fn split_is_chronological() {
        // ---
        // A level shift in the final 20% shows up as degraded test
        // metrics only if the held-out tail really is the tail.
        let mut readings = synthetic_readings(500, 0);
        readings.sort_by_key(|r| r.time);
        for r in readings.iter_mut().skip(400) {
            if let Some(v) = r.values.get_mut("object.co2") {
                *v += 500.0;
            }
        }
        let (_, metrics) = fit_models(SensorType::Air, readings).unwrap();
        let co2 = &metrics["object.co2"];
        assert!(co2.train_r2 > co2.test_r2);
        assert!(co2.test_rmse > co2.train_rmse);
    }

    #[test]
    fn metric_helpers() {
        // ---
        let actual = [1.0, 2.0, 3.0];
        assert_eq!(r2_score(&actual, &actual), 1.0);
        assert_eq!(rmse(&actual, &actual), 0.0);
        assert_eq!(mae(&actual, &[2.0, 3.0, 4.0]), 1.0);

        // Constant actuals with residual: defined as 0, not -inf.
        assert_eq!(r2_score(&[5.0, 5.0], &[4.0, 6.0]), 0.0);
    }
}
