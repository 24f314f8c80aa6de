//! Forecast generation from the latest trained model version.
//!
//! A predictor is loaded once per sensor type from the most recent
//! artifact manifest and then serves any number of horizon requests. A
//! forecast is complete or it fails: either every loaded field produces
//! a full series, or the call returns an error and nothing is archived.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::artifacts::{FieldModel, LoadedVersion, ModelStore};
use crate::error::Result;
use crate::features::{future_features, future_timestamps};
use crate::models::{Frequency, PredictionBundle, PredictionDocument, SensorType};
use crate::store::{PredictionArchive, ReadingStore};

// ---

/// Standard horizons for `predict_multiple`: a week of hourly points and
/// a month of daily points.
pub const SHORT_HORIZON_DAYS: u32 = 7;
pub const LONG_HORIZON_DAYS: u32 = 30;

/// Serves forecasts for one sensor type from one loaded model version.
#[derive(Debug)]
pub struct Predictor<S> {
    store: Arc<S>,
    sensor_type: SensorType,
    loaded: LoadedVersion,
}

impl<S: ReadingStore + PredictionArchive> Predictor<S> {
    /// Load the single most recent model version for `sensor_type`.
    ///
    /// Every field in the latest manifest is loaded; fields from older
    /// versions are never mixed in. Fails with
    /// [`crate::error::PipelineError::ModelUnavailable`] when no trained
    /// version exists.
    pub fn load(store: Arc<S>, models: &ModelStore, sensor_type: SensorType) -> Result<Self> {
        // ---
        let loaded = models.load_latest(sensor_type)?;
        info!(
            %sensor_type,
            version = loaded.manifest.version,
            fields = loaded.models.len(),
            "predictor ready"
        );
        Ok(Self {
            store,
            sensor_type,
            loaded,
        })
    }

    /// The model version this predictor serves from.
    pub fn version(&self) -> &str {
        &self.loaded.manifest.version
    }

    /// Forecast `days` forward at the given frequency.
    ///
    /// The horizon is anchored at the most recent stored reading's
    /// declared timestamp, falling back to the current time when the
    /// store is empty.
    pub async fn predict(&self, days: u32, frequency: Frequency) -> Result<PredictionBundle> {
        // ---
        let anchor = match self.store.latest(self.sensor_type, 1).await?.first() {
            Some(reading) => reading.time,
            None => {
                info!(sensor_type = %self.sensor_type, "no stored readings, anchoring at now");
                Utc::now()
            }
        };

        forecast(
            &self.loaded.models,
            self.sensor_type,
            anchor,
            days,
            frequency,
            Utc::now(),
        )
    }

    /// Run the two standard horizons and archive them as one document.
    pub async fn predict_multiple(&self) -> Result<PredictionDocument> {
        // ---
        let short = self.predict(SHORT_HORIZON_DAYS, Frequency::Hourly).await?;
        let long = self.predict(LONG_HORIZON_DAYS, Frequency::Daily).await?;

        for bundle in [&short, &long] {
            for (field, summary) in bundle.summary() {
                info!(
                    sensor_type = %self.sensor_type,
                    horizon_days = bundle.horizon_days,
                    field,
                    mean = summary.mean,
                    min = summary.min,
                    max = summary.max,
                    "forecast summary"
                );
            }
        }

        let document = PredictionDocument {
            sensor_type: self.sensor_type,
            created_at: Utc::now(),
            bundles: vec![short, long],
        };
        self.store.archive(&document).await?;
        info!(sensor_type = %self.sensor_type, "prediction document archived");

        Ok(document)
    }
}

// ---

/// Build one forecast bundle from already-loaded field models.
///
/// Pure aside from the model evaluation: the timestamp grid starts at
/// `anchor` and advances one `frequency` step per point, `days * 24`
/// points hourly or `days` points daily.
pub fn forecast(
    models: &[FieldModel],
    sensor_type: SensorType,
    anchor: DateTime<Utc>,
    days: u32,
    frequency: Frequency,
    generated_at: DateTime<Utc>,
) -> Result<PredictionBundle> {
    let periods = frequency.periods(days);
    let timestamps = future_timestamps(anchor, periods, frequency);
    let features = future_features(&timestamps);

    let mut predictions = BTreeMap::new();
    for model in models {
        let series = model.predict(&features)?;
        debug_assert_eq!(series.len(), timestamps.len());
        predictions.insert(model.field.clone(), series);
    }

    Ok(PredictionBundle {
        sensor_type,
        generated_at,
        horizon_days: days,
        frequency,
        timestamps,
        predictions,
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::SensorReading;
    use crate::store::MemoryStore;
    use crate::trainer::fit_models;
    use chrono::{TimeZone, Timelike};
    use std::f64::consts::PI;

    /// Hourly air readings with sinusoidal CO2 and temperature.
    fn synthetic_readings(n: usize) -> Vec<SensorReading> {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        (0..n as i64)
            .map(|i| {
                let time = start + chrono::Duration::hours(i);
                let hour = time.hour() as f64;
                let mut values = BTreeMap::new();
                values.insert(
                    "object.co2".to_string(),
                    450.0 + 60.0 * (2.0 * PI * hour / 24.0).sin(),
                );
                values.insert("object.temperature".to_string(), 18.0 + hour / 4.0);
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

    fn trained_models() -> Vec<FieldModel> {
        let (models, _) = fit_models(SensorType::Air, synthetic_readings(240)).unwrap();
        models
    }

    #[test]
    fn horizon_arithmetic() {
        // ---
        let models = trained_models();
        let anchor = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        let hourly =
            forecast(&models, SensorType::Air, anchor, 7, Frequency::Hourly, anchor).unwrap();
        assert_eq!(hourly.timestamps.len(), 168);

        let daily =
            forecast(&models, SensorType::Air, anchor, 30, Frequency::Daily, anchor).unwrap();
        assert_eq!(daily.timestamps.len(), 30);
    }

    #[test]
    fn bundle_shape_invariant() {
        // ---
        let models = trained_models();
        let anchor = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let bundle =
            forecast(&models, SensorType::Air, anchor, 7, Frequency::Hourly, anchor).unwrap();

        assert!(!bundle.predictions.is_empty());
        for series in bundle.predictions.values() {
            assert_eq!(series.len(), bundle.timestamps.len());
        }
        assert!(bundle.timestamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn version_atomicity() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());

        // First run trains both fields, second run only CO2. The loaded
        // set must come entirely from the latest version.
        let (both, metrics) = fit_models(SensorType::Air, synthetic_readings(240)).unwrap();
        store
            .save_version(SensorType::Air, "20260301_000000", &both, &metrics)
            .unwrap();

        let co2_only: Vec<FieldModel> = fit_models(SensorType::Air, synthetic_readings(240))
            .unwrap()
            .0
            .into_iter()
            .filter(|m| m.field == "object.co2")
            .collect();
        store
            .save_version(SensorType::Air, "20260302_000000", &co2_only, &metrics)
            .unwrap();

        let loaded = store.load_latest(SensorType::Air).unwrap();
        assert_eq!(loaded.manifest.version, "20260302_000000");
        let fields: Vec<&str> = loaded.models.iter().map(|m| m.field.as_str()).collect();
        assert_eq!(fields, vec!["object.co2"]);
    }

    #[tokio::test]
    async fn anchor_is_latest_stored_reading() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let model_store = ModelStore::new(dir.path());
        let (models, metrics) = fit_models(SensorType::Air, synthetic_readings(240)).unwrap();
        model_store
            .save_version(SensorType::Air, "20260301_000000", &models, &metrics)
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let newest = synthetic_readings(5);
        for reading in &newest {
            crate::store::ReadingStore::append(store.as_ref(), reading)
                .await
                .unwrap();
        }

        let predictor = Predictor::load(store, &model_store, SensorType::Air).unwrap();
        let bundle = predictor.predict(7, Frequency::Hourly).await.unwrap();
        assert_eq!(bundle.timestamps[0], newest.last().unwrap().time);
    }

    #[tokio::test]
    async fn predict_multiple_archives_both_horizons() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let model_store = ModelStore::new(dir.path());
        let (models, metrics) = fit_models(SensorType::Air, synthetic_readings(240)).unwrap();
        model_store
            .save_version(SensorType::Air, "20260301_000000", &models, &metrics)
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let predictor = Predictor::load(store.clone(), &model_store, SensorType::Air).unwrap();
        let document = predictor.predict_multiple().await.unwrap();

        assert_eq!(document.bundles.len(), 2);
        assert_eq!(document.bundles[0].timestamps.len(), 168);
        assert_eq!(document.bundles[1].timestamps.len(), 30);

        // Both horizons produce a summary for every forecast field.
        for bundle in &document.bundles {
            let summaries = bundle.summary();
            assert_eq!(summaries.len(), bundle.predictions.len());
            assert!(summaries
                .values()
                .all(|s| s.mean.is_finite() && s.min <= s.median && s.median <= s.max));
        }

        let archived = store.latest_document(SensorType::Air).await.unwrap();
        assert!(archived.is_some());
    }
}
