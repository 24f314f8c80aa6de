//! Domain data model for the sensor pipeline.
//!
//! Device payloads arrive as flattened key/value documents with
//! dotted sensor-value paths (e.g. `object.co2`). We keep those field
//! names but store them in a typed record: numeric fields that coerce to
//! float land in [`SensorReading::values`]; everything else (device and
//! radio metadata, non-coercible values) stays in an opaque metadata bag.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};

// ---

/// The three monitored device categories, each with its own schema of
/// numeric fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    /// Air quality stations (CO2, temperature, humidity, pressure).
    Air,
    /// Street noise meters (LAeq and impulse levels).
    Noise,
    /// Underground liquid level probes.
    Level,
}

impl SensorType {
    pub const ALL: [SensorType; 3] = [SensorType::Air, SensorType::Noise, SensorType::Level];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Air => "air",
            SensorType::Noise => "noise",
            SensorType::Level => "level",
        }
    }

    /// Declared numeric fields for this sensor type. Incoming values for
    /// these keys are coerced to float on ingestion.
    pub fn numeric_fields(&self) -> &'static [&'static str] {
        match self {
            SensorType::Air => &[
                "object.co2",
                "object.temperature",
                "object.humidity",
                "object.pressure",
                "object.battery",
            ],
            SensorType::Noise => &[
                "object.LAeq",
                "object.LAI",
                "object.LAImax",
                "object.battery",
            ],
            SensorType::Level => &["object.distance", "object.battery"],
        }
    }

    /// Fields the trainer fits one regressor for. Battery level is
    /// coerced and stored but never forecast.
    pub fn target_fields(&self) -> &'static [&'static str] {
        match self {
            SensorType::Air => &[
                "object.co2",
                "object.temperature",
                "object.humidity",
                "object.pressure",
            ],
            SensorType::Noise => &["object.LAeq", "object.LAI", "object.LAImax"],
            SensorType::Level => &["object.distance"],
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "air" => Ok(SensorType::Air),
            "noise" => Ok(SensorType::Noise),
            "level" => Ok(SensorType::Level),
            other => Err(PipelineError::data_quality(format!(
                "unknown sensor type '{other}'"
            ))),
        }
    }
}

// ---

/// One ingested measurement. Immutable after creation; appended to the
/// event store and never updated or deleted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_type: SensorType,
    pub device_id: String,
    /// Sensor-declared timestamp. Arrival order is not guaranteed to
    /// match this; readers must tolerate out-of-order ingestion.
    pub time: DateTime<Utc>,
    /// Successfully coerced numeric fields, keyed by dotted path.
    pub values: BTreeMap<String, f64>,
    /// Passthrough device/radio info plus any declared-numeric field
    /// that failed coercion (retained as-is, excluded from training).
    pub metadata: BTreeMap<String, Value>,
    /// Ingestion-time stamp set by the stream consumer.
    pub processed_at: DateTime<Utc>,
}

impl SensorReading {
    /// Build a reading from a raw bus payload.
    ///
    /// Fails with [`PipelineError::DataQuality`] when the payload is not
    /// a JSON object or its `time` field is missing/unparseable. Numeric
    /// coercion failures are not fatal: the offending value is kept in
    /// `metadata` and simply absent from `values`.
    pub fn from_payload(
        sensor_type: SensorType,
        payload: &Value,
        processed_at: DateTime<Utc>,
    ) -> Result<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| PipelineError::data_quality("payload is not a JSON object"))?;

        let time_raw = obj
            .get("time")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::data_quality("missing 'time' field"))?;
        let time = parse_timestamp(time_raw)?;

        let device_id = obj
            .get("deviceInfo.deviceName")
            .or_else(|| obj.get("deviceName"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let mut values = BTreeMap::new();
        let mut metadata = BTreeMap::new();

        for (key, value) in obj {
            if key == "time" {
                continue;
            }
            if sensor_type.numeric_fields().contains(&key.as_str()) {
                match coerce_numeric(value) {
                    Some(v) => {
                        values.insert(key.clone(), v);
                        continue;
                    }
                    None => {
                        // Retained as-is; never stored as a string
                        // masquerading as a numeric value.
                        tracing::debug!(field = %key, "non-coercible numeric field retained in metadata");
                    }
                }
            }
            metadata.insert(key.clone(), value.clone());
        }

        Ok(SensorReading {
            sensor_type,
            device_id,
            time,
            values,
            metadata,
            processed_at,
        })
    }

    /// The forecast target value for `field`, if this reading carries it.
    pub fn value(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied()
    }
}

/// Parse a sensor-declared timestamp. Accepts RFC 3339 (with `Z` or a
/// numeric offset) and offset-less ISO 8601, which is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(PipelineError::data_quality(format!(
        "unparseable timestamp '{raw}'"
    )))
}

fn coerce_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

// ---

/// Forecast step size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
}

impl Frequency {
    /// Number of forecast points covering `days` at this frequency.
    pub fn periods(&self, days: u32) -> usize {
        match self {
            Frequency::Hourly => days as usize * 24,
            Frequency::Daily => days as usize,
        }
    }

    pub fn step(&self) -> Duration {
        match self {
            Frequency::Hourly => Duration::hours(1),
            Frequency::Daily => Duration::days(1),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Hourly => f.write_str("hourly"),
            Frequency::Daily => f.write_str("daily"),
        }
    }
}

/// One complete forecast run over a single horizon.
///
/// Invariant: every series in `predictions` has exactly one value per
/// entry of `timestamps`, and `timestamps` is strictly increasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionBundle {
    pub sensor_type: SensorType,
    pub generated_at: DateTime<Utc>,
    pub horizon_days: u32,
    pub frequency: Frequency,
    pub timestamps: Vec<DateTime<Utc>>,
    pub predictions: BTreeMap<String, Vec<f64>>,
}

impl PredictionBundle {
    /// Per-field summary statistics over the forecast series.
    pub fn summary(&self) -> BTreeMap<String, FieldSummary> {
        self.predictions
            .iter()
            .map(|(field, series)| (field.clone(), FieldSummary::of(series)))
            .collect()
    }
}

/// Descriptive statistics of one forecast series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSummary {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

impl FieldSummary {
    pub fn of(series: &[f64]) -> Self {
        if series.is_empty() {
            return FieldSummary {
                mean: 0.0,
                std: 0.0,
                min: 0.0,
                max: 0.0,
                median: 0.0,
            };
        }
        let n = series.len() as f64;
        let mean = series.iter().sum::<f64>() / n;
        let var = series.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let mut sorted = series.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = if sorted.len() % 2 == 1 {
            sorted[sorted.len() / 2]
        } else {
            (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
        };
        FieldSummary {
            mean,
            std: var.sqrt(),
            min: sorted[0],
            max: *sorted.last().unwrap(),
            median,
        }
    }
}

/// What the prediction archive stores for one `predict_multiple` run:
/// the short (7 d hourly) and long (30 d daily) horizon bundles together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionDocument {
    pub sensor_type: SensorType,
    pub created_at: DateTime<Utc>,
    pub bundles: Vec<PredictionBundle>,
}

/// Evaluation metrics for one fitted (sensor_type, field) regressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetrics {
    pub train_r2: f64,
    pub test_r2: f64,
    pub train_rmse: f64,
    pub test_rmse: f64,
    pub train_mae: f64,
    pub test_mae: f64,
    pub samples: usize,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn air_payload() -> Value {
        json!({
            "time": "2026-03-26T18:45:00Z",
            "deviceInfo.deviceName": "air-station-04",
            "object.co2": 412.5,
            "object.temperature": "21.3",
            "object.humidity": 55.0,
            "object.battery": 3.61,
            "rxInfo.rssi": -87,
        })
    }

    #[test]
    fn payload_parses_and_coerces() {
        // ---
        let reading =
            SensorReading::from_payload(SensorType::Air, &air_payload(), Utc::now()).unwrap();

        assert_eq!(reading.device_id, "air-station-04");
        assert_eq!(reading.value("object.co2"), Some(412.5));
        // String-encoded numeric is coerced to float, not kept as string.
        assert_eq!(reading.value("object.temperature"), Some(21.3));
        assert_eq!(reading.value("object.battery"), Some(3.61));
        // Passthrough radio metadata survives untouched.
        assert_eq!(reading.metadata.get("rxInfo.rssi"), Some(&json!(-87)));
    }

    #[test]
    fn non_coercible_field_retained_in_metadata() {
        // ---
        let payload = json!({
            "time": "2026-03-26T18:45:00Z",
            "object.co2": "n/a",
            "object.humidity": 55.0,
        });
        let reading =
            SensorReading::from_payload(SensorType::Air, &payload, Utc::now()).unwrap();

        assert_eq!(reading.value("object.co2"), None);
        assert_eq!(reading.metadata.get("object.co2"), Some(&json!("n/a")));
        assert_eq!(reading.value("object.humidity"), Some(55.0));
    }

    #[test]
    fn missing_time_is_data_quality_error() {
        // ---
        let payload = json!({ "object.co2": 400.0 });
        let err = SensorReading::from_payload(SensorType::Air, &payload, Utc::now()).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn timestamp_formats() {
        // ---
        for raw in [
            "2026-03-26T18:45:00Z",
            "2026-03-26T18:45:00+00:00",
            "2026-03-26T18:45:00",
            "2026-03-26 18:45:00.250",
        ] {
            let dt = parse_timestamp(raw).unwrap();
            assert_eq!(dt.date_naive().to_string(), "2026-03-26");
        }
        assert!(parse_timestamp("yesterday-ish").is_err());
    }

    #[test]
    fn frequency_periods() {
        // ---
        assert_eq!(Frequency::Hourly.periods(7), 168);
        assert_eq!(Frequency::Daily.periods(30), 30);
    }

    #[test]
    fn battery_is_numeric_but_not_a_target() {
        // ---
        for sensor in SensorType::ALL {
            assert!(sensor.numeric_fields().contains(&"object.battery"));
            assert!(!sensor.target_fields().contains(&"object.battery"));
        }
    }

    #[test]
    fn field_summary_statistics() {
        // ---
        let s = FieldSummary::of(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(s.mean, 2.5);
        assert_eq!(s.median, 2.5);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 4.0);

        let odd = FieldSummary::of(&[3.0, 1.0, 2.0]);
        assert_eq!(odd.median, 2.0);
    }
}
