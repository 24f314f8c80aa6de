//! Cyclical time features shared by training and prediction.
//!
//! Every timestamp is encoded as a fixed five-dimensional vector:
//! sine/cosine of hour-of-day and day-of-week plus a normalized time
//! index. The encoding is a pure function of the timestamp sequence;
//! repeated calls over the same input produce identical output.

use std::f64::consts::PI;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

// ---

/// Number of model input features.
pub const FEATURE_DIM: usize = 5;

/// The fixed encoding of one timestamp used as regressor input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub hour_sin: f64,
    pub hour_cos: f64,
    pub day_sin: f64,
    pub day_cos: f64,
    pub time_index: f64,
}

impl FeatureVector {
    pub fn as_array(&self) -> [f64; FEATURE_DIM] {
        [
            self.hour_sin,
            self.hour_cos,
            self.day_sin,
            self.day_cos,
            self.time_index,
        ]
    }
}

fn cyclical(timestamp: &DateTime<Utc>, time_index: f64) -> FeatureVector {
    let hour = timestamp.hour() as f64;
    // Monday = 0 .. Sunday = 6, matching the training data layout.
    let day_of_week = timestamp.weekday().num_days_from_monday() as f64;

    FeatureVector {
        hour_sin: (2.0 * PI * hour / 24.0).sin(),
        hour_cos: (2.0 * PI * hour / 24.0).cos(),
        day_sin: (2.0 * PI * day_of_week / 7.0).sin(),
        day_cos: (2.0 * PI * day_of_week / 7.0).cos(),
        time_index,
    }
}

/// Features for a training window.
///
/// `time_index` is min-max normalized over the window: 0 at the earliest
/// sample, 1 at the latest. The span is measured in milliseconds so that
/// sub-second windows normalize instead of dividing by zero; a window
/// narrower than one millisecond gets index 0 throughout, like a window
/// of identical timestamps.
pub fn training_features(timestamps: &[DateTime<Utc>]) -> Vec<FeatureVector> {
    let min = timestamps.iter().min().copied();
    let span_ms = match (min, timestamps.iter().max()) {
        (Some(min), Some(max)) => (*max - min).num_milliseconds(),
        _ => 0,
    };

    timestamps
        .iter()
        .map(|t| {
            let time_index = match min {
                Some(min) if span_ms > 0 => {
                    (*t - min).num_milliseconds() as f64 / span_ms as f64
                }
                _ => 0.0,
            };
            cyclical(t, time_index)
        })
        .collect()
}

/// Features for a future forecast horizon.
///
/// `time_index` does NOT continue the training-time elapsed ratio: it is
/// a fixed `linspace(1.0, 1.1, n)` ramp just beyond the training window.
/// This is a known simplification carried over for behavioral parity
/// with previously trained models; it is only sound because forecast
/// horizons stay short. Do not change it without retraining everything.
pub fn future_features(timestamps: &[DateTime<Utc>]) -> Vec<FeatureVector> {
    let ramp = linspace(1.0, 1.1, timestamps.len());
    timestamps
        .iter()
        .zip(ramp)
        .map(|(t, time_index)| cyclical(t, time_index))
        .collect()
}

/// `n` evenly spaced values from `start` to `end` inclusive. `n == 1`
/// yields `[start]`, matching numpy's `linspace`.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// The ordered future timestamp sequence for one forecast: `periods`
/// points starting at `anchor`, one step of `frequency` apart.
pub fn future_timestamps(
    anchor: DateTime<Utc>,
    periods: usize,
    frequency: crate::models::Frequency,
) -> Vec<DateTime<Utc>> {
    let step = frequency.step();
    (0..periods as i64).map(|i| anchor + step * i as i32).collect()
}
