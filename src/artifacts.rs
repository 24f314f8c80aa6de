//! Model artifacts: fitted estimators and their on-disk layout.
//!
//! One training run produces one version directory per sensor type:
//!
//! ```text
//! models/<sensor_type>/<run_timestamp>/
//!     manifest.json       index of the run: field -> artifact files, metrics
//!     co2_model.json      serialized regressor
//!     co2_scaler.json     serialized feature scaler
//!     ...
//! ```
//!
//! The manifest is written last, so a version directory without one is
//! an aborted run and is ignored. The predictor loads every field listed
//! in the single most recent manifest and nothing else; scaler and
//! regressor always travel as a pair, and fields from different versions
//! are never mixed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smartcore::ensemble::random_forest_regressor::RandomForestRegressor;
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::error::{PipelineError, Result};
use crate::features::{FeatureVector, FEATURE_DIM};
use crate::models::{FieldMetrics, SensorType};

// ---

pub type Forest = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// Zero-mean unit-variance feature scaler, fitted on the training split
/// only and applied to test and future features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: [f64; FEATURE_DIM],
    std: [f64; FEATURE_DIM],
}

impl StandardScaler {
    pub fn fit(rows: &[[f64; FEATURE_DIM]]) -> Self {
        let n = rows.len().max(1) as f64;
        let mut mean = [0.0; FEATURE_DIM];
        for row in rows {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= n;
        }

        let mut std = [0.0; FEATURE_DIM];
        for row in rows {
            for ((s, v), m) in std.iter_mut().zip(row).zip(&mean) {
                *s += (v - m).powi(2);
            }
        }
        for s in &mut std {
            *s = (*s / n).sqrt();
            // Constant features pass through unscaled.
            if *s == 0.0 {
                *s = 1.0;
            }
        }

        StandardScaler { mean, std }
    }

    pub fn transform(&self, rows: &[[f64; FEATURE_DIM]]) -> Vec<Vec<f64>> {
        rows.iter()
            .map(|row| {
                row.iter()
                    .zip(self.mean.iter().zip(&self.std))
                    .map(|(v, (m, s))| (v - m) / s)
                    .collect()
            })
            .collect()
    }
}

/// A fitted (scaler, regressor) pair for one target field. The two are
/// always persisted and loaded together, under the same version.
#[derive(Debug, Serialize, Deserialize)]
pub struct FieldModel {
    pub field: String,
    pub scaler: StandardScaler,
    pub regressor: Forest,
}

impl FieldModel {
    /// Scale `features` with this field's scaler and run the regressor.
    pub fn predict(&self, features: &[FeatureVector]) -> Result<Vec<f64>> {
        let rows: Vec<[f64; FEATURE_DIM]> = features.iter().map(|f| f.as_array()).collect();
        let scaled = self.scaler.transform(&rows);
        let x = DenseMatrix::from_2d_vec(&scaled);
        self.regressor.predict(&x).map_err(|e| PipelineError::Fit {
            field: self.field.clone(),
            reason: e.to_string(),
        })
    }
}

// ---

/// Index record for one training run, written alongside the artifacts.
/// Version atomicity is enforced by this data structure rather than by
/// filename pattern matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionManifest {
    pub sensor_type: SensorType,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldArtifact>,
    pub metrics: BTreeMap<String, FieldMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldArtifact {
    pub model_file: String,
    pub scaler_file: String,
}

/// A fully loaded model version: every field of the latest manifest.
#[derive(Debug)]
pub struct LoadedVersion {
    pub manifest: VersionManifest,
    pub models: Vec<FieldModel>,
}

// ---

/// Versioned artifact storage rooted at `MODELS_DIR`.
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sensor_dir(&self, sensor_type: SensorType) -> PathBuf {
        self.root.join(sensor_type.as_str())
    }

    /// Persist one training run as a new version directory. Returns the
    /// manifest after it is safely on disk.
    pub fn save_version(
        &self,
        sensor_type: SensorType,
        version: &str,
        models: &[FieldModel],
        metrics: &BTreeMap<String, FieldMetrics>,
    ) -> Result<VersionManifest> {
        let dir = self.sensor_dir(sensor_type).join(version);
        fs::create_dir_all(&dir)?;

        let mut fields = BTreeMap::new();
        for model in models {
            let stem = file_stem(&model.field);
            let artifact = FieldArtifact {
                model_file: format!("{stem}_model.json"),
                scaler_file: format!("{stem}_scaler.json"),
            };
            write_json(&dir.join(&artifact.model_file), &model.regressor)?;
            write_json(&dir.join(&artifact.scaler_file), &model.scaler)?;
            tracing::info!(field = %model.field, version, "model artifacts saved");
            fields.insert(model.field.clone(), artifact);
        }

        let manifest = VersionManifest {
            sensor_type,
            version: version.to_string(),
            created_at: Utc::now(),
            fields,
            metrics: metrics.clone(),
        };
        // Written last: a directory without a manifest is an aborted run.
        write_json(&dir.join("manifest.json"), &manifest)?;

        Ok(manifest)
    }

    /// The most recent complete version for a sensor type, by version
    /// name (run timestamps sort lexicographically and temporally alike).
    pub fn latest_version(&self, sensor_type: SensorType) -> Result<Option<String>> {
        let dir = self.sensor_dir(sensor_type);
        if !dir.exists() {
            return Ok(None);
        }

        let mut versions: Vec<String> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join("manifest.json").is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        versions.sort();
        Ok(versions.pop())
    }

    /// Load every (scaler, regressor) pair of the latest version.
    ///
    /// Fails with [`PipelineError::ModelUnavailable`] when no complete
    /// version exists for the sensor type.
    pub fn load_latest(&self, sensor_type: SensorType) -> Result<LoadedVersion> {
        let version = self
            .latest_version(sensor_type)?
            .ok_or(PipelineError::ModelUnavailable(sensor_type))?;
        let dir = self.sensor_dir(sensor_type).join(&version);

        let manifest: VersionManifest = read_json(&dir.join("manifest.json"))?;

        let mut models = Vec::with_capacity(manifest.fields.len());
        for (field, artifact) in &manifest.fields {
            let regressor: Forest = read_json(&dir.join(&artifact.model_file))?;
            let scaler: StandardScaler = read_json(&dir.join(&artifact.scaler_file))?;
            models.push(FieldModel {
                field: field.clone(),
                scaler,
                regressor,
            });
            tracing::info!(%field, version, "model loaded");
        }

        Ok(LoadedVersion { manifest, models })
    }
}

/// Version name for a training run starting now.
pub fn run_version(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

/// Artifact file stem for a dotted field path: `object.co2` -> `co2`.
fn file_stem(field: &str) -> String {
    field
        .strip_prefix("object.")
        .unwrap_or(field)
        .replace('.', "_")
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec(value)?;
    fs::write(path, json)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn scaler_centers_and_scales() {
        // ---
        let rows = vec![
            [0.0, 0.0, 0.0, 0.0, 0.0],
            [2.0, 4.0, 0.0, 0.0, 1.0],
        ];
        let scaler = StandardScaler::fit(&rows);
        let out = scaler.transform(&rows);

        // Each non-constant column becomes (-1, 1); constant columns
        // pass through as zeros instead of dividing by zero.
        assert!((out[0][0] + 1.0).abs() < 1e-12);
        assert!((out[1][0] - 1.0).abs() < 1e-12);
        assert_eq!(out[0][2], 0.0);
        assert_eq!(out[1][2], 0.0);
    }

    #[test]
    fn scaler_round_trips_through_json() {
        // ---
        let scaler = StandardScaler::fit(&[[1.0, 2.0, 3.0, 4.0, 5.0], [3.0, 2.0, 1.0, 0.0, 5.0]]);
        let json = serde_json::to_string(&scaler).unwrap();
        let back: StandardScaler = serde_json::from_str(&json).unwrap();
        assert_eq!(scaler, back);
    }

    #[test]
    fn field_file_stems() {
        // ---
        assert_eq!(file_stem("object.co2"), "co2");
        assert_eq!(file_stem("object.LAImax"), "LAImax");
        assert_eq!(file_stem("distance"), "distance");
    }

    #[test]
    fn run_version_sorts_temporally() {
        // ---
        use chrono::TimeZone;
        let earlier = run_version(Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap());
        let later = run_version(Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap());
        assert_eq!(earlier, "20260301_093000");
        assert!(later > earlier);
    }

    #[test]
    fn missing_models_reported_unavailable() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let err = store.load_latest(SensorType::Noise).unwrap_err();
        assert!(matches!(err, PipelineError::ModelUnavailable(SensorType::Noise)));
    }

    #[test]
    fn incomplete_version_directories_are_ignored() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        // A version directory without a manifest is an aborted run.
        fs::create_dir_all(dir.path().join("air/20260301_120000")).unwrap();

        let store = ModelStore::new(dir.path());
        assert_eq!(store.latest_version(SensorType::Air).unwrap(), None);
    }
}
