//! Measurement-Set metadata reads.
//!
//! An MS is an on-disk directory. The converter leaves an `obsmeta.json`
//! sidecar inside it (time range, field directions, MODEL_DATA peak) so the
//! orchestrator never has to open the visibility tables itself. All reads here
//! are pure and idempotent; errors are escalated, never retried locally.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{StageError, StageResult};

/// Sidecar file written by the converter into each MS directory.
pub const OBS_META_FILE: &str = "obsmeta.json";

/// Marker file of a well-formed CASA table container.
pub const TABLE_MARKER: &str = "table.dat";

/// MODEL_DATA magnitudes below this are treated as unpopulated.
pub const MODEL_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FieldMeta {
    pub id: i64,
    pub ra_deg: f64,
    pub dec_deg: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObsMeta {
    pub start_mjd: f64,
    pub end_mjd: f64,
    #[serde(default)]
    pub fields: Vec<FieldMeta>,
    /// Peak magnitude over a sample of MODEL_DATA rows; absent or ~0 means
    /// the column has not been seeded.
    #[serde(default)]
    pub model_data_peak: Option<f64>,
}

impl ObsMeta {
    pub fn mid_mjd(&self) -> f64 {
        0.5 * (self.start_mjd + self.end_mjd)
    }
}

/// Stateless reader over MS directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsMetadataReader;

impl MsMetadataReader {
    pub fn read_meta(&self, ms_path: &Path) -> StageResult<ObsMeta> {
        if !ms_path.exists() {
            return Err(StageError::not_found(format!(
                "MS not found: {}",
                ms_path.display()
            )));
        }
        let meta_path = ms_path.join(OBS_META_FILE);
        let content = std::fs::read_to_string(&meta_path).map_err(|e| {
            StageError::corrupt(format!("missing {}: {e}", meta_path.display()))
        })?;
        let meta: ObsMeta = serde_json::from_str(&content)
            .map_err(|e| StageError::corrupt(format!("bad {}: {e}", meta_path.display())))?;
        if !meta.start_mjd.is_finite()
            || !meta.end_mjd.is_finite()
            || meta.start_mjd > meta.end_mjd
        {
            return Err(StageError::corrupt(format!(
                "invalid time range in {}: {} - {}",
                meta_path.display(),
                meta.start_mjd,
                meta.end_mjd
            )));
        }
        Ok(meta)
    }

    /// `(start, mid, end)` in MJD.
    pub fn time_range(&self, ms_path: &Path) -> StageResult<(f64, f64, f64)> {
        let meta = self.read_meta(ms_path)?;
        Ok((meta.start_mjd, meta.mid_mjd(), meta.end_mjd))
    }

    pub fn fields(&self, ms_path: &Path) -> StageResult<Vec<FieldMeta>> {
        let meta = self.read_meta(ms_path)?;
        if meta.fields.is_empty() {
            // An MS without a FIELD table is a malformed container.
            return Err(StageError::corrupt(format!(
                "no FIELD entries in {}",
                ms_path.display()
            )));
        }
        Ok(meta.fields)
    }

    /// Mean declination over all fields; fields track together in Dec.
    pub fn mean_declination(&self, ms_path: &Path) -> StageResult<f64> {
        let fields = self.fields(ms_path)?;
        let sum: f64 = fields.iter().map(|f| f.dec_deg).sum();
        Ok(sum / fields.len() as f64)
    }

    /// True iff MODEL_DATA exists and at least one sampled row has magnitude
    /// above `MODEL_EPSILON`.
    pub fn has_populated_model(&self, ms_path: &Path) -> StageResult<bool> {
        let meta = self.read_meta(ms_path)?;
        Ok(matches!(meta.model_data_peak, Some(peak) if peak > MODEL_EPSILON))
    }
}

/// Write the sidecar back. Used by the converter and by collaborators that
/// seed MODEL_DATA.
pub fn write_meta(ms_path: &Path, meta: &ObsMeta) -> StageResult<()> {
    std::fs::create_dir_all(ms_path)
        .map_err(|e| StageError::transient(format!("create {}: {e}", ms_path.display())))?;
    let content = serde_json::to_string_pretty(meta)
        .map_err(|e| StageError::corrupt(format!("encode obsmeta: {e}")))?;
    std::fs::write(ms_path.join(OBS_META_FILE), content)
        .map_err(|e| StageError::transient(format!("write obsmeta: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use tempfile::TempDir;

    fn fixture_ms(dir: &Path, name: &str, meta: &ObsMeta) -> std::path::PathBuf {
        let ms = dir.join(name);
        write_meta(&ms, meta).unwrap();
        std::fs::write(ms.join(TABLE_MARKER), b"").unwrap();
        ms
    }

    #[test]
    fn reads_time_range_and_declination() {
        let tmp = TempDir::new().unwrap();
        let ms = fixture_ms(
            tmp.path(),
            "2025-03-01T00:00:00.ms",
            &ObsMeta {
                start_mjd: 60000.0,
                end_mjd: 60000.003472,
                fields: vec![
                    FieldMeta { id: 0, ra_deg: 120.0, dec_deg: 37.0 },
                    FieldMeta { id: 1, ra_deg: 120.5, dec_deg: 37.1 },
                ],
                model_data_peak: None,
            },
        );

        let reader = MsMetadataReader;
        let (start, mid, end) = reader.time_range(&ms).unwrap();
        assert_eq!(start, 60000.0);
        assert!(mid > start && mid < end);
        assert!((reader.mean_declination(&ms).unwrap() - 37.05).abs() < 1e-9);
        assert!(!reader.has_populated_model(&ms).unwrap());
    }

    #[test]
    fn model_population_threshold() {
        let tmp = TempDir::new().unwrap();
        let reader = MsMetadataReader;

        let below = fixture_ms(
            tmp.path(),
            "below.ms",
            &ObsMeta {
                start_mjd: 60000.0,
                end_mjd: 60000.003,
                fields: vec![FieldMeta { id: 0, ra_deg: 0.0, dec_deg: 0.0 }],
                model_data_peak: Some(1e-12),
            },
        );
        assert!(!reader.has_populated_model(&below).unwrap());

        let above = fixture_ms(
            tmp.path(),
            "above.ms",
            &ObsMeta {
                start_mjd: 60000.0,
                end_mjd: 60000.003,
                fields: vec![FieldMeta { id: 0, ra_deg: 0.0, dec_deg: 0.0 }],
                model_data_peak: Some(0.8),
            },
        );
        assert!(reader.has_populated_model(&above).unwrap());
    }

    #[test]
    fn error_kinds() {
        let tmp = TempDir::new().unwrap();
        let reader = MsMetadataReader;

        let missing = tmp.path().join("nope.ms");
        assert_eq!(
            reader.time_range(&missing).unwrap_err().kind,
            ErrorKind::NotFound
        );

        let corrupt = tmp.path().join("corrupt.ms");
        std::fs::create_dir_all(&corrupt).unwrap();
        std::fs::write(corrupt.join(OBS_META_FILE), b"{not json").unwrap();
        assert_eq!(
            reader.time_range(&corrupt).unwrap_err().kind,
            ErrorKind::Corrupt
        );

        let no_fields = fixture_ms(
            tmp.path(),
            "nofields.ms",
            &ObsMeta {
                start_mjd: 60000.0,
                end_mjd: 60000.003,
                fields: vec![],
                model_data_peak: None,
            },
        );
        assert_eq!(
            reader.fields(&no_fields).unwrap_err().kind,
            ErrorKind::Corrupt
        );
    }
}
