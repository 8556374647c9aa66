//! Capability interfaces for the external stages.
//!
//! The orchestrator holds narrow typed references to each collaborator and
//! never reaches around them: CASA numerics, imaging, mosaicking, photometry
//! and registry publishing all live behind these traits. Production wiring
//! shells out to configured tools (`command` module); tests substitute mocks.

pub mod command;
pub mod data_registry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::CalibrationConfig;
use crate::errors::StageResult;

/// Point source used to seed MODEL_DATA.
#[derive(Debug, Clone)]
pub struct ModelSource {
    pub name: String,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub flux_jy: f64,
}

/// Options forwarded to the calibration solver.
#[derive(Debug, Clone)]
pub struct SolveOptions {
    pub model_standard: String,
    pub combine_fields: bool,
    pub combine_spw: bool,
    pub minsnr: f64,
    pub uvrange: String,
    pub t_short: String,
}

impl From<&CalibrationConfig> for SolveOptions {
    fn from(config: &CalibrationConfig) -> Self {
        Self {
            model_standard: config.model_standard.clone(),
            combine_fields: config.combine_fields,
            combine_spw: config.combine_spw,
            minsnr: config.minsnr,
            uvrange: config.uvrange.clone(),
            t_short: config.t_short.clone(),
        }
    }
}

/// Options forwarded to the imager.
#[derive(Debug, Clone)]
pub struct ImagingOptions {
    pub quality_tier: String,
    pub skip_fits: bool,
}

impl Default for ImagingOptions {
    fn default() -> Self {
        Self {
            quality_tier: "standard".into(),
            skip_fits: false,
        }
    }
}

/// HDF5 ingest: produce MS containers covering a time range. Idempotent per
/// timestamp.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, start_mjd: f64, end_mjd: f64) -> StageResult<Vec<PathBuf>>;
}

/// Bandpass and gain solving, plus the pre-solve MS preparations that only
/// the CASA side can perform.
#[async_trait]
pub trait CalibrationSolver: Send + Sync {
    /// Rephase all fields to the calibrator position so the MS is coherently
    /// phased for solving.
    async fn rephase_to_position(
        &self,
        ms: &Path,
        ra_deg: f64,
        dec_deg: f64,
        source_name: &str,
    ) -> StageResult<()>;

    /// Seed MODEL_DATA for the given fields from a catalog source.
    async fn populate_model(&self, ms: &Path, field: &str, source: &ModelSource)
        -> StageResult<()>;

    /// Solve bandpass; returns created table directories.
    async fn solve_bandpass(
        &self,
        ms: &Path,
        cal_field: &str,
        refant: &str,
        prefix: &Path,
        options: &SolveOptions,
    ) -> StageResult<Vec<PathBuf>>;

    /// Solve gains on top of the given bandpass tables; returns created
    /// table directories.
    async fn solve_gains(
        &self,
        ms: &Path,
        cal_field: &str,
        refant: &str,
        bp_tables: &[PathBuf],
        prefix: &Path,
        options: &SolveOptions,
    ) -> StageResult<Vec<PathBuf>>;
}

#[async_trait]
pub trait CalibrationApplier: Send + Sync {
    async fn apply(
        &self,
        ms: &Path,
        field: &str,
        gaintables: &[PathBuf],
        calwt: bool,
    ) -> StageResult<()>;
}

/// Per-MS imaging. Must produce at least one of `<base>-image-pb.fits`,
/// `<base>.pbcor`, `<base>.image` plus a primary-beam artifact.
#[async_trait]
pub trait Imager: Send + Sync {
    async fn image(
        &self,
        ms: &Path,
        image_basename: &Path,
        options: &ImagingOptions,
    ) -> StageResult<()>;
}

/// Weighted mosaic assembly; input order is preserved.
#[async_trait]
pub trait MosaicBuilder: Send + Sync {
    async fn build(
        &self,
        image_paths: &[PathBuf],
        weight_paths: &[PathBuf],
        out_path: &Path,
    ) -> StageResult<()>;
}

#[async_trait]
pub trait PhotometryEngine: Send + Sync {
    /// Enqueue photometry on a mosaic; returns the job id.
    async fn measure(&self, mosaic_path: &Path, aperture_arcsec: f64) -> StageResult<String>;
}

/// Downstream data-product registry ("ready/published" contract only).
#[async_trait]
pub trait DataRegistry: Send + Sync {
    async fn register(
        &self,
        data_type: &str,
        data_id: &str,
        path: &Path,
        metadata: serde_json::Value,
        auto_publish: bool,
    ) -> StageResult<()>;

    async fn finalize(
        &self,
        data_id: &str,
        qa_status: &str,
        validation_status: &str,
    ) -> StageResult<()>;
}

/// Bundle handed to the orchestrator at construction time.
#[derive(Clone)]
pub struct Collaborators {
    pub solver: Arc<dyn CalibrationSolver>,
    pub applier: Arc<dyn CalibrationApplier>,
    pub imager: Arc<dyn Imager>,
    pub mosaicker: Arc<dyn MosaicBuilder>,
    pub photometry: Option<Arc<dyn PhotometryEngine>>,
    pub data_registry: Arc<dyn DataRegistry>,
    pub converter: Option<Arc<dyn Converter>>,
}
