//! Pipeline configuration.
//!
//! Loaded from a TOML file with per-section defaults, so a minimal deployment
//! runs with an empty config and only `paths.state_dir` overridden via the
//! environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ephemeris::ObservatoryLocation;

/// Main configuration for the streaming mosaic pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Filesystem layout
    pub paths: PathsConfig,

    /// Group formation policy (window size, overlap, contiguity)
    pub grouping: GroupingPolicy,

    /// Calibration solve parameters and validity windows
    pub calibration: CalibrationConfig,

    /// Calibrator catalog lookup and auto-registration
    pub catalog: CatalogConfig,

    /// Observing site for sidereal calculations
    pub observatory: ObservatoryLocation,

    /// Per-stage retry and circuit-breaker policies
    pub stages: StagePolicies,

    /// Scheduler loop behaviour
    pub scheduler: SchedulerConfig,

    /// Optional photometry hand-off after mosaicking
    pub photometry: PhotometryConfig,

    /// External tool commands for the production collaborators
    pub tools: ToolsConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: PipelineConfig =
            toml::from_str(&content).with_context(|| format!("parse {}", path.display()))?;
        Ok(config)
    }

    /// Config with every path rooted under `root`; used by tests and by the
    /// single-directory deployment mode.
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Self::default();
        config.paths = PathsConfig::rooted_at(root);
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the state database
    pub state_dir: PathBuf,
    /// Root for organized MS storage (calibrators/, science/, failed/)
    pub ms_root: PathBuf,
    /// Per-MS image outputs
    pub images_dir: PathBuf,
    /// Mosaic outputs
    pub mosaics_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self::rooted_at(Path::new("./pipeline"))
    }
}

impl PathsConfig {
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            state_dir: root.join("state"),
            ms_root: root.join("ms"),
            images_dir: root.join("images"),
            mosaics_dir: root.join("mosaics"),
        }
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.state_dir.join("pipeline.sqlite3")
    }

    pub fn data_registry_db_path(&self) -> PathBuf {
        self.state_dir.join("data_registry.sqlite3")
    }
}

/// Which MS stages are eligible when forming the first group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialStagePolicy {
    /// Only MS that already went through per-MS imaging
    ImagedOnly,
    /// Anything converted or later
    ConvertedAndLater,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingPolicy {
    /// MS per group (N)
    pub ms_per_group: usize,
    /// Overlap carried from the previous completed group (K)
    pub overlap: usize,
    /// Allow groups smaller than N (never below `min_group_size`)
    pub allow_asymmetric: bool,
    pub min_group_size: usize,
    /// Maximum gap between consecutive MS midpoints
    pub max_gap_minutes: f64,
    /// Maximum span from first to last midpoint
    pub max_span_minutes: f64,
    /// Declination coherence tolerance around the group mean
    pub dec_tolerance_deg: f64,
    pub initial_stage_policy: InitialStagePolicy,
}

impl Default for GroupingPolicy {
    fn default() -> Self {
        Self {
            ms_per_group: 10,
            overlap: 2,
            allow_asymmetric: false,
            min_group_size: 3,
            max_gap_minutes: 6.0,
            max_span_minutes: 60.0,
            dec_tolerance_deg: 0.1,
            initial_stage_policy: InitialStagePolicy::ConvertedAndLater,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Reference antenna passed to the solver
    pub refant: String,
    /// Bandpass validity half-width, centered on calibrator transit
    pub bp_validity_hours: f64,
    /// Gain validity half-width, centered on the anchor MS midpoint
    pub gain_validity_minutes: f64,
    /// Flux assumed when seeding MODEL_DATA from the catalog
    pub model_flux_jy: f64,
    pub model_standard: String,
    pub combine_fields: bool,
    pub combine_spw: bool,
    pub minsnr: f64,
    pub uvrange: String,
    /// Solution interval for the short-timescale gain table
    pub t_short: String,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            refant: "103".into(),
            bp_validity_hours: 12.0,
            gain_validity_minutes: 30.0,
            model_flux_jy: 2.5,
            model_standard: "Perley-Butler 2017".into(),
            combine_fields: true,
            combine_spw: false,
            minsnr: 3.0,
            uvrange: ">100m".into(),
            t_short: "60s".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Attempt catalog auto-registration when no binding covers a declination
    pub auto_register: bool,
    /// Dec half-range recorded for an auto-registered binding
    pub auto_dec_tolerance_deg: f64,
    /// Angular search radius when matching MS fields against known sources
    pub search_radius_deg: f64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            auto_register: true,
            auto_dec_tolerance_deg: 5.0,
            search_radius_deg: 1.0,
        }
    }
}

/// Retry and breaker policy for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicy {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub success_threshold: u32,
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 300,
            success_threshold: 2,
            max_attempts: 3,
            base_delay_secs: 5.0,
            max_delay_secs: 60.0,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicies {
    pub calibration_solve: StagePolicy,
    pub imaging: StagePolicy,
    pub mosaicking: StagePolicy,
    pub photometry: StagePolicy,
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            calibration_solve: StagePolicy {
                failure_threshold: 3,
                recovery_timeout_secs: 300,
                success_threshold: 2,
                max_attempts: 3,
                base_delay_secs: 5.0,
                max_delay_secs: 60.0,
                exponential_base: 2.0,
                jitter: true,
            },
            imaging: StagePolicy {
                failure_threshold: 5,
                recovery_timeout_secs: 600,
                success_threshold: 3,
                max_attempts: 2,
                base_delay_secs: 10.0,
                max_delay_secs: 120.0,
                exponential_base: 2.0,
                jitter: true,
            },
            mosaicking: StagePolicy {
                failure_threshold: 3,
                recovery_timeout_secs: 300,
                success_threshold: 2,
                max_attempts: 2,
                base_delay_secs: 5.0,
                max_delay_secs: 60.0,
                exponential_base: 2.0,
                jitter: true,
            },
            photometry: StagePolicy {
                failure_threshold: 5,
                recovery_timeout_secs: 300,
                success_threshold: 2,
                max_attempts: 3,
                base_delay_secs: 2.0,
                max_delay_secs: 30.0,
                exponential_base: 2.0,
                jitter: true,
            },
        }
    }
}

impl StagePolicies {
    pub fn for_subsystem(&self, subsystem: &str) -> &StagePolicy {
        match subsystem {
            "calibration_solve" | "calibration_apply" => &self.calibration_solve,
            "imaging" => &self.imaging,
            "mosaicking" => &self.mosaicking,
            "photometry" => &self.photometry,
            _ => &self.calibration_solve,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sleep between ticks when idle
    pub poll_interval_secs: u64,
    /// Overall deadline for one group advance; clamps stage deadlines
    pub group_deadline_secs: Option<u64>,
    /// Concurrent per-MS work (apply, imaging)
    pub worker_pool: usize,
    /// Fraction of MS that must image successfully for the group to advance
    pub imaging_success_fraction: f64,
    /// Stale advisory locks older than this are reclaimed
    pub lock_stale_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            group_deadline_secs: None,
            worker_pool: 4,
            imaging_success_fraction: 0.75,
            lock_stale_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotometryConfig {
    pub enabled: bool,
    /// Aperture radius forwarded to the photometry engine
    pub aperture_arcsec: f64,
}

impl Default for PhotometryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            aperture_arcsec: 15.0,
        }
    }
}

/// External executables the production collaborators shell out to. Empty
/// strings leave the corresponding capability unconfigured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub converter_cmd: String,
    pub solver_cmd: String,
    pub applier_cmd: String,
    pub imager_cmd: String,
    pub mosaic_cmd: String,
    pub photometry_cmd: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stage_table() {
        let stages = StagePolicies::default();
        assert_eq!(stages.calibration_solve.failure_threshold, 3);
        assert_eq!(stages.calibration_solve.max_attempts, 3);
        assert_eq!(stages.imaging.failure_threshold, 5);
        assert_eq!(stages.imaging.recovery_timeout_secs, 600);
        assert_eq!(stages.imaging.max_attempts, 2);
        assert_eq!(stages.mosaicking.max_attempts, 2);
        assert_eq!(stages.photometry.base_delay_secs, 2.0);
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config: PipelineConfig = toml::from_str("").unwrap();
        assert_eq!(config.grouping.ms_per_group, 10);
        assert_eq!(config.grouping.overlap, 2);
        assert_eq!(config.calibration.bp_validity_hours, 12.0);
        assert!(!config.photometry.enabled);
    }

    #[test]
    fn partial_toml_overrides_one_section() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [grouping]
            ms_per_group = 6
            allow_asymmetric = true
            "#,
        )
        .unwrap();
        assert_eq!(config.grouping.ms_per_group, 6);
        assert!(config.grouping.allow_asymmetric);
        // Untouched sections keep defaults.
        assert_eq!(config.scheduler.poll_interval_secs, 30);
    }
}
