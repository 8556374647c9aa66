//! Core entities persisted in the state store.
//!
//! The orchestrator exclusively owns these rows; external stages own artifact
//! directories on disk but never touch the store.

use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;

/// Per-MS processing stage in `ms_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsStage {
    Ingested,
    Converted,
    Calibrated,
    Imaged,
    Done,
    Failed,
}

impl MsStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsStage::Ingested => "ingested",
            MsStage::Converted => "converted",
            MsStage::Calibrated => "calibrated",
            MsStage::Imaged => "imaged",
            MsStage::Done => "done",
            MsStage::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ingested" => MsStage::Ingested,
            "converted" => MsStage::Converted,
            "calibrated" => MsStage::Calibrated,
            "imaged" => MsStage::Imaged,
            "done" => MsStage::Done,
            "failed" => MsStage::Failed,
            _ => return None,
        })
    }
}

/// One row per Measurement Set on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsEntry {
    pub path: String,
    pub start_mjd: f64,
    pub mid_mjd: f64,
    pub end_mjd: f64,
    pub declination_deg: Option<f64>,
    pub stage: MsStage,
    pub cal_applied: bool,
    pub imagename: Option<String>,
    pub updated_at: i64,
}

/// Group lifecycle status. Transitions follow the processing DAG; the only
/// permitted skip is into `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupStatus {
    Pending,
    Calibrating,
    Calibrated,
    Imaging,
    Imaged,
    Mosaicking,
    Completed,
    Failed,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Pending => "pending",
            GroupStatus::Calibrating => "calibrating",
            GroupStatus::Calibrated => "calibrated",
            GroupStatus::Imaging => "imaging",
            GroupStatus::Imaged => "imaged",
            GroupStatus::Mosaicking => "mosaicking",
            GroupStatus::Completed => "completed",
            GroupStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => GroupStatus::Pending,
            "calibrating" => GroupStatus::Calibrating,
            "calibrated" => GroupStatus::Calibrated,
            "imaging" => GroupStatus::Imaging,
            "imaged" => GroupStatus::Imaged,
            "mosaicking" => GroupStatus::Mosaicking,
            "completed" => GroupStatus::Completed,
            "failed" => GroupStatus::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GroupStatus::Completed | GroupStatus::Failed)
    }

    /// Whether a direct transition to `next` is permitted.
    pub fn can_advance_to(&self, next: GroupStatus) -> bool {
        if next == GroupStatus::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (GroupStatus::Pending, GroupStatus::Calibrating)
                | (GroupStatus::Calibrating, GroupStatus::Calibrated)
                | (GroupStatus::Calibrated, GroupStatus::Imaging)
                | (GroupStatus::Imaging, GroupStatus::Imaged)
                | (GroupStatus::Imaged, GroupStatus::Mosaicking)
                | (GroupStatus::Mosaicking, GroupStatus::Completed)
        )
    }
}

/// An ordered group of MS entries forming one mosaic unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosaicGroup {
    pub group_id: String,
    /// Paths ordered by `mid_mjd`.
    pub ms_paths: Vec<String>,
    pub calibration_ms_path: Option<String>,
    pub status: GroupStatus,
    pub bpcal_solved: bool,
    pub gaincal_solved: bool,
    pub retry_count: i64,
    pub mosaic_id: Option<String>,
    pub failure_kind: Option<String>,
    pub failure_message: Option<String>,
    pub created_at: i64,
    pub calibrated_at: Option<i64>,
    pub imaged_at: Option<i64>,
    pub mosaicked_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl MosaicGroup {
    pub fn ms_paths_csv(&self) -> String {
        self.ms_paths.join(",")
    }
}

/// Calibration table kind. A solution set row carries exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalKind {
    Bp,
    Gp,
    TwoG,
}

impl CalKind {
    pub const ALL: [CalKind; 3] = [CalKind::Bp, CalKind::Gp, CalKind::TwoG];

    pub fn as_str(&self) -> &'static str {
        match self {
            CalKind::Bp => "BP",
            CalKind::Gp => "GP",
            CalKind::TwoG => "2G",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "BP" => CalKind::Bp,
            "GP" => CalKind::Gp,
            "2G" => CalKind::TwoG,
            _ => return None,
        })
    }

    /// Directory suffix appended to the shared table prefix.
    pub fn table_suffix(&self) -> &'static str {
        match self {
            CalKind::Bp => "_bpcal",
            CalKind::Gp => "_gpcal",
            CalKind::TwoG => "_2gcal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetStatus {
    Active,
    Superseded,
    Deleted,
}

impl SetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetStatus::Active => "active",
            SetStatus::Superseded => "superseded",
            SetStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "active" => SetStatus::Active,
            "superseded" => SetStatus::Superseded,
            "deleted" => SetStatus::Deleted,
            _ => return None,
        })
    }
}

/// One calibration solution table with its validity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSet {
    pub set_name: String,
    pub kind: CalKind,
    pub table_path: String,
    pub valid_start_mjd: f64,
    pub valid_end_mjd: f64,
    pub cal_field: String,
    pub refant: String,
    /// Declination the solving MS pointed at; used for band conflicts.
    pub dec_deg: Option<f64>,
    pub status: SetStatus,
    pub created_at: i64,
}

/// Declination-indexed bandpass calibrator binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandpassCalibrator {
    pub name: String,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub dec_range_min: f64,
    pub dec_range_max: f64,
    pub active: bool,
    pub registered_at: i64,
    pub notes: Option<String>,
}

/// Append-only record of group stage transitions, kept for resume and audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLogEntry {
    pub group_id: String,
    pub from_status: String,
    pub to_status: String,
    pub reason: Option<String>,
    pub attempt: i64,
    pub ts: i64,
}

/// Recent failure event consulted by circuit breakers and operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub subsystem: String,
    pub error_kind: ErrorKind,
    pub message: String,
    pub ts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag_forward_only() {
        use GroupStatus::*;
        assert!(Pending.can_advance_to(Calibrating));
        assert!(Calibrating.can_advance_to(Calibrated));
        assert!(Calibrated.can_advance_to(Imaging));
        assert!(Imaging.can_advance_to(Imaged));
        assert!(Imaged.can_advance_to(Mosaicking));
        assert!(Mosaicking.can_advance_to(Completed));

        // No skipping forward.
        assert!(!Pending.can_advance_to(Calibrated));
        assert!(!Calibrating.can_advance_to(Imaging));
        assert!(!Imaged.can_advance_to(Completed));
        // No going back.
        assert!(!Imaging.can_advance_to(Calibrating));
    }

    #[test]
    fn any_nonterminal_can_fail() {
        use GroupStatus::*;
        for status in [Pending, Calibrating, Calibrated, Imaging, Imaged, Mosaicking] {
            assert!(status.can_advance_to(Failed));
        }
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Failed));
    }

    #[test]
    fn cal_kind_suffixes() {
        assert_eq!(CalKind::Bp.table_suffix(), "_bpcal");
        assert_eq!(CalKind::Gp.table_suffix(), "_gpcal");
        assert_eq!(CalKind::TwoG.table_suffix(), "_2gcal");
        assert_eq!(CalKind::parse("2G"), Some(CalKind::TwoG));
    }
}
