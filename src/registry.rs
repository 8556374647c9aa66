//! Calibration-solution registry.
//!
//! Durable record of solved calibration tables with MJD validity windows.
//! Rows live in the state store; the artifact directories on disk are owned
//! by the solver. A set is usable only while both halves agree: row active
//! and artifact present.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::{ErrorKind, StageError, StageResult};
use crate::models::{CalKind, CalibrationSet, SetStatus};
use crate::msmeta::TABLE_MARKER;
use crate::store::StateStore;

pub struct CalibrationRegistry {
    store: Arc<StateStore>,
}

impl CalibrationRegistry {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// All active sets covering `mjd`, grouped by kind. The store guarantees
    /// at most one active set per (kind, declination band); the newest row
    /// wins within a kind if legacy rows predate band tracking.
    pub fn active_at(&self, mjd: f64) -> StageResult<HashMap<CalKind, Vec<CalibrationSet>>> {
        let sets = self
            .store
            .active_sets_at(mjd)
            .map_err(|e| StageError::transient(format!("registry query: {e}")))?;
        let mut by_kind: HashMap<CalKind, Vec<CalibrationSet>> = HashMap::new();
        for set in sets {
            by_kind.entry(set.kind).or_default().push(set);
        }
        Ok(by_kind)
    }

    /// Active sets at `mjd` whose artifacts are verified on disk, flattened
    /// into an ordered apply list (BP first, then GP, then 2G).
    pub fn verified_applylist(&self, mjd: f64) -> StageResult<Vec<CalibrationSet>> {
        let by_kind = self.active_at(mjd)?;
        let mut applylist = Vec::new();
        for kind in CalKind::ALL {
            if let Some(sets) = by_kind.get(&kind) {
                for set in sets {
                    if table_artifact_ok(Path::new(&set.table_path)) {
                        applylist.push(set.clone());
                    } else {
                        warn!(
                            set_name = %set.set_name,
                            table_path = %set.table_path,
                            "registry row is active but artifact is missing on disk"
                        );
                    }
                }
            }
        }
        Ok(applylist)
    }

    /// Register solution rows derived from a shared table prefix.
    ///
    /// Verifies the artifact directory for every kind being registered
    /// (`<prefix>_bpcal`, `<prefix>_gpcal`, `<prefix>_2gcal`) before writing
    /// anything, then inserts one row per kind, each superseding older
    /// coverage of the same (kind, band). Rejects with `Conflict` when an
    /// artifact is absent so a half-solved prefix can never be published.
    #[allow(clippy::too_many_arguments)]
    pub fn register_from_prefix(
        &self,
        set_name: &str,
        prefix: &Path,
        kinds: &[CalKind],
        cal_field: &str,
        refant: &str,
        dec_deg: Option<f64>,
        valid_start_mjd: f64,
        valid_end_mjd: f64,
    ) -> StageResult<()> {
        if valid_start_mjd >= valid_end_mjd {
            return Err(StageError::validation(format!(
                "empty validity window {valid_start_mjd} - {valid_end_mjd}"
            )));
        }
        for kind in kinds {
            let dir = table_path_for(prefix, *kind);
            if !table_artifact_ok(&dir) {
                return Err(StageError::new(
                    ErrorKind::Conflict,
                    format!("calibration artifact missing: {}", dir.display()),
                ));
            }
        }
        for kind in kinds {
            let set = CalibrationSet {
                set_name: format!("{set_name}_{}", kind.as_str().to_lowercase()),
                kind: *kind,
                table_path: table_path_for(prefix, *kind).to_string_lossy().into_owned(),
                valid_start_mjd,
                valid_end_mjd,
                cal_field: cal_field.to_string(),
                refant: refant.to_string(),
                dec_deg,
                status: SetStatus::Active,
                created_at: 0,
            };
            self.store
                .register_set(&set)
                .map_err(|e| StageError::transient(format!("register {}: {e}", set.set_name)))?;
        }
        info!(
            set_name,
            prefix = %prefix.display(),
            valid_start_mjd,
            valid_end_mjd,
            "registered calibration set"
        );
        Ok(())
    }

    /// Mark active sets whose artifact vanished as deleted. Returns the
    /// number of rows swept.
    pub fn sweep_missing(&self) -> StageResult<usize> {
        let active = self
            .store
            .list_active_sets()
            .map_err(|e| StageError::transient(format!("registry sweep: {e}")))?;
        let mut removed = 0;
        for set in active {
            if !table_artifact_ok(Path::new(&set.table_path)) {
                warn!(
                    set_name = %set.set_name,
                    table_path = %set.table_path,
                    "sweeping calibration set with missing artifact"
                );
                self.store
                    .mark_set_deleted(&set.set_name)
                    .map_err(|e| StageError::transient(format!("sweep {}: {e}", set.set_name)))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Artifact directory for one kind under a shared prefix.
pub fn table_path_for(prefix: &Path, kind: CalKind) -> PathBuf {
    let name = prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    prefix.with_file_name(format!("{name}{}", kind.table_suffix()))
}

/// A CASA table directory is usable iff it exists and carries `table.dat`.
pub fn table_artifact_ok(dir: &Path) -> bool {
    dir.is_dir() && dir.join(TABLE_MARKER).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_tables(prefix: &Path) {
        for kind in CalKind::ALL {
            let dir = table_path_for(prefix, kind);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(TABLE_MARKER), b"").unwrap();
        }
    }

    fn registry() -> (CalibrationRegistry, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(&tmp.path().join("state.sqlite3")).unwrap());
        (CalibrationRegistry::new(store), tmp)
    }

    #[test]
    fn register_requires_artifacts_for_every_kind() {
        let (registry, tmp) = registry();
        let prefix = tmp.path().join("cal/2025-03-01/obs");
        std::fs::create_dir_all(prefix.parent().unwrap()).unwrap();

        // Only the BP table exists.
        let bp_dir = table_path_for(&prefix, CalKind::Bp);
        std::fs::create_dir_all(&bp_dir).unwrap();
        std::fs::write(bp_dir.join(TABLE_MARKER), b"").unwrap();

        // Registering the full set is rejected: the gain tables are absent.
        let err = registry
            .register_from_prefix(
                "obs",
                &prefix,
                &CalKind::ALL,
                "0",
                "103",
                Some(37.0),
                60000.0,
                60001.0,
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert!(registry.active_at(60000.5).unwrap().is_empty());

        make_tables(&prefix);
        registry
            .register_from_prefix(
                "obs",
                &prefix,
                &CalKind::ALL,
                "0",
                "103",
                Some(37.0),
                60000.0,
                60001.0,
            )
            .unwrap();
        let active = registry.active_at(60000.5).unwrap();
        assert_eq!(active.get(&CalKind::Bp).map(Vec::len), Some(1));
        assert_eq!(active.get(&CalKind::Gp).map(Vec::len), Some(1));
        assert_eq!(active.get(&CalKind::TwoG).map(Vec::len), Some(1));
    }

    #[test]
    fn gains_only_registration_needs_only_gain_tables() {
        let (registry, tmp) = registry();
        let prefix = tmp.path().join("anchor2");
        // A later anchor solves fresh gains; the still-valid BP lives under
        // an older prefix, so only the gain dirs exist here.
        for kind in [CalKind::Gp, CalKind::TwoG] {
            let dir = table_path_for(&prefix, kind);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(TABLE_MARKER), b"").unwrap();
        }
        registry
            .register_from_prefix(
                "anchor2_g",
                &prefix,
                &[CalKind::Gp, CalKind::TwoG],
                "0",
                "103",
                Some(37.0),
                60000.0,
                60000.05,
            )
            .unwrap();
        let active = registry.active_at(60000.02).unwrap();
        assert!(active.contains_key(&CalKind::Gp));
        assert!(active.contains_key(&CalKind::TwoG));
    }

    #[test]
    fn gain_registration_writes_gp_and_2g_rows() {
        let (registry, tmp) = registry();
        let prefix = tmp.path().join("obs");
        make_tables(&prefix);

        registry
            .register_from_prefix(
                "obs_g",
                &prefix,
                &[CalKind::Gp, CalKind::TwoG],
                "0",
                "103",
                Some(37.0),
                60000.0,
                60000.05,
            )
            .unwrap();

        let active = registry.active_at(60000.02).unwrap();
        assert!(active.contains_key(&CalKind::Gp));
        assert!(active.contains_key(&CalKind::TwoG));
        assert!(!active.contains_key(&CalKind::Bp));

        let applylist = registry.verified_applylist(60000.02).unwrap();
        assert_eq!(applylist.len(), 2);
        // Ordered GP before 2G.
        assert_eq!(applylist[0].kind, CalKind::Gp);
        assert_eq!(applylist[1].kind, CalKind::TwoG);
    }

    #[test]
    fn sweep_marks_vanished_artifacts_deleted() {
        let (registry, tmp) = registry();
        let prefix = tmp.path().join("obs");
        make_tables(&prefix);
        registry
            .register_from_prefix(
                "obs",
                &prefix,
                &[CalKind::Bp],
                "0",
                "103",
                None,
                60000.0,
                60001.0,
            )
            .unwrap();

        std::fs::remove_dir_all(table_path_for(&prefix, CalKind::Bp)).unwrap();
        assert_eq!(registry.sweep_missing().unwrap(), 1);
        assert!(registry.active_at(60000.5).unwrap().is_empty());
        // Sweep is idempotent.
        assert_eq!(registry.sweep_missing().unwrap(), 0);
    }

    #[test]
    fn empty_window_rejected() {
        let (registry, tmp) = registry();
        let prefix = tmp.path().join("obs");
        make_tables(&prefix);
        let err = registry
            .register_from_prefix(
                "obs",
                &prefix,
                &[CalKind::Bp],
                "0",
                "103",
                None,
                60001.0,
                60000.0,
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
