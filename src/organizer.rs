//! Date- and role-partitioned MS storage.
//!
//! MS containers move from their ingestion location into
//! `<root>/{calibrators,science,failed}/<YYYY-MM-DD>/` as the pipeline learns
//! their role. Moves are rename-then-update: the filesystem rename lands
//! first, then the `ms_index` row. A crash between the two is repaired at
//! startup by scanning the organized tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::ephemeris::mjd_to_date_string;
use crate::errors::{StageError, StageResult};
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsRole {
    Calibrator,
    Science,
    Failed,
}

impl MsRole {
    pub fn dir_name(&self) -> &'static str {
        match self {
            MsRole::Calibrator => "calibrators",
            MsRole::Science => "science",
            MsRole::Failed => "failed",
        }
    }
}

pub struct FileOrganizer {
    ms_root: PathBuf,
    store: Arc<StateStore>,
}

impl FileOrganizer {
    pub fn new(ms_root: PathBuf, store: Arc<StateStore>) -> Self {
        Self { ms_root, store }
    }

    /// Target location for an MS given its role and observation date.
    pub fn organized_path(&self, ms_path: &Path, role: MsRole, mid_mjd: f64) -> PathBuf {
        let date = mjd_to_date_string(mid_mjd);
        let file_name = ms_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed.ms".into());
        self.ms_root.join(role.dir_name()).join(date).join(file_name)
    }

    /// Move an MS into the organized layout and update its index row.
    /// A no-op when the MS already sits at its target.
    pub fn organize(&self, ms_path: &Path, role: MsRole, mid_mjd: f64) -> StageResult<PathBuf> {
        let target = self.organized_path(ms_path, role, mid_mjd);
        if ms_path == target {
            return Ok(target);
        }
        if !ms_path.exists() {
            return Err(StageError::not_found(format!(
                "cannot organize missing MS {}",
                ms_path.display()
            )));
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StageError::transient(format!("create {}: {e}", parent.display())))?;
        }
        std::fs::rename(ms_path, &target).map_err(|e| {
            StageError::transient(format!(
                "move {} -> {}: {e}",
                ms_path.display(),
                target.display()
            ))
        })?;
        self.store
            .update_ms_path(&ms_path.to_string_lossy(), &target.to_string_lossy())
            .map_err(|e| StageError::transient(format!("update ms path: {e}")))?;
        info!(
            from = %ms_path.display(),
            to = %target.display(),
            role = role.dir_name(),
            "organized MS"
        );
        Ok(target)
    }

    /// Shared basename prefix for calibration tables, placed alongside the
    /// calibrator MS (`<dir>/<stem>` with no extension).
    pub fn table_prefix(&self, organized_ms: &Path) -> PathBuf {
        let stem = organized_ms
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        organized_ms
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(stem)
    }

    /// Repair index rows whose file was renamed but whose row update never
    /// landed. Scans every role/date directory for MS containers and points
    /// rows at files that moved. Returns the number of repaired rows.
    pub fn reconcile(&self) -> StageResult<usize> {
        let mut repaired = 0;
        for role in [MsRole::Calibrator, MsRole::Science, MsRole::Failed] {
            let role_dir = self.ms_root.join(role.dir_name());
            if !role_dir.is_dir() {
                continue;
            }
            for date_entry in read_dir(&role_dir)? {
                if !date_entry.is_dir() {
                    continue;
                }
                for ms_dir in read_dir(&date_entry)? {
                    let name = match ms_dir.file_name().map(|n| n.to_string_lossy().into_owned()) {
                        Some(n) if n.ends_with(".ms") => n,
                        _ => continue,
                    };
                    let found_path = ms_dir.to_string_lossy().into_owned();
                    match self.store.find_ms_by_filename(&name) {
                        Ok(Some(entry)) => {
                            if entry.path != found_path && !Path::new(&entry.path).exists() {
                                warn!(
                                    old = %entry.path,
                                    new = %found_path,
                                    "reconciling MS row after interrupted move"
                                );
                                self.store
                                    .update_ms_path(&entry.path, &found_path)
                                    .map_err(|e| {
                                        StageError::transient(format!("reconcile update: {e}"))
                                    })?;
                                repaired += 1;
                            }
                        }
                        Ok(None) => {
                            debug!(path = %found_path, "organized MS has no index row");
                        }
                        Err(e) => {
                            return Err(StageError::transient(format!("reconcile lookup: {e}")))
                        }
                    }
                }
            }
        }
        Ok(repaired)
    }
}

fn read_dir(dir: &Path) -> StageResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| StageError::transient(format!("read {}: {e}", dir.display())))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StageError::transient(format!("read {}: {e}", dir.display())))?;
        paths.push(entry.path());
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MsEntry, MsStage};
    use tempfile::TempDir;

    fn entry_at(path: &Path, mid: f64) -> MsEntry {
        MsEntry {
            path: path.to_string_lossy().into_owned(),
            start_mjd: mid - 0.0017,
            mid_mjd: mid,
            end_mjd: mid + 0.0017,
            declination_deg: Some(37.0),
            stage: MsStage::Converted,
            cal_applied: false,
            imagename: None,
            updated_at: 0,
        }
    }

    fn setup() -> (FileOrganizer, Arc<StateStore>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(&tmp.path().join("state.sqlite3")).unwrap());
        let organizer = FileOrganizer::new(tmp.path().join("ms"), store.clone());
        (organizer, store, tmp)
    }

    #[test]
    fn organize_moves_and_updates_row() {
        let (organizer, store, tmp) = setup();
        let ms = tmp.path().join("incoming/2025-03-01T00:00:00.ms");
        std::fs::create_dir_all(&ms).unwrap();
        std::fs::write(ms.join("table.dat"), b"").unwrap();
        store.upsert_ms(&entry_at(&ms, 60000.1)).unwrap();

        let target = organizer.organize(&ms, MsRole::Science, 60000.1).unwrap();
        assert!(target.ends_with("ms/science/2023-02-25/2025-03-01T00:00:00.ms"));
        assert!(target.is_dir());
        assert!(!ms.exists());

        // Row follows the file.
        assert!(store.get_ms(&ms.to_string_lossy()).unwrap().is_none());
        assert!(store.get_ms(&target.to_string_lossy()).unwrap().is_some());

        // Re-organizing an already organized MS is a no-op.
        let again = organizer.organize(&target, MsRole::Science, 60000.1).unwrap();
        assert_eq!(again, target);
    }

    #[test]
    fn table_prefix_strips_extension() {
        let (organizer, _store, _tmp) = setup();
        let prefix =
            organizer.table_prefix(Path::new("/root/ms/calibrators/2025-03-01/obs01.ms"));
        assert_eq!(prefix, Path::new("/root/ms/calibrators/2025-03-01/obs01"));
    }

    #[test]
    fn reconcile_repairs_interrupted_move() {
        let (organizer, store, tmp) = setup();
        // Simulate: file was renamed into the organized tree, crash before
        // the row update, so the row still points at the old location.
        let old = tmp.path().join("incoming/obs02.ms");
        store.upsert_ms(&entry_at(&old, 60000.2)).unwrap();

        let new_dir = tmp.path().join("ms/science/2023-02-25/obs02.ms");
        std::fs::create_dir_all(&new_dir).unwrap();

        let repaired = organizer.reconcile().unwrap();
        assert_eq!(repaired, 1);
        let entry = store
            .get_ms(&new_dir.to_string_lossy())
            .unwrap()
            .expect("row now points at the organized location");
        assert_eq!(entry.mid_mjd, 60000.2);

        // Second pass finds nothing to repair.
        assert_eq!(organizer.reconcile().unwrap(), 0);
    }
}
