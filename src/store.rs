//! SQLite-backed state store.
//!
//! Single source of truth for MS rows, groups, calibration sets, calibrator
//! bindings, the group state log, the failure ledger, and advisory group
//! locks. WAL mode so operators can read while the scheduler writes; every
//! mutation runs inside a transaction and bumps `updated_at`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::errors::ErrorKind;
use crate::models::{
    BandpassCalibrator, CalKind, CalibrationSet, FailureEvent, GroupStatus, MosaicGroup, MsEntry,
    MsStage, SetStatus, StateLogEntry,
};

/// Declination separation above which two calibration sets are considered
/// different bands and may both stay active.
pub const DEC_BAND_DEG: f64 = 0.2;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ms_index (
    path TEXT PRIMARY KEY,
    start_mjd REAL NOT NULL,
    mid_mjd REAL NOT NULL,
    end_mjd REAL NOT NULL,
    declination_deg REAL,
    stage TEXT NOT NULL,
    cal_applied INTEGER NOT NULL DEFAULT 0,
    imagename TEXT,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ms_index_stage_time
    ON ms_index(stage, mid_mjd ASC);

CREATE TABLE IF NOT EXISTS mosaic_groups (
    group_id TEXT PRIMARY KEY,
    ms_paths TEXT NOT NULL,
    calibration_ms_path TEXT,
    status TEXT NOT NULL,
    bpcal_solved INTEGER NOT NULL DEFAULT 0,
    gaincal_solved INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    mosaic_id TEXT,
    failure_kind TEXT,
    failure_message TEXT,
    created_at INTEGER NOT NULL,
    calibrated_at INTEGER,
    imaged_at INTEGER,
    mosaicked_at INTEGER,
    completed_at INTEGER,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_groups_status_created
    ON mosaic_groups(status, created_at ASC);

CREATE TABLE IF NOT EXISTS calibration_sets (
    set_name TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    table_path TEXT NOT NULL,
    valid_start_mjd REAL NOT NULL,
    valid_end_mjd REAL NOT NULL,
    cal_field TEXT NOT NULL,
    refant TEXT NOT NULL,
    dec_deg REAL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cal_sets_window
    ON calibration_sets(status, valid_start_mjd, valid_end_mjd);

CREATE TABLE IF NOT EXISTS bandpass_calibrators (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    ra_deg REAL NOT NULL,
    dec_deg REAL NOT NULL,
    dec_range_min REAL NOT NULL,
    dec_range_max REAL NOT NULL,
    status TEXT NOT NULL,
    registered_at INTEGER NOT NULL,
    notes TEXT,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bpcal_dec
    ON bandpass_calibrators(status, dec_range_min, dec_range_max);

CREATE TABLE IF NOT EXISTS group_state_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id TEXT NOT NULL,
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    reason TEXT,
    attempt INTEGER NOT NULL DEFAULT 0,
    ts INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_state_log_group
    ON group_state_log(group_id, ts ASC);

CREATE TABLE IF NOT EXISTS failure_ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subsystem TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    message TEXT NOT NULL,
    ts INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_failure_ledger_subsystem
    ON failure_ledger(subsystem, ts DESC);

CREATE TABLE IF NOT EXISTS group_locks (
    group_id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    acquired_at INTEGER NOT NULL
);
"#;

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Microsecond wall clock, used for collision-resistant group ids.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open state db {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---------------------------------------------------------------- ms_index

    pub fn upsert_ms(&self, entry: &MsEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ms_index
                 (path, start_mjd, mid_mjd, end_mjd, declination_deg, stage,
                  cal_applied, imagename, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(path) DO UPDATE SET
                 start_mjd = excluded.start_mjd,
                 mid_mjd = excluded.mid_mjd,
                 end_mjd = excluded.end_mjd,
                 declination_deg = excluded.declination_deg,
                 stage = excluded.stage,
                 cal_applied = excluded.cal_applied,
                 imagename = excluded.imagename,
                 updated_at = excluded.updated_at",
            params![
                entry.path,
                entry.start_mjd,
                entry.mid_mjd,
                entry.end_mjd,
                entry.declination_deg,
                entry.stage.as_str(),
                entry.cal_applied as i64,
                entry.imagename,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    pub fn get_ms(&self, path: &str) -> Result<Option<MsEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT path, start_mjd, mid_mjd, end_mjd, declination_deg, stage,
                        cal_applied, imagename, updated_at
                 FROM ms_index WHERE path = ?1",
                params![path],
                ms_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// MS rows in any of `stages`, ordered by `mid_mjd`.
    pub fn list_ms_by_stages(&self, stages: &[MsStage], limit: Option<usize>) -> Result<Vec<MsEntry>> {
        let placeholders = stages
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT path, start_mjd, mid_mjd, end_mjd, declination_deg, stage,
                    cal_applied, imagename, updated_at
             FROM ms_index WHERE stage IN ({placeholders})
             ORDER BY mid_mjd ASC {}",
            limit.map(|n| format!("LIMIT {n}")).unwrap_or_default()
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(stages.iter().map(|s| s.as_str())),
            ms_from_row,
        )?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn update_ms_stage(
        &self,
        path: &str,
        stage: MsStage,
        cal_applied: Option<bool>,
        imagename: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE ms_index SET
                 stage = ?2,
                 cal_applied = COALESCE(?3, cal_applied),
                 imagename = COALESCE(?4, imagename),
                 updated_at = ?5
             WHERE path = ?1",
            params![
                path,
                stage.as_str(),
                cal_applied.map(|b| b as i64),
                imagename,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    pub fn update_ms_declination(&self, path: &str, dec_deg: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE ms_index SET declination_deg = ?2, updated_at = ?3 WHERE path = ?1",
            params![path, dec_deg, now_ts()],
        )?;
        Ok(())
    }

    /// Row whose path ends with `/<file_name>`, used by startup reconciliation
    /// to find entries whose file moved before the crash.
    pub fn find_ms_by_filename(&self, file_name: &str) -> Result<Option<MsEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT path, start_mjd, mid_mjd, end_mjd, declination_deg, stage,
                        cal_applied, imagename, updated_at
                 FROM ms_index WHERE path LIKE ?1 ORDER BY updated_at DESC LIMIT 1",
                params![format!("%/{file_name}")],
                ms_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Move an MS row to its organized location. The filesystem rename happens
    /// first; this is the second half of the move-then-update contract.
    pub fn update_ms_path(&self, old_path: &str, new_path: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE ms_index SET path = ?2, updated_at = ?3 WHERE path = ?1",
            params![old_path, new_path, now_ts()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------ mosaic_groups

    pub fn insert_group(&self, group_id: &str, ms_paths_csv: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ts = now_ts();
        tx.execute(
            "INSERT INTO mosaic_groups (group_id, ms_paths, status, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?3)",
            params![group_id, ms_paths_csv, ts],
        )?;
        tx.execute(
            "INSERT INTO group_state_log (group_id, from_status, to_status, reason, attempt, ts)
             VALUES (?1, 'none', 'pending', 'group formed', 0, ?2)",
            params![group_id, ts],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn group_id_exists(&self, group_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<String> = conn
            .query_row(
                "SELECT group_id FROM mosaic_groups WHERE group_id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_group(&self, group_id: &str) -> Result<Option<MosaicGroup>> {
        let conn = self.conn.lock();
        let group = conn
            .query_row(
                &format!("SELECT {GROUP_COLS} FROM mosaic_groups WHERE group_id = ?1"),
                params![group_id],
                group_from_row,
            )
            .optional()?;
        Ok(group)
    }

    /// An existing non-completed group over the exact same paths, if any.
    pub fn find_open_group_by_paths(&self, ms_paths_csv: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let id: Option<String> = conn
            .query_row(
                "SELECT group_id FROM mosaic_groups
                 WHERE ms_paths = ?1 AND status != 'completed'",
                params![ms_paths_csv],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn oldest_nonterminal_group(&self) -> Result<Option<MosaicGroup>> {
        let conn = self.conn.lock();
        let group = conn
            .query_row(
                &format!(
                    "SELECT {GROUP_COLS} FROM mosaic_groups
                     WHERE status NOT IN ('completed', 'failed')
                     ORDER BY created_at ASC LIMIT 1"
                ),
                [],
                group_from_row,
            )
            .optional()?;
        Ok(group)
    }

    pub fn latest_completed_group(&self) -> Result<Option<MosaicGroup>> {
        let conn = self.conn.lock();
        let group = conn
            .query_row(
                &format!(
                    "SELECT {GROUP_COLS} FROM mosaic_groups
                     WHERE status = 'completed'
                     ORDER BY COALESCE(mosaicked_at, completed_at, created_at) DESC
                     LIMIT 1"
                ),
                [],
                group_from_row,
            )
            .optional()?;
        Ok(group)
    }

    /// Advance a group along the status DAG. Checks the current status still
    /// matches `from` and the transition is legal, stamps the matching stage
    /// timestamp, and appends the state-log row, all in one transaction.
    pub fn advance_group_status(
        &self,
        group_id: &str,
        from: GroupStatus,
        to: GroupStatus,
        reason: Option<&str>,
        attempt: i64,
    ) -> Result<()> {
        if !from.can_advance_to(to) {
            anyhow::bail!(
                "illegal transition {} -> {} for group {group_id}",
                from.as_str(),
                to.as_str()
            );
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ts = now_ts();
        let stamp_col = match to {
            GroupStatus::Calibrated => Some("calibrated_at"),
            GroupStatus::Imaged => Some("imaged_at"),
            GroupStatus::Completed => Some("completed_at"),
            _ => None,
        };
        let sql = match stamp_col {
            Some(col) => format!(
                "UPDATE mosaic_groups SET status = ?3, {col} = ?4, updated_at = ?4
                 WHERE group_id = ?1 AND status = ?2"
            ),
            None => "UPDATE mosaic_groups SET status = ?3, updated_at = ?4
                     WHERE group_id = ?1 AND status = ?2"
                .to_string(),
        };
        let changed = tx.execute(
            &sql,
            params![group_id, from.as_str(), to.as_str(), ts],
        )?;
        if changed == 0 {
            anyhow::bail!(
                "group {group_id} is no longer in status {}",
                from.as_str()
            );
        }
        tx.execute(
            "INSERT INTO group_state_log (group_id, from_status, to_status, reason, attempt, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![group_id, from.as_str(), to.as_str(), reason, attempt, ts],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Terminal failure: record kind, message and attempt count, and
    /// reassign the member MS rows to `failed` so they never re-candidate.
    pub fn fail_group(
        &self,
        group_id: &str,
        from: GroupStatus,
        kind: ErrorKind,
        message: &str,
        attempt: i64,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ts = now_ts();
        let changed = tx.execute(
            "UPDATE mosaic_groups
             SET status = 'failed', failure_kind = ?3, failure_message = ?4, updated_at = ?5
             WHERE group_id = ?1 AND status = ?2",
            params![group_id, from.as_str(), kind.as_str(), message, ts],
        )?;
        if changed == 0 {
            anyhow::bail!("group {group_id} is no longer in status {}", from.as_str());
        }
        let ms_paths: String = tx.query_row(
            "SELECT ms_paths FROM mosaic_groups WHERE group_id = ?1",
            params![group_id],
            |row| row.get(0),
        )?;
        for path in ms_paths.split(',').filter(|p| !p.is_empty()) {
            tx.execute(
                "UPDATE ms_index SET stage = 'failed', updated_at = ?2 WHERE path = ?1",
                params![path, ts],
            )?;
        }
        tx.execute(
            "INSERT INTO group_state_log (group_id, from_status, to_status, reason, attempt, ts)
             VALUES (?1, ?2, 'failed', ?3, ?4, ?5)",
            params![
                group_id,
                from.as_str(),
                format!("{}: {message}", kind.as_str()),
                attempt,
                ts
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_group_anchor(&self, group_id: &str, anchor_path: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE mosaic_groups SET calibration_ms_path = ?2, updated_at = ?3
             WHERE group_id = ?1",
            params![group_id, anchor_path, now_ts()],
        )?;
        Ok(())
    }

    pub fn set_group_solved(&self, group_id: &str, bpcal: bool, gaincal: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE mosaic_groups SET bpcal_solved = ?2, gaincal_solved = ?3, updated_at = ?4
             WHERE group_id = ?1",
            params![group_id, bpcal as i64, gaincal as i64, now_ts()],
        )?;
        Ok(())
    }

    /// Rewrite the ordered path list after organization moved the files.
    pub fn set_group_ms_paths(&self, group_id: &str, ms_paths_csv: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE mosaic_groups SET ms_paths = ?2, updated_at = ?3 WHERE group_id = ?1",
            params![group_id, ms_paths_csv, now_ts()],
        )?;
        Ok(())
    }

    pub fn set_group_mosaic(&self, group_id: &str, mosaic_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE mosaic_groups SET mosaic_id = ?2, mosaicked_at = ?3, updated_at = ?3
             WHERE group_id = ?1",
            params![group_id, mosaic_id, now_ts()],
        )?;
        Ok(())
    }

    /// Operator reset: back to `pending` with the retry counter bumped.
    pub fn reset_group(&self, group_id: &str, reason: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ts = now_ts();
        let prev: String = tx
            .query_row(
                "SELECT status FROM mosaic_groups WHERE group_id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| anyhow::anyhow!("unknown group {group_id}"))?;
        tx.execute(
            "UPDATE mosaic_groups
             SET status = 'pending', retry_count = retry_count + 1,
                 bpcal_solved = 0, gaincal_solved = 0,
                 failure_kind = NULL, failure_message = NULL, updated_at = ?2
             WHERE group_id = ?1",
            params![group_id, ts],
        )?;
        tx.execute(
            "INSERT INTO group_state_log (group_id, from_status, to_status, reason, attempt, ts)
             VALUES (?1, ?2, 'pending', ?3, 0, ?4)",
            params![group_id, prev, reason, ts],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn state_log_for_group(&self, group_id: &str) -> Result<Vec<StateLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT group_id, from_status, to_status, reason, attempt, ts
             FROM group_state_log WHERE group_id = ?1 ORDER BY ts ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok(StateLogEntry {
                group_id: row.get(0)?,
                from_status: row.get(1)?,
                to_status: row.get(2)?,
                reason: row.get(3)?,
                attempt: row.get(4)?,
                ts: row.get(5)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    // --------------------------------------------------------- calibration_sets

    /// Register a solution set row, superseding any older active set for the
    /// same kind and declination band with an overlapping validity window.
    /// Atomic: readers never observe two active sets for one band.
    pub fn register_set(&self, set: &CalibrationSet) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ts = now_ts();
        {
            let mut stmt = tx.prepare(
                "SELECT set_name, dec_deg FROM calibration_sets
                 WHERE status = 'active' AND kind = ?1
                   AND valid_start_mjd <= ?2 AND valid_end_mjd >= ?3",
            )?;
            let conflicts = stmt.query_map(
                params![set.kind.as_str(), set.valid_end_mjd, set.valid_start_mjd],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?)),
            )?;
            let mut superseded = Vec::new();
            for row in conflicts {
                let (name, dec) = row?;
                let same_band = match (set.dec_deg, dec) {
                    (Some(a), Some(b)) => (a - b).abs() <= DEC_BAND_DEG,
                    _ => true,
                };
                if same_band {
                    superseded.push(name);
                }
            }
            for name in superseded {
                tx.execute(
                    "UPDATE calibration_sets SET status = 'superseded', updated_at = ?2
                     WHERE set_name = ?1",
                    params![name, ts],
                )?;
            }
        }
        tx.execute(
            "INSERT INTO calibration_sets
                 (set_name, kind, table_path, valid_start_mjd, valid_end_mjd,
                  cal_field, refant, dec_deg, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9, ?9)",
            params![
                set.set_name,
                set.kind.as_str(),
                set.table_path,
                set.valid_start_mjd,
                set.valid_end_mjd,
                set.cal_field,
                set.refant,
                set.dec_deg,
                ts,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Active sets whose validity window contains `mjd`.
    pub fn active_sets_at(&self, mjd: f64) -> Result<Vec<CalibrationSet>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT set_name, kind, table_path, valid_start_mjd, valid_end_mjd,
                    cal_field, refant, dec_deg, status, created_at
             FROM calibration_sets
             WHERE status = 'active' AND valid_start_mjd <= ?1 AND valid_end_mjd >= ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![mjd], set_from_row)?;
        let mut sets = Vec::new();
        for row in rows {
            sets.push(row?);
        }
        Ok(sets)
    }

    pub fn list_active_sets(&self) -> Result<Vec<CalibrationSet>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT set_name, kind, table_path, valid_start_mjd, valid_end_mjd,
                    cal_field, refant, dec_deg, status, created_at
             FROM calibration_sets WHERE status = 'active'",
        )?;
        let rows = stmt.query_map([], set_from_row)?;
        let mut sets = Vec::new();
        for row in rows {
            sets.push(row?);
        }
        Ok(sets)
    }

    pub fn mark_set_deleted(&self, set_name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE calibration_sets SET status = 'deleted', updated_at = ?2
             WHERE set_name = ?1",
            params![set_name, now_ts()],
        )?;
        Ok(())
    }

    // ----------------------------------------------------- bandpass_calibrators

    /// Insert an active binding, deactivating overlapping active bindings in
    /// the same transaction so at most one active record covers any Dec.
    pub fn register_calibrator(&self, cal: &BandpassCalibrator) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ts = now_ts();
        tx.execute(
            "UPDATE bandpass_calibrators SET status = 'inactive', updated_at = ?3
             WHERE status = 'active' AND dec_range_min <= ?1 AND dec_range_max >= ?2",
            params![cal.dec_range_max, cal.dec_range_min, ts],
        )?;
        tx.execute(
            "INSERT INTO bandpass_calibrators
                 (name, ra_deg, dec_deg, dec_range_min, dec_range_max, status,
                  registered_at, notes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?6)",
            params![
                cal.name,
                cal.ra_deg,
                cal.dec_deg,
                cal.dec_range_min,
                cal.dec_range_max,
                ts,
                cal.notes,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Newest active binding whose range covers `dec_deg`.
    pub fn calibrator_for_dec(&self, dec_deg: f64) -> Result<Option<BandpassCalibrator>> {
        let conn = self.conn.lock();
        let cal = conn
            .query_row(
                "SELECT name, ra_deg, dec_deg, dec_range_min, dec_range_max, status,
                        registered_at, notes
                 FROM bandpass_calibrators
                 WHERE status = 'active' AND dec_range_min <= ?1 AND dec_range_max >= ?1
                 ORDER BY registered_at DESC LIMIT 1",
                params![dec_deg],
                calibrator_from_row,
            )
            .optional()?;
        Ok(cal)
    }

    // ------------------------------------------------------------ failure_ledger

    pub fn record_failure(&self, event: &FailureEvent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO failure_ledger (subsystem, error_kind, message, ts)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.subsystem,
                event.error_kind.as_str(),
                event.message,
                event.ts
            ],
        )?;
        Ok(())
    }

    pub fn failures_since(&self, subsystem: &str, since_ts: i64) -> Result<u32> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM failure_ledger WHERE subsystem = ?1 AND ts >= ?2",
            params![subsystem, since_ts],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn recent_failures(&self, limit: usize) -> Result<Vec<FailureEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT subsystem, error_kind, message, ts
             FROM failure_ledger ORDER BY ts DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let kind_str: String = row.get(1)?;
            Ok(FailureEvent {
                subsystem: row.get(0)?,
                error_kind: ErrorKind::parse(&kind_str).unwrap_or(ErrorKind::Permanent),
                message: row.get(2)?,
                ts: row.get(3)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn prune_failures_before(&self, ts: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM failure_ledger WHERE ts < ?1", params![ts])?;
        Ok(removed)
    }

    // --------------------------------------------------------------- group_locks

    /// Per-group advisory lock for multi-instance coordination. Stale locks
    /// are reclaimed after `stale_secs`.
    pub fn try_lock_group(&self, group_id: &str, owner: &str, stale_secs: i64) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ts = now_ts();
        tx.execute(
            "DELETE FROM group_locks WHERE group_id = ?1 AND acquired_at < ?2",
            params![group_id, ts - stale_secs],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO group_locks (group_id, owner, acquired_at)
             VALUES (?1, ?2, ?3)",
            params![group_id, owner, ts],
        )?;
        let holder: String = tx.query_row(
            "SELECT owner FROM group_locks WHERE group_id = ?1",
            params![group_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(holder == owner)
    }

    pub fn unlock_group(&self, group_id: &str, owner: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM group_locks WHERE group_id = ?1 AND owner = ?2",
            params![group_id, owner],
        )?;
        Ok(())
    }
}

const GROUP_COLS: &str = "group_id, ms_paths, calibration_ms_path, status, bpcal_solved, \
     gaincal_solved, retry_count, mosaic_id, failure_kind, failure_message, created_at, \
     calibrated_at, imaged_at, mosaicked_at, completed_at";

fn ms_from_row(row: &Row<'_>) -> rusqlite::Result<MsEntry> {
    let stage_str: String = row.get(5)?;
    Ok(MsEntry {
        path: row.get(0)?,
        start_mjd: row.get(1)?,
        mid_mjd: row.get(2)?,
        end_mjd: row.get(3)?,
        declination_deg: row.get(4)?,
        stage: MsStage::parse(&stage_str).unwrap_or(MsStage::Failed),
        cal_applied: row.get::<_, i64>(6)? != 0,
        imagename: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<MosaicGroup> {
    let status_str: String = row.get(3)?;
    let ms_paths: String = row.get(1)?;
    Ok(MosaicGroup {
        group_id: row.get(0)?,
        ms_paths: ms_paths
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        calibration_ms_path: row.get(2)?,
        status: GroupStatus::parse(&status_str).unwrap_or(GroupStatus::Failed),
        bpcal_solved: row.get::<_, i64>(4)? != 0,
        gaincal_solved: row.get::<_, i64>(5)? != 0,
        retry_count: row.get(6)?,
        mosaic_id: row.get(7)?,
        failure_kind: row.get(8)?,
        failure_message: row.get(9)?,
        created_at: row.get(10)?,
        calibrated_at: row.get(11)?,
        imaged_at: row.get(12)?,
        mosaicked_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

fn set_from_row(row: &Row<'_>) -> rusqlite::Result<CalibrationSet> {
    let kind_str: String = row.get(1)?;
    let status_str: String = row.get(8)?;
    Ok(CalibrationSet {
        set_name: row.get(0)?,
        kind: CalKind::parse(&kind_str).unwrap_or(CalKind::Bp),
        table_path: row.get(2)?,
        valid_start_mjd: row.get(3)?,
        valid_end_mjd: row.get(4)?,
        cal_field: row.get(5)?,
        refant: row.get(6)?,
        dec_deg: row.get(7)?,
        status: SetStatus::parse(&status_str).unwrap_or(SetStatus::Deleted),
        created_at: row.get(9)?,
    })
}

fn calibrator_from_row(row: &Row<'_>) -> rusqlite::Result<BandpassCalibrator> {
    let status_str: String = row.get(5)?;
    Ok(BandpassCalibrator {
        name: row.get(0)?,
        ra_deg: row.get(1)?,
        dec_deg: row.get(2)?,
        dec_range_min: row.get(3)?,
        dec_range_max: row.get(4)?,
        active: status_str == "active",
        registered_at: row.get(6)?,
        notes: row.get(7)?,
    })
}
