//! Group formation over the MS index.
//!
//! Groups are windows of N MS ordered by observation midpoint. The first
//! group is cut from the earliest eligible MS; every following group slides
//! forward, reusing the last K MS of the most recent completed group as an
//! overlap prefix. A group only forms when the window is temporally
//! contiguous and points at a single declination.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{GroupingPolicy, InitialStagePolicy};
use crate::models::{CalKind, MsEntry, MsStage};
use crate::msmeta::MsMetadataReader;
use crate::registry::table_path_for;
use crate::store::{now_micros, StateStore};

struct Candidate {
    path: String,
    mid_mjd: f64,
    dec_deg: f64,
}

pub struct GroupBuilder {
    store: Arc<StateStore>,
    reader: MsMetadataReader,
    policy: GroupingPolicy,
}

impl GroupBuilder {
    pub fn new(store: Arc<StateStore>, policy: GroupingPolicy) -> Self {
        Self {
            store,
            reader: MsMetadataReader,
            policy,
        }
    }

    /// Form the next group if one is ready. Returns the group id, which may
    /// belong to an existing open group over the same paths.
    pub fn build_next(&self) -> Result<Option<String>> {
        match self.store.latest_completed_group()? {
            Some(prev) => self.build_sliding(prev.ms_paths),
            None => self.build_initial(),
        }
    }

    fn initial_stages(&self) -> &'static [MsStage] {
        match self.policy.initial_stage_policy {
            InitialStagePolicy::ImagedOnly => &[MsStage::Imaged, MsStage::Done],
            InitialStagePolicy::ConvertedAndLater => &[
                MsStage::Converted,
                MsStage::Calibrated,
                MsStage::Imaged,
                MsStage::Done,
            ],
        }
    }

    fn build_initial(&self) -> Result<Option<String>> {
        let entries = self.store.list_ms_by_stages(self.initial_stages(), None)?;
        let candidates = self.to_candidates(entries)?;
        let window = match self.take_window(candidates, self.policy.ms_per_group) {
            Some(w) => w,
            None => return Ok(None),
        };
        self.finalize_group(window)
    }

    fn build_sliding(&self, prev_paths: Vec<String>) -> Result<Option<String>> {
        let overlap_k = self.policy.overlap.min(prev_paths.len());
        let mut overlap: Vec<Candidate> = Vec::new();
        for path in &prev_paths[prev_paths.len() - overlap_k..] {
            if !Path::new(path).exists() {
                warn!(path = %path, "overlap MS vanished, sliding without it");
                continue;
            }
            match self.store.get_ms(path)? {
                Some(entry) => overlap.push(self.candidate_from_entry(entry)?),
                None => warn!(path = %path, "overlap MS has no index row, sliding without it"),
            }
        }

        let new_needed = self.policy.ms_per_group - overlap.len();
        let entries = self.store.list_ms_by_stages(&[MsStage::Converted], None)?;
        let fresh: Vec<MsEntry> = entries
            .into_iter()
            .filter(|e| !overlap.iter().any(|o| o.path == e.path))
            .collect();
        let mut candidates = self.to_candidates(fresh)?;
        if candidates.len() < new_needed {
            debug!(
                available = candidates.len(),
                needed = new_needed,
                "not enough new MS for a sliding group"
            );
            if !self.policy.allow_asymmetric
                || overlap.len() + candidates.len() < self.policy.min_group_size
            {
                return Ok(None);
            }
        }
        candidates.truncate(new_needed);

        let mut window: Vec<Candidate> = overlap;
        let overlap_paths: Vec<String> = window.iter().map(|c| c.path.clone()).collect();
        window.extend(candidates);
        window.sort_by(|a, b| a.mid_mjd.total_cmp(&b.mid_mjd));
        if !self.window_is_valid(&window) {
            return Ok(None);
        }

        // Reset overlap MS: their previous calibration belongs to the old
        // group and must not leak into this one.
        for path in &overlap_paths {
            self.clear_calibration_artifacts(Path::new(path))?;
        }
        self.finalize_group(window)
    }

    fn candidate_from_entry(&self, entry: MsEntry) -> Result<Candidate> {
        let dec_deg = match entry.declination_deg {
            Some(dec) => dec,
            None => {
                let dec = self
                    .reader
                    .mean_declination(Path::new(&entry.path))
                    .map_err(|e| anyhow::anyhow!("declination of {}: {e}", entry.path))?;
                self.store.update_ms_declination(&entry.path, dec)?;
                dec
            }
        };
        Ok(Candidate {
            path: entry.path,
            mid_mjd: entry.mid_mjd,
            dec_deg,
        })
    }

    /// Keep only entries whose container still exists; vanished entries are
    /// dropped from the candidate list with a warning.
    fn to_candidates(&self, entries: Vec<MsEntry>) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for entry in entries {
            if !Path::new(&entry.path).exists() {
                warn!(path = %entry.path, "MS in index does not exist on disk, skipping");
                continue;
            }
            match self.candidate_from_entry(entry) {
                Ok(c) => candidates.push(c),
                Err(e) => {
                    warn!("dropping group candidate: {e}");
                    return Ok(Vec::new());
                }
            }
        }
        Ok(candidates)
    }

    fn take_window(&self, mut candidates: Vec<Candidate>, n: usize) -> Option<Vec<Candidate>> {
        if candidates.len() < n {
            if !self.policy.allow_asymmetric || candidates.len() < self.policy.min_group_size {
                return None;
            }
        } else {
            candidates.truncate(n);
        }
        candidates.sort_by(|a, b| a.mid_mjd.total_cmp(&b.mid_mjd));
        if self.window_is_valid(&candidates) {
            Some(candidates)
        } else {
            None
        }
    }

    /// Contiguity and declination checks, applied in order.
    fn window_is_valid(&self, window: &[Candidate]) -> bool {
        if window.len() < 2 {
            return false;
        }
        let max_gap_days = self.policy.max_gap_minutes / 60.0 / 24.0;
        for pair in window.windows(2) {
            let gap = pair[1].mid_mjd - pair[0].mid_mjd;
            if gap > max_gap_days {
                debug!(
                    gap_minutes = gap * 24.0 * 60.0,
                    first = %pair[0].path,
                    second = %pair[1].path,
                    "window not contiguous"
                );
                return false;
            }
        }

        let span = window[window.len() - 1].mid_mjd - window[0].mid_mjd;
        if span > self.policy.max_span_minutes / 60.0 / 24.0 {
            debug!(
                span_minutes = span * 24.0 * 60.0,
                "window span too large for a coherent mosaic"
            );
            return false;
        }

        let mean_dec: f64 =
            window.iter().map(|c| c.dec_deg).sum::<f64>() / window.len() as f64;
        for c in window {
            if (c.dec_deg - mean_dec).abs() > self.policy.dec_tolerance_deg {
                debug!(
                    path = %c.path,
                    dec_deg = c.dec_deg,
                    mean_dec,
                    "window spans multiple declinations"
                );
                return false;
            }
        }
        true
    }

    fn finalize_group(&self, window: Vec<Candidate>) -> Result<Option<String>> {
        let paths: Vec<String> = window.into_iter().map(|c| c.path).collect();
        let csv = paths.join(",");

        if let Some(existing) = self.store.find_open_group_by_paths(&csv)? {
            debug!(group_id = %existing, "open group with identical paths already exists");
            return Ok(Some(existing));
        }

        let mut group_id = group_id_for(&csv);
        if self.store.group_id_exists(&group_id)? {
            let suffix = 1000 + (rand::random::<u32>() % 9000);
            let alternative = format!("{group_id}_{suffix}");
            warn!(
                collided = %group_id,
                using = %alternative,
                "group id collision"
            );
            group_id = alternative;
        }
        self.store.insert_group(&group_id, &csv)?;
        info!(group_id = %group_id, n_ms = paths.len(), "formed new mosaic group");
        Ok(Some(group_id))
    }

    /// Remove calibration table directories sharing the MS basename prefix
    /// and reset the index row to `converted`.
    fn clear_calibration_artifacts(&self, ms_path: &Path) -> Result<()> {
        let stem = ms_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let prefix = ms_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(stem);
        for kind in CalKind::ALL {
            let table_dir = table_path_for(&prefix, kind);
            if table_dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&table_dir) {
                    warn!(path = %table_dir.display(), "failed to clear calibration table: {e}");
                } else {
                    info!(path = %table_dir.display(), "cleared calibration table for overlap reuse");
                }
            }
        }
        self.store.update_ms_stage(
            &ms_path.to_string_lossy(),
            MsStage::Converted,
            Some(false),
            None,
        )?;
        Ok(())
    }
}

/// Collision-resistant id: content hash of the ordered path list plus a
/// microsecond timestamp.
fn group_id_for(ms_paths_csv: &str) -> String {
    let digest = Sha256::digest(ms_paths_csv.as_bytes());
    format!("group_{}_{}", &hex::encode(digest)[..12], now_micros())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GroupStatus;
    use crate::msmeta::{write_meta, FieldMeta, ObsMeta};
    use tempfile::TempDir;

    const FIVE_MIN_DAYS: f64 = 5.0 / 60.0 / 24.0;

    fn seed_ms(
        store: &StateStore,
        dir: &Path,
        index: usize,
        mid_mjd: f64,
        dec_deg: f64,
    ) -> String {
        let ms = dir.join(format!("obs{index:03}.ms"));
        write_meta(
            &ms,
            &ObsMeta {
                start_mjd: mid_mjd - 0.0017,
                end_mjd: mid_mjd + 0.0017,
                fields: vec![FieldMeta { id: 0, ra_deg: 120.0, dec_deg }],
                model_data_peak: None,
            },
        )
        .unwrap();
        let path = ms.to_string_lossy().into_owned();
        store
            .upsert_ms(&MsEntry {
                path: path.clone(),
                start_mjd: mid_mjd - 0.0017,
                mid_mjd,
                end_mjd: mid_mjd + 0.0017,
                declination_deg: Some(dec_deg),
                stage: MsStage::Converted,
                cal_applied: false,
                imagename: None,
                updated_at: 0,
            })
            .unwrap();
        path
    }

    fn setup() -> (GroupBuilder, Arc<StateStore>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(&tmp.path().join("state.sqlite3")).unwrap());
        let builder = GroupBuilder::new(store.clone(), GroupingPolicy::default());
        (builder, store, tmp)
    }

    #[test]
    fn forms_initial_group_from_earliest_ten() {
        let (builder, store, tmp) = setup();
        for i in 0..12 {
            seed_ms(&store, tmp.path(), i, 60000.0 + i as f64 * FIVE_MIN_DAYS, 37.0);
        }
        let group_id = builder.build_next().unwrap().expect("group should form");
        assert!(group_id.starts_with("group_"));

        let group = store.get_group(&group_id).unwrap().unwrap();
        assert_eq!(group.ms_paths.len(), 10);
        assert_eq!(group.status, GroupStatus::Pending);
        // Earliest ten, in chronological order.
        assert!(group.ms_paths[0].ends_with("obs000.ms"));
        assert!(group.ms_paths[9].ends_with("obs009.ms"));

        // Same paths, same open group: no duplicate row.
        let again = builder.build_next().unwrap().unwrap();
        assert_eq!(again, group_id);
    }

    #[test]
    fn rejects_non_contiguous_window() {
        let (builder, store, tmp) = setup();
        for i in 0..10 {
            // The 6th file opens a ~26-minute gap.
            let mid = if i < 5 {
                60000.0 + i as f64 * FIVE_MIN_DAYS
            } else {
                60000.030 + (i - 5) as f64 * FIVE_MIN_DAYS
            };
            seed_ms(&store, tmp.path(), i, mid, 37.0);
        }
        assert!(builder.build_next().unwrap().is_none());
        assert!(store.oldest_nonterminal_group().unwrap().is_none());
    }

    #[test]
    fn rejects_mixed_declinations() {
        let (builder, store, tmp) = setup();
        for i in 0..10 {
            let dec = if i == 4 { 37.5 } else { 37.0 };
            seed_ms(&store, tmp.path(), i, 60000.0 + i as f64 * FIVE_MIN_DAYS, dec);
        }
        assert!(builder.build_next().unwrap().is_none());
    }

    #[test]
    fn purges_missing_paths_before_forming() {
        let (builder, store, tmp) = setup();
        for i in 0..11 {
            let path = seed_ms(&store, tmp.path(), i, 60000.0 + i as f64 * FIVE_MIN_DAYS, 37.0);
            if i == 0 {
                std::fs::remove_dir_all(&path).unwrap();
            }
        }
        // obs000 is gone; the ten remaining files form the group.
        let group_id = builder.build_next().unwrap().unwrap();
        let group = store.get_group(&group_id).unwrap().unwrap();
        assert!(group.ms_paths[0].ends_with("obs001.ms"));
        assert_eq!(group.ms_paths.len(), 10);
    }

    #[test]
    fn sliding_group_reuses_overlap_and_resets_calibration() {
        let (builder, store, tmp) = setup();
        let mut paths = Vec::new();
        for i in 0..10 {
            paths.push(seed_ms(
                &store,
                tmp.path(),
                i,
                60000.0 + i as f64 * FIVE_MIN_DAYS,
                37.0,
            ));
        }
        let g1 = builder.build_next().unwrap().unwrap();

        // Drive g1 to completed through the store.
        use GroupStatus::*;
        for (from, to) in [
            (Pending, Calibrating),
            (Calibrating, Calibrated),
            (Calibrated, Imaging),
            (Imaging, Imaged),
            (Imaged, Mosaicking),
            (Mosaicking, Completed),
        ] {
            store.advance_group_status(&g1, from, to, None, 0).unwrap();
        }
        for path in &paths {
            store
                .update_ms_stage(path, MsStage::Done, Some(true), None)
                .unwrap();
        }
        // Leave a stale gain table next to the 9th MS.
        let overlap_ms = Path::new(&paths[8]);
        let stale = overlap_ms
            .parent()
            .unwrap()
            .join(format!("{}_gpcal", overlap_ms.file_stem().unwrap().to_string_lossy()));
        std::fs::create_dir_all(&stale).unwrap();

        // Eight new converted MS continue the sequence.
        let mut new_paths = Vec::new();
        for i in 10..18 {
            new_paths.push(seed_ms(
                &store,
                tmp.path(),
                i,
                60000.0 + i as f64 * FIVE_MIN_DAYS,
                37.0,
            ));
        }

        let g2 = builder.build_next().unwrap().expect("sliding group");
        assert_ne!(g2, g1);
        let group = store.get_group(&g2).unwrap().unwrap();
        assert_eq!(group.ms_paths.len(), 10);
        // First two are the last two of g1.
        assert_eq!(group.ms_paths[0], paths[8]);
        assert_eq!(group.ms_paths[1], paths[9]);
        assert_eq!(group.ms_paths[2], new_paths[0]);

        // Overlap calibration artifacts were cleared and rows reset.
        assert!(!stale.exists());
        let entry = store.get_ms(&paths[8]).unwrap().unwrap();
        assert_eq!(entry.stage, MsStage::Converted);
        assert!(!entry.cal_applied);
    }

    #[test]
    fn asymmetric_policy_allows_short_window() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(&tmp.path().join("state.sqlite3")).unwrap());
        let mut policy = GroupingPolicy::default();
        policy.allow_asymmetric = true;
        let builder = GroupBuilder::new(store.clone(), policy);

        for i in 0..4 {
            seed_ms(&store, tmp.path(), i, 60000.0 + i as f64 * FIVE_MIN_DAYS, 37.0);
        }
        let group_id = builder.build_next().unwrap().expect("asymmetric group");
        let group = store.get_group(&group_id).unwrap().unwrap();
        assert_eq!(group.ms_paths.len(), 4);
    }

    #[test]
    fn strict_policy_rejects_short_window() {
        let (builder, store, tmp) = setup();
        for i in 0..4 {
            seed_ms(&store, tmp.path(), i, 60000.0 + i as f64 * FIVE_MIN_DAYS, 37.0);
        }
        assert!(builder.build_next().unwrap().is_none());
        assert!(store.oldest_nonterminal_group().unwrap().is_none());
    }
}
