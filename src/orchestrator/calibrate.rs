//! Anchor selection and calibration solving.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};

use crate::catalog::angular_separation_deg;
use crate::errors::StageError;
use crate::external::{ModelSource, SolveOptions};
use crate::models::{CalKind, GroupStatus, MosaicGroup};
use crate::organizer::MsRole;
use crate::registry::table_artifact_ok;
use crate::runner::{Deadline, StageOutcome};

use super::{AdvanceOutcome, Orchestrator};

/// Default anchor when no MS contains the calibrator transit: the 5th by
/// time in a full window, the middle one in a short window.
const ANCHOR_INDEX: usize = 4;

/// Field meridians further than this from the calibrator RA suggest the
/// calibrator is barely inside the primary beam.
const LOW_VISIBILITY_SEPARATION_DEG: f64 = 5.0;

impl Orchestrator {
    /// `pending -> calibrating`: bind a calibrator, pick the anchor MS.
    pub(super) async fn begin_calibration(&self, group: &MosaicGroup) -> Result<AdvanceOutcome> {
        if group.ms_paths.is_empty() {
            return self.fail(
                group,
                &StageError::validation("group has no MS paths"),
                0,
            );
        }

        // A calibrator must cover this declination before anything runs;
        // catalog auto-registration fills the gap when allowed.
        let calibrator = match self
            .catalog
            .auto_register_if_missing(Path::new(&group.ms_paths[0]))
        {
            Ok(cal) => cal,
            Err(err) => return self.fail(group, &err, 0),
        };

        let mut times = Vec::with_capacity(group.ms_paths.len());
        for path in &group.ms_paths {
            match self.reader.time_range(Path::new(path)) {
                Ok((start, mid, end)) => times.push((start, mid, end, path.clone())),
                Err(err) => return self.fail(group, &err, 0),
            }
        }
        times.sort_by(|a, b| a.1.total_cmp(&b.1));

        let group_mid = times[times.len() / 2].1;
        let transit = match self
            .config
            .observatory
            .transit_mjd(calibrator.ra_deg, group_mid)
        {
            Ok(t) => t,
            Err(err) => return self.fail(group, &err, 0),
        };

        // Prefer the MS that contains the calibrator's meridian transit.
        let anchor = times
            .iter()
            .find(|(start, _, end, _)| *start <= transit && transit <= *end)
            .map(|(_, _, _, path)| {
                info!(
                    group_id = %group.group_id,
                    path = %path,
                    transit_mjd = transit,
                    "anchor MS contains calibrator transit"
                );
                path.clone()
            })
            .unwrap_or_else(|| {
                let index = if times.len() > ANCHOR_INDEX {
                    ANCHOR_INDEX
                } else {
                    times.len() / 2
                };
                warn!(
                    group_id = %group.group_id,
                    transit_mjd = transit,
                    "no MS contains calibrator transit, falling back to anchor index {index}"
                );
                times[index].3.clone()
            });

        self.store.set_group_anchor(&group.group_id, &anchor)?;
        self.progress(
            group,
            GroupStatus::Calibrating,
            &format!("selectCalibrationMS {anchor}"),
        )
    }

    /// `calibrating -> calibrated`: consult the registry, solve when not
    /// covered, register solutions with their validity windows.
    pub(super) async fn solve_stage(
        &self,
        group: &MosaicGroup,
        deadline: Deadline,
    ) -> Result<AdvanceOutcome> {
        let anchor = match &group.calibration_ms_path {
            Some(path) => path.clone(),
            None => {
                return self.fail(
                    group,
                    &StageError::validation("calibrating group has no anchor MS"),
                    0,
                )
            }
        };
        let (start, mid, end) = match self.reader.time_range(Path::new(&anchor)) {
            Ok(range) => range,
            Err(err) => return self.fail(group, &err, 0),
        };

        // Idempotence: skip solving entirely when the registry already
        // covers the anchor time and the artifacts are on disk.
        let active = match self.registry.active_at(mid) {
            Ok(active) => active,
            Err(err) => return self.soft_fail(group, err),
        };
        let covered = |kind: CalKind| {
            active
                .get(&kind)
                .map(|sets| {
                    sets.iter()
                        .any(|s| table_artifact_ok(Path::new(&s.table_path)))
                })
                .unwrap_or(false)
        };
        let need_bp = !covered(CalKind::Bp);
        let need_gains = !(covered(CalKind::Gp) && covered(CalKind::TwoG));
        if !need_bp && !need_gains {
            self.store.set_group_solved(&group.group_id, true, true)?;
            return self.progress(
                group,
                GroupStatus::Calibrated,
                "calibration found in registry, solve skipped",
            );
        }
        // Valid BP tables feed the gain solve when only gains are stale.
        let registry_bp_tables: Vec<PathBuf> = active
            .get(&CalKind::Bp)
            .map(|sets| {
                sets.iter()
                    .filter(|s| table_artifact_ok(Path::new(&s.table_path)))
                    .map(|s| PathBuf::from(&s.table_path))
                    .collect()
            })
            .unwrap_or_default();

        let dec = match self.reader.mean_declination(Path::new(&anchor)) {
            Ok(dec) => dec,
            Err(err) => return self.fail(group, &err, 0),
        };
        let calibrator = match self.catalog.for_declination(dec) {
            Ok(Some(cal)) => cal,
            Ok(None) => {
                return self.fail(
                    group,
                    &StageError::new(
                        crate::errors::ErrorKind::NoCalibrator,
                        format!("no bandpass calibrator registered for Dec={dec:.4}"),
                    ),
                    0,
                )
            }
            Err(err) => return self.soft_fail(group, err),
        };

        let transit = match self.config.observatory.transit_mjd(calibrator.ra_deg, mid) {
            Ok(t) => t,
            Err(err) => return self.fail(group, &err, 0),
        };
        // The bandpass solve needs the calibrator at meridian inside the
        // anchor scan; gains re-solves on a valid BP do not.
        if need_bp && (transit < start || transit > end) {
            let offset_hours = (transit - mid).abs() * 24.0;
            return self.fail(
                group,
                &StageError::new(
                    crate::errors::ErrorKind::LowVisibility,
                    format!(
                        "calibrator {} transit at {transit:.6} MJD is outside anchor range \
                         [{start:.6}, {end:.6}] ({offset_hours:.2} h from MS center); \
                         bandpass solve would have no signal",
                        calibrator.name
                    ),
                ),
                0,
            );
        }

        let fields = match self.reader.fields(Path::new(&anchor)) {
            Ok(fields) => fields,
            Err(err) => return self.fail(group, &err, 0),
        };
        let (best_idx, best_sep) = fields
            .iter()
            .enumerate()
            .map(|(i, f)| {
                (
                    i,
                    angular_separation_deg(f.ra_deg, f.dec_deg, calibrator.ra_deg, calibrator.dec_deg),
                )
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((0, 0.0));
        if best_sep > LOW_VISIBILITY_SEPARATION_DEG {
            warn!(
                group_id = %group.group_id,
                calibrator = %calibrator.name,
                separation_deg = best_sep,
                "calibrator is far from every field meridian, expect low SNR"
            );
        }
        let cal_field = fields[best_idx].id.to_string();

        // Tables are created directly at the calibrator's organized
        // location so registration and the MS move agree on the prefix.
        let organized_anchor =
            self.organizer
                .organized_path(Path::new(&anchor), MsRole::Calibrator, mid);
        let prefix = self.organizer.table_prefix(&organized_anchor);
        if let Some(parent) = prefix.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return self.soft_fail(
                    group,
                    StageError::transient(format!("create {}: {e}", parent.display())),
                );
            }
        }

        let source = ModelSource {
            name: calibrator.name.clone(),
            ra_deg: calibrator.ra_deg,
            dec_deg: calibrator.dec_deg,
            flux_jy: self
                .catalog
                .known_source(&calibrator.name)
                .map(|s| s.flux_jy_1400)
                .unwrap_or(self.config.calibration.model_flux_jy),
        };
        let options = SolveOptions::from(&self.config.calibration);
        let refant = self.config.calibration.refant.clone();
        let solver = self.collab.solver.clone();
        let anchor_path = PathBuf::from(&anchor);

        info!(
            group_id = %group.group_id,
            anchor = %anchor,
            calibrator = %calibrator.name,
            cal_field = %cal_field,
            need_bp,
            need_gains,
            "solving calibration"
        );

        let outcome = self
            .runner
            .run("calibration_solve", deadline, || {
                let solver = solver.clone();
                let anchor = anchor_path.clone();
                let source = source.clone();
                let options = options.clone();
                let prefix = prefix.clone();
                let refant = refant.clone();
                let cal_field = cal_field.clone();
                let registry_bp_tables = registry_bp_tables.clone();
                let (cal_ra, cal_dec, cal_name) =
                    (calibrator.ra_deg, calibrator.dec_deg, calibrator.name.clone());
                async move {
                    // Seed MODEL_DATA, then solve; a bandpass solve first
                    // rephases the MS so all fields are coherent on the
                    // calibrator.
                    if need_bp {
                        solver
                            .rephase_to_position(&anchor, cal_ra, cal_dec, &cal_name)
                            .await?;
                    }
                    solver.populate_model(&anchor, &cal_field, &source).await?;
                    let bp_tables = if need_bp {
                        let tables = solver
                            .solve_bandpass(&anchor, &cal_field, &refant, &prefix, &options)
                            .await?;
                        if tables.is_empty() {
                            return Err(StageError::permanent(
                                "bandpass solve returned no tables",
                            ));
                        }
                        tables
                    } else {
                        registry_bp_tables
                    };
                    if need_gains {
                        let gain_tables = solver
                            .solve_gains(&anchor, &cal_field, &refant, &bp_tables, &prefix, &options)
                            .await?;
                        if gain_tables.is_empty() {
                            return Err(StageError::permanent("gain solve returned no tables"));
                        }
                    }
                    Ok(())
                }
            })
            .await;

        match outcome {
            StageOutcome::Skipped(reason) => Ok(AdvanceOutcome::Unchanged(reason)),
            StageOutcome::Failed(err) => self.fail(
                group,
                &err,
                self.config.stages.calibration_solve.max_attempts as i64,
            ),
            StageOutcome::Ok(()) => {
                let stem = Path::new(&anchor)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "anchor".into());

                // Bandpass validity is centered on the calibrator transit;
                // gains on the anchor observation itself.
                let bp_half_days = self.config.calibration.bp_validity_hours / 24.0;
                let gain_half_days = self.config.calibration.gain_validity_minutes / 1440.0;

                if need_bp {
                    if let Err(err) = self.registry.register_from_prefix(
                        &format!("{stem}_bp_{transit:.6}"),
                        &prefix,
                        &[CalKind::Bp],
                        &cal_field,
                        &refant,
                        Some(dec),
                        transit - bp_half_days,
                        transit + bp_half_days,
                    ) {
                        return self.soft_fail(group, err);
                    }
                }
                if need_gains {
                    if let Err(err) = self.registry.register_from_prefix(
                        &format!("{stem}_g_{mid:.6}"),
                        &prefix,
                        &[CalKind::Gp, CalKind::TwoG],
                        &cal_field,
                        &refant,
                        Some(dec),
                        mid - gain_half_days,
                        mid + gain_half_days,
                    ) {
                        return self.soft_fail(group, err);
                    }
                }
                self.store.set_group_solved(&group.group_id, true, true)?;

                // The calibrator MS moves into the calibrators tree next to
                // its tables; the group path list follows.
                match self
                    .organizer
                    .organize(Path::new(&anchor), MsRole::Calibrator, mid)
                {
                    Ok(new_path) => {
                        let new_path = new_path.to_string_lossy().into_owned();
                        if new_path != anchor {
                            let paths: Vec<String> = group
                                .ms_paths
                                .iter()
                                .map(|p| if *p == anchor { new_path.clone() } else { p.clone() })
                                .collect();
                            self.store
                                .set_group_ms_paths(&group.group_id, &paths.join(","))?;
                            self.store.set_group_anchor(&group.group_id, &new_path)?;
                        }
                    }
                    Err(err) => {
                        warn!(
                            group_id = %group.group_id,
                            "could not organize calibrator MS: {err}; keeping original path"
                        );
                    }
                }

                self.progress(
                    group,
                    GroupStatus::Calibrated,
                    "bandpass and gain solutions registered",
                )
            }
        }
    }
}
