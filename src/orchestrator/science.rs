//! Calibration apply and per-MS imaging, fanned out over the worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::artifacts::ImageArtifacts;
use crate::errors::{ErrorKind, StageError};
use crate::external::{ImagingOptions, ModelSource};
use crate::models::{CalKind, GroupStatus, MosaicGroup, MsStage};
use crate::organizer::MsRole;
use crate::recovery::is_retryable;
use crate::registry::table_artifact_ok;
use crate::runner::{Deadline, StageOutcome};

use super::{AdvanceOutcome, Orchestrator};

/// Result of driving apply-calibration across a group.
enum ApplyResult {
    /// All MS applied (or already applied); organized paths in group order.
    Applied(Vec<String>),
    /// Something permanent went wrong.
    Fatal(StageError),
    /// Worth retrying on a later tick (breaker open, transient exhaustion
    /// of a single MS, ...).
    Retry(String),
}

impl Orchestrator {
    /// `calibrated -> imaging`: commit the transition, then start applying.
    /// Apply is idempotent, so a partial pass here is picked up again by the
    /// imaging stage on the next tick.
    pub(super) async fn start_apply_stage(
        &self,
        group: &MosaicGroup,
        deadline: Deadline,
    ) -> Result<AdvanceOutcome> {
        self.progress(group, GroupStatus::Imaging, "applying calibration")?;
        let mut in_imaging = group.clone();
        in_imaging.status = GroupStatus::Imaging;

        match self.ensure_applied(&in_imaging, deadline).await? {
            ApplyResult::Applied(_) => Ok(AdvanceOutcome::Progressed(GroupStatus::Imaging)),
            ApplyResult::Fatal(err) => self.fail(&in_imaging, &err, 0),
            ApplyResult::Retry(reason) => {
                warn!(group_id = %group.group_id, reason = %reason, "apply incomplete, will resume");
                Ok(AdvanceOutcome::Progressed(GroupStatus::Imaging))
            }
        }
    }

    /// `imaging -> imaged`: make sure every MS is applied, image each MS,
    /// and advance when enough images exist on disk.
    pub(super) async fn imaging_stage(
        &self,
        group: &MosaicGroup,
        deadline: Deadline,
    ) -> Result<AdvanceOutcome> {
        let paths = match self.ensure_applied(group, deadline).await? {
            ApplyResult::Applied(paths) => paths,
            ApplyResult::Fatal(err) => return self.fail(group, &err, 0),
            ApplyResult::Retry(reason) => return Ok(AdvanceOutcome::Unchanged(reason)),
        };

        let total = paths.len();
        let threshold = (self.config.scheduler.imaging_success_fraction * total as f64).ceil()
            as usize;

        let semaphore = Arc::new(Semaphore::new(self.config.scheduler.worker_pool.max(1)));
        let mut tasks: JoinSet<(usize, Result<(), StageError>)> = JoinSet::new();
        for (index, ms_path) in paths.iter().enumerate() {
            let permit_source = semaphore.clone();
            let runner = self.runner.clone();
            let store = self.store.clone();
            let catalog = self.catalog.clone();
            let solver = self.collab.solver.clone();
            let imager = self.collab.imager.clone();
            let reader = self.reader;
            let images_dir = self.config.paths.images_dir.clone();
            let model_flux = self.config.calibration.model_flux_jy;
            let ms_path = ms_path.clone();

            tasks.spawn(async move {
                let _permit = permit_source.acquire_owned().await;
                let ms = PathBuf::from(&ms_path);
                let artifacts = ImageArtifacts::for_ms(&images_dir, &ms);
                let imgroot = artifacts.imgroot.to_string_lossy().into_owned();

                // Existence check: crash recovery and reruns skip finished MS.
                if artifacts.any_exists() {
                    let _ = store.update_ms_stage(&ms_path, MsStage::Imaged, None, Some(&imgroot));
                    return (index, Ok(()));
                }

                // Imaging needs a starting model; re-seed once if absent.
                match reader.has_populated_model(&ms) {
                    Ok(true) => {}
                    Ok(false) => {
                        if let Some(source) = model_source_for(&catalog, &reader, &ms, model_flux)
                        {
                            if let Err(e) = solver.populate_model(&ms, "", &source).await {
                                warn!(ms = %ms_path, "MODEL_DATA re-seed failed: {e}");
                            }
                        }
                        if !reader.has_populated_model(&ms).unwrap_or(false) {
                            return (
                                index,
                                Err(StageError::validation(format!(
                                    "MODEL_DATA could not be populated for {ms_path}"
                                ))),
                            );
                        }
                    }
                    Err(err) => return (index, Err(err)),
                }

                if let Some(parent) = artifacts.imgroot.parent() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        return (
                            index,
                            Err(StageError::transient(format!(
                                "create {}: {e}",
                                parent.display()
                            ))),
                        );
                    }
                }

                let outcome = runner
                    .run("imaging", deadline, || {
                        let imager = imager.clone();
                        let ms = ms.clone();
                        let imgroot = artifacts.imgroot.clone();
                        async move {
                            imager.image(&ms, &imgroot, &ImagingOptions::default()).await
                        }
                    })
                    .await;
                let result = match outcome {
                    StageOutcome::Ok(()) => {
                        if artifacts.any_exists() {
                            let _ = store.update_ms_stage(
                                &ms_path,
                                MsStage::Imaged,
                                None,
                                Some(&imgroot),
                            );
                            Ok(())
                        } else {
                            Err(StageError::validation(format!(
                                "imager reported success but produced no artifact for {ms_path}"
                            )))
                        }
                    }
                    StageOutcome::Failed(err) => Err(err),
                    StageOutcome::Skipped(reason) => {
                        Err(StageError::new(ErrorKind::CircuitOpen, reason))
                    }
                };
                (index, result)
            });
        }

        let mut succeeded = 0usize;
        let mut skipped_only = true;
        let mut failures: Vec<(usize, StageError)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {
                    succeeded += 1;
                }
                Ok((index, Err(err))) => {
                    if err.kind != ErrorKind::CircuitOpen {
                        skipped_only = false;
                    }
                    failures.push((index, err));
                }
                Err(join_err) => {
                    skipped_only = false;
                    failures.push((usize::MAX, StageError::transient(format!(
                        "imaging task aborted: {join_err}"
                    ))));
                }
            }
        }

        if succeeded >= threshold {
            let reason = if succeeded == total {
                format!("{succeeded}/{total} MS imaged")
            } else {
                let missing: Vec<String> = failures
                    .iter()
                    .filter_map(|(i, _)| paths.get(*i).cloned())
                    .collect();
                warn!(
                    group_id = %group.group_id,
                    succeeded,
                    total,
                    ?missing,
                    "accepting partially imaged group"
                );
                format!("{succeeded}/{total} MS imaged, missing: {}", missing.join(","))
            };
            self.progress(group, GroupStatus::Imaged, &reason)
        } else if skipped_only && !failures.is_empty() {
            Ok(AdvanceOutcome::Unchanged(
                "imaging deferred: circuit open".into(),
            ))
        } else {
            let detail = failures
                .first()
                .map(|(_, e)| e.message.clone())
                .unwrap_or_default();
            self.fail(
                group,
                &StageError::permanent(format!(
                    "imaging succeeded for only {succeeded}/{total} MS \
                     (minimum {threshold}); first failure: {detail}"
                )),
                self.config.stages.imaging.max_attempts as i64,
            )
        }
    }

    /// Apply calibration to every MS in the group that still needs it.
    /// Idempotent: applied-and-organized MS are skipped.
    async fn ensure_applied(
        &self,
        group: &MosaicGroup,
        deadline: Deadline,
    ) -> Result<ApplyResult> {
        let anchor = group.calibration_ms_path.clone().unwrap_or_default();
        let semaphore = Arc::new(Semaphore::new(self.config.scheduler.worker_pool.max(1)));
        let mut tasks: JoinSet<(usize, Result<String, StageError>)> = JoinSet::new();

        for (index, ms_path) in group.ms_paths.iter().enumerate() {
            let permit_source = semaphore.clone();
            let runner = self.runner.clone();
            let store = self.store.clone();
            let registry = self.registry.clone();
            let organizer = self.organizer.clone();
            let catalog = self.catalog.clone();
            let applier = self.collab.applier.clone();
            let solver = self.collab.solver.clone();
            let reader = self.reader;
            let ms_root = self.config.paths.ms_root.clone();
            let model_flux = self.config.calibration.model_flux_jy;
            let is_anchor = *ms_path == anchor;
            let ms_path = ms_path.clone();

            tasks.spawn(async move {
                let _permit = permit_source.acquire_owned().await;
                let result = apply_one(
                    &ms_path, is_anchor, &runner, &store, &registry, &organizer, &catalog,
                    applier, solver, reader, &ms_root, model_flux, deadline,
                )
                .await;
                (index, result)
            });
        }

        let mut new_paths: Vec<Option<String>> = vec![None; group.ms_paths.len()];
        let mut fatal: Option<StageError> = None;
        let mut retry: Option<String> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(path))) => new_paths[index] = Some(path),
                Ok((_, Err(err))) => match err.kind {
                    ErrorKind::CircuitOpen => {
                        retry.get_or_insert(err.message);
                    }
                    // Retry exhaustion already promoted the error; it must
                    // not be re-classified off its (transient) message text.
                    ErrorKind::Permanent => {
                        fatal.get_or_insert(err);
                    }
                    _ if is_retryable(&err) => {
                        retry.get_or_insert(err.message);
                    }
                    _ => {
                        fatal.get_or_insert(err);
                    }
                },
                Err(join_err) => {
                    retry.get_or_insert(format!("apply task aborted: {join_err}"));
                }
            }
        }

        // Record organized locations even on a partial pass; otherwise a
        // resumed tick would look the moved MS up under their old paths.
        let paths: Vec<String> = new_paths
            .into_iter()
            .zip(group.ms_paths.iter())
            .map(|(new, old)| new.unwrap_or_else(|| old.clone()))
            .collect();
        let csv = paths.join(",");
        if csv != group.ms_paths_csv() {
            self.store.set_group_ms_paths(&group.group_id, &csv)?;
        }

        if let Some(err) = fatal {
            return Ok(ApplyResult::Fatal(err));
        }
        if let Some(reason) = retry {
            return Ok(ApplyResult::Retry(reason));
        }
        Ok(ApplyResult::Applied(paths))
    }
}

/// Seed source for MODEL_DATA: the calibrator bound to this declination.
fn model_source_for(
    catalog: &crate::catalog::CalibratorCatalog,
    reader: &crate::msmeta::MsMetadataReader,
    ms: &Path,
    default_flux: f64,
) -> Option<ModelSource> {
    let dec = reader.mean_declination(ms).ok()?;
    let cal = catalog.for_declination(dec).ok()??;
    let flux = catalog
        .known_source(&cal.name)
        .map(|s| s.flux_jy_1400)
        .unwrap_or(default_flux);
    Some(ModelSource {
        name: cal.name,
        ra_deg: cal.ra_deg,
        dec_deg: cal.dec_deg,
        flux_jy: flux,
    })
}

#[allow(clippy::too_many_arguments)]
async fn apply_one(
    ms_path: &str,
    is_anchor: bool,
    runner: &crate::runner::StageRunner,
    store: &crate::store::StateStore,
    registry: &crate::registry::CalibrationRegistry,
    organizer: &crate::organizer::FileOrganizer,
    catalog: &crate::catalog::CalibratorCatalog,
    applier: Arc<dyn crate::external::CalibrationApplier>,
    solver: Arc<dyn crate::external::CalibrationSolver>,
    reader: crate::msmeta::MsMetadataReader,
    ms_root: &Path,
    model_flux: f64,
    deadline: Deadline,
) -> Result<String, StageError> {
    let entry = store
        .get_ms(ms_path)
        .map_err(|e| StageError::transient(format!("ms lookup: {e}")))?
        .ok_or_else(|| StageError::not_found(format!("no index row for {ms_path}")))?;

    // Already applied and already organized: nothing to do.
    if entry.cal_applied && Path::new(ms_path).starts_with(ms_root) {
        return Ok(ms_path.to_string());
    }

    let mid = entry.mid_mjd;
    let active = registry.active_at(mid)?;
    let mut tables: Vec<PathBuf> = Vec::new();
    for kind in CalKind::ALL {
        for set in active.get(&kind).map(|v| v.as_slice()).unwrap_or(&[]) {
            let dir = PathBuf::from(&set.table_path);
            if !table_artifact_ok(&dir) {
                return Err(StageError::new(
                    ErrorKind::MissingTable,
                    format!("calibration table missing on disk: {}", set.table_path),
                ));
            }
            tables.push(dir);
        }
    }
    if tables.is_empty() {
        return Err(StageError::new(
            ErrorKind::MissingTable,
            format!("no active calibration covers MJD {mid:.6} for {ms_path}"),
        ));
    }

    let ms = PathBuf::from(ms_path);
    let outcome = runner
        .run("calibration_apply", deadline, || {
            let applier = applier.clone();
            let ms = ms.clone();
            let tables = tables.clone();
            async move { applier.apply(&ms, "", &tables, true).await }
        })
        .await;
    match outcome {
        StageOutcome::Ok(()) => {}
        StageOutcome::Failed(err) => return Err(err),
        StageOutcome::Skipped(reason) => {
            return Err(StageError::new(ErrorKind::CircuitOpen, reason))
        }
    }

    let role = if is_anchor {
        MsRole::Calibrator
    } else {
        MsRole::Science
    };
    let organized = organizer.organize(&ms, role, mid)?;
    let organized_str = organized.to_string_lossy().into_owned();
    store
        .update_ms_stage(&organized_str, MsStage::Calibrated, Some(true), None)
        .map_err(|e| StageError::transient(format!("ms update: {e}")))?;

    // Give imaging a starting model right away; a failure here is survivable
    // because imaging re-seeds once more before running.
    if !reader.has_populated_model(&organized).unwrap_or(false) {
        if let Some(source) = model_source_for(catalog, &reader, &organized, model_flux) {
            if let Err(e) = solver.populate_model(&organized, "", &source).await {
                warn!(ms = %organized_str, "MODEL_DATA seeding failed: {e}");
            }
        }
    }

    info!(ms = %organized_str, n_tables = tables.len(), "applied calibration");
    Ok(organized_str)
}
