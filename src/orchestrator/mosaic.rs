//! Mosaic validation, assembly, and publishing hand-off.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{error, info, warn};

use crate::artifacts::{mosaic_id_for_group, mosaic_paths, ImageArtifacts};
use crate::errors::StageError;
use crate::models::{GroupStatus, MosaicGroup};
use crate::runner::{Deadline, StageOutcome};

use super::{AdvanceOutcome, Orchestrator};

impl Orchestrator {
    /// `imaged -> mosaicking`: tiles must be chronological and backed by an
    /// image artifact on disk.
    pub(super) fn validate_for_mosaic(&self, group: &MosaicGroup) -> Result<AdvanceOutcome> {
        // Chronological ordering guards against mosaic artifacts from
        // shuffled tiles; violations are repaired, not fatal.
        let mut with_time: Vec<(f64, String)> = Vec::with_capacity(group.ms_paths.len());
        for path in &group.ms_paths {
            match self.reader.time_range(Path::new(path)) {
                Ok((_, mid, _)) => with_time.push((mid, path.clone())),
                Err(err) => {
                    warn!(path = %path, "could not read MS time for ordering check: {err}");
                    with_time.push((f64::INFINITY, path.clone()));
                }
            }
        }
        let sorted = with_time.windows(2).all(|w| w[0].0 <= w[1].0);
        let ordered_paths: Vec<String> = if sorted {
            group.ms_paths.clone()
        } else {
            error!(
                group_id = %group.group_id,
                "MS paths are not in chronological order, re-sorting"
            );
            with_time.sort_by(|a, b| a.0.total_cmp(&b.0));
            let paths: Vec<String> = with_time.into_iter().map(|(_, p)| p).collect();
            self.store
                .set_group_ms_paths(&group.group_id, &paths.join(","))?;
            paths
        };

        let mut available = 0usize;
        let mut missing: Vec<String> = Vec::new();
        for path in &ordered_paths {
            let artifacts = ImageArtifacts::for_ms(&self.config.paths.images_dir, Path::new(path));
            if artifacts.any_exists() {
                available += 1;
            } else {
                missing.push(path.clone());
            }
        }
        let total = ordered_paths.len();
        let threshold = (self.config.scheduler.imaging_success_fraction * total as f64).ceil()
            as usize;
        if available < threshold.max(1) {
            return self.fail(
                group,
                &StageError::validation(format!(
                    "only {available}/{total} image artifacts exist, need {threshold}"
                )),
                0,
            );
        }
        if !missing.is_empty() {
            warn!(
                group_id = %group.group_id,
                ?missing,
                "mosaicking without tiles for some MS"
            );
        }
        self.progress(
            group,
            GroupStatus::Mosaicking,
            &format!("{available}/{total} tiles validated"),
        )
    }

    /// `mosaicking -> completed`: build the weighted mosaic, register it with
    /// the data registry, optionally enqueue photometry, then finish the
    /// group in one transactional write.
    pub(super) async fn mosaic_stage(
        &self,
        group: &MosaicGroup,
        deadline: Deadline,
    ) -> Result<AdvanceOutcome> {
        let mosaic_id = mosaic_id_for_group(&group.group_id);
        let (image_path, fits_path) =
            mosaic_paths(&self.config.paths.mosaics_dir, &mosaic_id);

        let mut images: Vec<PathBuf> = Vec::new();
        let mut weights: Vec<PathBuf> = Vec::new();
        let mut issues: Vec<String> = Vec::new();
        for path in &group.ms_paths {
            let artifacts = ImageArtifacts::for_ms(&self.config.paths.images_dir, Path::new(path));
            match artifacts.existing_image() {
                Some(image) => {
                    let pb = artifacts.pb_weight();
                    if pb.exists() {
                        weights.push(pb);
                    } else {
                        issues.push(format!("no primary-beam artifact for {path}"));
                    }
                    images.push(image);
                }
                None => issues.push(format!("no image artifact for {path}")),
            }
        }
        if images.is_empty() {
            return self.fail(
                group,
                &StageError::validation("no image artifacts available for mosaic"),
                0,
            );
        }

        // Skip the build when a prior run already produced the artifact.
        if fits_path.exists() || image_path.exists() {
            info!(group_id = %group.group_id, mosaic_id = %mosaic_id, "mosaic artifact already exists, skipping build");
        } else {
            if let Err(e) = std::fs::create_dir_all(&self.config.paths.mosaics_dir) {
                return self.soft_fail(
                    group,
                    StageError::transient(format!("create mosaics dir: {e}")),
                );
            }
            let mosaicker = self.collab.mosaicker.clone();
            let outcome = self
                .runner
                .run("mosaicking", deadline, || {
                    let mosaicker = mosaicker.clone();
                    let images = images.clone();
                    let weights = weights.clone();
                    let out = image_path.clone();
                    async move { mosaicker.build(&images, &weights, &out).await }
                })
                .await;
            match outcome {
                StageOutcome::Ok(()) => {
                    if !fits_path.exists() && !image_path.exists() {
                        return self.fail(
                            group,
                            &StageError::validation(
                                "mosaic builder reported success but produced no artifact",
                            ),
                            0,
                        );
                    }
                }
                StageOutcome::Failed(err) => {
                    return self.fail(
                        group,
                        &err,
                        self.config.stages.mosaicking.max_attempts as i64,
                    )
                }
                StageOutcome::Skipped(reason) => return Ok(AdvanceOutcome::Unchanged(reason)),
            }
        }
        let final_path = if fits_path.exists() {
            fits_path.clone()
        } else {
            image_path.clone()
        };
        self.store.set_group_mosaic(&group.group_id, &mosaic_id)?;

        // Publishing hand-off: register the product, then finalize with the
        // QA verdict. Warnings are stored but block auto-publish downstream.
        let (start_mjd, end_mjd) = self.group_time_bounds(group);
        let mut metadata = serde_json::json!({
            "group_id": group.group_id,
            "mosaic_id": mosaic_id,
            "n_images": images.len(),
            "image_paths": images.iter().map(|p| p.to_string_lossy()).collect::<Vec<_>>(),
            "ms_paths": group.ms_paths,
            "start_mjd": start_mjd,
            "end_mjd": end_mjd,
        });
        if !issues.is_empty() {
            metadata["validation_issues"] = serde_json::json!(issues);
        }
        if let Err(err) = self
            .collab
            .data_registry
            .register("mosaic", &mosaic_id, &final_path, metadata, true)
            .await
        {
            return self.soft_fail(group, err);
        }
        let qa_status = if issues.is_empty() { "passed" } else { "warning" };
        if let Err(err) = self
            .collab
            .data_registry
            .finalize(&mosaic_id, qa_status, "validated")
            .await
        {
            return self.soft_fail(group, err);
        }

        if self.config.photometry.enabled {
            if let Some(photometry) = &self.collab.photometry {
                let photometry = photometry.clone();
                let aperture = self.config.photometry.aperture_arcsec;
                let mosaic_path = final_path.clone();
                let outcome = self
                    .runner
                    .run("photometry", deadline, || {
                        let photometry = photometry.clone();
                        let mosaic_path = mosaic_path.clone();
                        async move { photometry.measure(&mosaic_path, aperture).await }
                    })
                    .await;
                match outcome {
                    StageOutcome::Ok(job_id) => {
                        info!(group_id = %group.group_id, job_id = %job_id, "photometry enqueued");
                    }
                    StageOutcome::Failed(err) => {
                        warn!(group_id = %group.group_id, "photometry failed (non-fatal): {err}");
                    }
                    StageOutcome::Skipped(reason) => {
                        warn!(group_id = %group.group_id, reason = %reason, "photometry skipped");
                    }
                }
            }
        }

        self.progress(
            group,
            GroupStatus::Completed,
            &format!("mosaic {mosaic_id} ({qa_status})"),
        )
    }

    fn group_time_bounds(&self, group: &MosaicGroup) -> (Option<f64>, Option<f64>) {
        let first = group
            .ms_paths
            .first()
            .and_then(|p| self.reader.time_range(Path::new(p)).ok())
            .map(|(start, _, _)| start);
        let last = group
            .ms_paths
            .last()
            .and_then(|p| self.reader.time_range(Path::new(p)).ok())
            .map(|(_, _, end)| end);
        (first, last)
    }
}
