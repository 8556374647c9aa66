//! Command-line collaborator implementations.
//!
//! Each capability shells out to a configured executable (typically a thin
//! CASA/WSClean wrapper script). Exit code 0 is success; anything else
//! surfaces the stderr tail as the error message, leaving retry
//! classification to the keyword matcher upstream.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{StageError, StageResult};

use super::{
    CalibrationApplier, CalibrationSolver, Converter, Imager, ImagingOptions, ModelSource,
    MosaicBuilder, PhotometryEngine, SolveOptions,
};

async fn run_tool(program: &str, args: &[String]) -> StageResult<String> {
    debug!(program, ?args, "invoking external tool");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| StageError::transient(format!("spawn {program}: {e}")))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("; ");
        Err(StageError::permanent(format!(
            "{program} exited with {}: {tail}",
            output.status
        )))
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub struct CommandConverter {
    pub program: String,
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(&self, start_mjd: f64, end_mjd: f64) -> StageResult<Vec<PathBuf>> {
        let stdout = run_tool(
            &self.program,
            &[
                "convert".into(),
                "--start-mjd".into(),
                format!("{start_mjd:.8}"),
                "--end-mjd".into(),
                format!("{end_mjd:.8}"),
            ],
        )
        .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }
}

pub struct CommandSolver {
    pub program: String,
}

#[async_trait]
impl CalibrationSolver for CommandSolver {
    async fn rephase_to_position(
        &self,
        ms: &Path,
        ra_deg: f64,
        dec_deg: f64,
        source_name: &str,
    ) -> StageResult<()> {
        run_tool(
            &self.program,
            &[
                "rephase".into(),
                "--ms".into(),
                path_arg(ms),
                "--ra-deg".into(),
                format!("{ra_deg:.6}"),
                "--dec-deg".into(),
                format!("{dec_deg:.6}"),
                "--source".into(),
                source_name.into(),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn populate_model(
        &self,
        ms: &Path,
        field: &str,
        source: &ModelSource,
    ) -> StageResult<()> {
        run_tool(
            &self.program,
            &[
                "populate-model".into(),
                "--ms".into(),
                path_arg(ms),
                "--field".into(),
                field.into(),
                "--source".into(),
                source.name.clone(),
                "--ra-deg".into(),
                format!("{:.6}", source.ra_deg),
                "--dec-deg".into(),
                format!("{:.6}", source.dec_deg),
                "--flux-jy".into(),
                format!("{:.3}", source.flux_jy),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn solve_bandpass(
        &self,
        ms: &Path,
        cal_field: &str,
        refant: &str,
        prefix: &Path,
        options: &SolveOptions,
    ) -> StageResult<Vec<PathBuf>> {
        let stdout = run_tool(
            &self.program,
            &[
                "solve-bandpass".into(),
                "--ms".into(),
                path_arg(ms),
                "--field".into(),
                cal_field.into(),
                "--refant".into(),
                refant.into(),
                "--prefix".into(),
                path_arg(prefix),
                "--model-standard".into(),
                options.model_standard.clone(),
                "--minsnr".into(),
                format!("{}", options.minsnr),
                "--uvrange".into(),
                options.uvrange.clone(),
            ],
        )
        .await?;
        Ok(stdout.lines().map(PathBuf::from).collect())
    }

    async fn solve_gains(
        &self,
        ms: &Path,
        cal_field: &str,
        refant: &str,
        bp_tables: &[PathBuf],
        prefix: &Path,
        options: &SolveOptions,
    ) -> StageResult<Vec<PathBuf>> {
        let mut args = vec![
            "solve-gains".into(),
            "--ms".into(),
            path_arg(ms),
            "--field".into(),
            cal_field.into(),
            "--refant".into(),
            refant.into(),
            "--prefix".into(),
            path_arg(prefix),
            "--t-short".into(),
            options.t_short.clone(),
        ];
        for table in bp_tables {
            args.push("--bp-table".into());
            args.push(path_arg(table));
        }
        let stdout = run_tool(&self.program, &args).await?;
        Ok(stdout.lines().map(PathBuf::from).collect())
    }
}

pub struct CommandApplier {
    pub program: String,
}

#[async_trait]
impl CalibrationApplier for CommandApplier {
    async fn apply(
        &self,
        ms: &Path,
        field: &str,
        gaintables: &[PathBuf],
        calwt: bool,
    ) -> StageResult<()> {
        let mut args = vec![
            "apply".into(),
            "--ms".into(),
            path_arg(ms),
            "--field".into(),
            field.into(),
            format!("--calwt={calwt}"),
        ];
        for table in gaintables {
            args.push("--gaintable".into());
            args.push(path_arg(table));
        }
        run_tool(&self.program, &args).await.map(|_| ())
    }
}

pub struct CommandImager {
    pub program: String,
}

#[async_trait]
impl Imager for CommandImager {
    async fn image(
        &self,
        ms: &Path,
        image_basename: &Path,
        options: &ImagingOptions,
    ) -> StageResult<()> {
        run_tool(
            &self.program,
            &[
                "image".into(),
                "--ms".into(),
                path_arg(ms),
                "--imagename".into(),
                path_arg(image_basename),
                "--quality-tier".into(),
                options.quality_tier.clone(),
                format!("--skip-fits={}", options.skip_fits),
            ],
        )
        .await
        .map(|_| ())
    }
}

pub struct CommandMosaicker {
    pub program: String,
}

#[async_trait]
impl MosaicBuilder for CommandMosaicker {
    async fn build(
        &self,
        image_paths: &[PathBuf],
        weight_paths: &[PathBuf],
        out_path: &Path,
    ) -> StageResult<()> {
        let mut args = vec!["build".into(), "--out".into(), path_arg(out_path)];
        for image in image_paths {
            args.push("--image".into());
            args.push(path_arg(image));
        }
        for weight in weight_paths {
            args.push("--weight".into());
            args.push(path_arg(weight));
        }
        run_tool(&self.program, &args).await.map(|_| ())
    }
}

pub struct CommandPhotometry {
    pub program: String,
}

#[async_trait]
impl PhotometryEngine for CommandPhotometry {
    async fn measure(&self, mosaic_path: &Path, aperture_arcsec: f64) -> StageResult<String> {
        let stdout = run_tool(
            &self.program,
            &[
                "measure".into(),
                "--mosaic".into(),
                path_arg(mosaic_path),
                "--aperture-arcsec".into(),
                format!("{aperture_arcsec}"),
            ],
        )
        .await?;
        Ok(stdout.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[tokio::test]
    async fn missing_program_is_transient() {
        let err = run_tool("/nonexistent/tool-xyz", &["convert".into()])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        // `sh -c` gives a portable failing tool.
        let err = run_tool("sh", &["-c".into(), "echo boom >&2; exit 3".into()])
            .await
            .unwrap_err();
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn successful_tool_returns_stdout() {
        let stdout = run_tool("sh", &["-c".into(), "printf '/a/x.ms\\n/a/y.ms\\n'".into()])
            .await
            .unwrap();
        assert_eq!(stdout, "/a/x.ms\n/a/y.ms\n");
    }
}
