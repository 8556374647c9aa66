//! Artifact naming for per-MS images and mosaics.
//!
//! The imager may be WSClean-flavoured (FITS outputs) or CASA-flavoured
//! (.pbcor/.image directories); downstream code accepts any of the three,
//! preferring FITS.

use std::path::{Path, PathBuf};

/// Expected outputs of imaging one MS, derived from the MS basename.
#[derive(Debug, Clone)]
pub struct ImageArtifacts {
    /// Image root without extension, e.g. `<images_dir>/<ms_stem>`.
    pub imgroot: PathBuf,
}

impl ImageArtifacts {
    pub fn for_ms(images_dir: &Path, ms_path: &Path) -> Self {
        let stem = ms_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".into());
        Self {
            imgroot: images_dir.join(stem),
        }
    }

    /// WSClean primary-beam-corrected FITS.
    pub fn pbcor_fits(&self) -> PathBuf {
        append_to_name(&self.imgroot, "-image-pb.fits")
    }

    /// CASA primary-beam-corrected image directory.
    pub fn pbcor(&self) -> PathBuf {
        append_to_name(&self.imgroot, ".pbcor")
    }

    /// Uncorrected CASA image directory.
    pub fn image(&self) -> PathBuf {
        append_to_name(&self.imgroot, ".image")
    }

    /// Primary-beam response map used as the mosaic weight.
    pub fn pb_weight(&self) -> PathBuf {
        append_to_name(&self.imgroot, "-pb.fits")
    }

    /// First existing image artifact in preference order, if any.
    pub fn existing_image(&self) -> Option<PathBuf> {
        [self.pbcor_fits(), self.pbcor(), self.image()]
            .into_iter()
            .find(|p| p.exists())
    }

    pub fn any_exists(&self) -> bool {
        self.existing_image().is_some()
    }
}

/// Mosaic id derived from the group id.
pub fn mosaic_id_for_group(group_id: &str) -> String {
    format!("mosaic_{}", group_id.trim_start_matches("group_"))
}

/// Mosaic artifact paths: the builder writes the CASA image path; a FITS
/// export may appear alongside and is preferred when present.
pub fn mosaic_paths(mosaics_dir: &Path, mosaic_id: &str) -> (PathBuf, PathBuf) {
    (
        mosaics_dir.join(format!("{mosaic_id}.image")),
        mosaics_dir.join(format!("{mosaic_id}.fits")),
    )
}

fn append_to_name(root: &Path, suffix: &str) -> PathBuf {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    root.with_file_name(format!("{name}{suffix}"))
}
