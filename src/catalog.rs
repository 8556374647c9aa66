//! Bandpass-calibrator catalog.
//!
//! Declination-indexed bindings live in the state store; a small built-in
//! list of standard flux calibrators backs auto-registration when a group
//! arrives at a declination no operator has bound yet.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::CatalogConfig;
use crate::errors::{ErrorKind, StageError, StageResult};
use crate::models::BandpassCalibrator;
use crate::msmeta::MsMetadataReader;
use crate::store::StateStore;

/// Known source usable for bandpass solving.
#[derive(Debug, Clone, Copy)]
pub struct KnownSource {
    pub name: &'static str,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub flux_jy_1400: f64,
}

/// Standard calibrators, positions J2000, fluxes at 1.4 GHz.
pub const KNOWN_SOURCES: &[KnownSource] = &[
    KnownSource { name: "3C48", ra_deg: 24.4221, dec_deg: 33.1598, flux_jy_1400: 16.0 },
    KnownSource { name: "3C138", ra_deg: 80.2912, dec_deg: 16.6395, flux_jy_1400: 8.5 },
    KnownSource { name: "3C147", ra_deg: 85.6505, dec_deg: 49.8520, flux_jy_1400: 22.5 },
    KnownSource { name: "3C196", ra_deg: 123.4001, dec_deg: 48.2174, flux_jy_1400: 14.0 },
    KnownSource { name: "0834+555", ra_deg: 129.5639, dec_deg: 55.3542, flux_jy_1400: 8.0 },
    KnownSource { name: "3C286", ra_deg: 202.7845, dec_deg: 30.5091, flux_jy_1400: 15.0 },
    KnownSource { name: "3C295", ra_deg: 212.8360, dec_deg: 52.2025, flux_jy_1400: 22.0 },
    KnownSource { name: "3C380", ra_deg: 277.3824, dec_deg: 48.7462, flux_jy_1400: 14.5 },
];

/// Great-circle separation in degrees.
pub fn angular_separation_deg(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let (ra1, dec1, ra2, dec2) = (
        ra1.to_radians(),
        dec1.to_radians(),
        ra2.to_radians(),
        dec2.to_radians(),
    );
    let sin_half_ddec = ((dec2 - dec1) / 2.0).sin();
    let sin_half_dra = ((ra2 - ra1) / 2.0).sin();
    let h = sin_half_ddec * sin_half_ddec
        + dec1.cos() * dec2.cos() * sin_half_dra * sin_half_dra;
    2.0 * h.sqrt().asin().to_degrees()
}

pub struct CalibratorCatalog {
    store: Arc<StateStore>,
    reader: MsMetadataReader,
    config: CatalogConfig,
}

impl CalibratorCatalog {
    pub fn new(store: Arc<StateStore>, config: CatalogConfig) -> Self {
        Self {
            store,
            reader: MsMetadataReader,
            config,
        }
    }

    /// Active binding covering `dec_deg`, newest registration wins.
    pub fn for_declination(&self, dec_deg: f64) -> StageResult<Option<BandpassCalibrator>> {
        self.store
            .calibrator_for_dec(dec_deg)
            .map_err(|e| StageError::transient(format!("calibrator lookup: {e}")))
    }

    /// Register a binding with the given Dec half-range, deactivating
    /// overlapping active bindings.
    pub fn register(
        &self,
        name: &str,
        ra_deg: f64,
        dec_deg: f64,
        dec_tolerance_deg: f64,
        notes: Option<String>,
    ) -> StageResult<BandpassCalibrator> {
        if name.trim().is_empty() {
            return Err(StageError::validation("calibrator name must be non-empty"));
        }
        if !ra_deg.is_finite() || !dec_deg.is_finite() || !dec_tolerance_deg.is_finite() {
            return Err(StageError::validation(format!(
                "non-finite calibrator coordinates for {name}"
            )));
        }
        let cal = BandpassCalibrator {
            name: name.to_string(),
            ra_deg,
            dec_deg,
            dec_range_min: dec_deg - dec_tolerance_deg,
            dec_range_max: dec_deg + dec_tolerance_deg,
            active: true,
            registered_at: 0,
            notes,
        };
        self.store
            .register_calibrator(&cal)
            .map_err(|e| StageError::transient(format!("register calibrator {name}: {e}")))?;
        info!(
            name,
            ra_deg,
            dec_deg,
            dec_range_min = cal.dec_range_min,
            dec_range_max = cal.dec_range_max,
            "registered bandpass calibrator"
        );
        Ok(cal)
    }

    /// Ensure some binding covers the declination of `ms_path`.
    ///
    /// When none exists and auto-registration is enabled, the MS fields are
    /// matched against the built-in source list within the search radius; on
    /// a hit the source is registered with the configured Dec tolerance.
    pub fn auto_register_if_missing(&self, ms_path: &Path) -> StageResult<BandpassCalibrator> {
        let dec_deg = self.reader.mean_declination(ms_path)?;
        if let Some(existing) = self.for_declination(dec_deg)? {
            return Ok(existing);
        }
        if !self.config.auto_register {
            return Err(StageError::new(
                ErrorKind::NoCalibrator,
                format!("no bandpass calibrator registered for Dec={dec_deg:.4}"),
            ));
        }

        info!(
            dec_deg,
            "no bandpass calibrator registered, attempting catalog auto-registration"
        );
        let fields = self.reader.fields(ms_path)?;
        let mut best: Option<(&KnownSource, f64)> = None;
        for source in KNOWN_SOURCES {
            for field in &fields {
                let sep =
                    angular_separation_deg(field.ra_deg, field.dec_deg, source.ra_deg, source.dec_deg);
                if sep <= self.config.search_radius_deg
                    && best.map(|(_, b)| sep < b).unwrap_or(true)
                {
                    best = Some((source, sep));
                }
            }
        }

        match best {
            Some((source, sep)) => {
                let cal = self.register(
                    source.name,
                    source.ra_deg,
                    source.dec_deg,
                    self.config.auto_dec_tolerance_deg,
                    Some(format!(
                        "auto-registered from catalog lookup for Dec={dec_deg:.4} \
                         (separation {sep:.3} deg, {} Jy at 1.4 GHz)",
                        source.flux_jy_1400
                    )),
                )?;
                Ok(cal)
            }
            None => {
                warn!(
                    dec_deg,
                    search_radius_deg = self.config.search_radius_deg,
                    "no catalog source within search radius of any field"
                );
                Err(StageError::new(
                    ErrorKind::NoCalibrator,
                    format!(
                        "no catalog calibrator within {:.1} deg of fields at Dec={dec_deg:.4}",
                        self.config.search_radius_deg
                    ),
                ))
            }
        }
    }

    /// Known-source entry for a registered binding, used to seed MODEL_DATA.
    pub fn known_source(&self, name: &str) -> Option<&'static KnownSource> {
        KNOWN_SOURCES.iter().find(|s| s.name == name)
    }
}
