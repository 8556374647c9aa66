//! MJD and sidereal-time arithmetic for transit scheduling.
//!
//! Bandpass validity windows are centered on the calibrator's meridian
//! transit, which occurs when local sidereal time equals the source's right
//! ascension. All times are Modified Julian Dates in UTC days.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, StageError, StageResult};

/// Unix epoch expressed as MJD.
const MJD_UNIX_EPOCH: f64 = 40587.0;

/// J2000.0 epoch expressed as MJD.
const MJD_J2000: f64 = 51544.5;

/// Sidereal rate: degrees of GMST advance per UT day.
const SIDEREAL_RATE_DEG_PER_DAY: f64 = 360.985_647_366_29;

/// Observing site; longitude is east-positive degrees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservatoryLocation {
    pub name: String,
    pub longitude_deg: f64,
    pub latitude_deg: f64,
}

impl Default for ObservatoryLocation {
    fn default() -> Self {
        // DSA-110 site at Owens Valley Radio Observatory.
        Self {
            name: "OVRO".into(),
            longitude_deg: -118.2817,
            latitude_deg: 37.2339,
        }
    }
}

/// Greenwich mean sidereal time in degrees, wrapped to [0, 360).
pub fn gmst_deg(mjd: f64) -> f64 {
    let d = mjd - MJD_J2000;
    let gmst = 280.460_618_37 + SIDEREAL_RATE_DEG_PER_DAY * d;
    gmst.rem_euclid(360.0)
}

/// Local mean sidereal time in degrees at an east-positive longitude.
pub fn lst_deg(mjd: f64, longitude_deg: f64) -> f64 {
    (gmst_deg(mjd) + longitude_deg).rem_euclid(360.0)
}

/// Wrap an angle into (-180, +180] degrees.
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

impl ObservatoryLocation {
    /// MJD at which local sidereal time equals `ra_deg`, nearest to `at_mjd`.
    ///
    /// The hour angle is wrapped into (-180, +180] degrees before conversion
    /// to days, then refined against the sidereal rate until the residual is
    /// far below one second.
    pub fn transit_mjd(&self, ra_deg: f64, at_mjd: f64) -> StageResult<f64> {
        if !ra_deg.is_finite() || !at_mjd.is_finite() {
            return Err(StageError::new(
                ErrorKind::Validation,
                format!("non-finite transit inputs: ra={ra_deg}, mjd={at_mjd}"),
            ));
        }

        let mut transit = at_mjd;
        // Converges in two rounds; the bound guards degenerate inputs.
        for _ in 0..5 {
            let ha = wrap_degrees(ra_deg - lst_deg(transit, self.longitude_deg));
            transit += ha / SIDEREAL_RATE_DEG_PER_DAY;
            if ha.abs() < 1e-9 {
                break;
            }
        }
        Ok(transit)
    }
}

/// Symmetric MJD window around `mid`.
pub fn mjd_range(mid: f64, half_width_secs: f64) -> (f64, f64) {
    let half_days = half_width_secs / 86_400.0;
    (mid - half_days, mid + half_days)
}

pub fn mjd_to_datetime(mjd: f64) -> DateTime<Utc> {
    let secs = (mjd - MJD_UNIX_EPOCH) * 86_400.0;
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// UTC calendar date (`YYYY-MM-DD`) for directory partitioning.
pub fn mjd_to_date_string(mjd: f64) -> String {
    mjd_to_datetime(mjd).format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gmst_at_j2000_noon() {
        // GMST at 2000-01-01 12:00 UT is 280.46062 degrees.
        let gmst = gmst_deg(MJD_J2000);
        assert!((gmst - 280.460_618_37).abs() < 1e-6, "gmst={gmst}");
    }

    #[test]
    fn wrap_degrees_range() {
        assert_eq!(wrap_degrees(0.0), 0.0);
        assert_eq!(wrap_degrees(180.0), 180.0);
        assert!((wrap_degrees(181.0) + 179.0).abs() < 1e-12);
        assert!((wrap_degrees(-190.0) - 170.0).abs() < 1e-12);
        assert!((wrap_degrees(725.0) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn transit_is_nearest_and_exact() {
        let site = ObservatoryLocation::default();
        let at = 60000.25;
        let transit = site.transit_mjd(128.5, at).unwrap();

        // Nearest transit is within half a sidereal day.
        assert!((transit - at).abs() <= 0.5);

        // At the solution, LST equals the RA to well under a second of time.
        let lst = lst_deg(transit, site.longitude_deg);
        let residual_deg = wrap_degrees(128.5 - lst).abs();
        // 1 second of time is ~0.004 degrees of sidereal rotation.
        assert!(residual_deg < 0.001, "residual={residual_deg}");
    }

    #[test]
    fn transit_rejects_nan() {
        let site = ObservatoryLocation::default();
        let err = site.transit_mjd(f64::NAN, 60000.0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn mjd_window_and_date() {
        let (start, end) = mjd_range(60000.0, 1800.0);
        assert!((end - start - 3600.0 / 86400.0).abs() < 1e-12);
        // MJD 60000 is 2023-02-25.
        assert_eq!(mjd_to_date_string(60000.0), "2023-02-25");
    }
}
