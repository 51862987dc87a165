//! Zenithal celestial projections behind the [`CelestialSolver`] seam.
//!
//! Pixel coordinates follow the FITS convention: the centre of the first
//! pixel is `(1, 1)`. Sky coordinates are longitude/latitude in degrees.

use std::fmt::Debug;

use glam::{DMat2, DVec2};
use strum_macros::{Display, EnumString};

use crate::header::Header;

/// The four operations the viewer needs from a WCS solver.
pub trait CelestialSolver: Debug + Send + Sync {
    /// Builds a solver from 80-column header cards. `None` when the cards do
    /// not describe a usable coordinate system.
    fn init(cards: &str) -> Option<Self>
    where
        Self: Sized;

    /// FITS pixel to `[lon, lat]` in degrees.
    fn pix2sky(&self, pixel: [f64; 2]) -> Option<[f64; 2]>;

    /// `[lon, lat]` in degrees to FITS pixel.
    fn sky2pix(&self, sky: [f64; 2]) -> Option<[f64; 2]>;

    fn has_celestial(&self) -> bool;
}

/// Supported zenithal projection codes, as found in `CTYPEi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Projection {
    /// Gnomonic.
    Tan,
    /// Orthographic.
    Sin,
    /// Zenithal equidistant.
    Arc,
    /// Stereographic.
    Stg,
    /// Zenithal equal-area.
    Zea,
}

impl Projection {
    /// Native latitude for a radial distance `r` on the projection plane.
    fn theta(self, r: f64) -> Option<f64> {
        let theta = match self {
            Projection::Tan => 1f64.atan2(r.to_radians()).to_degrees(),
            Projection::Sin => {
                let s = r.to_radians();
                if s > 1.0 {
                    return None;
                }
                s.acos().to_degrees()
            }
            Projection::Arc => {
                if r > 180.0 {
                    return None;
                }
                90.0 - r
            }
            Projection::Stg => 90.0 - 2.0 * (r.to_radians() / 2.0).atan().to_degrees(),
            Projection::Zea => {
                let s = r.to_radians() / 2.0;
                if s > 1.0 {
                    return None;
                }
                90.0 - 2.0 * s.asin().to_degrees()
            }
        };
        Some(theta)
    }

    /// Radial distance on the projection plane for native latitude `theta`.
    /// `None` where the projection is undefined.
    fn radius(self, theta: f64) -> Option<f64> {
        let colatitude = (90.0 - theta).to_radians();
        let r = match self {
            Projection::Tan => {
                if theta <= 0.0 {
                    return None;
                }
                theta.to_radians().cos() / theta.to_radians().sin()
            }
            Projection::Sin => {
                if theta < 0.0 {
                    return None;
                }
                theta.to_radians().cos()
            }
            Projection::Arc => colatitude,
            Projection::Stg => {
                if theta <= -90.0 {
                    return None;
                }
                2.0 * (colatitude / 2.0).tan()
            }
            Projection::Zea => 2.0 * (colatitude / 2.0).sin(),
        };
        Some(r.to_degrees())
    }
}

/// Built-in solver: linear transform, zenithal projection and spherical
/// rotation. Distortion terms (`-SIP`, `PVi_m`) are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionSolver {
    crpix: DVec2,
    crval: DVec2,
    linear: DMat2,
    inverse: DMat2,
    projection: Option<Projection>,
    lonpole: f64,
}

impl ProjectionSolver {
    pub fn projection(&self) -> Option<Projection> {
        self.projection
    }

    pub fn linear(&self) -> DMat2 {
        self.linear
    }

    /// Native spherical coordinates to celestial, all in degrees.
    fn native_to_celestial(&self, phi: f64, theta: f64) -> [f64; 2] {
        let (sin_theta, cos_theta) = theta.to_radians().sin_cos();
        let (sin_dp, cos_dp) = self.crval.y.to_radians().sin_cos();
        let (sin_dphi, cos_dphi) = (phi - self.lonpole).to_radians().sin_cos();

        let y = -cos_theta * sin_dphi;
        let x = sin_theta * cos_dp - cos_theta * sin_dp * cos_dphi;
        let sin_lat = sin_theta * sin_dp + cos_theta * cos_dp * cos_dphi;

        let lat = sin_lat.atan2(x.hypot(y)).to_degrees();
        let lon = (self.crval.x + y.atan2(x).to_degrees()).rem_euclid(360.0);
        [lon, lat]
    }

    fn celestial_to_native(&self, lon: f64, lat: f64) -> (f64, f64) {
        let (sin_lat, cos_lat) = lat.to_radians().sin_cos();
        let (sin_dp, cos_dp) = self.crval.y.to_radians().sin_cos();
        let (sin_da, cos_da) = (lon - self.crval.x).to_radians().sin_cos();

        let y = -cos_lat * sin_da;
        let x = sin_lat * cos_dp - cos_lat * sin_dp * cos_da;
        let sin_theta = sin_lat * sin_dp + cos_lat * cos_dp * cos_da;

        let theta = sin_theta.atan2(x.hypot(y)).to_degrees();
        let phi = self.lonpole + y.atan2(x).to_degrees();
        (phi, theta)
    }
}

impl CelestialSolver for ProjectionSolver {
    fn init(cards: &str) -> Option<Self> {
        let header = Header::parse_cards(cards);

        let distortion = distortion_keywords(&header);
        if !distortion.is_empty() {
            tracing::warn!(keywords = ?distortion, "distorted WCS is not supported");
            return None;
        }

        let linear = linear_part(&header)?;
        if linear.determinant() == 0.0 || !linear.determinant().is_finite() {
            tracing::debug!("singular WCS matrix");
            return None;
        }

        let projection = match (header.get_str("CTYPE1"), header.get_str("CTYPE2")) {
            (Some(lon), Some(lat)) => Some(celestial_projection(lon, lat)?),
            _ => None,
        };

        let crpix = DVec2::new(header.get_f64("CRPIX1")?, header.get_f64("CRPIX2")?);
        let crval = DVec2::new(header.get_f64("CRVAL1")?, header.get_f64("CRVAL2")?);
        let default_lonpole = if crval.y < 90.0 { 180.0 } else { 0.0 };
        let lonpole = header.get_f64("LONPOLE").unwrap_or(default_lonpole);

        Some(Self {
            crpix,
            crval,
            linear,
            inverse: linear.inverse(),
            projection,
            lonpole,
        })
    }

    fn pix2sky(&self, pixel: [f64; 2]) -> Option<[f64; 2]> {
        let projection = self.projection?;
        let plane = self.linear * (DVec2::from(pixel) - self.crpix);

        let r = plane.length();
        let phi = if r == 0.0 {
            0.0
        } else {
            plane.x.atan2(-plane.y).to_degrees()
        };
        let theta = projection.theta(r)?;

        let sky = self.native_to_celestial(phi, theta);
        sky.iter().all(|v| v.is_finite()).then_some(sky)
    }

    fn sky2pix(&self, [lon, lat]: [f64; 2]) -> Option<[f64; 2]> {
        let projection = self.projection?;
        let (phi, theta) = self.celestial_to_native(lon, lat);
        let r = projection.radius(theta)?;

        let (sin_phi, cos_phi) = phi.to_radians().sin_cos();
        let plane = DVec2::new(r * sin_phi, -r * cos_phi);
        let pixel = self.inverse * plane + self.crpix;
        pixel.is_finite().then_some(pixel.to_array())
    }

    fn has_celestial(&self) -> bool {
        self.projection.is_some()
    }
}

/// Pixel-to-plane matrix in degrees per pixel: `CDi_j` when present, else
/// `CDELTi · PCi_j`, else `CDELTi` rotated by `CROTA2`. `None` when no
/// scale can be derived.
pub(crate) fn linear_part(header: &Header) -> Option<DMat2> {
    let get = |key: &str| header.get_f64(key);
    let entry = |prefix: &str, i: usize, j: usize| get(&format!("{prefix}{i}_{j}"));

    let has_cd = (1..=2).any(|i| (1..=2).any(|j| entry("CD", i, j).is_some()));
    if has_cd {
        let cd = |i, j| entry("CD", i, j).unwrap_or(0.0);
        return Some(from_rows(cd(1, 1), cd(1, 2), cd(2, 1), cd(2, 2)));
    }

    let cdelt1 = get("CDELT1");
    let cdelt2 = get("CDELT2");
    let has_pc = (1..=2).any(|i| (1..=2).any(|j| entry("PC", i, j).is_some()));
    if has_pc {
        let pc = |i, j| entry("PC", i, j).unwrap_or(if i == j { 1.0 } else { 0.0 });
        let (s1, s2) = (cdelt1.unwrap_or(1.0), cdelt2.unwrap_or(1.0));
        return Some(from_rows(s1 * pc(1, 1), s1 * pc(1, 2), s2 * pc(2, 1), s2 * pc(2, 2)));
    }

    let (s1, s2) = (cdelt1?, cdelt2?);
    let (sin_rho, cos_rho) = get("CROTA2").unwrap_or(0.0).to_radians().sin_cos();
    Some(from_rows(
        s1 * cos_rho,
        -s2 * sin_rho,
        s1 * sin_rho,
        s2 * cos_rho,
    ))
}

/// Keywords that describe a non-linear correction this solver cannot apply:
/// a `CTYPE` distortion suffix such as `-SIP` or `-TPV`, SIP polynomial
/// cards, and non-zero `PVi_m` parameters.
pub(crate) fn distortion_keywords(header: &Header) -> Vec<String> {
    const SIP_PREFIXES: [&str; 4] = ["A_", "B_", "AP_", "BP_"];

    header
        .iter()
        .filter(|entry| {
            let key = entry.key.as_str();
            if key.starts_with("CTYPE") {
                return entry
                    .value
                    .as_str()
                    .and_then(|ctype| ctype.trim_end().get(8..))
                    .is_some_and(|suffix| !suffix.is_empty());
            }
            if SIP_PREFIXES.iter().any(|prefix| key.starts_with(prefix)) {
                return true;
            }
            is_pv_key(key) && !matches!(entry.value.as_f64(), Some(v) if v == 0.0)
        })
        .map(|entry| entry.key.clone())
        .collect()
}

/// `PVi_m`, with `i` and `m` decimal.
fn is_pv_key(key: &str) -> bool {
    let Some(rest) = key.strip_prefix("PV") else {
        return false;
    };
    let Some((axis, index)) = rest.split_once('_') else {
        return false;
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(axis) && digits(index)
}

fn from_rows(m11: f64, m12: f64, m21: f64, m22: f64) -> DMat2 {
    DMat2::from_cols(DVec2::new(m11, m21), DVec2::new(m12, m22))
}

/// Projection shared by a longitude/latitude `CTYPE` pair such as
/// `RA---TAN` / `DEC--TAN`. `None` for unsupported or mismatched codes.
fn celestial_projection(lon: &str, lat: &str) -> Option<Projection> {
    const LONGITUDES: [&str; 3] = ["RA--", "GLON", "ELON"];
    const LATITUDES: [&str; 3] = ["DEC-", "GLAT", "ELAT"];

    let axis = |ctype: &str| ctype.get(..4).map(str::to_ascii_uppercase);
    let code = |ctype: &str| ctype.get(5..8).map(str::to_ascii_uppercase);

    let lon_axis = axis(lon)?;
    let lat_axis = axis(lat)?;
    if !LONGITUDES.contains(&lon_axis.as_str()) || !LATITUDES.contains(&lat_axis.as_str()) {
        tracing::debug!(lon, lat, "unsupported celestial axes");
        return None;
    }

    let lon_code = code(lon)?;
    if code(lat)? != lon_code {
        tracing::debug!(lon, lat, "mismatched projection codes");
        return None;
    }
    match lon_code.parse() {
        Ok(projection) => Some(projection),
        Err(_) => {
            tracing::debug!(code = %lon_code, "unsupported projection");
            None
        }
    }
}
