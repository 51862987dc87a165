//! World coordinate system of one image.
//!
//! A [`Wcs`] keeps only the WCS keywords of a header, hands them to a
//! [`CelestialSolver`] as header cards, and answers coordinate queries.
//! Every query returns `None` when the solver could not be initialized, so
//! a viewer without a WCS keeps working in pixel-only mode.

mod solver;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use glam::DMat2;

use crate::header::Header;

pub use solver::{CelestialSolver, Projection, ProjectionSolver};

const HOURS_PER_DEGREE: f64 = 1.0 / 15.0;

#[derive(Debug, Clone, Default)]
pub struct Wcs {
    solver: Option<Arc<dyn CelestialSolver>>,
    linear: Option<DMat2>,
}

impl Wcs {
    /// Builds the coordinate system with the built-in projection solver.
    pub fn new(header: &Header) -> Self {
        Self::with_solver::<ProjectionSolver>(header)
    }

    pub fn with_solver<S: CelestialSolver + 'static>(header: &Header) -> Self {
        let subset = header.wcs_subset();
        let cards = subset.to_cards();

        let Some(instance) = S::init(&cards).filter(|s| s.has_celestial()) else {
            tracing::debug!(keywords = subset.len(), "no celestial WCS");
            return Self::default();
        };

        Self {
            solver: Some(Arc::new(instance)),
            linear: solver::linear_part(&subset),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.solver.is_some()
    }

    /// FITS pixel to `[ra_hours, dec_degrees]`.
    pub fn pix_to_world(&self, pixel: [f64; 2]) -> Option<[f64; 2]> {
        let [ra, dec] = self.solver.as_ref()?.pix2sky(pixel)?;
        Some([ra * HOURS_PER_DEGREE, dec])
    }

    /// `[ra_hours, dec_degrees]` to FITS pixel.
    pub fn world_to_pix(&self, [ra_hours, dec]: [f64; 2]) -> Option<[f64; 2]> {
        self.solver.as_ref()?.sky2pix([ra_hours * 15.0, dec])
    }

    /// The 2×2 pixel-to-plane matrix, in degrees per pixel.
    pub fn linear(&self) -> Option<DMat2> {
        self.solver.as_ref()?;
        self.linear
    }

    /// Mean of the diagonal terms of the linear part, in degrees per pixel.
    pub fn pixel_scale(&self) -> Option<f64> {
        let [m11, _, _, m22] = self.matrix()?;
        Some((m11.abs() + m22.abs()) / 2.0)
    }

    /// True when the linear part mirrors the image (negative determinant).
    pub fn is_flipped(&self) -> Option<bool> {
        let [m11, m12, m21, m22] = self.matrix()?;
        Some(m11 * m22 - m12 * m21 < 0.0)
    }

    /// Rotation of the image in degrees, in `[0, 360)`.
    pub fn position_angle(&self) -> Option<f64> {
        let [_, m12, _, m22] = self.matrix()?;
        Some(m12.atan2(m22).to_degrees().rem_euclid(360.0))
    }

    /// Whether the rectangle spanned by this image's `(0, 0)` and
    /// `(width, height)` corners lands on `other`'s pixel grid.
    pub fn has_overlap(&self, size: [f64; 2], other: &Wcs, other_size: [f64; 2]) -> bool {
        let corner = |pixel: [f64; 2]| {
            self.pix_to_world(pixel)
                .and_then(|world| other.world_to_pix(world))
        };
        let (Some(a), Some(b)) = (corner([0.0, 0.0]), corner(size)) else {
            return false;
        };

        let (x1, x2) = (a[0].min(b[0]), a[0].max(b[0]));
        let (y1, y2) = (a[1].min(b[1]), a[1].max(b[1]));
        x1 < other_size[0] && x2 > 0.0 && y1 < other_size[1] && y2 > 0.0
    }

    /// Row-major `[m11, m12, m21, m22]`.
    fn matrix(&self) -> Option<[f64; 4]> {
        let m = self.linear()?;
        Some([m.x_axis.x, m.y_axis.x, m.x_axis.y, m.y_axis.y])
    }
}
