//! 2D affine transforms for pan, zoom, rotation and viewer synchronization.
//!
//! A [`Transform`] maps `x' = a·x + c·y + tx`, `y' = b·x + d·y + ty`.
//! Composition follows the "append" convention: `a.append(&b)` applies `b`
//! first, then `a`. Local edits (`translate`, `scale_about`, `rotate_about`)
//! are appended the same way, so they act in the transform's input space.

mod sync;


use glam::{DAffine2, DMat2, DVec2};
use serde::{Deserialize, Serialize};

use crate::tiles::Region;

pub use sync::{sync_transforms, SyncMode, SyncView};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self::new(1.0, 0.0, 0.0, 1.0, 0.0, 0.0);

    pub const fn new(a: f64, b: f64, c: f64, d: f64, tx: f64, ty: f64) -> Self {
        Self { a, b, c, d, tx, ty }
    }

    pub fn identity() -> Self {
        Self::IDENTITY
    }

    /// Pure linear map, no translation.
    pub fn from_linear(m: DMat2) -> Self {
        Self::from_affine(DAffine2::from_mat2(m))
    }

    pub fn from_translation(offset: DVec2) -> Self {
        Self::from_affine(DAffine2::from_translation(offset))
    }

    pub fn from_affine(affine: DAffine2) -> Self {
        let [a, b, c, d, tx, ty] = affine.to_cols_array();
        Self::new(a, b, c, d, tx, ty)
    }

    pub fn to_affine(&self) -> DAffine2 {
        DAffine2::from_cols_array(&[self.a, self.b, self.c, self.d, self.tx, self.ty])
    }

    /// `self ∘ other`: applies `other` first.
    pub fn append(&self, other: &Transform) -> Transform {
        Self::from_affine(self.to_affine() * other.to_affine())
    }

    /// `None` when the linear part is singular.
    pub fn invert(&self) -> Option<Transform> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        Some(Self::from_affine(self.to_affine().inverse()))
    }

    pub fn determinant(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }

    pub fn apply(&self, point: DVec2) -> DVec2 {
        self.to_affine().transform_point2(point)
    }

    pub fn translate(&self, offset: DVec2) -> Transform {
        self.append(&Self::from_translation(offset))
    }

    /// Scales by `factor` around `anchor`, which stays fixed.
    pub fn scale_about(&self, factor: DVec2, anchor: DVec2) -> Transform {
        let local = DAffine2::from_translation(anchor)
            * DAffine2::from_scale(factor)
            * DAffine2::from_translation(-anchor);
        self.append(&Self::from_affine(local))
    }

    /// Rotates by `degrees` around `anchor`, which stays fixed.
    pub fn rotate_about(&self, degrees: f64, anchor: DVec2) -> Transform {
        let local = DAffine2::from_translation(anchor)
            * DAffine2::from_angle(degrees.to_radians())
            * DAffine2::from_translation(-anchor);
        self.append(&Self::from_affine(local))
    }

    /// Length of the transformed unit x axis: the zoom of a transform
    /// without shear.
    pub fn scale_factor(&self) -> f64 {
        self.a.hypot(self.b)
    }
}

/// Image→viewport transform of a viewer: the viewport transform applied
/// after the image transform.
pub fn image_to_viewport(viewport: &Transform, image: &Transform) -> Transform {
    viewport.append(image)
}

/// The part of the image visible through the viewport, in image
/// coordinates and clamped to `[0.5, size + 0.5]`. It feeds
/// [`crate::tiles::TiledImage::find_tiles`].
///
/// `None` when the transform is singular or nothing of the image is visible.
pub fn viewport_region(
    image_to_viewport: &Transform,
    viewport_size: DVec2,
    image_size: DVec2,
) -> Option<Region> {
    let inverse = image_to_viewport.invert()?;
    let corners = [
        DVec2::new(0.5, 0.5),
        DVec2::new(viewport_size.x + 0.5, 0.5),
        DVec2::new(0.5, viewport_size.y + 0.5),
        viewport_size + 0.5,
    ]
    .map(|corner| inverse.apply(corner) + 0.5);

    let min = corners.iter().fold(DVec2::INFINITY, |acc, c| acc.min(*c));
    let max = corners.iter().fold(DVec2::NEG_INFINITY, |acc, c| acc.max(*c));

    let left = min.max(DVec2::splat(0.5));
    let right = max.min(image_size + 0.5);
    let extent = right - left;
    if !(extent.x > 0.0 && extent.y > 0.0) {
        return None;
    }
    Some(Region::new(left.x, left.y, extent.x, extent.y))
}
