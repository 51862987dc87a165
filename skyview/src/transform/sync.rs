use glam::DVec2;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::wcs::Wcs;

use super::Transform;

/// How synchronized viewers follow the reference viewer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Align on sky position through both images' WCS.
    #[default]
    Sky,
    /// Copy the reference transforms as they are.
    Pixel,
}

/// Geometry of one viewer taking part in synchronization.
#[derive(Debug, Clone, Copy)]
pub struct SyncView<'a> {
    pub image_transform: Transform,
    pub viewport_transform: Transform,
    pub viewport_size: DVec2,
    pub image_size: DVec2,
    pub wcs: &'a Wcs,
}

/// New `(image_transform, viewport_transform)` for `target` so it shows what
/// `reference` shows.
///
/// In sky mode with both coordinate systems valid, the target image is
/// mapped onto the reference image through the two WCS linear parts and
/// the viewport is recentred for the target's viewport size; a target that
/// does not overlap the reference on the sky keeps its transforms. Without
/// a usable WCS on either side, and in pixel mode, the reference transforms
/// are copied.
pub fn sync_transforms(
    mode: SyncMode,
    reference: &SyncView<'_>,
    target: &SyncView<'_>,
) -> (Transform, Transform) {
    let copied = (reference.image_transform, reference.viewport_transform);
    match mode {
        SyncMode::Pixel => copied,
        SyncMode::Sky => {
            if !(reference.wcs.is_valid() && target.wcs.is_valid()) {
                return copied;
            }
            sky_aligned(reference, target)
                .unwrap_or((target.image_transform, target.viewport_transform))
        }
    }
}

fn sky_aligned(reference: &SyncView<'_>, target: &SyncView<'_>) -> Option<(Transform, Transform)> {
    let overlaps = reference.wcs.has_overlap(
        reference.image_size.to_array(),
        target.wcs,
        target.image_size.to_array(),
    );
    if !overlaps {
        tracing::debug!("sync target does not overlap the reference");
        return None;
    }

    let reference_linear = Transform::from_linear(reference.wcs.linear()?);
    let target_linear = Transform::from_linear(target.wcs.linear()?);
    let origin_world = reference.wcs.pix_to_world([0.0, 0.0])?;
    let origin_pixels = DVec2::from(target.wcs.world_to_pix(origin_world)?);

    let target_to_reference = reference_linear
        .invert()?
        .append(&target_linear)
        .translate(-origin_pixels);
    let image = reference.image_transform.append(&target_to_reference);

    let mut viewport = reference.viewport_transform;
    let recentre = (target.viewport_size - reference.viewport_size) / 2.0;
    viewport.tx += recentre.x;
    viewport.ty += recentre.y;

    Some((image, viewport))
}
