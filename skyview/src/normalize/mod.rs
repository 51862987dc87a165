//! Pixel normalization: raw samples to packed RGBA through levels, a stretch
//! curve and a colour map.
//!
//! [`normalize`] is pure and deterministic, so it can run inline or on the
//! blocking worker with identical results. [`Normalization`] keeps the
//! rendered tiles of one layer in step with its source tiles and normalizer.

mod normalization;
mod normalizer;
mod stretch;


use num_traits::ToPrimitive;
use rayon::prelude::*;

use crate::color_map::ColorMap;
use crate::histogram::Levels;

pub use normalization::{Normalization, RenderJob, RenderResult};
pub use normalizer::{NormalizerMode, PixelNormalizer};
pub use stretch::StretchMode;

/// Number of pixels processed per parallel chunk.
const CHUNK_SIZE: usize = 4096;

/// Packed value written for samples without data.
pub const TRANSPARENT: u32 = 0x0000_0000;

const MAX_INDEX: f64 = u16::MAX as f64;

/// Everything the per-pixel loop needs, resolved once per render.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizeParams {
    background: f64,
    peak: f64,
    midtone: f64,
    stretch: StretchMode,
    invert: bool,
    scale: f64,
    offset: f64,
}

impl NormalizeParams {
    /// Orders the levels so background ≤ peak. Reversed levels, either given
    /// that way or through `inverted`, reverse the colour index instead.
    pub fn new(levels: &Levels, normalizer: &PixelNormalizer) -> Self {
        let (mut background, mut peak) = (levels.background, levels.peak);
        if normalizer.inverted {
            std::mem::swap(&mut background, &mut peak);
        }
        let invert = background > peak;
        if invert {
            std::mem::swap(&mut background, &mut peak);
        }

        let range = peak - background;
        let midtone = if range > 0.0 {
            ((levels.mid - background) / range).clamp(0.0, 1.0)
        } else {
            0.5
        };
        let midtone = if midtone.is_nan() { 0.5 } else { midtone };

        Self {
            background,
            peak,
            midtone,
            stretch: normalizer.stretch_mode,
            invert,
            scale: normalizer.layer_scale,
            offset: normalizer.layer_offset,
        }
    }

    pub fn background(&self) -> f64 {
        self.background
    }

    pub fn peak(&self) -> f64 {
        self.peak
    }

    pub fn midtone(&self) -> f64 {
        self.midtone
    }

    pub fn is_inverted(&self) -> bool {
        self.invert
    }

    /// Colour-map index of one raw sample, `None` for NaN.
    #[inline]
    fn color_index(&self, value: f64) -> Option<u16> {
        if value.is_nan() {
            return None;
        }
        let value = value * self.scale + self.offset;
        let range = self.peak - self.background;
        let t = if range > 0.0 {
            ((value - self.background) / range).clamp(0.0, 1.0)
        } else if value >= self.peak {
            1.0
        } else {
            0.0
        };
        let stretched = self.stretch.apply(t, self.midtone);
        let index = (stretched * MAX_INDEX).clamp(0.0, MAX_INDEX).floor() as u16;
        Some(if self.invert { u16::MAX - index } else { index })
    }
}

/// Packs 16-bit channels as `A<<24 | B<<16 | G<<8 | R` with opaque alpha.
#[inline]
pub fn pack_rgba([r, g, b]: [u16; 3]) -> u32 {
    0xFF00_0000 | (((b >> 8) as u32) << 16) | (((g >> 8) as u32) << 8) | (r >> 8) as u32
}

/// Normalizes `pixels` into `out`, one packed RGBA value per sample.
/// NaN samples become [`TRANSPARENT`].
///
/// # Panics
/// Panics if `pixels` and `out` differ in length.
pub fn normalize<T: ToPrimitive + Sync>(
    pixels: &[T],
    params: &NormalizeParams,
    color_map: &ColorMap,
    out: &mut [u32],
) {
    assert_eq!(pixels.len(), out.len(), "pixel and output buffers differ in length");

    let convert = |src: &[T], dst: &mut [u32]| {
        for (value, rgba) in src.iter().zip(dst.iter_mut()) {
            let index = params.color_index(value.to_f64().unwrap_or(f64::NAN));
            *rgba = index.map_or(TRANSPARENT, |i| pack_rgba(color_map.lookup_rgb(i)));
        }
    };

    if pixels.len() <= CHUNK_SIZE {
        convert(pixels, out);
        return;
    }
    out.par_chunks_mut(CHUNK_SIZE)
        .zip(pixels.par_chunks(CHUNK_SIZE))
        .for_each(|(dst, src)| convert(src, dst));
}
