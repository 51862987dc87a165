//! Blending of rendered layers into one displayable RGBA buffer.
//!
//! Layers are stacked bottom to top. The bottom visible layer is copied as
//! is; each layer above it is blended in with its own mode and alpha. A 3×3
//! channel mixer is applied to the result last.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Number of pixels processed per parallel chunk.
const CHUNK_SIZE: usize = 4096;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum BlendMode {
    /// `result = base + alpha * (top - base)`
    #[default]
    Normal,
    /// `result = 1 - (1 - base) * (1 - top)`
    Screen,
    /// Hue and saturation of the base with the value of the top layer.
    Luminosity,
}

/// One rendered layer as input to [`compose`].
#[derive(Debug, Clone, Copy)]
pub struct CompositeLayer<'a> {
    pub rgba: &'a [u32],
    pub blend_mode: BlendMode,
    pub alpha: f64,
    pub visible: bool,
}

/// Output channel weights: `out[c] = Σ matrix[c][k] * in[k]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelMixer(pub [[f64; 3]; 3]);

impl Default for ChannelMixer {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl ChannelMixer {
    pub const IDENTITY: Self = Self([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);

    fn apply(&self, [r, g, b]: [u8; 3]) -> [u8; 3] {
        let (r, g, b) = (r as f64, g as f64, b as f64);
        self.0.map(|row| saturate(row[0] * r + row[1] * g + row[2] * b))
    }
}

/// Blends `layers` into `out`. With no visible layer the output is all zeros.
///
/// # Panics
/// Panics if a visible layer's buffer differs in length from `out`.
pub fn compose(layers: &[CompositeLayer<'_>], mixer: &ChannelMixer, out: &mut [u32]) {
    let visible: Vec<&CompositeLayer<'_>> = layers.iter().filter(|l| l.visible).collect();
    let Some((base, rest)) = visible.split_first() else {
        out.fill(0);
        return;
    };
    for layer in &visible {
        assert_eq!(layer.rgba.len(), out.len(), "layer and output buffers differ in length");
    }

    out.copy_from_slice(base.rgba);
    out.par_chunks_mut(CHUNK_SIZE)
        .enumerate()
        .for_each(|(chunk, pixels)| {
            let start = chunk * CHUNK_SIZE;
            for (offset, pixel) in pixels.iter_mut().enumerate() {
                let i = start + offset;
                let mut rgba = unpack(*pixel);
                for layer in rest {
                    rgba = blend(rgba, unpack(layer.rgba[i]), layer.blend_mode, layer.alpha);
                }
                let [r, g, b] = mixer.apply([rgba[0], rgba[1], rgba[2]]);
                *pixel = u32::from_le_bytes([r, g, b, rgba[3]]);
            }
        });
}

fn unpack(pixel: u32) -> [u8; 4] {
    pixel.to_le_bytes()
}

fn saturate(v: f64) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn to_unit(v: u8) -> f64 {
    v as f64 / 255.0
}

fn blend(base: [u8; 4], top: [u8; 4], mode: BlendMode, alpha: f64) -> [u8; 4] {
    let b = base.map(to_unit);
    let t = top.map(to_unit);
    match mode {
        BlendMode::Normal => [
            saturate((alpha * (t[0] - b[0]) + b[0]) * 255.0),
            saturate((alpha * (t[1] - b[1]) + b[1]) * 255.0),
            saturate((alpha * (t[2] - b[2]) + b[2]) * 255.0),
            255,
        ],
        BlendMode::Screen => {
            let screen = |b: f64, t: f64| saturate((1.0 - (1.0 - b) * (1.0 - t)) * 255.0);
            [
                screen(b[0], t[0]),
                screen(b[1], t[1]),
                screen(b[2], t[2]),
                screen(b[3], alpha),
            ]
        }
        BlendMode::Luminosity => {
            let [hue, saturation, _] = rgb_to_hsv([b[0], b[1], b[2]]);
            let [_, _, value] = rgb_to_hsv([t[0], t[1], t[2]]);
            let [r, g, b] = hsv_to_rgb([hue, saturation, value]);
            [saturate(r * 255.0), saturate(g * 255.0), saturate(b * 255.0), 255]
        }
    }
}

/// RGB in `[0, 1]` to hue, saturation and value, all in `[0, 1]`.
pub fn rgb_to_hsv([r, g, b]: [f64; 3]) -> [f64; 3] {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta == 0.0 {
        return [0.0, 0.0, max];
    }

    let saturation = delta / max;
    let dr = ((max - r) / 6.0 + delta / 2.0) / delta;
    let dg = ((max - g) / 6.0 + delta / 2.0) / delta;
    let db = ((max - b) / 6.0 + delta / 2.0) / delta;

    let mut hue = if r == max {
        db - dg
    } else if g == max {
        1.0 / 3.0 + dr - db
    } else {
        2.0 / 3.0 + dg - dr
    };
    if hue < 0.0 {
        hue += 1.0;
    }
    if hue > 1.0 {
        hue -= 1.0;
    }
    [hue, saturation, max]
}

pub fn hsv_to_rgb([hue, saturation, value]: [f64; 3]) -> [f64; 3] {
    if saturation == 0.0 {
        return [value; 3];
    }

    let h = if hue * 6.0 >= 6.0 { 0.0 } else { hue * 6.0 };
    let sector = h.floor();
    let f = h - sector;
    let p = value * (1.0 - saturation);
    let q = value * (1.0 - saturation * f);
    let t = value * (1.0 - saturation * (1.0 - f));

    match sector as u8 {
        0 => [value, t, p],
        1 => [q, value, p],
        2 => [p, value, t],
        3 => [p, q, value],
        4 => [t, p, value],
        _ => [value, p, q],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba(r: u8, g: u8, b: u8, a: u8) -> u32 {
        u32::from_le_bytes([r, g, b, a])
    }

    fn layer(rgba: &[u32], blend_mode: BlendMode, alpha: f64) -> CompositeLayer<'_> {
        CompositeLayer {
            rgba,
            blend_mode,
            alpha,
            visible: true,
        }
    }

    #[test]
    fn test_no_visible_layers_gives_zeros() {
        let pixels = [rgba(10, 20, 30, 255)];
        let hidden = CompositeLayer {
            visible: false,
            ..layer(&pixels, BlendMode::Normal, 1.0)
        };
        let mut out = [0xDEAD_BEEF];
        compose(&[hidden], &ChannelMixer::IDENTITY, &mut out);
        assert_eq!(out, [0]);

        compose(&[], &ChannelMixer::IDENTITY, &mut out);
        assert_eq!(out, [0]);
    }

    #[test]
    fn test_single_layer_copied() {
        let pixels = [rgba(10, 20, 30, 255), rgba(0, 0, 0, 0)];
        let mut out = [0; 2];
        compose(&[layer(&pixels, BlendMode::Screen, 0.2)], &ChannelMixer::IDENTITY, &mut out);
        assert_eq!(out, pixels);
    }

    #[test]
    fn test_normal_blend_lerps_by_alpha() {
        let base = [rgba(0, 100, 200, 255)];
        let top = [rgba(255, 200, 0, 255)];
        let mut out = [0];
        compose(
            &[layer(&base, BlendMode::Normal, 1.0), layer(&top, BlendMode::Normal, 0.5)],
            &ChannelMixer::IDENTITY,
            &mut out,
        );
        assert_eq!(out, [rgba(128, 150, 100, 255)]);
    }

    #[test]
    fn test_hidden_layer_skipped() {
        let base = [rgba(0, 100, 200, 255)];
        let top = [rgba(255, 200, 0, 255)];
        let hidden = CompositeLayer {
            visible: false,
            ..layer(&top, BlendMode::Normal, 1.0)
        };
        let mut out = [0];
        compose(&[layer(&base, BlendMode::Normal, 1.0), hidden], &ChannelMixer::IDENTITY, &mut out);
        assert_eq!(out, base);
    }

    #[test]
    fn test_screen_blend() {
        let base = [rgba(255, 0, 0, 255)];
        let top = [rgba(0, 0, 255, 255)];
        let mut out = [0];
        compose(
            &[layer(&base, BlendMode::Normal, 1.0), layer(&top, BlendMode::Screen, 1.0)],
            &ChannelMixer::IDENTITY,
            &mut out,
        );
        assert_eq!(out, [rgba(255, 0, 255, 255)]);
    }

    #[test]
    fn test_luminosity_takes_value_from_top() {
        let base = [rgba(255, 0, 0, 255)];
        let top = [rgba(51, 51, 51, 255)];
        let mut out = [0];
        compose(
            &[layer(&base, BlendMode::Normal, 1.0), layer(&top, BlendMode::Luminosity, 1.0)],
            &ChannelMixer::IDENTITY,
            &mut out,
        );
        assert_eq!(out, [rgba(51, 0, 0, 255)]);
    }

    #[test]
    fn test_channel_mixer_saturates() {
        let base = [rgba(200, 100, 10, 255)];
        let mixer = ChannelMixer([[1.0, 1.0, 0.0], [0.0, 0.5, 0.0], [-1.0, 0.0, 0.0]]);
        let mut out = [0];
        compose(&[layer(&base, BlendMode::Normal, 1.0)], &mixer, &mut out);
        assert_eq!(out, [rgba(255, 50, 0, 255)]);
    }

    #[test]
    fn test_hsv_round_trip() {
        for rgb in [[0.2, 0.4, 0.6], [0.9, 0.1, 0.5], [0.3, 0.3, 0.3], [1.0, 1.0, 0.0]] {
            let back = hsv_to_rgb(rgb_to_hsv(rgb));
            for (a, b) in rgb.iter().zip(back) {
                assert!((a - b).abs() < 1e-12, "{rgb:?} -> {back:?}");
            }
        }
    }

    #[test]
    fn test_large_buffer_uses_all_chunks() {
        let len = CHUNK_SIZE * 3 + 7;
        let base = vec![rgba(0, 0, 0, 255); len];
        let top = vec![rgba(255, 255, 255, 255); len];
        let mut out = vec![0; len];
        compose(
            &[layer(&base, BlendMode::Normal, 1.0), layer(&top, BlendMode::Normal, 1.0)],
            &ChannelMixer::IDENTITY,
            &mut out,
        );
        assert!(out.iter().all(|&p| p == rgba(255, 255, 255, 255)));
    }
}
