//! Cross-calibration of layers against a reference layer.

use crate::histogram::ImageHistogram;
use crate::normalize::NormalizerMode;

use super::{fit_histogram, HistogramFit};

const SCALE_STEPS: usize = 200;
const INITIAL_SCALE: f64 = 2.5;
const INITIAL_STEP: f64 = 0.025;
const MIN_STEP: f64 = 0.0001;
const MAX_SEARCH_ROUNDS: usize = 256;

/// A layer's histogram together with its current affine pre-transform.
#[derive(Debug, Clone, Copy)]
pub struct LayerCalibration<'a> {
    pub histogram: &'a ImageHistogram,
    pub layer_scale: f64,
    pub layer_offset: f64,
}

/// New pre-transform for the layer at `index` of the input slice.
///
/// `mode` is set when the correction only shows on screen with the
/// layer's levels pinned in that mode. Percentile levels follow the
/// pre-transform, so a moved offset alone would render identically.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerCorrection {
    pub index: usize,
    pub layer_scale: f64,
    pub layer_offset: f64,
    pub mode: Option<NormalizerMode>,
}

/// Offsets every non-reference layer so its fitted background mode lands on
/// the reference's, keeping each layer's own scale. Corrected layers switch
/// to [`NormalizerMode::Pixel`].
///
/// Layers whose histogram cannot be fitted are left out of the result, as is
/// everything when the reference cannot be fitted.
pub fn neutralize_backgrounds(
    layers: &[LayerCalibration<'_>],
    reference: usize,
) -> Vec<LayerCorrection> {
    let fits: Vec<Option<HistogramFit>> = layers
        .iter()
        .map(|l| fit_histogram(l.histogram, false))
        .collect();
    background_corrections(layers, &fits, reference, |i| layers[i].layer_scale)
}

/// Finds, for every non-reference layer, the multiplicative scale that best
/// aligns its source curve with the reference's. Offsets are unchanged.
pub fn neutralize_sources(
    layers: &[LayerCalibration<'_>],
    reference: usize,
) -> Vec<LayerCorrection> {
    let fits: Vec<Option<HistogramFit>> = layers
        .iter()
        .map(|l| fit_histogram(l.histogram, true))
        .collect();
    source_corrections(layers, &fits, reference)
}

/// Source scales followed by background offsets computed with those scales.
/// Corrected layers switch to [`NormalizerMode::Pixel`].
pub fn neutralize_histograms(
    layers: &[LayerCalibration<'_>],
    reference: usize,
) -> Vec<LayerCorrection> {
    let fits: Vec<Option<HistogramFit>> = layers
        .iter()
        .map(|l| fit_histogram(l.histogram, true))
        .collect();

    let scales = source_corrections(layers, &fits, reference);
    let scale_of = |i: usize| {
        scales
            .iter()
            .find(|c| c.index == i)
            .map_or(layers[i].layer_scale, |c| c.layer_scale)
    };
    background_corrections(layers, &fits, reference, scale_of)
        .into_iter()
        .map(|c| LayerCorrection {
            layer_scale: scale_of(c.index),
            ..c
        })
        .collect()
}

fn background_corrections(
    layers: &[LayerCalibration<'_>],
    fits: &[Option<HistogramFit>],
    reference: usize,
    scale_of: impl Fn(usize) -> f64,
) -> Vec<LayerCorrection> {
    let Some(Some(reference_fit)) = fits.get(reference) else {
        tracing::warn!(reference, "reference layer background could not be fitted");
        return Vec::new();
    };
    let reference_scale = layers[reference].layer_scale;

    fits.iter()
        .enumerate()
        .filter(|&(i, _)| i != reference)
        .filter_map(|(i, fit)| {
            let fit = fit.as_ref()?;
            let scale = scale_of(i);
            Some(LayerCorrection {
                index: i,
                layer_scale: scale,
                layer_offset: -fit.background_mu * scale
                    + reference_fit.background_mu * reference_scale,
                mode: Some(NormalizerMode::Pixel),
            })
        })
        .collect()
}

fn source_corrections(
    layers: &[LayerCalibration<'_>],
    fits: &[Option<HistogramFit>],
    reference: usize,
) -> Vec<LayerCorrection> {
    let Some(Some(reference_fit)) = fits.get(reference) else {
        tracing::warn!(reference, "reference layer sources could not be fitted");
        return Vec::new();
    };
    let reference_layer = &layers[reference];
    let reference_bin_width = reference_layer.histogram.bin_width();

    let reference_x: Vec<f64> = reference_fit.source_x.iter().map(|x| x.ln()).collect();
    let reference_y: Vec<f64> = reference_fit.source_y.iter().map(|y| y.sqrt()).collect();

    fits.iter()
        .enumerate()
        .filter(|&(i, _)| i != reference)
        .filter_map(|(i, fit)| {
            let fit = fit.as_ref()?;
            let corr = layers[i].histogram.bin_width() / reference_bin_width;
            let m = search_scale(&reference_x, &reference_y, fit, corr)?;
            Some(LayerCorrection {
                index: i,
                layer_scale: m * reference_layer.layer_scale,
                layer_offset: layers[i].layer_offset,
                mode: None,
            })
        })
        .collect()
}

/// Coarse-to-fine line search over the scale `m`.
///
/// Each round evaluates 200 candidates around the current best. The step
/// halves after each round, or doubles together with the centre when the best
/// candidate is the largest one, until it drops to the precision floor.
fn search_scale(
    reference_x: &[f64],
    reference_y: &[f64],
    fit: &HistogramFit,
    corr: f64,
) -> Option<f64> {
    if reference_x.is_empty() || fit.source_x.is_empty() || !(corr.is_finite() && corr > 0.0) {
        return None;
    }

    let mut m0 = INITIAL_SCALE;
    let mut step_size = INITIAL_STEP;
    let mut rounds = 0;

    while step_size > MIN_STEP {
        rounds += 1;
        if rounds > MAX_SEARCH_ROUNDS {
            tracing::warn!(m0, step_size, "scale search did not converge");
            break;
        }

        let mut candidates: Vec<(f64, f64)> = Vec::with_capacity(SCALE_STEPS);
        for step in 0..SCALE_STEPS {
            let s = step_size * (step as f64 - (SCALE_STEPS / 2) as f64);
            if m0 + s <= 0.0 {
                continue;
            }
            let m = m0 + s;
            if let Some(f) = alignment_cost(reference_x, reference_y, fit, corr, m) {
                candidates.push((m, f));
            }
        }

        if candidates.is_empty() {
            tracing::debug!(m0, step_size, "no overlapping source points");
            break;
        }

        let mut best = 0;
        for (i, &(_, f)) in candidates.iter().enumerate() {
            if f < candidates[best].1 {
                best = i;
            }
        }
        m0 = candidates[best].0;

        if best == candidates.len() - 1 {
            step_size *= 2.0;
            m0 *= 2.0;
        } else {
            step_size *= 0.5;
        }
    }

    tracing::debug!(scale = m0, rounds, "source scale search finished");
    Some(m0)
}

/// Weighted chi-square between the reference curve and the layer's curve
/// scaled by `m`, over the reference points inside the layer's range.
fn alignment_cost(
    reference_x: &[f64],
    reference_y: &[f64],
    fit: &HistogramFit,
    corr: f64,
    m: f64,
) -> Option<f64> {
    let xs: Vec<f64> = fit.source_x.iter().map(|x| (x * m).ln()).collect();
    let ys: Vec<f64> = fit
        .source_y
        .iter()
        .map(|y| (y / corr / m).sqrt())
        .collect();
    let (first, last) = (xs[0], xs[xs.len() - 1]);

    let mut k2 = 0.0;
    let mut n = 0usize;
    let mut w = 0.0;
    let mut w_sum = 0.0;
    for (&x, &y_ref) in reference_x.iter().zip(reference_y) {
        if x < first || x > last {
            continue;
        }
        w += y_ref.sqrt();
        w_sum += w;
        k2 += w * (y_ref - interpolate_linear(x, &xs, &ys)).powi(2);
        n += 1;
    }

    (n > 0).then(|| k2 / w_sum)
}

/// Linear interpolation of `(xs, ys)` at `x`, with `xs` ascending.
fn interpolate_linear(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let k = xs.partition_point(|&v| v < x);
    if k == 0 {
        return ys[0];
    }
    if k == xs.len() {
        return ys[xs.len() - 1];
    }
    let (x0, x1) = (xs[k - 1], xs[k]);
    if x1 <= x0 {
        return ys[k - 1];
    }
    ys[k - 1] + (x - x0) / (x1 - x0) * (ys[k] - ys[k - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_linear() {
        let xs = [0.0, 1.0, 3.0];
        let ys = [0.0, 10.0, 30.0];
        assert_eq!(interpolate_linear(0.0, &xs, &ys), 0.0);
        assert_eq!(interpolate_linear(0.5, &xs, &ys), 5.0);
        assert_eq!(interpolate_linear(2.0, &xs, &ys), 20.0);
        assert_eq!(interpolate_linear(3.0, &xs, &ys), 30.0);
        assert_eq!(interpolate_linear(5.0, &xs, &ys), 30.0);
    }

    #[test]
    fn test_alignment_cost_zero_for_identical_curves() {
        let fit = HistogramFit {
            background_mu: 0.0,
            background_sigma: 1.0,
            background_peak: 1.0,
            source_x: vec![1.0, 2.0, 4.0, 8.0],
            source_y: vec![100.0, 50.0, 20.0, 5.0],
            norm: 1.0,
        };
        let rx: Vec<f64> = fit.source_x.iter().map(|x| x.ln()).collect();
        let ry: Vec<f64> = fit.source_y.iter().map(|y| y.sqrt()).collect();
        let cost = alignment_cost(&rx, &ry, &fit, 1.0, 1.0).unwrap();
        assert!(cost.abs() < 1e-12);
        assert!(alignment_cost(&rx, &ry, &fit, 1.0, 1.5).unwrap() > cost);
    }

    #[test]
    fn test_alignment_cost_none_without_overlap() {
        let fit = HistogramFit {
            background_mu: 0.0,
            background_sigma: 1.0,
            background_peak: 1.0,
            source_x: vec![100.0, 200.0],
            source_y: vec![4.0, 1.0],
            norm: 1.0,
        };
        let rx = [0.0_f64, 0.5];
        let ry = [1.0, 1.0];
        assert!(alignment_cost(&rx, &ry, &fit, 1.0, 1.0).is_none());
    }
}
