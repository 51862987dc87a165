//! Robust background/source separation of pixel histograms.
//!
//! The background is modelled as a Gaussian whose centre is a weighted mode
//! and whose width is the one-sided 68th-percentile deviation below it.
//! Points on the high side that a Gaussian of that shape cannot explain are
//! clipped iteratively; what remains above the background is the source curve
//! used to cross-calibrate layers.

mod neutralize;


use serde::{Deserialize, Serialize};

use crate::histogram::ImageHistogram;

pub use neutralize::{
    neutralize_backgrounds, neutralize_histograms, neutralize_sources, LayerCalibration,
    LayerCorrection,
};

const ONE_SIGMA_FRACTION: f64 = 0.682689;
const ONE_SIGMA_COMPLEMENT: f64 = 0.317311;

/// Result of [`fit_background`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundFit {
    pub mu: f64,
    pub sigma: f64,
    pub peak: f64,
    /// Points that survived clipping.
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

/// Result of [`fit_histogram`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramFit {
    pub background_mu: f64,
    pub background_sigma: f64,
    pub background_peak: f64,
    /// Source curve abscissae, relative to `background_mu`.
    pub source_x: Vec<f64>,
    pub source_y: Vec<f64>,
    /// Ratio of raw to filtered counts.
    pub norm: f64,
}

/// Fits the background Gaussian of `hist` and, when `fit_sources` is set,
/// extracts the residual source curve.
///
/// Returns `None` for an empty histogram or one whose background width
/// cannot be estimated.
pub fn fit_histogram(hist: &ImageHistogram, fit_sources: bool) -> Option<HistogramFit> {
    let data = hist.data();
    let n0: f64 = data.iter().sum();

    // 3-point median removes the strobing caused by discrete pixel levels.
    let mut filtered = vec![0.0; data.len()];
    for i in 1..data.len().saturating_sub(1) {
        let (a, b, c) = (data[i - 1], data[i], data[i + 1]);
        filtered[i] = a.min(b).max(a.max(b).min(c));
    }
    let n: f64 = filtered.iter().sum();

    let (mut x, mut y, mut norm) = (Vec::new(), Vec::new(), 1.0);
    if n > 0.0 {
        norm = n0 / n;
        for (i, &count) in filtered.iter().enumerate() {
            if count != 0.0 {
                x.push(hist.bin_center(i));
                y.push(count * norm);
            }
        }
    }
    if x.is_empty() {
        for (i, &count) in data.iter().enumerate() {
            if count != 0.0 {
                x.push(hist.bin_center(i));
                y.push(count);
            }
        }
    }

    let background = fit_background(&x, &y)?;

    let (source_x, source_y) = if fit_sources {
        source_curve(&x, &y, &background)
    } else {
        (Vec::new(), Vec::new())
    };

    Some(HistogramFit {
        background_mu: background.mu,
        background_sigma: background.sigma,
        background_peak: background.peak,
        source_x,
        source_y,
        norm,
    })
}

/// Excess over the background Gaussian, starting at its first peak.
fn source_curve(x: &[f64], y: &[f64], background: &BackgroundFit) -> (Vec<f64>, Vec<f64>) {
    let last_background_x = background.x.last().copied().unwrap_or(f64::NEG_INFINITY);
    let gaussian = |t: f64| {
        background.peak * (-0.5 * ((t - background.mu) / background.sigma).powi(2)).exp()
    };

    let mut source_x = Vec::new();
    let mut source_y: Vec<f64> = Vec::new();
    let mut start = 0;
    let mut first_peak_found = false;

    for i in 0..x.len().saturating_sub(1) {
        if x[i] <= last_background_x {
            continue;
        }
        let excess = y[i] - gaussian(x[i]);
        if excess <= 1.0 {
            continue;
        }
        source_x.push(x[i] - background.mu);
        source_y.push(excess);

        if !first_peak_found {
            let index = source_y.len() - 1;
            if source_y[index] >= source_y[start] {
                start = index;
            } else {
                first_peak_found = true;
            }
        }
    }

    source_x.drain(..start);
    source_y.drain(..start);
    (source_x, source_y)
}

/// Iteratively fits a Gaussian background to the points `(x, y)`, where `x`
/// is ascending and `y` holds the counts.
///
/// Each round recomputes the weighted mode and the one-sided width, then
/// drops points above the mode whose expected count under the Gaussian tail
/// is below one half. Rounds stop once nothing is dropped.
pub fn fit_background(x: &[f64], y: &[f64]) -> Option<BackgroundFit> {
    debug_assert_eq!(x.len(), y.len());
    if x.is_empty() {
        return None;
    }

    let mut x = x.to_vec();
    let mut y = y.to_vec();
    let mut rounds = 0;

    let (mu, sigma) = loop {
        rounds += 1;
        let mu = weighted_mode(&y, &x);

        let (dev_weights, devs): (Vec<f64>, Vec<f64>) = x
            .iter()
            .zip(&y)
            .take_while(|&(&xi, _)| xi <= mu)
            .map(|(&xi, &yi)| (yi, (xi - mu).abs()))
            .unzip();
        let sigma = weighted_68th(&dev_weights, &devs);

        let n = y.len() as f64;
        let (kept_x, kept_y): (Vec<f64>, Vec<f64>) = x
            .iter()
            .zip(&y)
            .filter(|&(&xi, _)| {
                let tail = 1.0 - libm::erf((xi - mu).abs() / sigma / std::f64::consts::SQRT_2);
                !(xi > mu && n * tail < 0.5)
            })
            .map(|(&xi, &yi)| (xi, yi))
            .unzip();

        if kept_x.len() == x.len() {
            break (mu, sigma);
        }
        x = kept_x;
        y = kept_y;
    };

    tracing::debug!(mu, sigma, rounds, points = x.len(), "background fit converged");

    if !(mu.is_finite() && sigma.is_finite() && sigma > 0.0) {
        return None;
    }

    // The first bin may hold pile-up, leave it out of the amplitude fit.
    let gaussian = |t: f64| (-0.5 * ((t - mu) / sigma).powi(2)).exp();
    let (numerator, denominator) = x
        .iter()
        .zip(&y)
        .skip(1)
        .fold((0.0, 0.0), |(num, den), (&xi, &yi)| {
            let g = gaussian(xi);
            (num + yi * g, den + g * g)
        });
    let peak = if denominator > 0.0 {
        numerator / denominator
    } else {
        y.iter().copied().fold(0.0, f64::max)
    };

    Some(BackgroundFit {
        mu,
        sigma,
        peak,
        x,
        y,
    })
}

/// Relative/absolute float comparison used by the mode search.
fn is_equal(a: f64, b: f64) -> bool {
    const MAX_RELATIVE: f64 = 1e-8;
    if (a - b).abs() < f64::MIN_POSITIVE {
        return true;
    }
    let relative = if b.abs() > a.abs() {
        ((a - b) / b).abs()
    } else {
        ((a - b) / a).abs()
    };
    relative <= MAX_RELATIVE
}

/// Weighted mode of `values` (ascending) with `weights`.
///
/// Repeatedly narrows the index window to the shortest span of values that
/// holds half of the window's weight, until the window stops changing, then
/// returns the weighted median of what is left. NaN for empty input.
pub fn weighted_mode(weights: &[f64], values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }

    let mut lower = 0usize;
    let mut upper = values.len() - 1;

    loop {
        let size = upper - lower + 1;
        let half_weight: f64 = weights[lower..=upper].iter().sum::<f64>() * 0.5;

        // Cumulative weight at each point, each point counting half on either side.
        let mut cumulative = Vec::with_capacity(size);
        let mut sum = 0.5 * weights[lower];
        cumulative.push(sum);
        for i in lower + 1..=upper {
            sum += 0.5 * weights[i - 1] + 0.5 * weights[i];
            cumulative.push(sum);
        }

        let mut min_dist = f64::INFINITY;
        let (mut final_lower, mut final_upper) = (lower, upper);
        let mut consider = |from: usize, to: usize| {
            let dist = (values[to + lower] - values[from + lower]).abs();
            if is_equal(dist, min_dist) {
                final_lower = final_lower.min(from + lower);
                final_upper = final_upper.max(to + lower);
            } else if dist < min_dist {
                min_dist = dist;
                final_lower = from + lower;
                final_upper = to + lower;
            }
        };

        for i in 0..size {
            let s = cumulative[i];
            if s < half_weight || is_equal(s, half_weight) {
                let target = s + half_weight;
                let mut k = i;
                while k < size && (cumulative[k] < target || is_equal(cumulative[k], target)) {
                    k += 1;
                }
                consider(i, k - 1);
            }
            if s > half_weight || is_equal(s, half_weight) {
                let target = s - half_weight;
                let mut k = i as isize;
                while k >= 0
                    && (cumulative[k as usize] > target || is_equal(cumulative[k as usize], target))
                {
                    k -= 1;
                }
                consider((k + 1) as usize, i);
            }
        }

        if final_lower == lower && final_upper == upper {
            break;
        }
        lower = final_lower;
        upper = final_upper;
    }

    weighted_median(&weights[lower..=upper], &values[lower..=upper])
}

/// Weighted median of `values` (ascending), interpolating between the two
/// points whose half-weight cumulative sums straddle the midpoint.
pub fn weighted_median(weights: &[f64], values: &[f64]) -> f64 {
    weighted_quantile(weights, values, 0.5, 0.5)
}

/// Weighted 68.27th percentile of `values` after sorting them with their
/// weights. Used as a one-sided sigma estimate from absolute deviations.
pub fn weighted_68th(weights: &[f64], values: &[f64]) -> f64 {
    let mut pairs: Vec<(f64, f64)> = values.iter().copied().zip(weights.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let (values, weights): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
    weighted_quantile(&weights, &values, ONE_SIGMA_FRACTION, ONE_SIGMA_COMPLEMENT)
}

/// Shared walk for the weighted median and 68th percentile. Each step adds
/// `trailing` of the previous weight and `fraction` of the current one.
fn weighted_quantile(weights: &[f64], values: &[f64], fraction: f64, trailing: f64) -> f64 {
    match values.len() {
        0 => return f64::NAN,
        1 => return values[0],
        _ => {}
    }

    let total: f64 = weights.iter().sum();
    let target = fraction * total;
    let last = values.len() - 1;

    let mut counter = 0;
    let mut running = weights[0] * fraction;
    let mut step = 0.0;
    while running < target && counter < last {
        counter += 1;
        step = weights[counter - 1] * trailing + weights[counter] * fraction;
        running += step;
    }

    if counter == 0 {
        return values[0];
    }
    if step <= 0.0 {
        return values[counter];
    }
    let before = running - step;
    values[counter - 1] + (target - before) / step * (values[counter] - values[counter - 1])
}
