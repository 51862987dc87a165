//! Fixed-bin pixel histograms and percentile level estimation.
//!
//! Levels and percentiles are computed with a single forward pass over the
//! bins, interpolating linearly inside the bin where the cumulative count
//! crosses its target. An empty histogram is a valid state and yields zero
//! levels rather than an error.


use num_traits::ToPrimitive;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::tiles::TiledImage;

/// Number of pixels processed per parallel chunk.
const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageHistogram {
    data: Vec<f64>,
    min_bin: f64,
    max_bin: f64,
}

/// Background, mid and peak pixel levels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Levels {
    pub background: f64,
    pub mid: f64,
    pub peak: f64,
}

/// Background, mid and peak percentiles in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Percentiles {
    pub background: f64,
    pub mid: f64,
    pub peak: f64,
}

impl Levels {
    pub const fn new(background: f64, mid: f64, peak: f64) -> Self {
        Self {
            background,
            mid,
            peak,
        }
    }

    /// Rounds every level to a precision derived from the background-peak
    /// range: at least three decimals, more for narrow ranges.
    pub fn rounded(&self) -> Self {
        let range = self.peak - self.background;
        if !(range.is_finite() && range > 0.0) {
            return *self;
        }
        let exponent = (range.log10().floor() - 3.0).min(-3.0).abs();
        let factor = 10f64.powf(exponent);
        let round = |v: f64| (v * factor).round() / factor;
        Self::new(round(self.background), round(self.mid), round(self.peak))
    }

    pub fn scaled(&self, scale: f64, offset: f64) -> Self {
        Self::new(
            self.background * scale + offset,
            self.mid * scale + offset,
            self.peak * scale + offset,
        )
    }
}

impl Percentiles {
    pub const fn new(background: f64, mid: f64, peak: f64) -> Self {
        Self {
            background,
            mid,
            peak,
        }
    }
}

impl ImageHistogram {
    /// Histogram over `[min_bin, max_bin]` with `data.len()` equal bins.
    /// Negative or non-finite counts are treated as zero.
    pub fn new(data: Vec<f64>, min_bin: f64, max_bin: f64) -> Self {
        let (min_bin, max_bin) = if max_bin < min_bin {
            tracing::warn!(min_bin, max_bin, "histogram range reversed, swapping");
            (max_bin, min_bin)
        } else {
            (min_bin, max_bin)
        };
        let data = data
            .into_iter()
            .map(|c| if c.is_finite() && c > 0.0 { c } else { 0.0 })
            .collect();
        Self {
            data,
            min_bin,
            max_bin,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Bins the finite values of `pixels` over their own min/max range.
    pub fn from_pixels<T: ToPrimitive + Sync>(pixels: &[T], bins: usize) -> Self {
        Self::from_slices(&[pixels], bins)
    }

    /// Bins the pixels of every loaded tile. Unloaded tiles are skipped, so
    /// the result reflects whatever has arrived so far.
    pub fn from_tiles<T: ToPrimitive + Sync>(image: &TiledImage<T>, bins: usize) -> Self {
        let slices: Vec<&[T]> = image
            .loaded_tiles()
            .filter_map(|tile| tile.pixels().map(|p| p.pixels()))
            .collect();
        Self::from_slices(&slices, bins)
    }

    fn from_slices<T: ToPrimitive + Sync>(slices: &[&[T]], bins: usize) -> Self {
        assert!(bins > 0, "bins must be > 0");

        let (min, max) = slices
            .par_iter()
            .flat_map(|&s| s.par_chunks(CHUNK_SIZE))
            .map(|chunk| {
                chunk
                    .iter()
                    .filter_map(finite)
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                        (lo.min(v), hi.max(v))
                    })
            })
            .reduce(
                || (f64::INFINITY, f64::NEG_INFINITY),
                |a, b| (a.0.min(b.0), a.1.max(b.1)),
            );

        if min > max {
            return Self::empty();
        }

        let width = (max - min) / bins as f64;
        let data = slices
            .par_iter()
            .flat_map(|&s| s.par_chunks(CHUNK_SIZE))
            .fold(
                || vec![0.0; bins],
                |mut counts, chunk| {
                    for v in chunk.iter().filter_map(finite) {
                        let bin = if width > 0.0 {
                            (((v - min) / width) as usize).min(bins - 1)
                        } else {
                            0
                        };
                        counts[bin] += 1.0;
                    }
                    counts
                },
            )
            .reduce(
                || vec![0.0; bins],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                    a
                },
            );

        Self {
            data,
            min_bin: min,
            max_bin: max,
        }
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn min_bin(&self) -> f64 {
        self.min_bin
    }

    pub fn max_bin(&self) -> f64 {
        self.max_bin
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn bin_width(&self) -> f64 {
        if self.data.is_empty() {
            0.0
        } else {
            (self.max_bin - self.min_bin) / self.data.len() as f64
        }
    }

    pub fn bin_left(&self, index: usize) -> f64 {
        self.min_bin + index as f64 * self.bin_width()
    }

    pub fn bin_right(&self, index: usize) -> f64 {
        self.bin_left(index + 1)
    }

    pub fn bin_center(&self, index: usize) -> f64 {
        self.min_bin + (index as f64 + 0.5) * self.bin_width()
    }

    /// Pixel levels below which `background`, `mid` and `peak` percent of the
    /// counts fall.
    pub fn calc_levels(&self, background: f64, mid: f64, peak: f64) -> Levels {
        if self.data.is_empty() {
            return Levels::default();
        }

        let last = self.data.len() - 1;
        let total = self.total();
        let percents = [background, mid, peak];
        let mut levels: [Option<f64>; 3] =
            percents.map(|p| (p >= 100.0).then(|| self.bin_right(last)));

        let width = self.bin_width();
        let mut sum = 0.0;
        for (i, &count) in self.data.iter().enumerate() {
            if levels.iter().all(Option::is_some) {
                break;
            }
            sum += count;
            for (level, percent) in levels.iter_mut().zip(percents) {
                if level.is_some() {
                    continue;
                }
                let target = percent / 100.0 * total;
                if sum >= target {
                    let fraction = if count > 0.0 {
                        (target - (sum - count)) / count
                    } else {
                        0.0
                    };
                    *level = Some(self.bin_left(i) + fraction * width);
                }
            }
        }

        let [bg, mid, peak] = levels.map(|l| l.unwrap_or_else(|| self.bin_right(last)));
        Levels::new(bg, mid, peak)
    }

    /// Percentages of counts lying below each of the three levels. The inverse
    /// of [`ImageHistogram::calc_levels`].
    pub fn calc_percentiles(&self, background: f64, mid: f64, peak: f64) -> Percentiles {
        let total = self.total();
        if self.data.is_empty() || total <= 0.0 {
            return Percentiles::default();
        }

        let targets = [background, mid, peak];
        let mut counts: [Option<f64>; 3] = [None; 3];

        let mut cumulative = 0.0;
        for (i, &count) in self.data.iter().enumerate() {
            if counts.iter().all(Option::is_some) {
                break;
            }
            cumulative += count;
            let x0 = self.bin_left(i);
            let x1 = self.bin_right(i);
            let y0 = cumulative - count;
            for (slot, level) in counts.iter_mut().zip(targets) {
                if slot.is_some() || x1 <= level {
                    continue;
                }
                let y = if x1 > x0 {
                    (y0 * (x1 - level) + cumulative * (level - x0)) / (x1 - x0)
                } else {
                    y0
                };
                *slot = Some(y.clamp(0.0, total));
            }
        }

        let [bg, mid, peak] = counts.map(|c| c.unwrap_or(total) / total * 100.0);
        Percentiles::new(bg, mid, peak)
    }
}

#[inline]
fn finite<T: ToPrimitive>(v: &T) -> Option<f64> {
    v.to_f64().filter(|v| v.is_finite())
}
