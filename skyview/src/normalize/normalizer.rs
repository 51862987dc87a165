use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::header::{Header, HeaderValue};
use crate::histogram::{ImageHistogram, Levels, Percentiles};

use super::StretchMode;

pub const KEY_MODE: &str = "AG_NMODE";
pub const KEY_BACKGROUND_PERCENTILE: &str = "AG_BKGP";
pub const KEY_MID_PERCENTILE: &str = "AG_MIDP";
pub const KEY_PEAK_PERCENTILE: &str = "AG_PEAKP";
pub const KEY_BACKGROUND_LEVEL: &str = "AG_BKGL";
pub const KEY_MID_LEVEL: &str = "AG_MIDL";
pub const KEY_PEAK_LEVEL: &str = "AG_PEAKL";
pub const KEY_COLOR_MAP: &str = "AG_CMAP";
pub const KEY_STRETCH: &str = "AG_STRCH";
pub const KEY_INVERTED: &str = "AG_INVRT";
pub const KEY_SCALE: &str = "AG_SCALE";
pub const KEY_OFFSET: &str = "AG_OFFSET";

/// Which of the two level descriptions is authoritative.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum NormalizerMode {
    /// Levels follow the histogram percentiles.
    #[default]
    Percentile,
    /// Levels are absolute pixel values.
    Pixel,
}

/// Display settings of one layer: how raw pixels become colour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PixelNormalizer {
    pub mode: NormalizerMode,
    pub background_percentile: f64,
    pub mid_percentile: f64,
    pub peak_percentile: f64,
    pub background_level: Option<f64>,
    pub mid_level: Option<f64>,
    pub peak_level: Option<f64>,
    pub color_map_name: String,
    pub stretch_mode: StretchMode,
    pub inverted: bool,
    /// Affine pre-transform applied to raw pixels before leveling.
    pub layer_scale: f64,
    pub layer_offset: f64,
}

impl Default for PixelNormalizer {
    fn default() -> Self {
        Self {
            mode: NormalizerMode::Percentile,
            background_percentile: 10.0,
            mid_percentile: 50.0,
            peak_percentile: 99.0,
            background_level: None,
            mid_level: None,
            peak_level: None,
            color_map_name: "gray".to_string(),
            stretch_mode: StretchMode::Linear,
            inverted: false,
            layer_scale: 1.0,
            layer_offset: 0.0,
        }
    }
}

impl PixelNormalizer {
    pub fn percentiles(&self) -> Percentiles {
        Percentiles::new(
            self.background_percentile,
            self.mid_percentile,
            self.peak_percentile,
        )
    }

    /// Levels to render with, in the layer's scaled pixel space.
    ///
    /// Percentile mode derives them from `histogram` and needs it non-empty.
    /// Pixel mode needs absolute background and peak levels; a missing mid
    /// level falls halfway between them.
    pub fn resolve_levels(&self, histogram: &ImageHistogram) -> Option<Levels> {
        match self.mode {
            NormalizerMode::Percentile => {
                if histogram.is_empty() {
                    return None;
                }
                let levels = histogram.calc_levels(
                    self.background_percentile,
                    self.mid_percentile,
                    self.peak_percentile,
                );
                Some(levels.scaled(self.layer_scale, self.layer_offset))
            }
            NormalizerMode::Pixel => {
                let background = self.background_level?;
                let peak = self.peak_level?;
                let mid = self.mid_level.unwrap_or((background + peak) / 2.0);
                Some(Levels::new(background, mid, peak))
            }
        }
    }

    /// Fills the non-authoritative description from the histogram: levels
    /// in percentile mode, percentiles in pixel mode.
    pub fn sync_with_histogram(&mut self, histogram: &ImageHistogram) {
        if histogram.is_empty() {
            return;
        }
        match self.mode {
            NormalizerMode::Percentile => {
                if let Some(levels) = self.resolve_levels(histogram) {
                    self.background_level = Some(levels.background);
                    self.mid_level = Some(levels.mid);
                    self.peak_level = Some(levels.peak);
                }
            }
            NormalizerMode::Pixel => {
                if self.layer_scale == 0.0 || !self.layer_scale.is_finite() {
                    return;
                }
                let Some(levels) = self.resolve_levels(histogram) else {
                    return;
                };
                let raw = |level: f64| (level - self.layer_offset) / self.layer_scale;
                let percentiles =
                    histogram.calc_percentiles(raw(levels.background), raw(levels.mid), raw(levels.peak));
                self.background_percentile = percentiles.background;
                self.mid_percentile = percentiles.mid;
                self.peak_percentile = percentiles.peak;
            }
        }
    }

    /// Header entries that persist these settings. Absent levels are omitted.
    pub fn to_header_entries(&self) -> Vec<(String, HeaderValue)> {
        let mut entries: Vec<(String, HeaderValue)> = vec![
            (KEY_MODE.into(), self.mode.to_string().into()),
            (KEY_BACKGROUND_PERCENTILE.into(), self.background_percentile.into()),
            (KEY_MID_PERCENTILE.into(), self.mid_percentile.into()),
            (KEY_PEAK_PERCENTILE.into(), self.peak_percentile.into()),
        ];
        for (key, level) in [
            (KEY_BACKGROUND_LEVEL, self.background_level),
            (KEY_MID_LEVEL, self.mid_level),
            (KEY_PEAK_LEVEL, self.peak_level),
        ] {
            if let Some(level) = level {
                entries.push((key.into(), level.into()));
            }
        }
        entries.extend([
            (KEY_COLOR_MAP.into(), self.color_map_name.clone().into()),
            (KEY_STRETCH.into(), self.stretch_mode.to_string().into()),
            (KEY_INVERTED.into(), self.inverted.into()),
            (KEY_SCALE.into(), self.layer_scale.into()),
            (KEY_OFFSET.into(), self.layer_offset.into()),
        ]);
        entries
    }

    /// Overrides fields from any persisted entries present in `header`.
    /// Unparseable values are logged and ignored.
    pub fn apply_header_entries(&mut self, header: &Header) {
        if let Some(mode) = header.get_str(KEY_MODE) {
            match mode.parse() {
                Ok(mode) => self.mode = mode,
                Err(_) => tracing::warn!(mode, "unknown normalizer mode in header"),
            }
        }

        let set = |target: &mut f64, key: &str| {
            if let Some(v) = header.get_f64(key) {
                *target = v;
            }
        };
        set(&mut self.background_percentile, KEY_BACKGROUND_PERCENTILE);
        set(&mut self.mid_percentile, KEY_MID_PERCENTILE);
        set(&mut self.peak_percentile, KEY_PEAK_PERCENTILE);
        set(&mut self.layer_scale, KEY_SCALE);
        set(&mut self.layer_offset, KEY_OFFSET);

        for (target, key) in [
            (&mut self.background_level, KEY_BACKGROUND_LEVEL),
            (&mut self.mid_level, KEY_MID_LEVEL),
            (&mut self.peak_level, KEY_PEAK_LEVEL),
        ] {
            if let Some(v) = header.get_f64(key) {
                *target = Some(v);
            }
        }

        if let Some(name) = header.get_str(KEY_COLOR_MAP) {
            self.color_map_name = name.to_string();
        }
        if let Some(stretch) = header.get_str(KEY_STRETCH) {
            match stretch.parse() {
                Ok(stretch) => self.stretch_mode = stretch,
                Err(_) => tracing::warn!(stretch, "unknown stretch mode in header"),
            }
        }
        if let Some(inverted) = header.get_bool(KEY_INVERTED) {
            self.inverted = inverted;
        }
    }
}
