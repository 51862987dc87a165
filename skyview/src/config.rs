//! Viewer-wide settings.

use std::path::Path;

use common::FileFormat;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::normalize::PixelNormalizer;
use crate::transform::SyncMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub tile_width: usize,
    pub tile_height: usize,
    pub histogram_bins: usize,
    /// Tiles with more pixels than this are rendered on the blocking pool.
    pub worker_threshold: usize,
    /// Maximum number of concurrent worker renders.
    pub worker_jobs: usize,
    /// Display settings of newly opened layers.
    pub default_normalizer: PixelNormalizer,
    pub sync_mode: SyncMode,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            tile_width: 512,
            tile_height: 512,
            histogram_bins: 1024,
            worker_threshold: 65_536,
            worker_jobs: 4,
            default_normalizer: PixelNormalizer::default(),
            sync_mode: SyncMode::Sky,
        }
    }
}

impl ViewerConfig {
    /// Panics on invalid settings.
    pub fn validate(&self) {
        if let Err(err) = self.check() {
            panic!("{err}");
        }
    }

    /// Like [`validate`](Self::validate), for settings that came from a file.
    pub fn check(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::Invalid(reason.to_string()));
        if self.tile_width == 0 || self.tile_height == 0 {
            return invalid("Tile size must be positive");
        }
        if self.histogram_bins == 0 {
            return invalid("Histogram needs at least 1 bin");
        }
        if self.worker_jobs == 0 {
            return invalid("Worker needs at least 1 job slot");
        }
        let n = &self.default_normalizer;
        let percentiles = [n.background_percentile, n.mid_percentile, n.peak_percentile];
        if percentiles.iter().any(|p| !(0.0..=100.0).contains(p)) {
            return invalid("Percentiles must be within [0, 100]");
        }
        if !n.layer_scale.is_finite() || !n.layer_offset.is_finite() {
            return invalid("Layer scale and offset must be finite");
        }
        Ok(())
    }

    /// Reads a Yaml or Json file, chosen by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let format = FileFormat::from_file_name(&path)?;
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: Self = common::deserialize(&text, format)
            .map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
        config.check()?;
        tracing::info!(%path, "viewer config loaded");
        Ok(config)
    }

    pub fn to_string(&self, format: FileFormat) -> Result<String, ConfigError> {
        common::serialize(self, format).map_err(ConfigError::Serialize)
    }
}
