//! Per-layer data flow: tile fetches, histogram updates and tile renders.
//!
//! Every layer is identified by a [`LayerKey`]. The generation part changes
//! each time a layer is (re)opened, so results addressed to a closed or
//! replaced layer are recognised and dropped instead of being applied to
//! whatever now lives under the same id.

mod worker;
mod workbench;

#[cfg(test)]
mod tests;

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::config::ViewerConfig;
use crate::error::Result;
use crate::histogram::{ImageHistogram, Levels};
use crate::normalize::{Normalization, PixelNormalizer, RenderJob, RenderResult};
use crate::tiles::{Region, TileState, TiledImage};
use crate::wcs::Wcs;

pub use worker::NormalizeWorker;
pub use workbench::{fetch_tiles, LoadSummary, NeutralizeKind, Workbench};

common::id_type!(LayerId);

/// A layer id together with the generation it was opened under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerKey {
    pub id: LayerId,
    pub generation: u64,
}

/// One tile the pipeline wants fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRequest {
    pub key: LayerKey,
    pub index: usize,
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl TileRequest {
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// A fetched tile on its way back to the pipeline that asked for it.
#[derive(Debug)]
pub struct TileResult {
    pub key: LayerKey,
    pub index: usize,
    pub pixels: Result<Vec<f32>>,
}

/// What happened to a delivered [`TileResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TileOutcome {
    Loaded,
    Failed,
    /// Addressed to another generation, or the tile was not waiting for it.
    Discarded,
}

/// Where pixel data and histograms come from.
#[async_trait]
pub trait PixelSource: Debug + Send + Sync {
    /// Row-major pixels of the requested tile, `request.pixel_count()` long.
    async fn fetch_tile(&self, request: &TileRequest) -> Result<Vec<f32>>;

    async fn fetch_histogram(&self, layer: LayerId) -> Result<ImageHistogram>;
}

/// Source tiles, histogram and rendered tiles of one open layer.
#[derive(Debug, Clone)]
pub struct LayerPipeline {
    key: LayerKey,
    tiles: TiledImage<f32>,
    histogram: ImageHistogram,
    /// Set once the source delivered a histogram; local rebuilds stop then.
    source_histogram: bool,
    normalization: Normalization,
    wcs: Wcs,
    histogram_bins: usize,
    worker_threshold: usize,
}

impl LayerPipeline {
    pub fn new(
        key: LayerKey,
        width: usize,
        height: usize,
        normalizer: PixelNormalizer,
        config: &ViewerConfig,
    ) -> Self {
        let tiles = TiledImage::new(width, height, config.tile_width, config.tile_height);
        let normalization = Normalization::new(&tiles, normalizer);
        Self {
            key,
            tiles,
            histogram: ImageHistogram::empty(),
            source_histogram: false,
            normalization,
            wcs: Wcs::default(),
            histogram_bins: config.histogram_bins,
            worker_threshold: config.worker_threshold,
        }
    }

    pub fn key(&self) -> LayerKey {
        self.key
    }

    pub fn tiles(&self) -> &TiledImage<f32> {
        &self.tiles
    }

    pub fn histogram(&self) -> &ImageHistogram {
        &self.histogram
    }

    pub fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    pub fn wcs(&self) -> &Wcs {
        &self.wcs
    }

    pub fn set_wcs(&mut self, wcs: Wcs) {
        self.wcs = wcs;
    }

    pub fn normalizer(&self) -> &PixelNormalizer {
        self.normalization.normalizer()
    }

    pub fn set_normalizer(&mut self, normalizer: PixelNormalizer) {
        self.normalization.set_normalizer(normalizer);
    }

    /// Levels the next render would use, if they can be resolved yet.
    pub fn levels(&self) -> Option<Levels> {
        self.normalizer().resolve_levels(&self.histogram)
    }

    /// Marks every not-yet-requested tile under `region` as loading and
    /// returns the fetches to issue. Tiles already in flight, loaded or
    /// failed are skipped.
    pub fn request_tiles(&mut self, region: &Region) -> Result<Vec<TileRequest>> {
        let mut requests = Vec::new();
        for index in self.tiles.find_tile_indices(region) {
            if !self.tiles.begin_load(index)? {
                continue;
            }
            let Some(tile) = self.tiles.tile(index) else {
                continue;
            };
            requests.push(TileRequest {
                key: self.key,
                index,
                x: tile.x(),
                y: tile.y(),
                width: tile.width(),
                height: tile.height(),
            });
        }
        Ok(requests)
    }

    /// Failed tiles go back to `NotLoaded` so the next request fetches them
    /// again. Returns how many were reset.
    pub fn retry_failed(&mut self) -> Result<usize> {
        let failed: Vec<usize> = self
            .tiles
            .tiles()
            .iter()
            .filter(|t| t.state() == TileState::Failed)
            .map(|t| t.index())
            .collect();
        for &index in &failed {
            self.tiles.reset_failed(index)?;
        }
        Ok(failed.len())
    }

    pub fn apply_tile(&mut self, result: TileResult) -> Result<TileOutcome> {
        if result.key != self.key {
            tracing::debug!(
                layer = %result.key.id,
                generation = result.key.generation,
                tile = result.index,
                "discarding tile for stale layer"
            );
            return Ok(TileOutcome::Discarded);
        }
        let waiting = self
            .tiles
            .tile(result.index)
            .is_some_and(|t| t.state() == TileState::Loading);
        if !waiting {
            tracing::debug!(tile = result.index, "discarding unexpected tile");
            return Ok(TileOutcome::Discarded);
        }

        match result.pixels {
            Ok(pixels) => {
                if let Err(err) = self.tiles.complete_load(result.index, pixels) {
                    tracing::warn!(layer = %self.key.id, %err, "tile rejected");
                    return Ok(TileOutcome::Failed);
                }
                self.normalization.invalidate_tile(result.index)?;
                Ok(TileOutcome::Loaded)
            }
            Err(err) => {
                self.tiles.fail_load(result.index)?;
                tracing::warn!(layer = %self.key.id, tile = result.index, %err, "tile fetch failed");
                Ok(TileOutcome::Failed)
            }
        }
    }

    /// Installs a histogram delivered by the pixel source and re-derives
    /// the normalizer's levels from it. Every rendered tile goes stale.
    /// Returns `false` for a stale key.
    pub fn apply_histogram(&mut self, key: LayerKey, histogram: ImageHistogram) -> bool {
        if key != self.key {
            tracing::debug!(layer = %key.id, generation = key.generation, "discarding stale histogram");
            return false;
        }
        self.source_histogram = true;
        self.install_histogram(histogram);
        true
    }

    pub fn has_source_histogram(&self) -> bool {
        self.source_histogram
    }

    /// Histogram of whatever source tiles have arrived, for sources that do
    /// not provide one.
    pub fn rebuild_histogram(&mut self) {
        let histogram = ImageHistogram::from_tiles(&self.tiles, self.histogram_bins);
        self.install_histogram(histogram);
    }

    fn install_histogram(&mut self, histogram: ImageHistogram) {
        let mut normalizer = self.normalizer().clone();
        normalizer.sync_with_histogram(&histogram);
        self.histogram = histogram;
        if &normalizer == self.normalizer() {
            self.normalization.invalidate_all();
        } else {
            self.normalization.set_normalizer(normalizer);
        }
    }

    pub fn begin_render(&mut self, index: usize) -> Result<Option<RenderJob>> {
        let Some(levels) = self.levels() else {
            return Ok(None);
        };
        self.normalization.begin_render(index, &self.tiles, &levels)
    }

    pub fn finish_render(&mut self, result: RenderResult) -> Result<bool> {
        self.normalization.finish_render(result)
    }

    pub fn cancel_render(&mut self, index: usize) -> Result<()> {
        self.normalization.cancel_render(index)
    }

    /// True when a job is small enough to run on the calling thread.
    pub fn renders_inline(&self, job: &RenderJob) -> bool {
        job.pixel_count() <= self.worker_threshold
    }

    /// Renders tile `index`, inline for small tiles and on `worker` for
    /// large ones. Returns `false` when there was nothing to render or the
    /// result went stale.
    pub async fn render_tile(&mut self, index: usize, worker: &NormalizeWorker) -> Result<bool> {
        let Some(job) = self.begin_render(index)? else {
            return Ok(false);
        };
        let result = if self.renders_inline(&job) {
            job.run()
        } else {
            worker.run(job).await
        };
        match result {
            Ok(result) => self.finish_render(result),
            Err(err) => {
                self.cancel_render(index)?;
                Err(err)
            }
        }
    }
}
