use crate::color_map::color_map;
use crate::error::Result;
use crate::histogram::Levels;
use crate::tiles::{TileState, TiledImage};

use super::{normalize, NormalizeParams, PixelNormalizer};

/// Rendered RGBA tiles of one layer, kept in step with its source tiles.
///
/// Every tile carries a generation that moves forward whenever its output
/// becomes stale. A render started under an older generation is discarded
/// when it finishes.
#[derive(Debug, Clone)]
pub struct Normalization {
    normalizer: PixelNormalizer,
    tiles: TiledImage<u32>,
    generations: Vec<u64>,
}

/// Input of one tile render, detached from the cache so it can be moved to a
/// worker.
#[derive(Debug)]
pub struct RenderJob {
    pub index: usize,
    pub generation: u64,
    pub params: NormalizeParams,
    pub color_map_name: String,
    pub pixels: Vec<f32>,
}

/// Output of a tile render. The input buffer travels back with it.
#[derive(Debug)]
pub struct RenderResult {
    pub index: usize,
    pub generation: u64,
    pub pixels: Vec<f32>,
    pub rgba: Vec<u32>,
}

impl RenderJob {
    /// Runs the normalization. Fails only on an unknown colour map.
    pub fn run(self) -> Result<RenderResult> {
        let map = color_map(&self.color_map_name)?;
        let mut rgba = vec![0u32; self.pixels.len()];
        normalize(&self.pixels, &self.params, map, &mut rgba);
        Ok(RenderResult {
            index: self.index,
            generation: self.generation,
            pixels: self.pixels,
            rgba,
        })
    }

    pub fn pixel_count(&self) -> usize {
        self.pixels.len()
    }
}

impl Normalization {
    /// Empty cache with the same tile grid as `source`.
    pub fn new<T>(source: &TiledImage<T>, normalizer: PixelNormalizer) -> Self {
        let tiles = TiledImage::new(
            source.width(),
            source.height(),
            source.tile_width(),
            source.tile_height(),
        );
        let generations = vec![0; tiles.tiles().len()];
        Self {
            normalizer,
            tiles,
            generations,
        }
    }

    pub fn normalizer(&self) -> &PixelNormalizer {
        &self.normalizer
    }

    pub fn tiles(&self) -> &TiledImage<u32> {
        &self.tiles
    }

    pub fn generation(&self, index: usize) -> Option<u64> {
        self.generations.get(index).copied()
    }

    /// Replaces the normalizer. Any change invalidates every rendered tile.
    pub fn set_normalizer(&mut self, normalizer: PixelNormalizer) {
        if normalizer == self.normalizer {
            return;
        }
        self.normalizer = normalizer;
        self.invalidate_all();
    }

    /// Marks one tile stale after its source pixels changed.
    pub fn invalidate_tile(&mut self, index: usize) -> Result<()> {
        self.tiles.invalidate(index)?;
        self.generations[index] += 1;
        Ok(())
    }

    /// Marks every tile stale, e.g. after new levels were computed.
    pub fn invalidate_all(&mut self) {
        for generation in &mut self.generations {
            *generation += 1;
        }
        self.tiles.invalidate_all();
        tracing::debug!(tiles = self.generations.len(), "normalization invalidated");
    }

    /// Starts rendering tile `index` when it is stale and its source tile is
    /// loaded. Returns `None` when there is nothing to do yet.
    pub fn begin_render(
        &mut self,
        index: usize,
        source: &TiledImage<f32>,
        levels: &Levels,
    ) -> Result<Option<RenderJob>> {
        let Some(pixels) = source
            .tile(index)
            .filter(|t| t.is_loaded())
            .and_then(|t| t.pixels())
        else {
            return Ok(None);
        };
        if !self.tiles.begin_load(index)? {
            return Ok(None);
        }

        Ok(Some(RenderJob {
            index,
            generation: self.generations[index],
            params: NormalizeParams::new(levels, &self.normalizer),
            color_map_name: self.normalizer.color_map_name.clone(),
            pixels: pixels.pixels().to_vec(),
        }))
    }

    /// Stores a finished render. Returns `false` and drops the output when
    /// the tile went stale while the job was running.
    pub fn finish_render(&mut self, result: RenderResult) -> Result<bool> {
        let current = self.generation(result.index);
        let in_flight = self
            .tiles
            .tile(result.index)
            .is_some_and(|t| t.state() == TileState::Loading);
        if current != Some(result.generation) || !in_flight {
            tracing::debug!(
                tile = result.index,
                generation = result.generation,
                "discarding stale render"
            );
            return Ok(false);
        }
        self.tiles.complete_load(result.index, result.rgba)?;
        Ok(true)
    }

    /// Abandons an in-flight render, leaving the tile stale.
    pub fn cancel_render(&mut self, index: usize) -> Result<()> {
        if self.tiles.tile(index).is_some_and(|t| t.state() == TileState::Loading) {
            self.tiles.invalidate(index)?;
        }
        Ok(())
    }

    /// Renders tile `index` on the calling thread.
    pub fn normalize_tile(
        &mut self,
        index: usize,
        source: &TiledImage<f32>,
        levels: &Levels,
    ) -> Result<bool> {
        let Some(job) = self.begin_render(index, source, levels)? else {
            return Ok(false);
        };
        match job.run() {
            Ok(result) => self.finish_render(result),
            Err(err) => {
                self.cancel_render(index)?;
                Err(err)
            }
        }
    }
}
