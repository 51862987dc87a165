use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use tokio::task::JoinSet;

use crate::config::ViewerConfig;
use crate::error::{Error, Result};
use crate::fitting::{
    neutralize_backgrounds, neutralize_histograms, neutralize_sources, LayerCalibration,
};
use crate::header::Header;
use crate::normalize::{NormalizerMode, PixelNormalizer};
use crate::tiles::Region;
use crate::wcs::Wcs;

use super::{
    LayerId, LayerKey, LayerPipeline, NormalizeWorker, PixelSource, TileOutcome, TileRequest,
    TileResult,
};

/// Which cross-calibration [`Workbench::neutralize`] runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum NeutralizeKind {
    /// Match background levels through offsets.
    Backgrounds,
    /// Match source brightness through scales.
    Sources,
    /// Scales first, then offsets.
    #[default]
    Histograms,
}

/// Tally of one [`Workbench::load_visible_tiles`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadSummary {
    pub requested: usize,
    pub loaded: usize,
    pub failed: usize,
    pub discarded: usize,
}

impl LoadSummary {
    fn record(&mut self, outcome: TileOutcome) {
        match outcome {
            TileOutcome::Loaded => self.loaded += 1,
            TileOutcome::Failed => self.failed += 1,
            TileOutcome::Discarded => self.discarded += 1,
        }
    }
}

/// All open layers of one viewer, in stacking order.
#[derive(Debug)]
pub struct Workbench {
    config: ViewerConfig,
    layers: HashMap<LayerId, LayerPipeline>,
    order: Vec<LayerId>,
    next_generation: u64,
    worker: NormalizeWorker,
}

impl Workbench {
    pub fn new(config: ViewerConfig) -> Self {
        config.validate();
        let worker = NormalizeWorker::new(config.worker_jobs);
        Self {
            config,
            layers: HashMap::new(),
            order: Vec::new(),
            next_generation: 0,
            worker,
        }
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn layer(&self, id: LayerId) -> Option<&LayerPipeline> {
        self.layers.get(&id)
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut LayerPipeline> {
        self.layers.get_mut(&id)
    }

    /// Open layer ids, bottom first.
    pub fn layer_ids(&self) -> &[LayerId] {
        &self.order
    }

    /// Opens `id` with the default normalizer. Reopening an id replaces its
    /// pipeline in place; anything still in flight for the old one is
    /// discarded on arrival.
    pub fn open_layer(&mut self, id: LayerId, width: usize, height: usize) -> LayerKey {
        let normalizer = self.config.default_normalizer.clone();
        self.open_layer_with(id, width, height, normalizer)
    }

    pub fn open_layer_with(
        &mut self,
        id: LayerId,
        width: usize,
        height: usize,
        normalizer: PixelNormalizer,
    ) -> LayerKey {
        self.next_generation += 1;
        let key = LayerKey {
            id,
            generation: self.next_generation,
        };
        let pipeline = LayerPipeline::new(key, width, height, normalizer, &self.config);
        if self.layers.insert(id, pipeline).is_none() {
            self.order.push(id);
        }
        tracing::debug!(layer = %id, generation = key.generation, width, height, "layer opened");
        key
    }

    /// Opens a layer sized by `NAXIS1`/`NAXIS2`, with display settings and
    /// WCS taken from the same header. `None` when the size is missing.
    pub fn open_layer_from_header(&mut self, id: LayerId, header: &Header) -> Option<LayerKey> {
        let width = axis_length(header, "NAXIS1")?;
        let height = axis_length(header, "NAXIS2")?;

        let mut normalizer = self.config.default_normalizer.clone();
        normalizer.apply_header_entries(header);
        let key = self.open_layer_with(id, width, height, normalizer);
        if let Some(layer) = self.layers.get_mut(&id) {
            layer.set_wcs(Wcs::new(header));
        }
        Some(key)
    }

    /// Drops the layer. Returns `false` when it was not open.
    pub fn close_layer(&mut self, id: LayerId) -> bool {
        if self.layers.remove(&id).is_none() {
            return false;
        }
        self.order.retain(|&other| other != id);
        tracing::debug!(layer = %id, "layer closed");
        true
    }

    pub fn request_tiles(&mut self, id: LayerId, region: &Region) -> Result<Vec<TileRequest>> {
        match self.layers.get_mut(&id) {
            Some(layer) => layer.request_tiles(region),
            None => Ok(Vec::new()),
        }
    }

    /// Hands a fetched tile to the layer it was requested for.
    pub fn deliver(&mut self, result: TileResult) -> Result<TileOutcome> {
        match self.layers.get_mut(&result.key.id) {
            Some(layer) => layer.apply_tile(result),
            None => {
                tracing::debug!(layer = %result.key.id, tile = result.index, "discarding tile for closed layer");
                Ok(TileOutcome::Discarded)
            }
        }
    }

    /// Fetches every missing tile under `region` concurrently and applies
    /// the results. Until the source has delivered a histogram, the layer's
    /// histogram is rebuilt from the tiles loaded so far.
    pub async fn load_visible_tiles(
        &mut self,
        source: Arc<dyn PixelSource>,
        id: LayerId,
        region: &Region,
    ) -> Result<LoadSummary> {
        let requests = self.request_tiles(id, region)?;
        let mut summary = LoadSummary {
            requested: requests.len(),
            ..LoadSummary::default()
        };
        let mut first_error = None;
        for result in fetch_tiles(source, requests).await {
            match self.deliver(result) {
                Ok(outcome) => summary.record(outcome),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        if summary.loaded > 0 {
            if let Some(layer) = self.layers.get_mut(&id).filter(|l| !l.has_source_histogram()) {
                layer.rebuild_histogram();
            }
        }
        tracing::debug!(layer = %id, ?summary, "visible tiles loaded");
        Ok(summary)
    }

    /// Replaces the layer's histogram with the one `source` reports.
    pub async fn refresh_histogram(&mut self, source: &dyn PixelSource, id: LayerId) -> Result<bool> {
        let Some(key) = self.layers.get(&id).map(LayerPipeline::key) else {
            return Ok(false);
        };
        let histogram = source.fetch_histogram(id).await?;
        Ok(self
            .layers
            .get_mut(&id)
            .is_some_and(|layer| layer.apply_histogram(key, histogram)))
    }

    /// Renders every stale tile of the layer under `region`. Large tiles go
    /// to the worker and render concurrently. Returns how many tiles were
    /// stored.
    pub async fn render_visible(&mut self, id: LayerId, region: &Region) -> Result<usize> {
        let Some(layer) = self.layers.get_mut(&id) else {
            return Ok(0);
        };

        let mut rendered = 0;
        let mut first_error = None;
        let mut in_flight: Vec<usize> = Vec::new();
        let mut pending = JoinSet::new();
        for index in layer.tiles().find_tile_indices(region) {
            let job = match layer.begin_render(index) {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(err) => {
                    first_error = Some(err);
                    break;
                }
            };
            if layer.renders_inline(&job) {
                let outcome = job.run().and_then(|result| layer.finish_render(result));
                match outcome {
                    Ok(stored) => rendered += usize::from(stored),
                    Err(err) => {
                        first_error.get_or_insert(err);
                        if let Err(err) = layer.cancel_render(index) {
                            tracing::warn!(tile = index, %err, "failed to cancel render");
                        }
                    }
                }
            } else {
                let worker = self.worker.clone();
                in_flight.push(index);
                pending.spawn(async move { (index, worker.run(job).await) });
            }
        }

        while let Some(joined) = pending.join_next().await {
            let (index, result) = match joined {
                Ok(joined) => joined,
                Err(err) => {
                    tracing::warn!(%err, "render task failed");
                    first_error.get_or_insert(Error::Worker(err.to_string()));
                    continue;
                }
            };
            in_flight.retain(|&other| other != index);
            match result.and_then(|result| layer.finish_render(result)) {
                Ok(stored) => rendered += usize::from(stored),
                Err(err) => {
                    first_error.get_or_insert(err);
                    if let Err(err) = layer.cancel_render(index) {
                        tracing::warn!(tile = index, %err, "failed to cancel render");
                    }
                }
            }
        }
        // Renders whose task died leave their tile stale for the next pass.
        for index in in_flight {
            if let Err(err) = layer.cancel_render(index) {
                tracing::warn!(tile = index, %err, "failed to cancel render");
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(rendered),
        }
    }

    /// Cross-calibrates every layer that has a histogram against
    /// `reference` and stores the new scales and offsets in their
    /// normalizers. Offset corrections pin the layer's current levels in
    /// pixel mode. Returns how many layers changed.
    pub fn neutralize(&mut self, reference: LayerId, kind: NeutralizeKind) -> usize {
        let ids: Vec<LayerId> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.layers.get(id).is_some_and(|l| !l.histogram().is_empty()))
            .collect();
        let Some(reference_index) = ids.iter().position(|&id| id == reference) else {
            tracing::warn!(layer = %reference, "reference layer has no histogram");
            return 0;
        };

        let corrections = {
            let calibrations: Vec<LayerCalibration<'_>> = ids
                .iter()
                .filter_map(|id| self.layers.get(id))
                .map(|layer| LayerCalibration {
                    histogram: layer.histogram(),
                    layer_scale: layer.normalizer().layer_scale,
                    layer_offset: layer.normalizer().layer_offset,
                })
                .collect();
            match kind {
                NeutralizeKind::Backgrounds => neutralize_backgrounds(&calibrations, reference_index),
                NeutralizeKind::Sources => neutralize_sources(&calibrations, reference_index),
                NeutralizeKind::Histograms => neutralize_histograms(&calibrations, reference_index),
            }
        };

        let mut changed = 0;
        for correction in corrections {
            let Some(layer) = ids.get(correction.index).and_then(|id| self.layers.get_mut(id)) else {
                continue;
            };
            let mut normalizer = layer.normalizer().clone();
            if let Some(mode) = correction.mode {
                if mode == NormalizerMode::Pixel && normalizer.mode != mode {
                    // Keep the levels the layer renders with now.
                    if let Some(levels) = layer.levels() {
                        normalizer.background_level = Some(levels.background);
                        normalizer.mid_level = Some(levels.mid);
                        normalizer.peak_level = Some(levels.peak);
                    }
                }
                normalizer.mode = mode;
            }
            normalizer.layer_scale = correction.layer_scale;
            normalizer.layer_offset = correction.layer_offset;
            if &normalizer != layer.normalizer() {
                layer.set_normalizer(normalizer);
                changed += 1;
            }
        }
        tracing::debug!(reference = %reference, %kind, changed, "layers neutralized");
        changed
    }
}

/// Runs `requests` against `source` concurrently. Results come back in
/// tile order, one per request; per-tile failures are carried inside each
/// result. A fetch task that dies without reporting yields a
/// [`Error::Worker`] result for its tile.
pub async fn fetch_tiles(source: Arc<dyn PixelSource>, requests: Vec<TileRequest>) -> Vec<TileResult> {
    let mut in_flight: Vec<(LayerKey, usize)> = Vec::with_capacity(requests.len());
    let mut pending = JoinSet::new();
    for request in requests {
        in_flight.push((request.key, request.index));
        let source = Arc::clone(&source);
        pending.spawn(async move {
            let pixels = source.fetch_tile(&request).await;
            TileResult {
                key: request.key,
                index: request.index,
                pixels,
            }
        });
    }

    let mut results = Vec::with_capacity(in_flight.len());
    while let Some(joined) = pending.join_next().await {
        match joined {
            Ok(result) => {
                in_flight.retain(|&(key, index)| (key, index) != (result.key, result.index));
                results.push(result);
            }
            Err(err) => tracing::warn!(%err, "tile fetch task failed"),
        }
    }
    for (key, index) in in_flight {
        results.push(TileResult {
            key,
            index,
            pixels: Err(Error::Worker(format!("fetch of tile {index} did not complete"))),
        });
    }
    results.sort_by_key(|r| r.index);
    results
}

fn axis_length(header: &Header, key: &str) -> Option<usize> {
    let value = header.get_f64(key)?;
    (value >= 1.0 && value.fract() == 0.0).then_some(value as usize)
}
