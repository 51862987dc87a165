use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;

use super::*;
use crate::color_map::color_map;
use crate::error::Error;
use crate::fitting::{neutralize_sources, LayerCalibration};
use crate::header::Header;
use crate::normalize::{normalize, NormalizeParams, NormalizerMode};
use crate::tiles::TileState;

const WIDTH: usize = 10;
const HEIGHT: usize = 10;

fn small_config() -> ViewerConfig {
    ViewerConfig {
        tile_width: 4,
        tile_height: 4,
        histogram_bins: 16,
        ..ViewerConfig::default()
    }
}

/// Pixel value `x + y * WIDTH`.
fn ramp() -> Vec<f32> {
    (0..WIDTH * HEIGHT).map(|i| i as f32).collect()
}

fn gaussian_histogram(min_bin: f64) -> ImageHistogram {
    let data = (0..2000)
        .map(|i| {
            let c = i as f64 + 0.5;
            (100_000.0 * (-0.5 * ((c - 600.0) / 50.0).powi(2)).exp()).round()
        })
        .collect();
    ImageHistogram::new(data, min_bin, min_bin + 2000.0)
}

#[derive(Debug, Default)]
struct MemorySource {
    images: HashMap<LayerId, Vec<f32>>,
    histograms: HashMap<LayerId, ImageHistogram>,
    failing: Vec<usize>,
    short: Vec<usize>,
    panicking: Vec<usize>,
    fetches: AtomicUsize,
}

impl MemorySource {
    fn with_image(id: LayerId, pixels: Vec<f32>) -> Self {
        let mut source = Self::default();
        source.images.insert(id, pixels);
        source
    }
}

#[async_trait]
impl PixelSource for MemorySource {
    async fn fetch_tile(&self, request: &TileRequest) -> Result<Vec<f32>> {
        tokio::task::yield_now().await;
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let layer = request.key.id;
        if self.panicking.contains(&request.index) {
            panic!("tile source crashed on tile {}", request.index);
        }
        if self.failing.contains(&request.index) {
            return Err(Error::Fetch {
                layer,
                reason: "connection reset".to_string(),
            });
        }
        let image = self.images.get(&layer).ok_or_else(|| Error::Fetch {
            layer,
            reason: "unknown layer".to_string(),
        })?;

        let mut pixels = Vec::with_capacity(request.pixel_count());
        for y in request.y..request.y + request.height {
            let row = y * WIDTH;
            pixels.extend_from_slice(&image[row + request.x..row + request.x + request.width]);
        }
        if self.short.contains(&request.index) {
            pixels.pop();
        }
        Ok(pixels)
    }

    async fn fetch_histogram(&self, layer: LayerId) -> Result<ImageHistogram> {
        self.histograms.get(&layer).cloned().ok_or_else(|| Error::Fetch {
            layer,
            reason: "no histogram".to_string(),
        })
    }
}

fn whole_image() -> Region {
    Region::new(0.0, 0.0, WIDTH as f64, HEIGHT as f64)
}

/// Narrow background at 1000 plus a power-law source population, spread
/// over 2000 bins up to `max`.
fn sky_histogram(max: f64) -> ImageHistogram {
    let data = (0..2000)
        .map(|i| {
            let v = (i as f64 + 0.5) * 2.5;
            let g = 200_000.0 * (-0.5 * ((v - 1000.0) / 20.0).powi(2)).exp();
            let s = if v > 1000.0 {
                5e6 * (v - 900.0).powf(-1.5)
            } else {
                0.0
            };
            (g + s).round()
        })
        .collect();
    ImageHistogram::new(data, 0.0, max)
}

fn install_histogram(workbench: &mut Workbench, id: LayerId, histogram: ImageHistogram) {
    let layer = workbench.layer_mut(id).unwrap();
    let key = layer.key();
    assert!(layer.apply_histogram(key, histogram));
}

/// Packed colour the layer's current settings give a raw `value`.
fn render_value(layer: &LayerPipeline, value: f32) -> u32 {
    let levels = layer.levels().unwrap();
    let params = NormalizeParams::new(&levels, layer.normalizer());
    let map = color_map(&layer.normalizer().color_map_name).unwrap();
    let mut out = [0_u32];
    normalize(&[value], &params, map, &mut out);
    out[0]
}

fn rendered_pixel(layer: &LayerPipeline) -> u32 {
    let tile = layer.normalization().tiles().tile(0).unwrap();
    *tile.pixels().unwrap().get(0, 0).unwrap()
}

#[test]
fn test_layer_id_parses_and_displays() {
    let id = LayerId::from_u128(0xfeed);
    let parsed: LayerId = id.to_string().parse().unwrap();
    assert_eq!(parsed, id);
    assert!("layer-one".parse::<LayerId>().is_err());
}

// =============================================================================
// LayerPipeline
// =============================================================================

#[test]
fn test_request_tiles_marks_loading_once() {
    let key = LayerKey {
        id: LayerId::from_u128(1),
        generation: 1,
    };
    let mut layer = LayerPipeline::new(key, WIDTH, HEIGHT, PixelNormalizer::default(), &small_config());
    assert_eq!(layer.tiles().tiles().len(), 9);

    let requests = layer.request_tiles(&Region::new(0.0, 0.0, 5.0, 5.0)).unwrap();
    let indices: Vec<usize> = requests.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1, 3, 4]);
    assert!(requests.iter().all(|r| r.key == key));
    assert_eq!(requests[1].x, 4);
    assert_eq!(requests[1].width, 4);

    assert!(layer.request_tiles(&Region::new(0.0, 0.0, 5.0, 5.0)).unwrap().is_empty());
    assert_eq!(layer.tiles().tile(0).unwrap().state(), TileState::Loading);
    assert_eq!(layer.tiles().tile(2).unwrap().state(), TileState::NotLoaded);
}

#[test]
fn test_edge_tiles_are_clipped() {
    let key = LayerKey {
        id: LayerId::from_u128(1),
        generation: 1,
    };
    let mut layer = LayerPipeline::new(key, WIDTH, HEIGHT, PixelNormalizer::default(), &small_config());
    let requests = layer.request_tiles(&whole_image()).unwrap();
    let last = requests.last().unwrap();
    assert_eq!(last.index, 8);
    assert_eq!((last.x, last.y, last.width, last.height), (8, 8, 2, 2));
    assert_eq!(last.pixel_count(), 4);
}

#[test]
fn test_apply_tile_outcomes() {
    let key = LayerKey {
        id: LayerId::from_u128(1),
        generation: 2,
    };
    let mut layer = LayerPipeline::new(key, WIDTH, HEIGHT, PixelNormalizer::default(), &small_config());
    layer.request_tiles(&Region::new(0.0, 0.0, 1.0, 1.0)).unwrap();

    let stale = TileResult {
        key: LayerKey { generation: 1, ..key },
        index: 0,
        pixels: Ok(vec![0.0; 16]),
    };
    assert_eq!(layer.apply_tile(stale).unwrap(), TileOutcome::Discarded);

    let not_requested = TileResult {
        key,
        index: 5,
        pixels: Ok(vec![0.0; 16]),
    };
    assert_eq!(layer.apply_tile(not_requested).unwrap(), TileOutcome::Discarded);

    let loaded = TileResult {
        key,
        index: 0,
        pixels: Ok(vec![1.0; 16]),
    };
    assert_eq!(layer.apply_tile(loaded).unwrap(), TileOutcome::Loaded);
    assert!(layer.tiles().tile(0).unwrap().is_loaded());

    let duplicate = TileResult {
        key,
        index: 0,
        pixels: Ok(vec![2.0; 16]),
    };
    assert_eq!(layer.apply_tile(duplicate).unwrap(), TileOutcome::Discarded);
    assert_eq!(layer.tiles().get_pixel(0.5, 0.5, false), 1.0);
}

#[test]
fn test_failed_tile_can_be_retried() {
    let key = LayerKey {
        id: LayerId::from_u128(1),
        generation: 1,
    };
    let mut layer = LayerPipeline::new(key, WIDTH, HEIGHT, PixelNormalizer::default(), &small_config());
    layer.request_tiles(&Region::new(0.0, 0.0, 1.0, 1.0)).unwrap();

    let failed = TileResult {
        key,
        index: 0,
        pixels: Err(Error::Fetch {
            layer: key.id,
            reason: "timeout".to_string(),
        }),
    };
    assert_eq!(layer.apply_tile(failed).unwrap(), TileOutcome::Failed);
    assert_eq!(layer.tiles().tile(0).unwrap().state(), TileState::Failed);
    assert!(layer.tiles().get_pixel(0.5, 0.5, false).is_nan());

    // Failed tiles are not requested again until reset.
    assert!(layer.request_tiles(&Region::new(0.0, 0.0, 1.0, 1.0)).unwrap().is_empty());
    assert_eq!(layer.retry_failed().unwrap(), 1);
    assert_eq!(layer.request_tiles(&Region::new(0.0, 0.0, 1.0, 1.0)).unwrap().len(), 1);
}

#[test]
fn test_apply_histogram_syncs_levels() {
    let key = LayerKey {
        id: LayerId::from_u128(1),
        generation: 1,
    };
    let mut layer = LayerPipeline::new(key, WIDTH, HEIGHT, PixelNormalizer::default(), &small_config());
    assert!(layer.levels().is_none());

    let histogram = ImageHistogram::new(vec![1.0; 100], 0.0, 100.0);
    assert!(!layer.apply_histogram(LayerKey { generation: 9, ..key }, histogram.clone()));
    assert!(layer.histogram().is_empty());

    assert!(layer.apply_histogram(key, histogram));
    let levels = layer.levels().unwrap();
    assert!((levels.background - 10.0).abs() < 1e-9, "{levels:?}");
    assert!((levels.peak - 99.0).abs() < 1e-9, "{levels:?}");
    assert_eq!(layer.normalizer().background_level, Some(levels.background));
    assert_eq!(layer.normalizer().peak_level, Some(levels.peak));
}

#[test]
fn test_render_waits_for_source_and_levels() {
    let key = LayerKey {
        id: LayerId::from_u128(1),
        generation: 1,
    };
    let mut layer = LayerPipeline::new(key, WIDTH, HEIGHT, PixelNormalizer::default(), &small_config());
    layer.request_tiles(&Region::new(0.0, 0.0, 1.0, 1.0)).unwrap();
    let result = TileResult {
        key,
        index: 0,
        pixels: Ok((0..16).map(|v| v as f32).collect()),
    };
    layer.apply_tile(result).unwrap();

    // No histogram yet, so no levels.
    assert!(layer.begin_render(0).unwrap().is_none());

    layer.rebuild_histogram();
    assert!(!layer.histogram().is_empty());
    assert!(layer.begin_render(1).unwrap().is_none());
    assert!(layer.begin_render(0).unwrap().is_some());
}

#[test]
fn test_stale_render_is_discarded() {
    let key = LayerKey {
        id: LayerId::from_u128(1),
        generation: 1,
    };
    let mut layer = LayerPipeline::new(key, WIDTH, HEIGHT, PixelNormalizer::default(), &small_config());
    layer.request_tiles(&Region::new(0.0, 0.0, 1.0, 1.0)).unwrap();
    layer
        .apply_tile(TileResult {
            key,
            index: 0,
            pixels: Ok((0..16).map(|v| v as f32).collect()),
        })
        .unwrap();
    layer.rebuild_histogram();

    let job = layer.begin_render(0).unwrap().unwrap();
    let mut normalizer = layer.normalizer().clone();
    normalizer.inverted = true;
    layer.set_normalizer(normalizer);

    assert!(!layer.finish_render(job.run().unwrap()).unwrap());
    assert!(!layer.normalization().tiles().tile(0).unwrap().is_loaded());
}

// =============================================================================
// NormalizeWorker
// =============================================================================

#[tokio::test]
async fn test_worker_hands_buffers_back() {
    let key = LayerKey {
        id: LayerId::from_u128(1),
        generation: 1,
    };
    let mut layer = LayerPipeline::new(key, WIDTH, HEIGHT, PixelNormalizer::default(), &small_config());
    layer.request_tiles(&Region::new(0.0, 0.0, 1.0, 1.0)).unwrap();
    let input: Vec<f32> = (0..16).map(|v| v as f32).collect();
    layer
        .apply_tile(TileResult {
            key,
            index: 0,
            pixels: Ok(input.clone()),
        })
        .unwrap();
    layer.rebuild_histogram();

    let worker = NormalizeWorker::new(2);
    let job = layer.begin_render(0).unwrap().unwrap();
    let result = worker.run(job).await.unwrap();

    assert_eq!(result.index, 0);
    assert_eq!(result.pixels, input);
    assert_eq!(result.rgba.len(), 16);
    assert!(result.rgba.iter().all(|p| p >> 24 == 0xFF));
    assert_eq!(worker.available(), 2);

    assert!(layer.finish_render(result).unwrap());
    assert!(layer.normalization().tiles().tile(0).unwrap().is_loaded());
}

#[tokio::test]
async fn test_worker_reports_render_errors() {
    let key = LayerKey {
        id: LayerId::from_u128(1),
        generation: 1,
    };
    let normalizer = PixelNormalizer {
        color_map_name: "no-such-map".to_string(),
        ..PixelNormalizer::default()
    };
    let config = ViewerConfig {
        worker_threshold: 0,
        ..small_config()
    };
    let mut layer = LayerPipeline::new(key, WIDTH, HEIGHT, normalizer, &config);
    layer.request_tiles(&Region::new(0.0, 0.0, 1.0, 1.0)).unwrap();
    layer
        .apply_tile(TileResult {
            key,
            index: 0,
            pixels: Ok(vec![1.0; 16]),
        })
        .unwrap();
    layer.rebuild_histogram();

    let worker = NormalizeWorker::new(1);
    let err = layer.render_tile(0, &worker).await.unwrap_err();
    assert!(matches!(err, Error::UnknownColorMap(_)));
    assert_eq!(
        layer.normalization().tiles().tile(0).unwrap().state(),
        TileState::NotLoaded
    );
}

// =============================================================================
// Workbench
// =============================================================================

#[tokio::test]
async fn test_load_visible_tiles() {
    let id = LayerId::from_u128(1);
    let mut workbench = Workbench::new(small_config());
    workbench.open_layer(id, WIDTH, HEIGHT);

    let source = Arc::new(MemorySource::with_image(id, ramp()));
    let summary = workbench
        .load_visible_tiles(source.clone(), id, &Region::new(0.0, 0.0, 5.0, 5.0))
        .await
        .unwrap();
    assert_eq!(
        summary,
        LoadSummary {
            requested: 4,
            loaded: 4,
            failed: 0,
            discarded: 0,
        }
    );

    let tiles = workbench.layer(id).unwrap().tiles();
    assert_eq!(tiles.get_pixel(2.5, 3.5, false), 32.0);
    assert_eq!(tiles.get_pixel(5.5, 6.5, false), 65.0);
    assert!(tiles.get_pixel(9.5, 9.5, false).is_nan());

    // Already loaded tiles are not fetched again.
    let summary = workbench
        .load_visible_tiles(source.clone(), id, &whole_image())
        .await
        .unwrap();
    assert_eq!(summary.requested, 5);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 9);
    assert!(workbench.layer(id).unwrap().tiles().is_fully_loaded());
}

#[tokio::test]
async fn test_load_reports_failures_per_tile() {
    let id = LayerId::from_u128(1);
    let mut workbench = Workbench::new(small_config());
    workbench.open_layer(id, WIDTH, HEIGHT);

    let mut source = MemorySource::with_image(id, ramp());
    source.failing.push(4);
    source.short.push(8);
    let summary = workbench
        .load_visible_tiles(Arc::new(source), id, &whole_image())
        .await
        .unwrap();
    assert_eq!(summary.loaded, 7);
    assert_eq!(summary.failed, 2);

    let tiles = workbench.layer(id).unwrap().tiles();
    assert_eq!(tiles.tile(4).unwrap().state(), TileState::Failed);
    assert_eq!(tiles.tile(8).unwrap().state(), TileState::Failed);
    assert!(tiles.get_pixel(5.5, 5.5, false).is_nan());
}

#[tokio::test]
async fn test_failed_renders_leave_no_tile_in_flight() {
    let id = LayerId::from_u128(1);
    let config = ViewerConfig {
        worker_threshold: 0,
        ..small_config()
    };
    let mut workbench = Workbench::new(config);
    let normalizer = PixelNormalizer {
        color_map_name: "no-such-map".to_string(),
        ..PixelNormalizer::default()
    };
    workbench.open_layer_with(id, WIDTH, HEIGHT, normalizer);
    let source = Arc::new(MemorySource::with_image(id, ramp()));
    workbench
        .load_visible_tiles(source, id, &whole_image())
        .await
        .unwrap();

    let err = workbench.render_visible(id, &whole_image()).await.unwrap_err();
    assert!(matches!(err, Error::UnknownColorMap(_)));
    let rendered = workbench.layer(id).unwrap().normalization().tiles();
    assert!(rendered
        .tiles()
        .iter()
        .all(|t| t.state() == TileState::NotLoaded));

    // Fixing the colour map renders every tile on the next pass.
    let layer = workbench.layer_mut(id).unwrap();
    let mut normalizer = layer.normalizer().clone();
    normalizer.color_map_name = "gray".to_string();
    layer.set_normalizer(normalizer);
    assert_eq!(workbench.render_visible(id, &whole_image()).await.unwrap(), 9);
}

#[tokio::test]
async fn test_crashed_fetch_fails_its_tile_only() {
    let id = LayerId::from_u128(1);
    let mut workbench = Workbench::new(small_config());
    workbench.open_layer(id, WIDTH, HEIGHT);

    let mut source = MemorySource::with_image(id, ramp());
    source.panicking = vec![0];
    let summary = workbench
        .load_visible_tiles(Arc::new(source), id, &whole_image())
        .await
        .unwrap();
    assert_eq!(
        summary,
        LoadSummary {
            requested: 9,
            loaded: 8,
            failed: 1,
            discarded: 0,
        }
    );

    let layer = workbench.layer(id).unwrap();
    assert_eq!(layer.tiles().tile(0).unwrap().state(), TileState::Failed);
    assert!((1..9).all(|i| layer.tiles().tile(i).unwrap().is_loaded()));
    assert_eq!(layer.histogram().total(), 84.0);

    assert_eq!(workbench.layer_mut(id).unwrap().retry_failed().unwrap(), 1);
    let source = Arc::new(MemorySource::with_image(id, ramp()));
    let summary = workbench
        .load_visible_tiles(source, id, &whole_image())
        .await
        .unwrap();
    assert_eq!((summary.requested, summary.loaded), (1, 1));
    assert_eq!(workbench.layer(id).unwrap().tiles().get_pixel(1.5, 1.5, false), 11.0);
}

#[tokio::test]
async fn test_fetch_tiles_reports_every_request() {
    let id = LayerId::from_u128(1);
    let key = LayerKey { id, generation: 1 };
    let mut layer = LayerPipeline::new(key, WIDTH, HEIGHT, PixelNormalizer::default(), &small_config());
    let requests = layer.request_tiles(&whole_image()).unwrap();

    let mut source = MemorySource::with_image(id, ramp());
    source.panicking = vec![2, 7];
    let results = fetch_tiles(Arc::new(source), requests).await;

    let indices: Vec<usize> = results.iter().map(|r| r.index).collect();
    assert_eq!(indices, (0..9).collect::<Vec<_>>());
    for result in results {
        let crashed = matches!(result.pixels, Err(Error::Worker(_)));
        assert_eq!(crashed, result.index == 2 || result.index == 7);
        layer.apply_tile(result).unwrap();
    }
    assert!(layer
        .tiles()
        .tiles()
        .iter()
        .all(|t| t.state() != TileState::Loading));
}

#[tokio::test]
async fn test_results_for_reopened_layer_are_discarded() {
    let id = LayerId::from_u128(1);
    let mut workbench = Workbench::new(small_config());
    let first = workbench.open_layer(id, WIDTH, HEIGHT);

    let requests = workbench.request_tiles(id, &whole_image()).unwrap();
    assert_eq!(requests.len(), 9);

    workbench.close_layer(id);
    let second = workbench.open_layer(id, WIDTH, HEIGHT);
    assert_ne!(first, second);

    let source: Arc<dyn PixelSource> = Arc::new(MemorySource::with_image(id, ramp()));
    for result in fetch_tiles(source, requests).await {
        assert_eq!(workbench.deliver(result).unwrap(), TileOutcome::Discarded);
    }
    let tiles = workbench.layer(id).unwrap().tiles();
    assert!(tiles.tiles().iter().all(|t| t.state() == TileState::NotLoaded));
}

#[tokio::test]
async fn test_results_for_closed_layer_are_discarded() {
    let id = LayerId::from_u128(1);
    let mut workbench = Workbench::new(small_config());
    workbench.open_layer(id, WIDTH, HEIGHT);
    let requests = workbench.request_tiles(id, &whole_image()).unwrap();

    assert!(workbench.close_layer(id));
    assert!(!workbench.close_layer(id));
    assert!(workbench.layer_ids().is_empty());

    let source: Arc<dyn PixelSource> = Arc::new(MemorySource::with_image(id, ramp()));
    for result in fetch_tiles(source, requests).await {
        assert_eq!(workbench.deliver(result).unwrap(), TileOutcome::Discarded);
    }
}

#[tokio::test]
async fn test_refresh_histogram_and_render() {
    let id = LayerId::from_u128(1);
    let config = ViewerConfig {
        worker_threshold: 8,
        ..small_config()
    };
    let mut workbench = Workbench::new(config);
    workbench.open_layer(id, WIDTH, HEIGHT);

    let mut source = MemorySource::with_image(id, ramp());
    source
        .histograms
        .insert(id, ImageHistogram::from_pixels(&ramp(), 100));
    let source = Arc::new(source);

    // Nothing to render before the pixels and levels arrive.
    assert_eq!(workbench.render_visible(id, &whole_image()).await.unwrap(), 0);

    workbench
        .load_visible_tiles(source.clone(), id, &whole_image())
        .await
        .unwrap();
    assert!(workbench.refresh_histogram(source.as_ref(), id).await.unwrap());

    // Full 4×4 tiles go to the worker, the narrower edge tiles render inline.
    assert_eq!(workbench.render_visible(id, &whole_image()).await.unwrap(), 9);
    let rendered = workbench.layer(id).unwrap().normalization().tiles();
    assert!(rendered.is_fully_loaded());

    // The darkest pixel sits below the background level, the brightest above the peak.
    let dark = rendered.tile(0).unwrap().pixels().unwrap().get(0, 0).copied();
    let bright = rendered.tile(8).unwrap().pixels().unwrap().get(1, 1).copied();
    assert_eq!(dark, Some(0xFF00_0000));
    assert_eq!(bright, Some(0xFFFF_FFFF));

    // Rendering again is a no-op until something goes stale.
    assert_eq!(workbench.render_visible(id, &whole_image()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_refresh_histogram_errors() {
    let id = LayerId::from_u128(1);
    let mut workbench = Workbench::new(small_config());
    let source = MemorySource::default();

    assert!(!workbench.refresh_histogram(&source, id).await.unwrap());

    workbench.open_layer(id, WIDTH, HEIGHT);
    let err = workbench.refresh_histogram(&source, id).await.unwrap_err();
    assert!(matches!(err, Error::Fetch { layer, .. } if layer == id));
}

#[test]
fn test_open_layer_from_header() {
    let id = LayerId::from_u128(1);
    let mut workbench = Workbench::new(small_config());

    let mut header = Header::new();
    header.insert("NAXIS1", 10_i64);
    header.insert("AG_CMAP", "heat");
    header.insert("AG_STRCH", "sqrt");
    assert!(workbench.open_layer_from_header(id, &header).is_none());

    header.insert("NAXIS2", 6_i64);
    header.insert("CTYPE1", "RA---TAN");
    header.insert("CTYPE2", "DEC--TAN");
    header.insert("CRPIX1", 5.0);
    header.insert("CRPIX2", 3.0);
    header.insert("CRVAL1", 150.0);
    header.insert("CRVAL2", 30.0);
    header.insert("CDELT1", -2.8e-4);
    header.insert("CDELT2", 2.8e-4);
    assert!(workbench.open_layer_from_header(id, &header).is_some());

    let layer = workbench.layer(id).unwrap();
    assert_eq!(layer.tiles().width(), 10);
    assert_eq!(layer.tiles().height(), 6);
    assert_eq!(layer.normalizer().color_map_name, "heat");
    assert_eq!(layer.normalizer().stretch_mode, crate::normalize::StretchMode::Sqrt);
    assert!(layer.wcs().is_valid());
}

#[test]
fn test_layers_keep_stacking_order() {
    let (a, b, c) = (LayerId::from_u128(1), LayerId::from_u128(2), LayerId::from_u128(3));
    let mut workbench = Workbench::new(small_config());
    workbench.open_layer(a, WIDTH, HEIGHT);
    workbench.open_layer(b, WIDTH, HEIGHT);
    workbench.open_layer(c, WIDTH, HEIGHT);
    workbench.open_layer(b, 4, 4);
    assert_eq!(workbench.layer_ids(), &[a, b, c]);
    assert_eq!(workbench.layer(b).unwrap().tiles().width(), 4);

    workbench.close_layer(a);
    assert_eq!(workbench.layer_ids(), &[b, c]);
}

#[test]
fn test_neutralize_backgrounds() {
    let (reference, shifted) = (LayerId::from_u128(1), LayerId::from_u128(2));
    let mut workbench = Workbench::new(small_config());
    for id in [reference, shifted] {
        workbench.open_layer(id, WIDTH, HEIGHT);
    }
    install_histogram(&mut workbench, reference, gaussian_histogram(0.0));

    // Only the reference has a histogram: nothing to align.
    assert_eq!(workbench.neutralize(reference, NeutralizeKind::Backgrounds), 0);

    install_histogram(&mut workbench, shifted, gaussian_histogram(200.0));
    let levels_before = workbench.layer(shifted).unwrap().levels().unwrap();
    let background_before = render_value(workbench.layer(shifted).unwrap(), 800.0);

    assert_eq!(workbench.neutralize(reference, NeutralizeKind::Backgrounds), 1);
    let layer = workbench.layer(shifted).unwrap();
    let normalizer = layer.normalizer();
    assert_eq!(normalizer.mode, NormalizerMode::Pixel);
    assert_eq!(normalizer.layer_scale, 1.0);
    assert!((normalizer.layer_offset + 200.0).abs() < 1e-6, "{normalizer:?}");
    assert_eq!(layer.levels(), Some(levels_before), "levels stay pinned");

    // The shifted background now sits below the pinned background level.
    let background_after = render_value(layer, 800.0);
    assert_ne!(background_after, background_before);
    assert_eq!(background_after, 0xFF00_0000);

    let reference_normalizer = workbench.layer(reference).unwrap().normalizer();
    assert_eq!(reference_normalizer.layer_offset, 0.0);
    assert_eq!(reference_normalizer.mode, NormalizerMode::Percentile);

    // Already aligned.
    assert_eq!(workbench.neutralize(reference, NeutralizeKind::Backgrounds), 0);
}

#[tokio::test]
async fn test_neutralize_backgrounds_rerenders_tiles() {
    let (reference, shifted) = (LayerId::from_u128(1), LayerId::from_u128(2));
    let mut workbench = Workbench::new(small_config());
    for id in [reference, shifted] {
        workbench.open_layer(id, WIDTH, HEIGHT);
    }
    install_histogram(&mut workbench, reference, gaussian_histogram(0.0));
    install_histogram(&mut workbench, shifted, gaussian_histogram(200.0));

    let layer = workbench.layer_mut(shifted).unwrap();
    let key = layer.key();
    assert_eq!(layer.request_tiles(&Region::new(0.0, 0.0, 1.0, 1.0)).unwrap().len(), 1);
    let outcome = layer
        .apply_tile(TileResult {
            key,
            index: 0,
            pixels: Ok(vec![800.0; 16]),
        })
        .unwrap();
    assert_eq!(outcome, TileOutcome::Loaded);

    let worker = NormalizeWorker::new(1);
    assert!(layer.render_tile(0, &worker).await.unwrap());
    let before = rendered_pixel(layer);

    assert_eq!(workbench.neutralize(reference, NeutralizeKind::Backgrounds), 1);
    let layer = workbench.layer_mut(shifted).unwrap();
    assert!(layer.normalization().tiles().tile(0).unwrap().pixels().is_none());
    assert!(layer.render_tile(0, &worker).await.unwrap());
    let after = rendered_pixel(layer);
    assert_ne!(after, before);
    assert_eq!(after, 0xFF00_0000);
}

#[test]
fn test_neutralize_sources_applies_searched_scale() {
    let (reference, compressed) = (LayerId::from_u128(1), LayerId::from_u128(2));
    let mut workbench = Workbench::new(small_config());
    for id in [reference, compressed] {
        workbench.open_layer(id, WIDTH, HEIGHT);
    }
    install_histogram(&mut workbench, reference, sky_histogram(5000.0));
    install_histogram(&mut workbench, compressed, sky_histogram(2500.0));

    let expected = {
        let reference_histogram = sky_histogram(5000.0);
        let compressed_histogram = sky_histogram(2500.0);
        let layers = [
            LayerCalibration {
                histogram: &reference_histogram,
                layer_scale: 1.0,
                layer_offset: 0.0,
            },
            LayerCalibration {
                histogram: &compressed_histogram,
                layer_scale: 1.0,
                layer_offset: 0.0,
            },
        ];
        neutralize_sources(&layers, 0)
    };
    assert_eq!(expected.len(), 1);
    assert!((expected[0].layer_scale - 2.0).abs() < 1e-3, "{expected:?}");

    assert_eq!(workbench.neutralize(reference, NeutralizeKind::Sources), 1);
    let normalizer = workbench.layer(compressed).unwrap().normalizer();
    assert_eq!(normalizer.layer_scale, expected[0].layer_scale);
    assert_eq!(normalizer.layer_offset, 0.0);
    assert_eq!(normalizer.mode, NormalizerMode::Percentile);
}

#[test]
fn test_neutralize_kind_names() {
    assert_eq!(NeutralizeKind::default(), NeutralizeKind::Histograms);
    assert_eq!(NeutralizeKind::Sources.to_string(), "sources");
    assert_eq!("Backgrounds".parse::<NeutralizeKind>().ok(), Some(NeutralizeKind::Backgrounds));
}

#[tokio::test]
async fn test_histogram_follows_loads_until_source_delivers() {
    let id = LayerId::from_u128(1);
    let mut workbench = Workbench::new(small_config());
    workbench.open_layer(id, WIDTH, HEIGHT);

    let mut source = MemorySource::with_image(id, ramp());
    let from_source = ImageHistogram::new(vec![1.0; 4], -10.0, 10.0);
    source.histograms.insert(id, from_source.clone());
    let source = Arc::new(source);

    workbench
        .load_visible_tiles(source.clone(), id, &Region::new(0.0, 0.0, 1.0, 1.0))
        .await
        .unwrap();
    let histogram = workbench.layer(id).unwrap().histogram();
    assert_eq!(histogram.total(), 16.0);
    assert!(workbench.layer(id).unwrap().levels().is_some());

    workbench
        .load_visible_tiles(source.clone(), id, &Region::new(5.0, 0.0, 1.0, 1.0))
        .await
        .unwrap();
    assert_eq!(workbench.layer(id).unwrap().histogram().total(), 32.0);

    assert!(workbench.refresh_histogram(source.as_ref(), id).await.unwrap());
    workbench
        .load_visible_tiles(source.clone(), id, &whole_image())
        .await
        .unwrap();
    let layer = workbench.layer(id).unwrap();
    assert!(layer.has_source_histogram());
    assert_eq!(layer.histogram(), &from_source);
}
