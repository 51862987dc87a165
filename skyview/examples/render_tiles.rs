//! Example: render a synthetic star field through the tile pipeline
//!
//! Opens two layers over the same generated image, fetches and renders the
//! visible tiles, blends them with a screen blend and reads out the sky
//! position of the image centre.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example render_tiles
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use skyview::prelude::*;

const WIDTH: usize = 1200;
const HEIGHT: usize = 900;

#[derive(Debug)]
struct SyntheticSource {
    pixels: Vec<f32>,
}

impl SyntheticSource {
    fn new() -> Self {
        let pixels = (0..WIDTH * HEIGHT)
            .map(|i| {
                let (x, y) = ((i % WIDTH) as f32, (i / WIDTH) as f32);
                let star = if (i * 7919) % 4099 == 0 { 8000.0 } else { 0.0 };
                1000.0 + 0.02 * x + 0.01 * y + star
            })
            .collect();
        Self { pixels }
    }
}

#[async_trait]
impl PixelSource for SyntheticSource {
    async fn fetch_tile(&self, request: &TileRequest) -> skyview::Result<Vec<f32>> {
        let mut out = Vec::with_capacity(request.pixel_count());
        for y in request.y..request.y + request.height {
            let start = y * WIDTH + request.x;
            out.extend_from_slice(&self.pixels[start..start + request.width]);
        }
        Ok(out)
    }

    async fn fetch_histogram(&self, _layer: LayerId) -> skyview::Result<ImageHistogram> {
        Ok(ImageHistogram::from_pixels(&self.pixels, 1024))
    }
}

fn sky_header() -> Header {
    let mut header = Header::new();
    header.insert("NAXIS1", WIDTH as i64);
    header.insert("NAXIS2", HEIGHT as i64);
    header.insert("CTYPE1", "RA---TAN");
    header.insert("CTYPE2", "DEC--TAN");
    header.insert("CRPIX1", WIDTH as f64 / 2.0 + 0.5);
    header.insert("CRPIX2", HEIGHT as f64 / 2.0 + 0.5);
    header.insert("CRVAL1", 83.82);
    header.insert("CRVAL2", -5.39);
    header.insert("CDELT1", -2.8e-4);
    header.insert("CDELT2", 2.8e-4);
    header
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::log_setup::setup_logging("info")?;

    let source: Arc<dyn PixelSource> = Arc::new(SyntheticSource::new());
    let mut workbench = Workbench::new(ViewerConfig::default());

    let mut header = sky_header();
    let base = LayerId::unique();
    workbench
        .open_layer_from_header(base, &header)
        .ok_or_else(|| anyhow::anyhow!("Header has no image size"))?;

    header.insert("AG_CMAP", "heat");
    header.insert("AG_STRCH", "arcsinh");
    let overlay = LayerId::unique();
    workbench
        .open_layer_from_header(overlay, &header)
        .ok_or_else(|| anyhow::anyhow!("Header has no image size"))?;

    let region = Region::new(0.0, 0.0, WIDTH as f64, HEIGHT as f64);
    for id in [base, overlay] {
        let summary = workbench.load_visible_tiles(source.clone(), id, &region).await?;
        workbench.refresh_histogram(source.as_ref(), id).await?;
        let rendered = workbench.render_visible(id, &region).await?;
        tracing::info!(layer = %id, ?summary, rendered, "layer ready");
    }

    // Blend the first rendered tile of both layers.
    let tile_of = |id: LayerId| -> anyhow::Result<Vec<u32>> {
        let layer = workbench
            .layer(id)
            .ok_or_else(|| anyhow::anyhow!("Layer {id} is not open"))?;
        let pixels = layer
            .normalization()
            .tiles()
            .tile(0)
            .and_then(|tile| tile.pixels())
            .ok_or_else(|| anyhow::anyhow!("Tile 0 of layer {id} is not rendered"))?;
        Ok(pixels.pixels().to_vec())
    };
    let (bottom, top) = (tile_of(base)?, tile_of(overlay)?);
    let mut blended = vec![0u32; bottom.len()];
    compose(
        &[
            CompositeLayer {
                rgba: &bottom,
                blend_mode: BlendMode::Normal,
                alpha: 1.0,
                visible: true,
            },
            CompositeLayer {
                rgba: &top,
                blend_mode: BlendMode::Screen,
                alpha: 0.5,
                visible: true,
            },
        ],
        &ChannelMixer::default(),
        &mut blended,
    );
    tracing::info!(pixels = blended.len(), first = %format!("{:#010x}", blended[0]), "tile blended");

    let wcs = workbench
        .layer(base)
        .map(|layer| layer.wcs().clone())
        .unwrap_or_default();
    if let Some([ra_hours, dec]) = wcs.pix_to_world([WIDTH as f64 / 2.0, HEIGHT as f64 / 2.0]) {
        tracing::info!(ra_hours, dec, scale = ?wcs.pixel_scale(), "image centre");
    }
    Ok(())
}
