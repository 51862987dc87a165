//! Skyview - tiled rendering and coordinate core of a FITS viewer.
//!
//! The crate turns raw scientific pixel data into displayable colour and
//! pixel coordinates into sky coordinates and back:
//! - Tiled image storage with per-tile load tracking and region lookup
//! - Histograms, percentile levels and robust background fitting
//! - Pixel normalization (stretch + colour map) into packed RGBA
//! - Layer compositing with blend modes and a channel mixer
//! - WCS projections, affine view transforms and cross-image alignment
//! - An async per-layer pipeline that fetches, levels and renders tiles
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use skyview::prelude::*;
//!
//! let mut workbench = Workbench::new(ViewerConfig::default());
//! let id = LayerId::unique();
//! workbench.open_layer(id, 4096, 4096);
//!
//! let region = Region::new(0.0, 0.0, 1024.0, 1024.0);
//! workbench.load_visible_tiles(source.clone(), id, &region).await?;
//! workbench.refresh_histogram(source.as_ref(), id).await?;
//! workbench.render_visible(id, &region).await?;
//! ```

mod color_map;
mod compose;
mod config;
mod error;
mod fitting;
mod header;
mod histogram;
mod normalize;
mod pipeline;
mod tiles;
mod transform;
mod wcs;

pub mod prelude;

// ============================================================================
// Errors and configuration
// ============================================================================

pub use config::ViewerConfig;
pub use error::{ConfigError, Error, Result};

// ============================================================================
// Tiles
// ============================================================================

pub use tiles::{ImageTile, Region, TileState, TiledImage};

// ============================================================================
// Histograms and fitting
// ============================================================================

pub use fitting::{
    fit_background, fit_histogram, neutralize_backgrounds, neutralize_histograms,
    neutralize_sources, weighted_68th, weighted_median, weighted_mode, BackgroundFit,
    HistogramFit, LayerCalibration, LayerCorrection,
};
pub use histogram::{ImageHistogram, Levels, Percentiles};

// ============================================================================
// Colour
// ============================================================================

pub use color_map::{color_map, color_map_names, ColorMap, ControlPoint, LOOKUP_LENGTH};
pub use compose::{compose, hsv_to_rgb, rgb_to_hsv, BlendMode, ChannelMixer, CompositeLayer};
pub use normalize::{
    normalize, pack_rgba, NormalizeParams, Normalization, NormalizerMode, PixelNormalizer,
    RenderJob, RenderResult, StretchMode, TRANSPARENT,
};

// ============================================================================
// Coordinates
// ============================================================================

pub use header::{is_wcs_keyword, Header, HeaderEntry, HeaderValue, CARD_LENGTH};
pub use transform::{
    image_to_viewport, sync_transforms, viewport_region, SyncMode, SyncView, Transform,
};
pub use wcs::{CelestialSolver, Projection, ProjectionSolver, Wcs};

// ============================================================================
// Pipeline
// ============================================================================

pub use pipeline::{
    fetch_tiles, LayerId, LayerKey, LayerPipeline, LoadSummary, NeutralizeKind,
    NormalizeWorker, PixelSource, TileOutcome, TileRequest, TileResult, Workbench,
};
