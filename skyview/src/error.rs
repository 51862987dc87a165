//! Error types for the viewer core.
//!
//! Most degenerate conditions (unloaded tiles, empty histograms, invalid WCS)
//! are not errors and surface as `None`/NaN. These variants cover caller
//! mistakes and I/O failures scoped to a single layer or tile.

use thiserror::Error;

use crate::pipeline::LayerId;
use crate::tiles::TileState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid {channel} palette: {reason}")]
    InvalidPalette {
        channel: &'static str,
        reason: String,
    },

    #[error("Unknown color map '{0}'")]
    UnknownColorMap(String),

    #[error("Tile index {index} out of range ({count} tiles)")]
    TileIndexOutOfRange { index: usize, count: usize },

    #[error("Tile {index} expects {expected} pixels, got {actual}")]
    PixelCountMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Tile {index} cannot move from {from} to {to}")]
    InvalidTileTransition {
        index: usize,
        from: TileState,
        to: TileState,
    },

    #[error("Fetch failed for layer {layer}: {reason}")]
    Fetch { layer: LayerId, reason: String },

    #[error("Normalize worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Extension(#[from] common::FileExtensionError),

    #[error("Failed to parse config '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: common::SerdeFormatError,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[source] common::SerdeFormatError),
}

pub type Result<T> = std::result::Result<T, Error>;
