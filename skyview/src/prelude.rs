//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use skyview::prelude::*;
//! ```

// Pipeline
pub use crate::{LayerId, PixelSource, TileRequest, ViewerConfig, Workbench};

// Pixels and colour
pub use crate::compose::compose;
pub use crate::{
    BlendMode, ChannelMixer, CompositeLayer, ImageHistogram, PixelNormalizer, Region,
    StretchMode, TiledImage,
};

// Coordinates
pub use crate::{sync_transforms, Header, SyncMode, SyncView, Transform, Wcs};

pub use crate::{Error, Result};
