//! Tiled pixel storage with per-tile load tracking.
//!
//! An image is split into a row-major grid of fixed-size tiles when its header
//! is read. Tiles on the right and bottom edges shrink so none extends past the
//! image. The grid never changes afterwards; only tile pixel buffers and load
//! states do.
//!
//! Pixel coordinates use the half-pixel convention: the sample for pixel
//! index `k` sits at coordinate `k + 0.5`.

mod interpolation;


use common::Buffer2;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::error::{Error, Result};

use interpolation::{bicubic, round_half_up};

/// Load state of a single tile.
///
/// Transitions only move forward: `NotLoaded -> Loading -> Loaded | Failed`.
/// A failed tile returns to `NotLoaded` only through an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum TileState {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

/// Axis-aligned rectangle in image space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Region {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// True when the rectangles overlap with positive area.
    pub fn intersects(&self, other: &Region) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }
}

#[derive(Debug, Clone)]
pub struct ImageTile<T> {
    index: usize,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    state: TileState,
    pixels: Option<Buffer2<T>>,
}

impl<T> ImageTile<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn x(&self) -> usize {
        self.x
    }

    pub fn y(&self) -> usize {
        self.y
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == TileState::Loaded
    }

    /// Pixel buffer, present only once the tile is loaded.
    pub fn pixels(&self) -> Option<&Buffer2<T>> {
        self.pixels.as_ref()
    }

    pub fn region(&self) -> Region {
        Region::new(
            self.x as f64,
            self.y as f64,
            self.width as f64,
            self.height as f64,
        )
    }
}

/// A tiled image: the tile arena plus the grid geometry.
#[derive(Debug, Clone)]
pub struct TiledImage<T> {
    width: usize,
    height: usize,
    tile_width: usize,
    tile_height: usize,
    tiles_x: usize,
    tiles_y: usize,
    tiles: Vec<ImageTile<T>>,
}

impl<T> TiledImage<T> {
    /// Creates the tile grid for a `width`×`height` image.
    pub fn new(width: usize, height: usize, tile_width: usize, tile_height: usize) -> Self {
        assert!(tile_width > 0, "tile_width must be > 0");
        assert!(tile_height > 0, "tile_height must be > 0");

        let tiles_x = width.div_ceil(tile_width);
        let tiles_y = height.div_ceil(tile_height);

        let mut tiles = Vec::with_capacity(tiles_x * tiles_y);
        for j in 0..tiles_y {
            let y = j * tile_height;
            let h = tile_height.min(height - y);
            for i in 0..tiles_x {
                let x = i * tile_width;
                let w = tile_width.min(width - x);
                tiles.push(ImageTile {
                    index: j * tiles_x + i,
                    x,
                    y,
                    width: w,
                    height: h,
                    state: TileState::NotLoaded,
                    pixels: None,
                });
            }
        }

        Self {
            width,
            height,
            tile_width,
            tile_height,
            tiles_x,
            tiles_y,
            tiles,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn tile_width(&self) -> usize {
        self.tile_width
    }

    pub fn tile_height(&self) -> usize {
        self.tile_height
    }

    pub fn tiles_x(&self) -> usize {
        self.tiles_x
    }

    pub fn tiles_y(&self) -> usize {
        self.tiles_y
    }

    pub fn tiles(&self) -> &[ImageTile<T>] {
        &self.tiles
    }

    pub fn tile(&self, index: usize) -> Option<&ImageTile<T>> {
        self.tiles.get(index)
    }

    /// Tile at grid column `i`, row `j`.
    pub fn tile_at(&self, i: usize, j: usize) -> Option<&ImageTile<T>> {
        if i >= self.tiles_x || j >= self.tiles_y {
            return None;
        }
        self.tiles.get(j * self.tiles_x + i)
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.tiles.iter().all(ImageTile::is_loaded)
    }

    /// Loaded tiles only, in index order.
    pub fn loaded_tiles(&self) -> impl Iterator<Item = &ImageTile<T>> {
        self.tiles.iter().filter(|t| t.is_loaded())
    }

    /// Every tile intersecting `region`, each exactly once, in index order.
    pub fn find_tiles(&self, region: &Region) -> Vec<&ImageTile<T>> {
        self.find_tile_indices(region)
            .into_iter()
            .map(|index| &self.tiles[index])
            .collect()
    }

    pub fn find_tile_indices(&self, region: &Region) -> Vec<usize> {
        let Some((i_start, i_end)) = tile_span(region.x, region.width, self.tile_width, self.tiles_x)
        else {
            return Vec::new();
        };
        let Some((j_start, j_end)) =
            tile_span(region.y, region.height, self.tile_height, self.tiles_y)
        else {
            return Vec::new();
        };

        let mut indices = Vec::with_capacity((i_end - i_start) * (j_end - j_start));
        for j in j_start..j_end {
            for i in i_start..i_end {
                indices.push(j * self.tiles_x + i);
            }
        }
        indices
    }

    /// Marks a tile as in flight. Returns `false` when the tile is already
    /// loading, loaded or failed, so callers never issue a duplicate fetch.
    pub fn begin_load(&mut self, index: usize) -> Result<bool> {
        let tile = self.tile_mut(index)?;
        if tile.state != TileState::NotLoaded {
            return Ok(false);
        }
        tile.state = TileState::Loading;
        tracing::trace!(tile = index, "tile loading");
        Ok(true)
    }

    /// Stores the fetched pixels of an in-flight tile. A buffer of the wrong
    /// size fails the tile.
    pub fn complete_load(&mut self, index: usize, pixels: Vec<T>) -> Result<()> {
        let tile = self.tile_mut(index)?;
        tile.expect_state(TileState::Loading, TileState::Loaded)?;

        match Buffer2::try_new(tile.width, tile.height, pixels) {
            Ok(buffer) => {
                tile.pixels = Some(buffer);
                tile.state = TileState::Loaded;
                tracing::trace!(tile = index, "tile loaded");
                Ok(())
            }
            Err(pixels) => {
                tile.state = TileState::Failed;
                Err(Error::PixelCountMismatch {
                    index,
                    expected: tile.pixel_count(),
                    actual: pixels.len(),
                })
            }
        }
    }

    pub fn fail_load(&mut self, index: usize) -> Result<()> {
        let tile = self.tile_mut(index)?;
        tile.expect_state(TileState::Loading, TileState::Failed)?;
        tile.state = TileState::Failed;
        tracing::debug!(tile = index, "tile load failed");
        Ok(())
    }

    /// Returns a failed tile to `NotLoaded` so it can be fetched again.
    pub fn reset_failed(&mut self, index: usize) -> Result<()> {
        let tile = self.tile_mut(index)?;
        tile.expect_state(TileState::Failed, TileState::NotLoaded)?;
        tile.state = TileState::NotLoaded;
        Ok(())
    }

    /// Drops a tile back to `NotLoaded` regardless of its state, releasing
    /// its pixels. Only derived caches use this; source tiles never unload.
    pub(crate) fn invalidate_all(&mut self) {
        for tile in &mut self.tiles {
            tile.state = TileState::NotLoaded;
            tile.pixels = None;
        }
    }

    pub(crate) fn invalidate(&mut self, index: usize) -> Result<()> {
        let tile = self.tile_mut(index)?;
        tile.state = TileState::NotLoaded;
        tile.pixels = None;
        Ok(())
    }

    fn tile_mut(&mut self, index: usize) -> Result<&mut ImageTile<T>> {
        let count = self.tiles.len();
        self.tiles
            .get_mut(index)
            .ok_or(Error::TileIndexOutOfRange { index, count })
    }
}

impl<T> ImageTile<T> {
    fn expect_state(&self, from: TileState, to: TileState) -> Result<()> {
        if self.state != from {
            return Err(Error::InvalidTileTransition {
                index: self.index,
                from: self.state,
                to,
            });
        }
        Ok(())
    }
}

impl<T: ToPrimitive + Copy> TiledImage<T> {
    /// Pixel value at image coordinate `(x, y)`.
    ///
    /// NaN when the coordinate is outside the image or its tile is not
    /// loaded. With `interpolate`, the value is a bicubic blend of the 4×4
    /// surrounding samples; any unloaded neighbour makes the result NaN.
    pub fn get_pixel(&self, x: f64, y: f64, interpolate: bool) -> f64 {
        if interpolate {
            return self.get_pixel_bicubic(x, y);
        }

        let px = (x - 0.5).floor();
        let py = (y - 0.5).floor();
        if !(px >= 0.0 && py >= 0.0 && px < self.width as f64 && py < self.height as f64) {
            return f64::NAN;
        }
        let (px, py) = (px as usize, py as usize);

        let Some(tile) = self.tile_at(px / self.tile_width, py / self.tile_height) else {
            return f64::NAN;
        };
        let Some(pixels) = tile.pixels.as_ref().filter(|_| tile.is_loaded()) else {
            return f64::NAN;
        };
        pixels
            .get(px - tile.x, py - tile.y)
            .and_then(|v| v.to_f64())
            .unwrap_or(f64::NAN)
    }

    fn get_pixel_bicubic(&self, x: f64, y: f64) -> f64 {
        let x0 = round_half_up(x) + 0.5 - 2.0;
        let y0 = round_half_up(y) + 0.5 - 2.0;

        let mut neighbors = [[0.0; 4]; 4];
        for (i, column) in neighbors.iter_mut().enumerate() {
            for (j, value) in column.iter_mut().enumerate() {
                *value = self.get_pixel(x0 + i as f64, y0 + j as f64, false);
            }
        }

        bicubic(
            0.5 - (round_half_up(x) - x),
            0.5 - (round_half_up(y) - y),
            &neighbors,
        )
    }

    /// Row-major copy of `width`×`height` samples starting at `(x, y)`.
    pub fn get_pixels(&self, x: f64, y: f64, width: usize, height: usize) -> Buffer2<f64> {
        let mut out = Vec::with_capacity(width * height);
        for j in 0..height {
            for i in 0..width {
                out.push(self.get_pixel(x + i as f64, y + j as f64, false));
            }
        }
        Buffer2::new(width, height, out)
    }
}

/// Half-open range of tile columns (or rows) touched by `[origin, origin + extent]`.
fn tile_span(origin: f64, extent: f64, tile_size: usize, tile_count: usize) -> Option<(usize, usize)> {
    if tile_count == 0 || !origin.is_finite() || !extent.is_finite() {
        return None;
    }
    let size = tile_size as f64;
    let last = tile_count as i64 - 1;

    let start = ((origin / size).floor() as i64).max(0);
    let end = ((origin + extent) / size).floor() as i64;
    let end = end.min(last);
    if end < start {
        return None;
    }
    Some((start as usize, end as usize + 1))
}
