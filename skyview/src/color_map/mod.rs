//! Dense color lookup tables built from per-channel control points.
//!
//! Each channel palette is a short list of `(x, y)` control points over
//! `[0, 1]`. [`ColorMap::build`] expands them once into three 65536-entry
//! 16-bit lookup tables which are immutable afterwards and can be shared by
//! every normalizer in the process.

mod registry;


use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use registry::{color_map, color_map_names};

/// Number of entries in each channel lookup table.
pub const LOOKUP_LENGTH: usize = 65536;

/// A palette control point. Both coordinates are in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlPoint {
    pub x: f64,
    pub y: f64,
}

impl ControlPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone)]
pub struct ColorMap {
    name: String,
    red: Vec<ControlPoint>,
    green: Vec<ControlPoint>,
    blue: Vec<ControlPoint>,
    red_lookup: Box<[u16]>,
    green_lookup: Box<[u16]>,
    blue_lookup: Box<[u16]>,
}

impl ColorMap {
    /// Builds the lookup tables for the three channel palettes.
    ///
    /// Each palette needs at least two control points, sorted by `x`, with
    /// both coordinates inside `[0, 1]`.
    pub fn build(
        name: impl Into<String>,
        red: &[ControlPoint],
        green: &[ControlPoint],
        blue: &[ControlPoint],
    ) -> Result<Self> {
        validate_palette("red", red)?;
        validate_palette("green", green)?;
        validate_palette("blue", blue)?;

        let name = name.into();
        tracing::debug!(color_map = %name, "building color map lookup tables");

        Ok(Self {
            red_lookup: build_lookup(red),
            green_lookup: build_lookup(green),
            blue_lookup: build_lookup(blue),
            red: red.to_vec(),
            green: green.to_vec(),
            blue: blue.to_vec(),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn red_palette(&self) -> &[ControlPoint] {
        &self.red
    }

    pub fn green_palette(&self) -> &[ControlPoint] {
        &self.green
    }

    pub fn blue_palette(&self) -> &[ControlPoint] {
        &self.blue
    }

    #[inline]
    pub fn red(&self, index: u16) -> u16 {
        self.red_lookup[index as usize]
    }

    #[inline]
    pub fn green(&self, index: u16) -> u16 {
        self.green_lookup[index as usize]
    }

    #[inline]
    pub fn blue(&self, index: u16) -> u16 {
        self.blue_lookup[index as usize]
    }

    #[inline]
    pub fn lookup_rgb(&self, index: u16) -> [u16; 3] {
        let i = index as usize;
        [self.red_lookup[i], self.green_lookup[i], self.blue_lookup[i]]
    }
}

fn validate_palette(channel: &'static str, palette: &[ControlPoint]) -> Result<()> {
    let invalid = |reason: String| Error::InvalidPalette { channel, reason };

    if palette.len() < 2 {
        return Err(invalid(format!(
            "needs at least 2 control points, got {}",
            palette.len()
        )));
    }
    if let Some(p) = palette
        .iter()
        .find(|p| !(0.0..=1.0).contains(&p.x) || !(0.0..=1.0).contains(&p.y))
    {
        return Err(invalid(format!(
            "control point ({}, {}) outside [0, 1]",
            p.x, p.y
        )));
    }
    if palette.windows(2).any(|w| w[1].x < w[0].x) {
        return Err(invalid("control points are not sorted by x".to_string()));
    }
    Ok(())
}

fn build_lookup(palette: &[ControlPoint]) -> Box<[u16]> {
    (0..LOOKUP_LENGTH)
        .map(|i| {
            let x = i as f64 / LOOKUP_LENGTH as f64;
            (channel_value(x, palette) * 65535.0).round().clamp(0.0, 65535.0) as u16
        })
        .collect()
}

/// Palette value at `x`, clamped to the end points outside the palette range.
fn channel_value(x: f64, palette: &[ControlPoint]) -> f64 {
    let k = palette.partition_point(|p| p.x < x);
    if k == 0 {
        return palette[0].y;
    }
    if k == palette.len() {
        return palette[palette.len() - 1].y;
    }

    let left = palette[k - 1];
    let right = palette[k];
    let slope = (right.y - left.y) / (right.x - left.x);
    if slope == 0.0 {
        return left.y;
    }
    slope * (x - left.x) + left.y
}
