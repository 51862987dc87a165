//! Built-in named color maps.

use std::sync::OnceLock;

use super::{ColorMap, ControlPoint};
use crate::error::{Error, Result};

const fn cp(x: f64, y: f64) -> ControlPoint {
    ControlPoint::new(x, y)
}

const RAMP: &[ControlPoint] = &[cp(0.0, 0.0), cp(1.0, 1.0)];
const OFF: &[ControlPoint] = &[cp(0.0, 0.0), cp(1.0, 0.0)];

struct Palette {
    name: &'static str,
    red: &'static [ControlPoint],
    green: &'static [ControlPoint],
    blue: &'static [ControlPoint],
}

// Display order.
const PALETTES: &[Palette] = &[
    Palette {
        name: "gray",
        red: RAMP,
        green: RAMP,
        blue: RAMP,
    },
    Palette {
        name: "rainbow",
        red: &[cp(0.0, 1.0), cp(0.2, 0.0), cp(0.6, 0.0), cp(0.8, 1.0), cp(1.0, 1.0)],
        green: &[cp(0.0, 0.0), cp(0.2, 0.0), cp(0.4, 1.0), cp(0.8, 1.0), cp(1.0, 0.0)],
        blue: &[cp(0.0, 1.0), cp(0.4, 1.0), cp(0.6, 0.0), cp(1.0, 0.0)],
    },
    Palette {
        name: "cool",
        red: &[cp(0.0, 0.0), cp(0.29, 0.0), cp(0.76, 0.1), cp(1.0, 1.0)],
        green: &[cp(0.0, 0.0), cp(0.22, 0.0), cp(0.96, 1.0), cp(1.0, 1.0)],
        blue: &[cp(0.0, 0.0), cp(0.53, 1.0), cp(1.0, 1.0)],
    },
    Palette {
        name: "heat",
        red: &[cp(0.0, 0.0), cp(0.34, 1.0), cp(1.0, 1.0)],
        green: RAMP,
        blue: &[cp(0.0, 0.0), cp(0.65, 0.0), cp(0.98, 1.0), cp(1.0, 1.0)],
    },
    Palette {
        name: "red",
        red: RAMP,
        green: OFF,
        blue: OFF,
    },
    Palette {
        name: "green",
        red: OFF,
        green: RAMP,
        blue: OFF,
    },
    Palette {
        name: "blue",
        red: OFF,
        green: OFF,
        blue: RAMP,
    },
    Palette {
        name: "a",
        red: &[cp(0.0, 0.0), cp(0.25, 0.0), cp(0.5, 1.0), cp(1.0, 1.0)],
        green: &[cp(0.0, 0.0), cp(0.25, 1.0), cp(0.5, 0.0), cp(0.77, 0.0), cp(1.0, 1.0)],
        blue: &[
            cp(0.0, 0.0),
            cp(0.125, 0.0),
            cp(0.5, 1.0),
            cp(0.64, 0.5),
            cp(0.77, 0.0),
            cp(1.0, 0.0),
        ],
    },
    Palette {
        name: "b",
        red: &[cp(0.0, 0.0), cp(0.25, 0.0), cp(0.5, 1.0), cp(1.0, 1.0)],
        green: &[cp(0.0, 0.0), cp(0.5, 0.0), cp(0.75, 1.0), cp(1.0, 1.0)],
        blue: &[cp(0.0, 0.0), cp(0.25, 1.0), cp(0.5, 0.0), cp(0.75, 0.0), cp(1.0, 1.0)],
    },
    Palette {
        name: "bb",
        red: &[cp(0.0, 0.0), cp(0.5, 1.0), cp(1.0, 1.0)],
        green: &[cp(0.0, 0.0), cp(0.25, 0.0), cp(0.75, 1.0), cp(1.0, 1.0)],
        blue: &[cp(0.0, 0.0), cp(0.5, 0.0), cp(1.0, 1.0)],
    },
    Palette {
        name: "he",
        red: &[cp(0.0, 0.0), cp(0.015, 0.5), cp(0.25, 0.5), cp(0.5, 0.75), cp(1.0, 1.0)],
        green: &[
            cp(0.0, 0.0),
            cp(0.065, 0.0),
            cp(0.125, 0.5),
            cp(0.25, 0.75),
            cp(0.5, 0.81),
            cp(1.0, 1.0),
        ],
        blue: &[
            cp(0.0, 0.0),
            cp(0.015, 0.125),
            cp(0.03, 0.375),
            cp(0.065, 0.625),
            cp(0.25, 0.25),
            cp(1.0, 1.0),
        ],
    },
];

static COLOR_MAPS: OnceLock<Vec<ColorMap>> = OnceLock::new();

fn builtin_maps() -> &'static [ColorMap] {
    COLOR_MAPS.get_or_init(|| {
        PALETTES
            .iter()
            .filter_map(|p| match ColorMap::build(p.name, p.red, p.green, p.blue) {
                Ok(map) => Some(map),
                Err(err) => {
                    tracing::error!("built-in color map '{}' rejected: {}", p.name, err);
                    None
                }
            })
            .collect()
    })
}

/// Looks up a built-in color map by case-insensitive name. `grey` is accepted
/// for `gray`.
pub fn color_map(name: &str) -> Result<&'static ColorMap> {
    let wanted = name.trim().to_ascii_lowercase();
    let wanted = if wanted == "grey" { "gray" } else { wanted.as_str() };

    builtin_maps()
        .iter()
        .find(|map| map.name() == wanted)
        .ok_or_else(|| Error::UnknownColorMap(name.to_string()))
}

pub fn color_map_names() -> impl Iterator<Item = &'static str> {
    PALETTES.iter().map(|p| p.name)
}
