use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Transfer curve applied to normalized intensities in `[0, 1]`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum StretchMode {
    #[default]
    Linear,
    Log,
    Sqrt,
    ArcSinh,
    MidTone,
}

impl StretchMode {
    /// Maps `x` in `[0, 1]` onto `[0, 1]`. `midtone` is the balance point of
    /// [`StretchMode::MidTone`] and is ignored by the other curves.
    pub fn apply(self, x: f64, midtone: f64) -> f64 {
        match self {
            StretchMode::Linear => x,
            StretchMode::Log => (1000.0 * x + 1.0).log10() / 1001f64.log10(),
            StretchMode::Sqrt => x.sqrt(),
            StretchMode::ArcSinh => (10.0 * x).asinh() / 10f64.asinh(),
            StretchMode::MidTone => midtone_transfer(x, midtone),
        }
    }
}

/// Midtone transfer function: fixes 0 and 1 and sends `m` to one half.
fn midtone_transfer(x: f64, m: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    if x == m {
        return 0.5;
    }
    ((m - 1.0) * x) / ((2.0 * m - 1.0) * x - m)
}
