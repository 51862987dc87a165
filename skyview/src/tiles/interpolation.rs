//! Catmull-Rom bicubic convolution over a 4×4 sample window.

/// Catmull-Rom cubic through `b` (t = 0) and `c` (t = 1), shaped by the
/// outer samples `a` and `d`.
#[inline]
pub(crate) fn terp(t: f64, a: f64, b: f64, c: f64, d: f64) -> f64 {
    0.5 * (c - a + (2.0 * a - 5.0 * b + 4.0 * c - d + (3.0 * (b - c) + d - a) * t) * t) * t + b
}

/// Interpolates `values[column][row]` at fractional offsets `(tx, ty)`
/// measured from the second column/row.
#[inline]
pub(crate) fn bicubic(tx: f64, ty: f64, values: &[[f64; 4]; 4]) -> f64 {
    let rows: [f64; 4] = std::array::from_fn(|row| {
        terp(
            tx,
            values[0][row],
            values[1][row],
            values[2][row],
            values[3][row],
        )
    });
    terp(ty, rows[0], rows[1], rows[2], rows[3])
}

/// Rounds half up, matching the sample-grid anchoring of the pixel lookup.
#[inline]
pub(crate) fn round_half_up(v: f64) -> f64 {
    (v + 0.5).floor()
}
