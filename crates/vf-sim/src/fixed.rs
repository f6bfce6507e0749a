//! Q32.32 fixed-point arithmetic.
//!
//! All kinematics in this crate run on signed 64-bit fixed-point numbers with
//! 32 fractional bits (`Q32.32`) rather than floats, so that the same inputs
//! produce bit-identical results on every platform -- required for the
//! deterministic tick loop (`spec.md` §5).
//!
//! Multiply and divide route through `i128` intermediates to avoid overflow
//! when both operands are near `SCALE` (`spec.md` §9 "Q32.32 division").

use std::sync::OnceLock;

/// A Q32.32 fixed-point scalar.
pub type Fixed = i64;

/// `1 << 32`: the fixed-point scale factor (one "whole unit").
pub const SCALE: Fixed = 1i64 << 32;

/// Half of [`SCALE`]; the offset from a cell's integer corner to its center.
pub const CELL_CENTER: Fixed = SCALE / 2;

/// Convert an integer to fixed-point.
#[inline]
pub fn from_int(n: i32) -> Fixed {
    (n as i64) << 32
}

/// Truncate (floor toward negative infinity) a fixed-point value to an integer.
#[inline]
pub fn to_int(q: Fixed) -> i32 {
    (q >> 32) as i32
}

/// Fixed-point multiply using a 128-bit intermediate.
#[inline]
pub fn mul(a: Fixed, b: Fixed) -> Fixed {
    (((a as i128) * (b as i128)) >> 32) as i64
}

/// Fixed-point divide using a 128-bit intermediate. `b == 0` returns `0`
/// rather than panicking -- this is simulation math, not user input, and a
/// degenerate division (e.g. a zero-length direction vector) should decay to
/// "no effect" rather than crash the tick.
#[inline]
pub fn div(a: Fixed, b: Fixed) -> Fixed {
    if b == 0 {
        return 0;
    }
    (((a as i128) << 32) / (b as i128)) as i64
}

/// Coordinates of the center of grid cell `(x, y)`, in fixed-point.
#[inline]
pub fn cell_center(x: i32, y: i32) -> (Fixed, Fixed) {
    (from_int(x) + CELL_CENTER, from_int(y) + CELL_CENTER)
}

/// Integer square root of a non-negative `i128`, via Newton's method.
fn isqrt_i128(n: i128) -> i64 {
    if n <= 0 {
        return 0;
    }
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x as i64
}

/// Magnitude of `(x, y)` in fixed-point, via a 128-bit squared sum and
/// integer square root.
pub fn magnitude(x: Fixed, y: Fixed) -> Fixed {
    let sum_sq = (x as i128) * (x as i128) + (y as i128) * (y as i128);
    // sqrt(sum_sq / SCALE^2) * SCALE == sqrt(sum_sq)
    isqrt_i128(sum_sq)
}

/// Squared Euclidean distance between two fixed-point points, as a raw
/// `i128` (not scaled back down) -- used for cheap `<=` threshold compares
/// that would otherwise need a sqrt.
pub fn dist_sq_raw(x0: Fixed, y0: Fixed, x1: Fixed, y1: Fixed) -> i128 {
    let dx = (x1 - x0) as i128;
    let dy = (y1 - y0) as i128;
    dx * dx + dy * dy
}

/// Unit vector in the direction of `(x, y)`. `(0, 0)` maps to `(0, 0)`.
pub fn normalize2d(x: Fixed, y: Fixed) -> (Fixed, Fixed) {
    let mag = magnitude(x, y);
    if mag == 0 {
        return (0, 0);
    }
    (div(x, mag), div(y, mag))
}

/// Linear interpolation between `a` and `b`. `t` is expected in `[0, SCALE]`
/// but is not clamped, so callers can deliberately extrapolate.
pub fn lerp(a: Fixed, b: Fixed, t: Fixed) -> Fixed {
    a + mul(b - a, t)
}

// ---------------------------------------------------------------------------
// Trig LUT
// ---------------------------------------------------------------------------

/// Number of entries in the sin/cos lookup table. A power of two so the
/// angle -> index mapping is a cheap shift.
const LUT_BITS: u32 = 12;
const LUT_SIZE: usize = 1 << LUT_BITS; // 4096

struct TrigLut {
    sin: Vec<Fixed>,
}

static TRIG_LUT: OnceLock<TrigLut> = OnceLock::new();

fn trig_lut() -> &'static TrigLut {
    TRIG_LUT.get_or_init(|| {
        let mut sin = Vec::with_capacity(LUT_SIZE);
        for i in 0..LUT_SIZE {
            let radians = (i as f64) * std::f64::consts::TAU / (LUT_SIZE as f64);
            sin.push((radians.sin() * (SCALE as f64)).round() as i64);
        }
        TrigLut { sin }
    })
}

/// Reduce an arbitrary fixed-point angle (plus an additive offset, used to
/// implement `cos(a) = sin(a + pi/2)`) to a LUT index in `[0, LUT_SIZE)`.
#[inline]
fn lut_index(angle: Fixed, offset: Fixed) -> usize {
    let wrapped = angle.wrapping_add(offset).rem_euclid(SCALE);
    ((wrapped as u64 * LUT_SIZE as u64) / (SCALE as u64)) as usize % LUT_SIZE
}

/// Sine of `angle`, where `angle` in `[0, SCALE)` represents `[0, 2*pi)`.
pub fn sin(angle: Fixed) -> Fixed {
    trig_lut().sin[lut_index(angle, 0)]
}

/// Cosine of `angle`, where `angle` in `[0, SCALE)` represents `[0, 2*pi)`.
pub fn cos(angle: Fixed) -> Fixed {
    trig_lut().sin[lut_index(angle, SCALE / 4)]
}

// ---------------------------------------------------------------------------
// Geometry helpers
// ---------------------------------------------------------------------------

/// `true` iff `(x, y)` lies within (or on) the ellipse centered at `(cx, cy)`
/// with inverse-squared radii `inv_rx_sq`, `inv_ry_sq` (both precomputed as
/// `SCALE / (r*r)` by the caller, so this function stays multiply-only).
pub fn ellipse_contains_point(
    x: Fixed,
    y: Fixed,
    cx: Fixed,
    cy: Fixed,
    inv_rx_sq: Fixed,
    inv_ry_sq: Fixed,
) -> bool {
    let dx = x - cx;
    let dy = y - cy;
    let term = mul(mul(dx, dx), inv_rx_sq) + mul(mul(dy, dy), inv_ry_sq);
    term <= SCALE
}

/// Squared distance in "circular" space: `y` is halved first, correcting for
/// the grid being twice as tall as wide in rendered pixels, so that a
/// Euclidean compare in this space approximates an on-screen circle.
pub fn circle_dist_sq(dx: Fixed, dy: Fixed) -> i128 {
    let dy_corrected = dy / 2;
    (dx as i128) * (dx as i128) + (dy_corrected as i128) * (dy_corrected as i128)
}

/// Rescale `(x, y)` to the aspect-corrected space used by [`circle_dist_sq`].
pub fn scale_to_circular(x: Fixed, y: Fixed) -> (Fixed, Fixed) {
    (x, y / 2)
}

// ---------------------------------------------------------------------------
// DDA traversal
// ---------------------------------------------------------------------------

/// Visit every grid cell touched by the supercover line from `(x0, y0)` to
/// `(x1, y1)` (integer grid coordinates), in order, calling `callback(x, y)`
/// for each. Stops early if `callback` returns `false`.
///
/// This is a standard integer DDA: step along the dominant axis one cell at a
/// time, accumulating error for the other axis and stepping it whenever the
/// error exceeds half a cell. It always includes both endpoints.
pub fn traverse(x0: i32, y0: i32, x1: i32, y1: i32, mut callback: impl FnMut(i32, i32) -> bool) {
    let dx = (x1 - x0).abs();
    let dy = (y1 - y0).abs();
    let sx: i32 = if x1 > x0 { 1 } else { -1 };
    let sy: i32 = if y1 > y0 { 1 } else { -1 };

    let mut x = x0;
    let mut y = y0;

    if dx >= dy {
        let mut err = dx / 2;
        for _ in 0..=dx {
            if !callback(x, y) {
                return;
            }
            if x == x1 {
                break;
            }
            err -= dy;
            if err < 0 {
                y += sy;
                err += dx;
            }
            x += sx;
        }
    } else {
        let mut err = dy / 2;
        for _ in 0..=dy {
            if !callback(x, y) {
                return;
            }
            if y == y1 {
                break;
            }
            err -= dx;
            if err < 0 {
                x += sx;
                err += dy;
            }
            y += sy;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
