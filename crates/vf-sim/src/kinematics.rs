//! Q32.32 kinematic integration, homing steering and collision response
//! (`spec.md` §4.3).
//!
//! # Determinism
//!
//! Every function here operates on [`Fixed`] values with integer-only
//! arithmetic (`crate::fixed`). There is no floating point in the hot path,
//! so given the same starting `Kinetic` and the same `dt_ms` sequence, every
//! platform produces bit-identical trajectories -- the same guarantee the
//! teacher engine's tick loop makes for its command application order,
//! extended here to the physics itself. Collision response additionally
//! takes a seeded `Pcg64`, the same RNG type the genetic optimizer uses, so
//! a whole run stays reproducible end to end.

use rand::Rng;
use rand_pcg::Pcg64;

use crate::components::Kinetic;
use crate::fixed::{self, Fixed};

/// Convert a millisecond delta into Q32.32 seconds. `dt_ms` is always small
/// (clamped to `[0, 100]` by the tick loop), so this needs no 128-bit
/// intermediate.
#[inline]
fn ms_to_fixed_seconds(dt_ms: i64) -> Fixed {
    (dt_ms * fixed::SCALE) / 1000
}

/// Advance `k`'s position by its velocity over `dt_ms`.
pub fn integrate(k: &mut Kinetic, dt_ms: i64) {
    let dt = ms_to_fixed_seconds(dt_ms);
    k.x += fixed::mul(k.vx, dt);
    k.y += fixed::mul(k.vy, dt);
}

/// Reflect `k.vx` and clamp `k.x` into `[min_x, max_x]` if it overshot.
/// Returns whether a bounce occurred.
pub fn reflect_bounds_x(k: &mut Kinetic, min_x: Fixed, max_x: Fixed) -> bool {
    if k.x < min_x {
        k.x = min_x + (min_x - k.x);
        k.vx = -k.vx;
        true
    } else if k.x > max_x {
        k.x = max_x - (k.x - max_x);
        k.vx = -k.vx;
        true
    } else {
        false
    }
}

pub fn reflect_bounds_y(k: &mut Kinetic, min_y: Fixed, max_y: Fixed) -> bool {
    if k.y < min_y {
        k.y = min_y + (min_y - k.y);
        k.vy = -k.vy;
        true
    } else if k.y > max_y {
        k.y = max_y - (k.y - max_y);
        k.vy = -k.vy;
        true
    } else {
        false
    }
}

/// Integrate against a rectangular bound, plus a wall-aware bounce: each axis
/// is advanced independently, and if the cell the sampling point `(x + off_x,
/// y + off_y)` would land on tests positive under `is_blocked`, that axis's
/// move is undone and its velocity component is reflected and scaled by
/// `restitution` instead of being applied (`spec.md` §4.3 "Integrators").
/// `off_x`/`off_y` let a composite member sample blocking at its own offset
/// from the point being integrated rather than at `(k.x, k.y)` itself.
/// Returns whether either axis bounced this step.
#[allow(clippy::too_many_arguments)]
pub fn integrate_with_bounce(
    k: &mut Kinetic,
    dt_ms: i64,
    off_x: Fixed,
    off_y: Fixed,
    min_x: Fixed,
    max_x: Fixed,
    min_y: Fixed,
    max_y: Fixed,
    restitution: Fixed,
    is_blocked: impl Fn(i32, i32) -> bool,
) -> bool {
    let dt = ms_to_fixed_seconds(dt_ms);
    let safe_x = k.x;
    let safe_y = k.y;
    let mut bounced = false;

    let candidate_x = (k.x + fixed::mul(k.vx, dt)).clamp(min_x, max_x);
    let probe_y = fixed::to_int(k.y + off_y);
    if is_blocked(fixed::to_int(candidate_x + off_x), probe_y) {
        k.vx = -fixed::mul(k.vx, restitution);
        k.x = safe_x;
        bounced = true;
    } else {
        k.x = candidate_x;
    }

    let candidate_y = (k.y + fixed::mul(k.vy, dt)).clamp(min_y, max_y);
    let probe_x = fixed::to_int(k.x + off_x);
    if is_blocked(probe_x, fixed::to_int(candidate_y + off_y)) {
        k.vy = -fixed::mul(k.vy, restitution);
        k.y = safe_y;
        bounced = true;
    } else {
        k.y = candidate_y;
    }

    bounced
}

/// Acceleration/drag pair driving [`apply_homing`]/[`apply_homing_scaled`]
/// (`spec.md` §4.3 "Homing"). `acceleration` is Q32.32 units/s^2 applied
/// toward the target; `drag` is a Q32.32 fraction of current velocity bled
/// off per second, in `[0, SCALE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomingProfile {
    pub acceleration: Fixed,
    pub drag: Fixed,
}

/// Steer `k` toward `(target_x, target_y)` by accelerating along the
/// straight-line direction to it and bleeding off `profile.drag` of current
/// velocity every second, at full `profile.acceleration` (`spec.md` §4.3
/// "Homing"). Equivalent to [`apply_homing_scaled`] with `scale = SCALE` and
/// `direct_path = true`.
pub fn apply_homing(k: &mut Kinetic, target_x: Fixed, target_y: Fixed, profile: &HomingProfile, dt_ms: i64) {
    apply_homing_scaled(k, target_x, target_y, profile, fixed::SCALE, dt_ms, true);
}

/// As [`apply_homing`], but when `direct_path` is `false` the acceleration is
/// additionally multiplied by `scale` (Q32.32) instead of applied at full
/// strength -- used when steering off a flow-field sample rather than a
/// straight line to the target, so the body curves into a turn instead of
/// snapping onto a direction that goes stale the instant it rounds a corner
/// (`spec.md` §4.3 "Homing": "reduce acceleration ... to curve rather than
/// snap").
pub fn apply_homing_scaled(
    k: &mut Kinetic,
    target_x: Fixed,
    target_y: Fixed,
    profile: &HomingProfile,
    scale: Fixed,
    dt_ms: i64,
    direct_path: bool,
) {
    let (dir_x, dir_y) = fixed::normalize2d(target_x - k.x, target_y - k.y);
    if dir_x == 0 && dir_y == 0 {
        return;
    }

    let dt = ms_to_fixed_seconds(dt_ms);
    let accel_scale = if direct_path { fixed::SCALE } else { scale };
    let accel = fixed::mul(profile.acceleration, accel_scale);

    k.vx += fixed::mul(fixed::mul(dir_x, accel), dt);
    k.vy += fixed::mul(fixed::mul(dir_y, accel), dt);

    let drag = fixed::mul(profile.drag, dt).clamp(0, fixed::SCALE);
    k.vx = fixed::mul(k.vx, fixed::SCALE - drag);
    k.vy = fixed::mul(k.vy, fixed::SCALE - drag);
}

/// Clamp `k`'s speed to `max_speed`, preserving direction.
pub fn cap_speed(k: &mut Kinetic, max_speed: Fixed) {
    let speed = fixed::magnitude(k.vx, k.vy);
    if speed > max_speed && speed != 0 {
        let scale = fixed::div(max_speed, speed);
        k.vx = fixed::mul(k.vx, scale);
        k.vy = fixed::mul(k.vy, scale);
    }
}

/// Response parameters for a resolved collision (`spec.md` §4.3 "Collision
/// profiles").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionProfile {
    /// Velocity pushed along the radial direction away from the thing that
    /// was hit.
    pub impulse_magnitude: Fixed,
    /// 0 = fully absorb the closing velocity component, `SCALE` = keep it
    /// unattenuated.
    pub restitution: Fixed,
    /// How long the struck entity resists a second kinetic hit, in ms.
    pub immunity_duration_ms: i64,
    /// Random sideways kick magnitude, perpendicular to the radial
    /// direction, so a straight-line hit doesn't produce a perfectly
    /// straight-line bounce every time.
    pub lateral_jitter: Fixed,
    /// Scales the angular kick an [`apply_offset_collision`] hit imparts
    /// around the header, proportional to `cross(offset, radial)`.
    pub rotational_factor: Fixed,
}

/// Resolve a collision against `k` along the radial direction `(radial_x,
/// radial_y)` (pointing from whatever was hit toward `k`): attenuate the
/// velocity component still closing along that direction by
/// `profile.restitution`, push `profile.impulse_magnitude` outward along it,
/// and add a `profile.lateral_jitter`-scaled random kick perpendicular to it
/// (`spec.md` §4.3 "apply_collision"). A zero-length radial falls back to
/// `(1, 0)` so the result stays deterministic even when `k` sits exactly on
/// the point it was struck from.
pub fn apply_collision(k: &mut Kinetic, radial_x: Fixed, radial_y: Fixed, profile: &CollisionProfile, rng: &mut Pcg64) {
    let (mut nx, mut ny) = fixed::normalize2d(radial_x, radial_y);
    if nx == 0 && ny == 0 {
        nx = fixed::SCALE;
        ny = 0;
    }

    let along = fixed::mul(k.vx, nx) + fixed::mul(k.vy, ny);
    if along < 0 {
        let removed = fixed::mul(along, fixed::SCALE - profile.restitution);
        k.vx -= fixed::mul(nx, removed);
        k.vy -= fixed::mul(ny, removed);
    }

    k.vx += fixed::mul(nx, profile.impulse_magnitude);
    k.vy += fixed::mul(ny, profile.impulse_magnitude);

    if profile.lateral_jitter != 0 {
        let jitter = rng.gen_range(-profile.lateral_jitter..=profile.lateral_jitter);
        let (px, py) = (-ny, nx);
        k.vx += fixed::mul(px, jitter);
        k.vy += fixed::mul(py, jitter);
    }
}

/// As [`apply_collision`], plus an angular term for a composite member struck
/// at `(offset_x, offset_y)` away from its header's centroid: the impulse is
/// rotated around the header by `profile.rotational_factor * cross(offset,
/// radial)`, expressed as extra velocity tangential to `offset` (`spec.md`
/// §4.3 "apply_offset_collision").
pub fn apply_offset_collision(
    k: &mut Kinetic,
    radial_x: Fixed,
    radial_y: Fixed,
    offset_x: Fixed,
    offset_y: Fixed,
    profile: &CollisionProfile,
    rng: &mut Pcg64,
) {
    apply_collision(k, radial_x, radial_y, profile, rng);

    let (rx, ry) = fixed::normalize2d(radial_x, radial_y);
    let cross = fixed::mul(offset_x, ry) - fixed::mul(offset_y, rx);
    let torque = fixed::mul(profile.rotational_factor, cross);
    if torque != 0 {
        let (tx, ty) = fixed::normalize2d(-offset_y, offset_x);
        k.vx += fixed::mul(tx, torque);
        k.vy += fixed::mul(ty, torque);
    }
}

/// Detection-only ellipse overlap test: does `(x, y)` fall inside the
/// ellipse centered at `(cx, cy)` with inverse-squared radii `inv_rx_sq`,
/// `inv_ry_sq` (`spec.md` §4.3 "check_soft_collision"). Returns the radial
/// vector from the center to the point (for a caller that wants to resolve a
/// hit immediately) alongside the hit flag, rather than just a bool, so
/// triggering and resolving a soft collision doesn't need a second distance
/// computation.
pub fn check_soft_collision(x: Fixed, y: Fixed, cx: Fixed, cy: Fixed, inv_rx_sq: Fixed, inv_ry_sq: Fixed) -> (Fixed, Fixed, bool) {
    let radial_x = x - cx;
    let radial_y = y - cy;
    let hit = fixed::ellipse_contains_point(x, y, cx, cy, inv_rx_sq, inv_ry_sq);
    (radial_x, radial_y, hit)
}
