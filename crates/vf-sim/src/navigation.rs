//! Flow-field navigation (`spec.md` §4.6).
//!
//! A [`PassabilityGrid`] answers "can a footprint of this size stand here",
//! built once per target group per tick via Minkowski expansion of the wall
//! layer. A [`FlowField`] is then a single Dijkstra flood from the target
//! cell over that grid, giving every passable cell a direction that makes
//! monotonic progress toward the target without needing per-entity A*.
//! Entities sample the field bilinearly so they don't visibly snap between
//! cells as they cross cell boundaries.

use std::collections::HashMap;

use vf_ecs::EntityId;

use crate::components::{Kinetic, Navigation, Target};
use crate::events::{EventKind, SimEvent, TargetSpec};
use crate::fixed::{self, Fixed};
use crate::scheduler::{MetaSystemCommand, SimContext, System};
use crate::spatial::SpatialIndex;
use crate::world::World;

/// Integer edge costs. The diagonal cost is the classic `10`/`14` Bresenham
/// proxy for `sqrt(2)`, keeping the whole flood in integers.
const CARDINAL_COST: i32 = 10;
const DIAGONAL_COST: i32 = 14;

/// Deterministic neighbor visitation order: N, E, S, W, then the diagonals.
/// Fixing this order (rather than iterating a HashMap or similar) is what
/// makes two floods from the same target produce identical fields.
const NEIGHBORS: [(i32, i32, i32); 8] = [
    (0, -1, CARDINAL_COST),
    (1, 0, CARDINAL_COST),
    (0, 1, CARDINAL_COST),
    (-1, 0, CARDINAL_COST),
    (1, -1, DIAGONAL_COST),
    (1, 1, DIAGONAL_COST),
    (-1, 1, DIAGONAL_COST),
    (-1, -1, DIAGONAL_COST),
];

/// Whether a `w`x`h` footprint can stand at each cell, computed once and
/// shared by every entity of matching footprint/mask this tick.
pub struct PassabilityGrid {
    pub width: i32,
    pub height: i32,
    passable: Vec<bool>,
}

impl PassabilityGrid {
    /// Minkowski-expand the wall layer by the footprint's half-extents: a
    /// cell is passable iff no wall cell matching `mask` falls within the
    /// `w`x`h` rectangle centered on it.
    pub fn build(world: &World, spatial: &SpatialIndex, width: i32, height: i32, w: i32, h: i32, mask: u32) -> Self {
        let mut passable = vec![true; (width as usize) * (height as usize)];
        let half_w = w / 2;
        let half_h = h / 2;
        for y in 0..height {
            for x in 0..width {
                let idx = (y as usize) * (width as usize) + (x as usize);
                passable[idx] =
                    !spatial.has_blocking_wall_in_area(world, x - half_w, y - half_h, w.max(1), h.max(1), mask);
            }
        }
        Self {
            width,
            height,
            passable,
        }
    }

    #[inline]
    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return None;
        }
        Some((y as usize) * (self.width as usize) + (x as usize))
    }

    pub fn is_passable(&self, x: i32, y: i32) -> bool {
        self.index(x, y).map(|i| self.passable[i]).unwrap_or(false)
    }
}

/// A flood-filled direction-to-target field over a [`PassabilityGrid`].
pub struct FlowField {
    pub width: i32,
    pub height: i32,
    /// Unit direction toward the target at every passable cell; `(0, 0)` at
    /// unreachable cells.
    dir: Vec<(Fixed, Fixed)>,
    reachable: Vec<bool>,
}

impl FlowField {
    /// Dijkstra flood from `(target_x, target_y)` over `grid`, using
    /// [`NEIGHBORS`]'s fixed order so ties resolve identically every time.
    pub fn compute(grid: &PassabilityGrid, target_x: i32, target_y: i32) -> Self {
        let cells = (grid.width as usize) * (grid.height as usize);
        let mut cost = vec![i32::MAX; cells];
        let mut dir = vec![(0, 0); cells];
        let mut reachable = vec![false; cells];

        if grid.width <= 0 || grid.height <= 0 || !grid.is_passable(target_x, target_y) {
            return Self {
                width: grid.width,
                height: grid.height,
                dir,
                reachable,
            };
        }

        // Small binary heap keyed by cost; cells are cheap enough that a
        // BinaryHeap<Reverse<_>> over a bounded grid stays fast without extra
        // bookkeeping.
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        let target_idx = (target_y as usize) * (grid.width as usize) + (target_x as usize);
        cost[target_idx] = 0;
        reachable[target_idx] = true;
        let mut heap = BinaryHeap::new();
        heap.push(Reverse((0i32, target_x, target_y)));

        while let Some(Reverse((d, x, y))) = heap.pop() {
            let idx = (y as usize) * (grid.width as usize) + (x as usize);
            if d > cost[idx] {
                continue;
            }
            for &(dx, dy, step_cost) in &NEIGHBORS {
                let (nx, ny) = (x + dx, y + dy);
                if !grid.is_passable(nx, ny) {
                    continue;
                }
                let nidx = (ny as usize) * (grid.width as usize) + (nx as usize);
                let nd = d + step_cost;
                if nd < cost[nidx] {
                    cost[nidx] = nd;
                    reachable[nidx] = true;
                    // Direction points from (nx, ny) back toward (x, y), i.e.
                    // toward the target.
                    dir[nidx] = fixed::normalize2d(fixed::from_int(-dx), fixed::from_int(-dy));
                    heap.push(Reverse((nd, nx, ny)));
                }
            }
        }

        Self {
            width: grid.width,
            height: grid.height,
            dir,
            reachable,
        }
    }

    #[inline]
    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return None;
        }
        Some((y as usize) * (self.width as usize) + (x as usize))
    }

    pub fn has_path_at(&self, x: i32, y: i32) -> bool {
        self.index(x, y).map(|i| self.reachable[i]).unwrap_or(false)
    }

    pub fn direction_at(&self, x: i32, y: i32) -> (Fixed, Fixed) {
        self.index(x, y).map(|i| self.dir[i]).unwrap_or((0, 0))
    }

    /// Bilinearly interpolate the flow direction at a continuous Q32.32
    /// point, so motion doesn't visibly snap at cell boundaries. Falls back
    /// to the nearest reachable corner's direction if some corners are
    /// unreachable.
    pub fn sample_bilinear(&self, x: Fixed, y: Fixed) -> (Fixed, Fixed) {
        let x0 = fixed::to_int(x);
        let y0 = fixed::to_int(y);
        let x1 = x0 + 1;
        let y1 = y0 + 1;

        let frac_x = x - fixed::from_int(x0);
        let frac_y = y - fixed::from_int(y0);

        let corners = [
            (self.direction_at(x0, y0), self.has_path_at(x0, y0)),
            (self.direction_at(x1, y0), self.has_path_at(x1, y0)),
            (self.direction_at(x0, y1), self.has_path_at(x0, y1)),
            (self.direction_at(x1, y1), self.has_path_at(x1, y1)),
        ];

        if let Some((best, _)) = corners.iter().find(|(_, ok)| *ok) {
            if corners.iter().all(|(_, ok)| *ok) {
                let top_x = fixed::lerp(corners[0].0 .0, corners[1].0 .0, frac_x);
                let top_y = fixed::lerp(corners[0].0 .1, corners[1].0 .1, frac_x);
                let bottom_x = fixed::lerp(corners[2].0 .0, corners[3].0 .0, frac_x);
                let bottom_y = fixed::lerp(corners[2].0 .1, corners[3].0 .1, frac_x);
                let x = fixed::lerp(top_x, bottom_x, frac_y);
                let y = fixed::lerp(top_y, bottom_y, frac_y);
                return fixed::normalize2d(x, y);
            }
            return *best;
        }
        (0, 0)
    }
}

/// Selects which of several target-group flow fields an entity should
/// follow this tick, weighted by `budget_multiplier` (`spec.md` §4.6 "band
/// routing"): entities prefer the nearest band whose flow cost, divided by
/// `budget_multiplier`, is lowest, so a higher multiplier lets an entity
/// "afford" a farther but less congested band.
pub fn select_band<'a>(
    fields: &'a [(u32, &'a FlowField)],
    x: i32,
    y: i32,
    budget_multiplier: Fixed,
) -> Option<(u32, &'a FlowField)> {
    fields
        .iter()
        .filter(|(_, f)| f.has_path_at(x, y))
        .min_by_key(|(_, f)| {
            let dir = f.direction_at(x, y);
            let proxy = fixed::magnitude(dir.0, dir.1); // always SCALE when reachable
            fixed::div(proxy, budget_multiplier.max(1))
        })
        .copied()
}

/// Wall layer every navigation query respects; the simulation only has one
/// blocking layer today (`spec.md` §3 `Wall.mask` invariant), so this is a
/// constant rather than a per-entity field.
const NAV_WALL_MASK: u32 = 1;

/// Recompute a group's cached flow field once its target has moved at least
/// this many cells (`spec.md` §4.6 "dirty_distance").
const DIRTY_DISTANCE_SQ: i64 = 3 * 3;

/// Never recompute a group's field more often than this, even if its target
/// moves every tick (`spec.md` §4.6 "min_ticks_between_compute").
const MIN_TICKS_BETWEEN_COMPUTE: u64 = 10;

struct CachedField {
    field: FlowField,
    target_cell: (i32, i32),
    computed_at_tick: u64,
}

/// Resolves each target group's goal cell, maintains a throttled flow-field
/// cache per `(group, footprint)`, and writes every navigating entity's
/// sampled direction into its `Navigation` component each tick (`spec.md`
/// §4.6). Entities with direct line of sight to their target skip the field
/// entirely and steer straight at it.
pub struct NavigationSystem {
    target_specs: HashMap<u32, TargetSpec>,
    cursor_cell: (i32, i32),
    fields: HashMap<(u32, i32, i32), CachedField>,
    tick: u64,
    /// Each entity's raw (pre-brake) flow direction from the previous tick,
    /// so a sharp turn can be detected and braked (`spec.md` §4.6
    /// "turn_threshold"/"brake_intensity").
    prev_dir: HashMap<EntityId, (Fixed, Fixed)>,
}

impl NavigationSystem {
    pub fn new() -> Self {
        Self {
            target_specs: HashMap::new(),
            cursor_cell: (0, 0),
            fields: HashMap::new(),
            tick: 0,
            prev_dir: HashMap::new(),
        }
    }

    fn resolve_target_cell(&self, world: &World, group: u32) -> Option<(i32, i32)> {
        match self.target_specs.get(&group).copied().unwrap_or(TargetSpec::Cursor) {
            TargetSpec::Cursor => Some(self.cursor_cell),
            TargetSpec::Static(x, y) => Some((x, y)),
            TargetSpec::Entity(e) => world.get::<Kinetic>(e).map(|k| k.grid_position()),
        }
    }

    /// Recompute and cache the `(group, w, h)` field if it's missing, moved
    /// far enough from its target, and isn't throttled. Split from
    /// [`NavigationSystem::field_for`] so two footprints can be fetched in
    /// the same tick without two simultaneous `&mut self` borrows.
    fn ensure_field(&mut self, world: &World, spatial: &SpatialIndex, group: u32, target_cell: (i32, i32), w: i32, h: i32) {
        let key = (group, w, h);
        let needs_recompute = match self.fields.get(&key) {
            None => true,
            Some(cached) => {
                let dx = (cached.target_cell.0 - target_cell.0) as i64;
                let dy = (cached.target_cell.1 - target_cell.1) as i64;
                let moved_far = dx * dx + dy * dy >= DIRTY_DISTANCE_SQ;
                let throttled = self.tick.saturating_sub(cached.computed_at_tick) < MIN_TICKS_BETWEEN_COMPUTE;
                moved_far && !throttled
            }
        };

        if needs_recompute {
            let grid = PassabilityGrid::build(
                world,
                spatial,
                world.config.map_width,
                world.config.map_height,
                w,
                h,
                NAV_WALL_MASK,
            );
            let field = FlowField::compute(&grid, target_cell.0, target_cell.1);
            self.fields.insert(
                key,
                CachedField {
                    field,
                    target_cell,
                    computed_at_tick: self.tick,
                },
            );
        }
    }

    fn get_field(&self, group: u32, w: i32, h: i32) -> &FlowField {
        &self.fields.get(&(group, w, h)).expect("ensure_field called first").field
    }

    fn field_for<'a>(
        &'a mut self,
        world: &World,
        spatial: &SpatialIndex,
        group: u32,
        target_cell: (i32, i32),
        w: i32,
        h: i32,
    ) -> &'a FlowField {
        self.ensure_field(world, spatial, group, target_cell, w, h);
        self.get_field(group, w, h)
    }
}

impl Default for NavigationSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl System for NavigationSystem {
    fn name(&self) -> &'static str {
        "navigation"
    }

    fn priority(&self) -> i32 {
        -50
    }

    fn run(&mut self, ctx: &mut SimContext, _dt_ms: i64) -> Vec<MetaSystemCommand> {
        for event in ctx.events.events() {
            match event {
                SimEvent::CursorMoved { x, y } => self.cursor_cell = (*x, *y),
                SimEvent::TargetGroupUpdate { group, target } => {
                    self.target_specs.insert(*group, *target);
                }
                _ => {}
            }
        }

        let entities = ctx.world.all::<Navigation>();
        for entity in entities {
            let Some(nav) = ctx.world.get::<Navigation>(entity).copied() else {
                continue;
            };
            let Some(kinetic) = ctx.world.get::<Kinetic>(entity).copied() else {
                continue;
            };
            let group = ctx.world.get::<Target>(entity).copied().unwrap_or_default().group;
            let Some(target_cell) = self.resolve_target_cell(ctx.world, group) else {
                continue;
            };

            let (ex, ey) = kinetic.grid_position();
            let has_los = ctx
                .spatial
                .has_area_line_of_sight_rotatable(ctx.world, ex, ey, target_cell.0, target_cell.1, nav.width, nav.height, NAV_WALL_MASK);

            let (mut flow_x, mut flow_y, mut has_direct_path) = if has_los {
                let (tx, ty) = fixed::cell_center(target_cell.0, target_cell.1);
                let (dx, dy) = fixed::normalize2d(tx - kinetic.x, ty - kinetic.y);
                (dx, dy, true)
            } else {
                self.ensure_field(ctx.world, ctx.spatial, group, target_cell, nav.width, nav.height);
                let field = self.get_field(group, nav.width, nav.height);
                let (dx, dy) = field.sample_bilinear(kinetic.x, kinetic.y);
                (dx, dy, field.has_path_at(ex, ey))
            };

            // Band routing (`spec.md` §4.6 "band routing"): once the entity
            // can afford it, let it favor a wider-berth route over the one
            // nearest to the straight-line gradient, scored by
            // `budget_multiplier` and blended in by `exploration_bias`. Gives
            // GA-tuned entities path diversity instead of every entity of a
            // species collapsing onto the same monotonic shortest path.
            if !has_los && nav.budget_multiplier > fixed::SCALE {
                let wide_w = nav.width + 2;
                let wide_h = nav.height + 2;
                self.ensure_field(ctx.world, ctx.spatial, group, target_cell, wide_w, wide_h);

                let near = self.get_field(group, nav.width, nav.height);
                let wide = self.get_field(group, wide_w, wide_h);
                let bands = [(0u32, near), (1u32, wide)];

                if let Some((1, chosen)) = select_band(&bands, ex, ey, nav.budget_multiplier) {
                    let (wx, wy) = chosen.sample_bilinear(kinetic.x, kinetic.y);
                    let (bx, by) = fixed::normalize2d(fixed::lerp(flow_x, wx, nav.exploration_bias), fixed::lerp(flow_y, wy, nav.exploration_bias));
                    flow_x = bx;
                    flow_y = by;
                    has_direct_path = chosen.has_path_at(ex, ey);
                }
            }

            let raw_dir = (flow_x, flow_y);
            if let Some(&prev) = self.prev_dir.get(&entity) {
                let dot = fixed::mul(flow_x, prev.0) + fixed::mul(flow_y, prev.1);
                let turn = fixed::SCALE - dot;
                if turn > nav.turn_threshold {
                    flow_x = fixed::mul(flow_x, nav.brake_intensity);
                    flow_y = fixed::mul(flow_y, nav.brake_intensity);
                }
            }
            self.prev_dir.insert(entity, raw_dir);

            if let Some(nav_mut) = ctx.world.get_mut::<Navigation>(entity) {
                nav_mut.flow_x = flow_x;
                nav_mut.flow_y = flow_y;
                nav_mut.has_direct_path = has_direct_path;
            }
        }

        self.tick += 1;
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::Wall;
    use crate::config::SimConfig;

    fn open_world(w: i32, h: i32) -> (World, SpatialIndex) {
        (World::new(SimConfig::default()), SpatialIndex::new(w, h))
    }

    #[test]
    fn open_field_points_toward_target() {
        let (world, spatial) = open_world(10, 10);
        let grid = PassabilityGrid::build(&world, &spatial, 10, 10, 1, 1, 1);
        let field = FlowField::compute(&grid, 5, 5);
        assert!(field.has_path_at(0, 0));
        let (dx, dy) = field.direction_at(0, 0);
        assert!(dx > 0 && dy > 0);
    }

    #[test]
    fn wall_blocks_reachability() {
        let (mut world, mut spatial) = open_world(10, 10);
        for y in 0..10 {
            let w = world.create();
            spatial.set_position(&mut world, w, 5, y);
            world.set(w, Wall { mask: 1 });
        }
        let grid = PassabilityGrid::build(&world, &spatial, 10, 10, 1, 1, 1);
        let field = FlowField::compute(&grid, 9, 5);
        assert!(!field.has_path_at(0, 5));
    }

    #[test]
    fn minkowski_expansion_blocks_wide_footprint_in_narrow_gap() {
        let (mut world, mut spatial) = open_world(10, 10);
        for y in 0..10 {
            if y != 5 {
                let w = world.create();
                spatial.set_position(&mut world, w, 5, y);
                world.set(w, Wall { mask: 1 });
            }
        }
        let narrow = PassabilityGrid::build(&world, &spatial, 10, 10, 1, 1, 1);
        assert!(narrow.is_passable(5, 5));

        let wide = PassabilityGrid::build(&world, &spatial, 10, 10, 3, 1, 1);
        assert!(!wide.is_passable(5, 5));
    }

    #[test]
    fn sample_bilinear_matches_cell_direction_at_cell_center() {
        let (world, spatial) = open_world(10, 10);
        let grid = PassabilityGrid::build(&world, &spatial, 10, 10, 1, 1, 1);
        let field = FlowField::compute(&grid, 9, 0);
        let (cx, cy) = fixed::cell_center(0, 0);
        let sampled = field.sample_bilinear(cx, cy);
        let direct = field.direction_at(0, 0);
        assert!((sampled.0 - direct.0).abs() < fixed::SCALE / 10);
    }

    #[test]
    fn select_band_prefers_reachable_field() {
        let (world, spatial) = open_world(10, 10);
        let grid = PassabilityGrid::build(&world, &spatial, 10, 10, 1, 1, 1);
        let near = FlowField::compute(&grid, 1, 1);
        let far = FlowField::compute(&grid, 9, 9);
        let fields: Vec<(u32, &FlowField)> = vec![(0, &near), (1, &far)];
        let chosen = select_band(&fields, 0, 0, fixed::SCALE);
        assert!(chosen.is_some());
    }

    fn nav_world() -> (World, SpatialIndex) {
        let config = SimConfig {
            map_width: 10,
            map_height: 10,
            ..SimConfig::default()
        };
        (World::new(config), SpatialIndex::new(10, 10))
    }

    #[test]
    fn entity_in_direct_sight_steers_straight_at_the_cursor() {
        use crate::events::EventBus;

        let (mut world, mut spatial) = nav_world();
        let entity = world.create();
        spatial.set_position(&mut world, entity, 0, 0);
        world.set(entity, Kinetic::at_cell(0, 0));
        world.set(entity, Navigation::default());
        world.set(entity, Target::default());

        let mut events = EventBus::new();
        events.publish(SimEvent::CursorMoved { x: 5, y: 5 });
        events.advance_tick();

        let mut system = NavigationSystem::new();
        let mut ctx = SimContext {
            world: &mut world,
            events: &mut events,
            spatial: &mut spatial,
        };
        system.run(&mut ctx, 50);

        let nav = world.get::<Navigation>(entity).unwrap();
        assert!(nav.has_direct_path);
        assert!(nav.flow_x > 0 && nav.flow_y > 0);
    }

    #[test]
    fn entity_behind_a_wall_follows_the_flow_field_instead() {
        use crate::events::EventBus;

        let (mut world, mut spatial) = nav_world();
        for y in 0..10 {
            let w = world.create();
            spatial.set_position(&mut world, w, 5, y);
            world.set(w, Wall { mask: 1 });
        }

        let entity = world.create();
        spatial.set_position(&mut world, entity, 0, 5);
        world.set(entity, Kinetic::at_cell(0, 5));
        world.set(entity, Navigation::default());
        world.set(entity, Target::default());

        let mut events = EventBus::new();
        events.publish(SimEvent::CursorMoved { x: 9, y: 5 });
        events.advance_tick();

        let mut system = NavigationSystem::new();
        let mut ctx = SimContext {
            world: &mut world,
            events: &mut events,
            spatial: &mut spatial,
        };
        system.run(&mut ctx, 50);

        let nav = world.get::<Navigation>(entity).unwrap();
        assert!(!nav.has_direct_path);
    }
}
