//! Grid -> entity-set spatial index, plus wall-blocking and line-of-sight
//! queries (`spec.md` §4.2).
//!
//! The index owns the authoritative `Position` write path: [`SpatialIndex::set_position`]
//! updates both the `Position` component and the cell bucket in the same
//! call, so the two can never drift apart. Any other code path that calls
//! `world.set::<Position>(..)` directly bypasses the blocking/LOS queries
//! and is forbidden by convention (`spec.md` §4.2).

use vf_ecs::EntityId;

use crate::components::{Position, Wall};
use crate::fixed::traverse;
use crate::world::World;

/// Guided expansion order used by [`SpatialIndex::find_free_from_pattern`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPattern {
    /// N, E, S, W before the diagonals.
    CardinalFirst,
    /// NE, SE, SW, NW before the cardinals.
    DiagonalFirst,
}

#[inline]
fn linear_index(width: i32, x: i32, y: i32) -> Option<usize> {
    if x < 0 || y < 0 || x >= width {
        return None;
    }
    Some((y as usize) * (width as usize) + (x as usize))
}

pub struct SpatialIndex {
    width: i32,
    height: i32,
    cells: Vec<Vec<EntityId>>,
    /// Last known cell per entity, so `set_position` can find and vacate the
    /// old bucket without a linear scan.
    last_cell: std::collections::HashMap<EntityId, (i32, i32)>,
}

impl SpatialIndex {
    pub fn new(width: i32, height: i32) -> Self {
        let count = (width.max(0) as usize) * (height.max(0) as usize);
        Self {
            width,
            height,
            cells: vec![Vec::new(); count],
            last_cell: std::collections::HashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        for bucket in self.cells.iter_mut() {
            bucket.clear();
        }
        self.last_cell.clear();
    }

    fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.width && y < self.height
    }

    fn bucket_mut(&mut self, x: i32, y: i32) -> Option<&mut Vec<EntityId>> {
        let idx = linear_index(self.width, x, y)?;
        if y >= self.height {
            return None;
        }
        self.cells.get_mut(idx)
    }

    fn bucket(&self, x: i32, y: i32) -> Option<&Vec<EntityId>> {
        let idx = linear_index(self.width, x, y)?;
        if y >= self.height {
            return None;
        }
        self.cells.get(idx)
    }

    /// Update `entity`'s `Position` component and its cell bucket together.
    pub fn set_position(&mut self, world: &mut World, entity: EntityId, x: i32, y: i32) {
        if let Some(&(ox, oy)) = self.last_cell.get(&entity) {
            if (ox, oy) == (x, y) {
                world.set(entity, Position::new(x, y));
                return;
            }
            if let Some(bucket) = self.bucket_mut(ox, oy) {
                bucket.retain(|&e| e != entity);
            }
        }
        if let Some(bucket) = self.bucket_mut(x, y) {
            bucket.push(entity);
        }
        self.last_cell.insert(entity, (x, y));
        world.set(entity, Position::new(x, y));
    }

    /// Alias for [`SpatialIndex::set_position`]; both names appear in
    /// `spec.md` §4.2 for the same operation.
    pub fn move_entity(&mut self, world: &mut World, entity: EntityId, x: i32, y: i32) {
        self.set_position(world, entity, x, y);
    }

    /// Remove `entity` from the index entirely (does not touch its
    /// component); called from entity teardown.
    pub fn forget(&mut self, entity: EntityId) {
        if let Some((x, y)) = self.last_cell.remove(&entity) {
            if let Some(bucket) = self.bucket_mut(x, y) {
                bucket.retain(|&e| e != entity);
            }
        }
    }

    pub fn get_all_at(&self, x: i32, y: i32) -> &[EntityId] {
        self.bucket(x, y).map(|b| b.as_slice()).unwrap_or(&[])
    }

    /// Zero-allocation variant: clears `buf` then extends it from the
    /// target cell, for hot sweeps that want to reuse a scratch buffer.
    pub fn get_all_at_into(&self, x: i32, y: i32, buf: &mut Vec<EntityId>) {
        buf.clear();
        if let Some(bucket) = self.bucket(x, y) {
            buf.extend_from_slice(bucket);
        }
    }

    pub fn has_blocking_wall_at(&self, world: &World, x: i32, y: i32, mask: u32) -> bool {
        if !self.in_bounds(x, y) {
            return true; // out of bounds behaves as solid
        }
        self.get_all_at(x, y).iter().any(|&e| {
            world
                .get::<Wall>(e)
                .map(|w| w.mask & mask != 0)
                .unwrap_or(false)
        })
    }

    pub fn has_blocking_wall_in_area(
        &self,
        world: &World,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
        mask: u32,
    ) -> bool {
        for cy in y..y + h.max(1) {
            for cx in x..x + w.max(1) {
                if self.has_blocking_wall_at(world, cx, cy, mask) {
                    return true;
                }
            }
        }
        false
    }

    /// Integer supercover DDA line of sight: true iff every cell the line
    /// touches is free of a blocking wall.
    pub fn has_line_of_sight(
        &self,
        world: &World,
        x0: i32,
        y0: i32,
        x1: i32,
        y1: i32,
        mask: u32,
    ) -> bool {
        let mut clear = true;
        traverse(x0, y0, x1, y1, |x, y| {
            if self.has_blocking_wall_at(world, x, y, mask) {
                clear = false;
                return false;
            }
            true
        });
        clear
    }

    /// Area line of sight for a `w`x`h` footprint swept from `(x0,y0)` to
    /// `(x1,y1)`. On failure, retries with the footprint's axes swapped
    /// (`spec.md` §4.6 "retry with the rectangle rotated 90").
    pub fn has_area_line_of_sight_rotatable(
        &self,
        world: &World,
        x0: i32,
        y0: i32,
        x1: i32,
        y1: i32,
        w: i32,
        h: i32,
        mask: u32,
    ) -> bool {
        if self.sweep_footprint_clear(world, x0, y0, x1, y1, w, h, mask) {
            return true;
        }
        self.sweep_footprint_clear(world, x0, y0, x1, y1, h, w, mask)
    }

    fn sweep_footprint_clear(
        &self,
        world: &World,
        x0: i32,
        y0: i32,
        x1: i32,
        y1: i32,
        w: i32,
        h: i32,
        mask: u32,
    ) -> bool {
        let half_w = w / 2;
        let half_h = h / 2;
        let mut clear = true;
        traverse(x0, y0, x1, y1, |x, y| {
            if self.has_blocking_wall_in_area(world, x - half_w, y - half_h, w, h, mask) {
                clear = false;
                return false;
            }
            true
        });
        clear
    }

    /// Spiral outward from `(cx + offset_x, cy + offset_y)` looking for a
    /// `w`x`h` area with `padding` extra clearance on every side that is
    /// entirely free of blocking walls.
    pub fn find_free_area_spiral(
        &self,
        world: &World,
        cx: i32,
        cy: i32,
        w: i32,
        h: i32,
        offset_x: i32,
        offset_y: i32,
        mask: u32,
        padding: i32,
    ) -> Option<(i32, i32)> {
        let origin_x = cx + offset_x;
        let origin_y = cy + offset_y;
        let max_radius = self.width.max(self.height);

        let check = |x: i32, y: i32| -> bool {
            !self.has_blocking_wall_in_area(
                world,
                x - padding,
                y - padding,
                w + padding * 2,
                h + padding * 2,
                mask,
            )
        };

        if check(origin_x, origin_y) {
            return Some((origin_x, origin_y));
        }

        for radius in 1..=max_radius {
            for dx in -radius..=radius {
                for dy in [-radius, radius] {
                    let (x, y) = (origin_x + dx, origin_y + dy);
                    if check(x, y) {
                        return Some((x, y));
                    }
                }
            }
            for dy in (-radius + 1)..radius {
                for dx in [-radius, radius] {
                    let (x, y) = (origin_x + dx, origin_y + dy);
                    if check(x, y) {
                        return Some((x, y));
                    }
                }
            }
        }
        None
    }

    /// Guided search expanding outward, trying neighbours in `pattern`'s
    /// order at each ring before falling back to a full spiral.
    pub fn find_free_from_pattern(
        &self,
        world: &World,
        cx: i32,
        cy: i32,
        w: i32,
        h: i32,
        mask: u32,
        pattern: SearchPattern,
    ) -> Option<(i32, i32)> {
        let cardinals = [(0, -1), (1, 0), (0, 1), (-1, 0)];
        let diagonals = [(1, -1), (1, 1), (-1, 1), (-1, -1)];
        let order: Vec<(i32, i32)> = match pattern {
            SearchPattern::CardinalFirst => cardinals.iter().chain(diagonals.iter()).copied().collect(),
            SearchPattern::DiagonalFirst => diagonals.iter().chain(cardinals.iter()).copied().collect(),
        };

        let check = |x: i32, y: i32| -> bool { !self.has_blocking_wall_in_area(world, x, y, w, h, mask) };

        if check(cx, cy) {
            return Some((cx, cy));
        }
        let max_radius = self.width.max(self.height);
        for radius in 1..=max_radius {
            for &(dx, dy) in &order {
                let (x, y) = (cx + dx * radius, cy + dy * radius);
                if check(x, y) {
                    return Some((x, y));
                }
            }
        }
        self.find_free_area_spiral(world, cx, cy, w, h, 0, 0, mask, 0)
    }
}
