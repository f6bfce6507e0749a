//! Flow-field pathfinding benchmark.
//!
//! The navigation system recomputes a group's flow field whenever its target
//! moves far enough (`spec.md` §4.6 "dirty-distance threshold"), so a map
//! that is both large and densely walled is the worst case for per-tick
//! cost. This measures `PassabilityGrid::build` + `FlowField::compute` in
//! isolation from the rest of the tick, since those two calls dominate the
//! system's cost when a recompute actually fires.
//!
//! Run with: `cargo bench --bench navigation_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use vf_sim::config::SimConfig;
use vf_sim::navigation::{FlowField, PassabilityGrid};
use vf_sim::spatial::SpatialIndex;
use vf_sim::world::World;

/// Scatter walls in a deterministic checkerboard-ish pattern so the
/// passability grid isn't trivially empty, without blocking every path
/// outright.
fn build_world_with_walls(width: i32, height: i32) -> (World, SpatialIndex) {
    let mut world = World::new(SimConfig {
        map_width: width,
        map_height: height,
        ..SimConfig::default()
    });
    let mut spatial = SpatialIndex::new(width, height);

    for y in 0..height {
        for x in 0..width {
            if (x + y * 3) % 7 == 0 {
                let wall = world.create();
                world.set(wall, vf_sim::components::Wall::default());
                spatial.set_position(&mut world, wall, x, y);
            }
        }
    }
    (world, spatial)
}

fn bench_flow_field_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_field_compute");

    for &size in &[32i32, 64, 128] {
        let (world, spatial) = build_world_with_walls(size, size);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let grid = PassabilityGrid::build(&world, &spatial, size, size, 1, 1, 0);
                let field = FlowField::compute(&grid, size / 2, size / 2);
                black_box(field);
            });
        });
    }

    group.finish();
}

fn bench_passability_grid_build(c: &mut Criterion) {
    let (world, spatial) = build_world_with_walls(128, 128);

    c.bench_function("passability_grid_build_128x128_footprint_3x3", |b| {
        b.iter(|| {
            let grid = PassabilityGrid::build(&world, &spatial, 128, 128, 3, 3, 0);
            black_box(grid);
        });
    });
}

fn bench_bilinear_sampling(c: &mut Criterion) {
    let (world, spatial) = build_world_with_walls(64, 64);
    let grid = PassabilityGrid::build(&world, &spatial, 64, 64, 1, 1, 0);
    let field = FlowField::compute(&grid, 32, 32);

    c.bench_function("flow_field_sample_bilinear", |b| {
        b.iter(|| {
            let (fx, fy) = vf_sim::fixed::cell_center(10, 10);
            black_box(field.sample_bilinear(fx, fy));
        });
    });
}

criterion_group!(
    benches,
    bench_flow_field_compute,
    bench_passability_grid_build,
    bench_bilinear_sampling,
);
criterion_main!(benches);
