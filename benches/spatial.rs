//! Spatial query and server tick benchmarks
//!
//! Run with: cargo bench --bench spatial

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use worldsim::config::ServerConfig;
use worldsim::game::components::{Collision, Input, InputState, InputType, Position, Velocity};
use worldsim::game::registry::Entity;
use worldsim::game::spatial::{Cylinder, EntityLocator, TileExtent};
use worldsim::metrics::Metrics;
use worldsim::net::aoi::{visible_entities, AoiConfig};
use worldsim::server::network::ServerNetwork;
use worldsim::server::simulation::ServerSimulation;
use worldsim::util::vec3::Vec3;

const MAP_TILES: u32 = 256;
const MAP_WORLD_WIDTH: f32 = MAP_TILES as f32 * 32.0;

fn random_point(rng: &mut StdRng) -> Vec3 {
    Vec3::new(
        rng.gen_range(64.0..MAP_WORLD_WIDTH - 64.0),
        rng.gen_range(64.0..MAP_WORLD_WIDTH - 64.0),
        0.0,
    )
}

/// Locator with `count` randomly placed player-sized cylinders
fn populated_locator(count: usize, rng: &mut StdRng) -> (EntityLocator, Vec<(Entity, Vec3)>) {
    let mut locator = EntityLocator::new();
    locator
        .set_grid_size(TileExtent::new(0, 0, 0, MAP_TILES as i32, MAP_TILES as i32, 1))
        .unwrap();
    let entities = (0..count)
        .map(|index| {
            let entity = Entity::from_raw(index as u32, 0);
            let position = random_point(rng);
            locator
                .set_location(entity, Collision::player(position).cylinder(position))
                .unwrap();
            (entity, position)
        })
        .collect();
    (locator, entities)
}

fn bench_entity_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("entity_locator");
    group.sample_size(50);
    let mut rng = StdRng::seed_from_u64(1);

    for count in [500, 2000, 8000] {
        let (locator, _) = populated_locator(count, &mut rng);
        let region = Cylinder::new(Vec3::new(MAP_WORLD_WIDTH / 2.0, MAP_WORLD_WIDTH / 2.0, -512.0), 800.0, 1024.0);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("coarse", count), &count, |b, _| {
            b.iter(|| black_box(locator.get_entities_coarse(black_box(region))))
        });
        group.bench_with_input(BenchmarkId::new("fine", count), &count, |b, _| {
            b.iter(|| black_box(locator.get_entities_fine(black_box(region))))
        });
    }
    group.finish();
}

fn bench_aoi(c: &mut Criterion) {
    let mut group = c.benchmark_group("aoi");
    group.sample_size(30);
    let mut rng = StdRng::seed_from_u64(2);
    let config = AoiConfig::default();

    for count in [500, 2000] {
        let (locator, entities) = populated_locator(count, &mut rng);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("all_viewers", count), &count, |b, _| {
            b.iter(|| {
                for &(entity, position) in &entities {
                    black_box(visible_entities(&config, entity, position, &locator));
                }
            })
        });
    }
    group.finish();
}

/// Server tick with `count` wandering entities and no clients
fn bench_server_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("server_tick");
    group.sample_size(30);

    for count in [250, 1000, 4000] {
        let config = ServerConfig {
            world_width_tiles: MAP_TILES,
            world_height_tiles: MAP_TILES,
            ..ServerConfig::default()
        };
        let metrics = Arc::new(Metrics::new());
        let mut rng = StdRng::seed_from_u64(3);
        let mut sim = ServerSimulation::with_rng(&config, metrics.clone(), StdRng::seed_from_u64(4)).unwrap();
        let mut network = ServerNetwork::new(&config, metrics);

        for _ in 0..count {
            let entity = sim.world.create();
            let position = random_point(&mut rng);
            let mut input = Input::default();
            input.set(InputType::ALL[rng.gen_range(0..4)], InputState::Pressed);
            sim.world.positions.insert(entity, Position(position));
            sim.world.velocities.insert(entity, Velocity::default());
            sim.world.inputs.insert(entity, input);
            sim.world.collisions.insert(entity, Collision::player(position));
            sim.entity_locator
                .set_location(entity, Collision::player(position).cylinder(position))
                .unwrap();
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("movement", count), &count, |b, _| {
            b.iter(|| sim.tick(&mut network).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_entity_queries, bench_aoi, bench_server_tick);
criterion_main!(benches);
