//! Property tests for the pieces replay and replication depend on

use hashbrown::HashSet;
use proptest::prelude::*;

use worldsim::game::components::{Collision, Input, InputState, InputType, Position, Velocity};
use worldsim::game::movement;
use worldsim::game::registry::Entity;
use worldsim::game::spatial::collision_locator::RaycastFilter;
use worldsim::game::spatial::{
    BoundingBox, CellGrid, ChunkExtent, CollisionLocator, CollisionMask, CollisionObject, Cylinder, EntityLocator,
    QueryRegion, Ray, TileExtent, TilePosition,
};
use worldsim::net::input_sequencer::{TickSorter, ValidityStatus};
use worldsim::util::circular_buffer::CircularBuffer;
use worldsim::util::vec3::Vec3;

const MAP: TileExtent = TileExtent::new(0, 0, 0, 32, 32, 1);
const MAP_WORLD_WIDTH: f32 = 32.0 * 32.0;

fn point_strategy() -> impl Strategy<Value = Vec3> {
    (0.0f32..MAP_WORLD_WIDTH, 0.0f32..MAP_WORLD_WIDTH).prop_map(|(x, y)| Vec3::new(x, y, 0.0))
}

/// Query regions of every shape. Integer coordinates keep edges off the
/// sub-epsilon slivers next to cell boundaries.
fn region_strategy() -> impl Strategy<Value = QueryRegion> {
    prop_oneof![
        (0i32..1024, 0i32..1024, 1i32..300).prop_map(|(x, y, radius)| {
            QueryRegion::from(Cylinder::new(Vec3::new(x as f32, y as f32, 0.0), radius as f32, 32.0))
        }),
        (0i32..1024, 0i32..1024, 1i32..400, 1i32..400, 0i32..31).prop_map(|(x, y, width, depth, z)| {
            QueryRegion::from(BoundingBox::new(
                Vec3::new(x as f32, y as f32, z as f32),
                Vec3::new((x + width) as f32, (y + depth) as f32, 32.0),
            ))
        }),
        (0i32..32, 0i32..32, 1i32..10, 1i32..10)
            .prop_map(|(x, y, width, depth)| QueryRegion::from(TileExtent::new(x, y, 0, width, depth, 1))),
        (0i32..2, 0i32..2, 1i32..3)
            .prop_map(|(x, y, length)| QueryRegion::from(ChunkExtent::new(x, y, 0, length, length, 1))),
    ]
}

/// Boxes inside the map with integer edges
fn collision_box_strategy() -> impl Strategy<Value = BoundingBox> {
    (0i32..1000, 0i32..1000, 1i32..100, 1i32..100, 0i32..31, 1i32..32).prop_map(|(x, y, width, depth, z, height)| {
        BoundingBox::new(
            Vec3::new(x as f32, y as f32, z as f32),
            Vec3::new(
                (x + width).min(1024) as f32,
                (y + depth).min(1024) as f32,
                (z + height).min(32) as f32,
            ),
        )
    })
}

fn mask_strategy() -> impl Strategy<Value = CollisionMask> {
    prop_oneof![
        Just(CollisionMask::TILE_LAYER),
        Just(CollisionMask::ENTITY),
        Just(CollisionMask::ALL),
    ]
}

/// Half-unit offsets so segments never run along a box face
fn ray_point_strategy() -> impl Strategy<Value = Vec3> {
    (0i32..1023, 0i32..1023, 0i32..31).prop_map(|(x, y, z)| Vec3::new(x as f32 + 0.5, y as f32 + 0.5, z as f32 + 0.5))
}

/// Locator holding `boxes`, alternating tile layers and entities
fn collision_world(boxes: Vec<BoundingBox>) -> (CollisionLocator, Vec<(CollisionObject, BoundingBox)>) {
    let mut locator = CollisionLocator::new();
    locator.set_grid_size(MAP).unwrap();
    let mut volumes = Vec::new();
    for (index, volume) in boxes.into_iter().enumerate() {
        let object = if index % 2 == 0 {
            CollisionObject::TileLayer {
                tile: TilePosition::new(index as i32, 0, 0),
                layer_index: 0,
            }
        } else {
            CollisionObject::Entity(Entity::from_raw(index as u32, 0))
        };
        locator.set(object, volume).unwrap();
        volumes.push((object, volume));
    }
    (locator, volumes)
}

fn input_strategy() -> impl Strategy<Value = Input> {
    prop::collection::vec(any::<bool>(), 6).prop_map(|pressed| {
        let mut input = Input::default();
        for (input_type, pressed) in InputType::ALL.into_iter().zip(pressed) {
            if pressed {
                input.set(input_type, InputState::Pressed);
            }
        }
        input
    })
}

proptest! {
    /// Index 0 is always the newest value, index i the one pushed i pushes ago
    #[test]
    fn prop_circular_buffer_indexes_from_newest(values in prop::collection::vec(any::<u32>(), 1..50)) {
        let mut buffer: CircularBuffer<u32, 8> = CircularBuffer::new();
        for value in &values {
            buffer.push(*value);
        }
        for ticks_ago in 0..values.len().min(8) {
            prop_assert_eq!(buffer[ticks_ago], values[values.len() - 1 - ticks_ago]);
        }
    }

    /// Coarse results cover the fine ones, and the fine pass returns exactly
    /// the entities a brute-force check finds, for every region shape
    #[test]
    fn prop_fine_query_matches_brute_force(
        centers in prop::collection::vec((8i32..=1016, 8i32..=1016), 1..40),
        region in region_strategy(),
    ) {
        let mut locator = EntityLocator::new();
        locator.set_grid_size(MAP).unwrap();
        let mut volumes = Vec::new();
        for (index, (x, y)) in centers.into_iter().enumerate() {
            let entity = Entity::from_raw(index as u32, 0);
            let cylinder = Cylinder::new(Vec3::new(x as f32, y as f32, 0.0), 8.0, 24.0);
            locator.set_location(entity, cylinder).unwrap();
            volumes.push((entity, cylinder));
        }

        let mut expected: Vec<Entity> = volumes
            .iter()
            .filter(|(_, volume)| region.intersects_cylinder(volume))
            .map(|(entity, _)| *entity)
            .collect();
        expected.sort_unstable();

        let coarse = locator.get_entities_coarse(region);
        let fine = locator.get_entities_fine(region);
        prop_assert!(fine.iter().all(|entity| coarse.contains(entity)));
        prop_assert_eq!(fine, expected);
    }

    /// Collision queries agree with a linear scan over every tracked volume
    #[test]
    fn prop_collisions_match_linear_scan(
        boxes in prop::collection::vec(collision_box_strategy(), 1..40),
        region in region_strategy(),
        mask in mask_strategy(),
    ) {
        let (locator, volumes) = collision_world(boxes);

        let expected: HashSet<CollisionObject> = volumes
            .iter()
            .filter(|(object, volume)| mask.intersects(object.mask()) && region.intersects_box(volume))
            .map(|(object, _)| *object)
            .collect();
        let broad: HashSet<CollisionObject> =
            locator.get_collisions_broad(region, mask).iter().map(|info| info.object).collect();
        let narrow: Vec<CollisionObject> =
            locator.get_collisions(region, mask).iter().map(|info| info.object).collect();

        prop_assert_eq!(narrow.len(), expected.len());
        prop_assert!(narrow.iter().all(|object| expected.contains(object) && broad.contains(object)));
    }

    /// The first raycast hit is the nearest hit of any volume on the segment
    #[test]
    fn prop_raycast_first_is_nearest(
        boxes in prop::collection::vec(collision_box_strategy(), 1..40),
        start in ray_point_strategy(),
        end in ray_point_strategy(),
    ) {
        prop_assume!(start != end);
        let (locator, volumes) = collision_world(boxes);
        let ray = Ray::new(start, end);

        let nearest = volumes
            .iter()
            .filter_map(|(_, volume)| volume.intersect_ray(&ray))
            .min_by(|a, b| a.total_cmp(b));
        let hit = locator.raycast_first(&ray, &RaycastFilter::default());

        match (nearest, hit) {
            (None, None) => {}
            (Some(t), Some(hit)) => {
                prop_assert!((hit.t - t).abs() < 1e-5);
                let volume = locator.volume_of(&hit.object).unwrap();
                prop_assert_eq!(volume.intersect_ray(&ray), Some(hit.t));
            }
            (nearest, hit) => prop_assert!(false, "nearest {:?}, raycast {:?}", nearest, hit),
        }
        prop_assert_eq!(locator.raycast_any(&ray, &RaycastFilter::default()), nearest.is_some());
    }

    /// Setting the same volume twice leaves exactly one membership per cell
    #[test]
    fn prop_set_is_idempotent(
        min in point_strategy(),
        size in (1.0f32..200.0, 1.0f32..200.0, 1.0f32..31.0),
    ) {
        let mut grid: CellGrid<u32> = CellGrid::new();
        grid.set_grid_size(MAP).unwrap();
        let max = (min + Vec3::new(size.0, size.1, size.2)).min(Vec3::new(MAP_WORLD_WIDTH, MAP_WORLD_WIDTH, 32.0));
        let volume = BoundingBox::new(min, max);

        grid.set(7, &volume).unwrap();
        let cells = grid.cells_of(&7);
        let count = grid.membership_count(&7);
        grid.set(7, &volume).unwrap();

        prop_assert_eq!(grid.cells_of(&7), cells);
        prop_assert_eq!(grid.membership_count(&7), count);
        prop_assert_eq!(count, cells.map(|extent| extent.cell_count()).unwrap_or(0));
    }

    /// Only ticks inside [current, current + W) are accepted, and a tick's
    /// items come back in arrival order
    #[test]
    fn prop_sorter_window(current in any::<u32>(), offsets in prop::collection::vec(-20i32..20, 1..30)) {
        let mut sorter: TickSorter<usize, 10> = TickSorter::new(current);
        let mut accepted_now = Vec::new();
        for (index, offset) in offsets.iter().enumerate() {
            let tick = current.wrapping_add(*offset as u32);
            let result = sorter.push(index, tick);
            prop_assert_eq!(result.diff, *offset);
            let expected = if *offset < 0 {
                ValidityStatus::TooLow
            } else if *offset >= 10 {
                ValidityStatus::TooHigh
            } else {
                ValidityStatus::Valid
            };
            prop_assert_eq!(result.status, expected);
            if *offset == 0 {
                accepted_now.push(index);
            }
        }
        prop_assert_eq!(sorter.drain_current().collect::<Vec<_>>(), accepted_now);
    }

    /// Movement never leaves the map, whatever is pressed
    #[test]
    fn prop_movement_stays_in_bounds(start in point_strategy(), inputs in prop::collection::vec(input_strategy(), 1..60)) {
        let mut locator = CollisionLocator::new();
        locator.set_grid_size(MAP).unwrap();
        let bounds = *locator.world_bounds();

        let mut collision = Collision::player(start);
        let lowest = bounds.min - collision.model_bounds.min;
        let highest = bounds.max - collision.model_bounds.max;
        // Start fully inside the map
        let start = start.max(lowest).min(highest);
        collision.update_world_bounds(start);
        let mut position = Position(start);
        let mut velocity = Velocity::default();

        for input in &inputs {
            movement::step(input, &mut position, &mut velocity, &mut collision, &locator);
            for axis in 0..3 {
                prop_assert!(position.0.axis(axis) >= lowest.axis(axis) - 1e-3);
                prop_assert!(position.0.axis(axis) <= highest.axis(axis) + 1e-3);
            }
        }
    }

    /// Stepping twice from the same state gives the same result
    #[test]
    fn prop_step_is_deterministic(start in point_strategy(), inputs in prop::collection::vec(input_strategy(), 1..30)) {
        let mut locator = CollisionLocator::new();
        locator.set_grid_size(MAP).unwrap();

        let run = || {
            let mut collision = Collision::player(start);
            let mut position = Position(start);
            let mut velocity = Velocity::default();
            for input in &inputs {
                movement::step(input, &mut position, &mut velocity, &mut collision, &locator);
            }
            position
        };
        prop_assert_eq!(run(), run());
    }
}
