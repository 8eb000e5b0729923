//! Movement integration shared by the server, client prediction, prediction
//! replay and NPC replication. Replay correctness depends on every caller
//! going through `step`.

use crate::game::components::{Collision, Input, InputType, Position, Velocity};
use crate::game::constants::movement::{RUN_SPEED, TIMESTEP};
use crate::game::spatial::{CollisionLocator, CollisionMask};
use crate::util::vec3::Vec3;

#[inline]
fn axis_speed(input: &Input, up: InputType, down: InputType) -> f32 {
    match (input.is_pressed(up), input.is_pressed(down)) {
        (true, false) => RUN_SPEED,
        (false, true) => -RUN_SPEED,
        _ => 0.0,
    }
}

/// Velocity is a pure function of the input: constant speed on each axis
pub fn update_velocity(input: &Input, velocity: &mut Velocity) {
    velocity.0 = Vec3::new(
        axis_speed(input, InputType::XUp, InputType::XDown),
        axis_speed(input, InputType::YUp, InputType::YDown),
        axis_speed(input, InputType::ZUp, InputType::ZDown),
    );
}

/// Integrate one timestep, resolving each axis separately against tile
/// collision volumes and the world bounds. Updates the collision's world bounds.
pub fn update_position(
    position: &mut Position,
    velocity: &Velocity,
    collision: &mut Collision,
    locator: &CollisionLocator,
) {
    let world_bounds = *locator.world_bounds();

    for axis in 0..3 {
        let delta = velocity.0.axis(axis) * TIMESTEP;
        if delta == 0.0 {
            continue;
        }

        let start = position.0.axis(axis);
        let min_offset = collision.model_bounds.min.axis(axis);
        let max_offset = collision.model_bounds.max.axis(axis);
        let mut target = (start + delta).clamp(
            world_bounds.min.axis(axis) - min_offset,
            world_bounds.max.axis(axis) - max_offset,
        );

        let current_bounds = collision.model_bounds.translated(position.0);
        let candidate = collision.model_bounds.translated(position.0.with_axis(axis, target));
        for hit in locator.get_collisions(candidate, CollisionMask::TILE_LAYER) {
            // Volumes we already overlap don't block, so entities can walk out
            if hit.volume.intersects(&current_bounds) {
                continue;
            }
            if delta > 0.0 {
                target = target.min(hit.volume.min.axis(axis) - max_offset);
            } else {
                target = target.max(hit.volume.max.axis(axis) - min_offset);
            }
        }

        // Resolution never pushes an entity backwards
        target = if delta > 0.0 { target.max(start) } else { target.min(start) };
        position.0 = position.0.with_axis(axis, target);
    }

    collision.update_world_bounds(position.0);
}

/// One full movement tick for an entity
pub fn step(
    input: &Input,
    position: &mut Position,
    velocity: &mut Velocity,
    collision: &mut Collision,
    locator: &CollisionLocator,
) {
    update_velocity(input, velocity);
    update_position(position, velocity, collision, locator);
}
