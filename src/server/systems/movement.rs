use crate::game::components::PreviousPosition;
use crate::game::movement;
use crate::game::registry::World;
use crate::game::SimError;
use crate::server::simulation::ServerSimulation;

/// Move every entity with an input one tick and keep both locators current
pub fn update(sim: &mut ServerSimulation) -> Result<(), SimError> {
    let World {
        positions,
        previous_positions,
        velocities,
        inputs,
        collisions,
        movement_dirty,
        ..
    } = &mut sim.world;

    for (entity, input) in inputs.iter() {
        let (Some(position), Some(velocity), Some(collision)) = (
            positions.get_mut(entity),
            velocities.get_mut(entity),
            collisions.get_mut(entity),
        ) else {
            continue;
        };

        let before = (*position, *velocity);
        previous_positions.insert(entity, PreviousPosition(position.0));
        movement::step(input, position, velocity, collision, &sim.collision_locator);
        if (*position, *velocity) == before {
            continue;
        }

        movement_dirty.insert(entity);
        sim.entity_locator
            .set_location(entity, collision.cylinder(position.0))?;
        sim.collision_locator
            .update_entity(entity, collision.world_bounds)?;
    }
    Ok(())
}
