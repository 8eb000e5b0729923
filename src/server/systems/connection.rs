//! Spawning and despawning client entities

use rand::Rng;
use tracing::{debug, info, warn};

use crate::game::components::{ClientSimData, Collision, Input, Position, PreviousPosition, Velocity};
use crate::game::spatial::TilePosition;
use crate::game::tile_map::{TileLayerType, TileMap};
use crate::game::SimError;
use crate::net::protocol::{ConnectionResponse, ServerMessage};
use crate::server::network::ServerNetwork;
use crate::server::session::{ClientSession, ConnectionEvent};
use crate::server::simulation::ServerSimulation;
use crate::util::vec3::Vec3;

/// Random tries before falling back to the map center
const SPAWN_ATTEMPTS: usize = 64;

pub fn process_events(
    sim: &mut ServerSimulation,
    network: &ServerNetwork,
    events: Vec<ConnectionEvent>,
) -> Result<(), SimError> {
    for event in events {
        match event {
            ConnectionEvent::Connected(session) => {
                if network.session(session.network_id()).is_none() {
                    // Already gone again
                    continue;
                }
                spawn_client(sim, &session)?;
            }
            ConnectionEvent::Disconnected(network_id) => despawn_client(sim, network_id),
        }
    }
    Ok(())
}

fn is_open_floor(map: &TileMap, tile: TilePosition) -> bool {
    map.get(tile).is_some_and(|tile| {
        !tile.layers.is_empty() && tile.layers.iter().all(|layer| layer.layer_type == TileLayerType::Floor)
    })
}

/// Center of a random interior tile with nothing but floor on it
pub fn find_spawn_point(map: &TileMap, rng: &mut impl Rng) -> Vec3 {
    let extent = map.extent();
    let tile_center = |tile: TilePosition| {
        let bounds = tile.world_bounds();
        let center = bounds.center();
        Vec3::new(center.x, center.y, bounds.min.z)
    };

    if extent.x_length > 2 && extent.y_length > 2 {
        for _ in 0..SPAWN_ATTEMPTS {
            let tile = TilePosition::new(
                rng.gen_range(extent.x + 1..extent.x + extent.x_length - 1),
                rng.gen_range(extent.y + 1..extent.y + extent.y_length - 1),
                extent.z,
            );
            if is_open_floor(map, tile) {
                return tile_center(tile);
            }
        }
    }

    warn!("No open spawn tile found, spawning at the map center");
    tile_center(TilePosition::new(
        extent.x + extent.x_length / 2,
        extent.y + extent.y_length / 2,
        extent.z,
    ))
}

fn spawn_client(sim: &mut ServerSimulation, session: &ClientSession) -> Result<(), SimError> {
    let network_id = session.network_id();
    let position = find_spawn_point(&sim.tile_map, &mut sim.rng);
    let collision = Collision::player(position);

    let entity = sim.world.create();
    sim.world.positions.insert(entity, Position(position));
    sim.world.previous_positions.insert(entity, PreviousPosition(position));
    sim.world.velocities.insert(entity, Velocity::default());
    sim.world.inputs.insert(entity, Input::default());
    sim.world.collisions.insert(entity, collision);
    sim.world.client_sims.insert(entity, ClientSimData::new(network_id));
    sim.entity_locator.set_location(entity, collision.cylinder(position))?;
    sim.collision_locator.update_entity(entity, collision.world_bounds)?;
    sim.world.movement_dirty.insert(entity);
    sim.clients.insert(network_id, entity);

    session.start(sim.current_tick);
    session.queue(&ServerMessage::ConnectionResponse(ConnectionResponse {
        entity,
        position,
        tick: sim.current_tick,
        map_extent: sim.tile_map.extent(),
    }))?;

    info!(
        "Spawned entity {} for client {} at ({:.0}, {:.0}) on tick {}",
        entity, network_id, position.x, position.y, sim.current_tick
    );
    Ok(())
}

fn despawn_client(sim: &mut ServerSimulation, network_id: crate::net::NetworkId) {
    let Some(entity) = sim.clients.remove(&network_id) else {
        debug!("Client {} left before it was spawned", network_id);
        return;
    };
    sim.entity_locator.remove(entity);
    sim.collision_locator.remove_entity(entity);
    sim.world.destroy(entity);
    info!("Removed entity {} of client {}", entity, network_id);
}
