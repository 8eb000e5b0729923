//! Applying client inputs and tile edit requests

use tracing::{debug, warn};

use crate::game::components::Input;
use crate::game::SimError;
use crate::metrics::Metrics;
use crate::net::NetworkId;
use crate::server::network::ServerNetwork;
use crate::server::session::TileEditRequest;
use crate::server::simulation::ServerSimulation;

/// A dropped input leaves the server unsure of what the client is pressing.
/// Fall back to neutral and make sure the client hears about it.
pub fn process_dropped_inputs(sim: &mut ServerSimulation, dropped: Vec<NetworkId>) -> Result<(), SimError> {
    for network_id in dropped {
        let Some(&entity) = sim.clients.get(&network_id) else {
            continue;
        };
        let input = sim
            .world
            .inputs
            .get_mut(entity)
            .ok_or(SimError::MissingComponent(entity, "Input"))?;
        *input = Input::default();
        let client = sim
            .world
            .client_sims
            .get_mut(entity)
            .ok_or(SimError::MissingComponent(entity, "ClientSimData"))?;
        client.input_was_dropped = true;
        sim.world.movement_dirty.insert(entity);
        Metrics::add(&sim.metrics.inputs_dropped, 1);
    }
    Ok(())
}

/// Apply every input each client sent for the current tick
pub fn apply_inputs(sim: &mut ServerSimulation, network: &ServerNetwork) -> Result<(), SimError> {
    for (&network_id, &entity) in &sim.clients {
        let Some(session) = network.session(network_id) else {
            return Err(SimError::MissingClientEntity { network_id, entity });
        };
        let commands = session.inputs.drain_and_advance();
        if commands.is_empty() {
            continue;
        }

        let input = sim
            .world
            .inputs
            .get_mut(entity)
            .ok_or(SimError::MissingComponent(entity, "Input"))?;
        let before = *input;
        for command in &commands {
            command.apply(input);
        }
        if *input != before {
            sim.world.movement_dirty.insert(entity);
        }
    }
    Ok(())
}

/// Apply tile edits. Requests naming unknown sprites or tiles outside the
/// map are dropped.
pub fn process_tile_requests(sim: &mut ServerSimulation, requests: Vec<TileEditRequest>) -> Result<(), SimError> {
    for request in requests {
        if let Some(layer) = request.layers.iter().find(|layer| sim.sprites.get(layer.sprite_id).is_err()) {
            warn!(
                "Client {} requested unknown sprite {} on tile {:?}",
                request.network_id, layer.sprite_id, request.tile
            );
            continue;
        }
        if let Err(e) = sim.tile_map.set_layers(request.tile, &request.layers) {
            warn!("Client {} tile request rejected: {}", request.network_id, e);
            continue;
        }
        sim.tile_map
            .sync_collision(request.tile, &sim.sprites, &mut sim.collision_locator)?;
        debug!("Client {} updated tile {:?}", request.network_id, request.tile);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::components::{InputState, InputType};
    use crate::game::spatial::{CollisionMask, TilePosition};
    use crate::game::tile_map::{sprites, TileLayer, TileLayerType};
    use crate::server::session::InputCommand;
    use crate::server::systems::{connection, test_support};
    use crate::net::peer::MemoryPeer;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn spawned() -> (ServerSimulation, ServerNetwork, NetworkId, MemoryPeer) {
        let mut sim = test_support::simulation();
        let mut network = test_support::network();
        let (server_end, client_end) = MemoryPeer::pair();
        let network_id = network.add_peer(Arc::new(server_end)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut events = Vec::new();
        while events.is_empty() && Instant::now() < deadline {
            events = network.poll_connection_events();
        }
        connection::process_events(&mut sim, &network, events).unwrap();
        sim.world.movement_dirty.clear();
        (sim, network, network_id, client_end)
    }

    #[test]
    fn test_inputs_applied_on_their_tick() {
        let (mut sim, network, network_id, _client) = spawned();
        let entity = sim.clients[&network_id];
        let session = network.session(network_id).unwrap();
        session
            .inputs
            .push(InputCommand::Change(InputType::XUp, InputState::Pressed), sim.current_tick + 1);

        apply_inputs(&mut sim, &network).unwrap();
        assert!(sim.world.inputs.get(entity).unwrap().is_neutral());
        assert!(sim.world.movement_dirty.is_empty());

        apply_inputs(&mut sim, &network).unwrap();
        assert!(sim.world.inputs.get(entity).unwrap().is_pressed(InputType::XUp));
        assert!(sim.world.movement_dirty.contains(&entity));
    }

    #[test]
    fn test_dropped_input_resets_to_neutral() {
        let (mut sim, _network, network_id, _client) = spawned();
        let entity = sim.clients[&network_id];
        sim.world.inputs.get_mut(entity).unwrap().set(InputType::YUp, InputState::Pressed);

        process_dropped_inputs(&mut sim, vec![network_id, 999]).unwrap();
        assert!(sim.world.inputs.get(entity).unwrap().is_neutral());
        assert!(sim.world.client_sims.get(entity).unwrap().input_was_dropped);
        assert!(sim.world.movement_dirty.contains(&entity));
    }

    #[test]
    fn test_tile_request_updates_collision() {
        let mut sim = test_support::simulation();
        let tile = TilePosition::new(10, 10, 0);
        let wall = vec![
            TileLayer::new(TileLayerType::Floor, sprites::GRASS),
            TileLayer::new(TileLayerType::Wall, sprites::STONE_WALL),
        ];
        process_tile_requests(&mut sim, vec![TileEditRequest { network_id: 0, tile, layers: wall }]).unwrap();
        assert_eq!(sim.tile_map.get(tile).unwrap().layers.len(), 2);
        assert!(!sim
            .collision_locator
            .get_collisions(tile.world_bounds(), CollisionMask::TILE_LAYER)
            .is_empty());
    }

    #[test]
    fn test_tile_request_with_unknown_sprite_dropped() {
        let mut sim = test_support::simulation();
        let tile = TilePosition::new(5, 5, 0);
        let before = sim.tile_map.get(tile).unwrap().clone();
        let bogus = vec![TileLayer::new(TileLayerType::Object, 9999)];
        let outside = TilePosition::new(-1, 5, 0);
        process_tile_requests(
            &mut sim,
            vec![
                TileEditRequest { network_id: 0, tile, layers: bogus },
                TileEditRequest { network_id: 0, tile: outside, layers: Vec::new() },
            ],
        )
        .unwrap();
        assert_eq!(sim.tile_map.get(tile).unwrap(), &before);
        assert!(sim.tile_map.take_dirty_tiles().is_empty());
    }
}
