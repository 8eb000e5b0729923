//! Per-client replication: map chunks, tile edits, AOI changes and movement
//!
//! Messages for every client are built in parallel against a read-only view
//! of the world, then applied to each client's state and queue in order.

use rayon::prelude::*;
use tracing::error;

use crate::game::constants::aoi::CHUNK_STREAM_RADIUS;
use crate::game::constants::world::CHUNK_WIDTH;
use crate::game::registry::{Entity, World};
use crate::game::spatial::{ChunkExtent, EntityLocator, TilePosition};
use crate::game::tile_map::TileMap;
use crate::game::{SimError, Tick};
use crate::net::aoi::{diff_sorted, visible_entities, AoiConfig};
use crate::net::protocol::{
    ChunkUpdate, EncodedMessage, EntityDelete, EntityInit, MovementState, MovementUpdate, ServerMessage,
    TileUpdate,
};
use crate::net::NetworkId;
use crate::server::network::ServerNetwork;
use crate::server::simulation::ServerSimulation;

/// Read-only state shared by the parallel pass
struct UpdateContext<'a> {
    world: &'a World,
    tile_map: &'a TileMap,
    entity_locator: &'a EntityLocator,
    aoi: &'a AoiConfig,
    dirty_tiles: &'a [TilePosition],
    tick: Tick,
}

/// Everything one client gets this tick
#[derive(Debug)]
struct ClientUpdate {
    network_id: NetworkId,
    entity: Entity,
    messages: Vec<EncodedMessage>,
    visible: Vec<Entity>,
    streamed_chunks: ChunkExtent,
}

pub fn movement_state(world: &World, entity: Entity) -> Result<MovementState, SimError> {
    let position = world
        .positions
        .get(entity)
        .ok_or(SimError::MissingComponent(entity, "Position"))?;
    let velocity = world
        .velocities
        .get(entity)
        .ok_or(SimError::MissingComponent(entity, "Velocity"))?;
    let input = world
        .inputs
        .get(entity)
        .ok_or(SimError::MissingComponent(entity, "Input"))?;
    Ok(MovementState {
        entity,
        position: position.0,
        velocity: velocity.0,
        input: *input,
    })
}

fn chunk_of(tile: TilePosition) -> (i32, i32) {
    let width = CHUNK_WIDTH as i32;
    (tile.x.div_euclid(width), tile.y.div_euclid(width))
}

fn build_update(ctx: &UpdateContext<'_>, network_id: NetworkId, entity: Entity) -> Result<ClientUpdate, SimError> {
    let world = ctx.world;
    let position = world
        .positions
        .get(entity)
        .ok_or(SimError::MissingComponent(entity, "Position"))?
        .0;
    let client = world
        .client_sims
        .get(entity)
        .ok_or(SimError::MissingComponent(entity, "ClientSimData"))?;
    let mut messages = Vec::new();

    // Chunks that came into range
    let map_chunks = ctx.tile_map.chunk_extent();
    let streamed_chunks = ChunkExtent::around_tile(TilePosition::from_world(position), CHUNK_STREAM_RADIUS as i32);
    for (chunk_x, chunk_y) in streamed_chunks.chunks() {
        if !map_chunks.contains(chunk_x, chunk_y) {
            continue;
        }
        if client
            .streamed_chunks
            .is_some_and(|previous| previous.contains(chunk_x, chunk_y))
        {
            continue;
        }
        match ctx.tile_map.snapshot_chunk(chunk_x, chunk_y, streamed_chunks.z) {
            Ok(snapshot) => messages.push(
                ServerMessage::ChunkUpdate(ChunkUpdate { tick: ctx.tick, snapshot }).encode()?,
            ),
            Err(e) => error!("Skipping chunk ({}, {}) for client {}: {}", chunk_x, chunk_y, network_id, e),
        }
    }

    // Edits inside chunks the client already had. Fresh chunks carry them.
    if let Some(previous) = client.streamed_chunks {
        for &tile in ctx.dirty_tiles {
            let (chunk_x, chunk_y) = chunk_of(tile);
            if !previous.contains(chunk_x, chunk_y) {
                continue;
            }
            let layers = ctx
                .tile_map
                .get(tile)
                .map(|tile| tile.layers.to_vec())
                .unwrap_or_default();
            messages.push(ServerMessage::TileUpdate(TileUpdate { tick: ctx.tick, tile, layers }).encode()?);
        }
    }

    let visible = visible_entities(ctx.aoi, entity, position, ctx.entity_locator);
    let delta = diff_sorted(&client.entities_in_aoi, &visible);

    if !delta.exited.is_empty() {
        messages.push(
            ServerMessage::EntityDelete(EntityDelete {
                tick: ctx.tick,
                entities: delta.exited,
            })
            .encode()?,
        );
    }

    if !delta.entered.is_empty() {
        let states = delta
            .entered
            .iter()
            .map(|&other| movement_state(world, other))
            .collect::<Result<Vec<_>, _>>()?;
        messages.push(ServerMessage::EntityInit(EntityInit { tick: ctx.tick, states }).encode()?);
    }

    let mut states = Vec::new();
    if world.movement_dirty.contains(&entity) || client.input_was_dropped {
        states.push(movement_state(world, entity)?);
    }
    for &other in &delta.retained {
        if world.movement_dirty.contains(&other) {
            states.push(movement_state(world, other)?);
        }
    }
    if !states.is_empty() {
        messages.push(ServerMessage::MovementUpdate(MovementUpdate { tick: ctx.tick, states }).encode()?);
    }

    Ok(ClientUpdate {
        network_id,
        entity,
        messages,
        visible,
        streamed_chunks,
    })
}

pub fn update(sim: &mut ServerSimulation, network: &ServerNetwork) -> Result<(), SimError> {
    let dirty_tiles = sim.tile_map.take_dirty_tiles();
    let clients: Vec<(NetworkId, Entity)> = sim.clients.iter().map(|(&id, &entity)| (id, entity)).collect();

    let ctx = UpdateContext {
        world: &sim.world,
        tile_map: &sim.tile_map,
        entity_locator: &sim.entity_locator,
        aoi: &sim.aoi,
        dirty_tiles: &dirty_tiles,
        tick: sim.current_tick,
    };
    let updates = clients
        .par_iter()
        .map(|&(network_id, entity)| build_update(&ctx, network_id, entity))
        .collect::<Result<Vec<_>, _>>()?;

    for update in updates {
        let client = sim
            .world
            .client_sims
            .get_mut(update.entity)
            .ok_or(SimError::MissingComponent(update.entity, "ClientSimData"))?;
        client.entities_in_aoi = update.visible;
        client.streamed_chunks = Some(update.streamed_chunks);
        client.input_was_dropped = false;

        let session = network.session(update.network_id).ok_or(SimError::MissingClientEntity {
            network_id: update.network_id,
            entity: update.entity,
        })?;
        session.queue_encoded(update.messages);
    }
    Ok(())
}
