//! Client simulation: applies what the server sends, predicts the player and
//! replicates everyone else a few ticks behind the server.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::camera::Camera;
use super::connection::{LifetimeEvent, NpcUpdate, PlayerUpdate, ServerConnection, TileChange};
use super::prediction;
use crate::game::components::{Collision, Input, InputHistory, Position, PreviousPosition, Velocity};
use crate::game::constants::sync::{REPLICATION_WINDOW, TICKDIFF_TARGET};
use crate::game::movement;
use crate::game::registry::{Entity, World};
use crate::game::spatial::{CollisionLocator, TilePosition};
use crate::game::tile_map::{SpriteDataMap, TileLayer, TileMap};
use crate::game::{SimError, Tick};
use crate::metrics::Metrics;
use crate::net::input_sequencer::TickSorter;
use crate::net::protocol::{
    ClientInput, ClientMessage, ConnectionResponse, InputChangeRequest, MovementState, TileUpdateRequest,
};

pub struct ClientSimulation {
    pub world: World,
    pub tile_map: TileMap,
    pub sprites: SpriteDataMap,
    pub collision_locator: CollisionLocator,
    /// Our own, predicted entity
    pub player: Entity,
    /// Server entity -> local entity
    server_entities: FxHashMap<Entity, Entity>,
    /// Tick being processed. Runs ahead of the server by the tick lead.
    pub current_tick: Tick,
    last_player_update: Option<Tick>,
    last_sent_input: Input,
    npc_updates: TickSorter<Vec<MovementState>, REPLICATION_WINDOW>,
    /// Tiles changed by the last tick, for whoever draws them
    pub changed_tiles: Vec<TilePosition>,
    pub camera: Camera,
    metrics: Arc<Metrics>,
}

impl ClientSimulation {
    pub fn new(response: &ConnectionResponse, metrics: Arc<Metrics>) -> Result<Self, SimError> {
        let extent = response.map_extent;
        let tile_map = TileMap::new(
            extent.x_length.max(0) as u32,
            extent.y_length.max(0) as u32,
            extent.z_length.max(0) as u32,
        );
        let mut collision_locator = CollisionLocator::new();
        collision_locator.set_grid_size(extent)?;

        let mut world = World::new();
        let player = world.create();
        world.positions.insert(player, Position(response.position));
        world.previous_positions.insert(player, PreviousPosition(response.position));
        world.velocities.insert(player, Velocity::default());
        world.inputs.insert(player, Input::default());
        world.input_histories.insert(player, InputHistory::default());
        world.collisions.insert(player, Collision::player(response.position));

        let mut server_entities = FxHashMap::default();
        server_entities.insert(response.entity, player);

        info!(
            "Client simulation starting at tick {} (server tick {}), player {}",
            response.tick.wrapping_add(TICKDIFF_TARGET as u32),
            response.tick,
            response.entity
        );
        Ok(Self {
            world,
            tile_map,
            sprites: SpriteDataMap::with_defaults(),
            collision_locator,
            player,
            server_entities,
            current_tick: response.tick.wrapping_add(TICKDIFF_TARGET as u32),
            last_player_update: None,
            last_sent_input: Input::default(),
            npc_updates: TickSorter::new(response.tick),
            changed_tiles: Vec::new(),
            camera: Camera::new(response.position),
            metrics,
        })
    }

    /// Local entity for a server entity, if it's replicated
    pub fn local_entity(&self, server_entity: Entity) -> Option<Entity> {
        self.server_entities.get(&server_entity).copied()
    }

    pub fn player_position(&self) -> Option<Position> {
        self.world.positions.get(self.player).copied()
    }

    /// Run one tick with `input` as this tick's player input
    pub fn tick(&mut self, connection: &ServerConnection, input: Input) -> Result<(), SimError> {
        connection.set_client_tick(self.current_tick);

        let tile_changes: Vec<TileChange> = connection.channels.tiles.try_iter().collect();
        self.changed_tiles = self.apply_tile_changes(tile_changes)?;

        for event in connection.channels.lifetime.try_iter() {
            self.apply_lifetime_event(event);
        }

        if let Some(message) = self.record_input(input)? {
            connection.queue(&message)?;
        }

        let player_updates: Vec<PlayerUpdate> = connection.channels.player.try_iter().collect();
        self.predict_player(&player_updates)?;

        // Everything up to the confirmed tick is in the channel once we read it
        let confirmed = connection.latest_confirmed();
        let npc_updates: Vec<NpcUpdate> = connection.channels.npcs.try_iter().collect();
        self.replicate_npcs(npc_updates, confirmed)?;

        if let Some(position) = self.player_position() {
            self.camera.follow(position.0);
        }

        Metrics::add(&self.metrics.tick_count, 1);
        self.metrics
            .current_tick
            .store(self.current_tick as u64, std::sync::atomic::Ordering::Relaxed);
        self.current_tick = self.current_tick.wrapping_add(1);
        Ok(())
    }

    /// Ask the server to replace a tile's layers
    pub fn request_tile_update(
        &self,
        connection: &ServerConnection,
        tile: TilePosition,
        layers: Vec<TileLayer>,
    ) -> Result<(), SimError> {
        let request = TileUpdateRequest {
            tick: self.current_tick,
            tile,
            layers,
        };
        connection.queue(&ClientMessage::TileUpdateRequest(request))?;
        Ok(())
    }

    /// Apply received chunks and tile edits, then rebuild their collision.
    /// Returns the tiles that changed.
    pub fn apply_tile_changes(&mut self, changes: Vec<TileChange>) -> Result<Vec<TilePosition>, SimError> {
        for change in changes {
            let result = match &change {
                TileChange::Chunk(snapshot) => self.tile_map.apply_snapshot(snapshot),
                TileChange::Tile { tile, layers } => self.tile_map.set_layers(*tile, layers),
            };
            if let Err(e) = result {
                warn!("Dropping tile change: {}", e);
            }
        }

        let dirty = self.tile_map.take_dirty_tiles();
        for &tile in &dirty {
            self.tile_map
                .sync_collision(tile, &self.sprites, &mut self.collision_locator)?;
        }
        Ok(dirty)
    }

    /// Entities entering or leaving our area of interest
    pub fn apply_lifetime_event(&mut self, event: LifetimeEvent) {
        match event {
            LifetimeEvent::Init(states) => {
                for state in states {
                    if self.server_entities.get(&state.entity) == Some(&self.player) {
                        continue;
                    }
                    let local = match self.server_entities.get(&state.entity) {
                        Some(&local) => local,
                        None => {
                            let local = self.world.create();
                            self.world.collisions.insert(local, Collision::player(state.position));
                            self.server_entities.insert(state.entity, local);
                            debug!("Replicating {} as {}", state.entity, local);
                            local
                        }
                    };
                    self.world
                        .previous_positions
                        .insert(local, PreviousPosition(state.position));
                    apply_movement_state(&mut self.world, local, &state);
                }
            }
            LifetimeEvent::Delete(entities) => {
                for server_entity in entities {
                    match self.server_entities.get(&server_entity) {
                        Some(&local) if local == self.player => {
                            warn!("Server deleted our own entity {}", server_entity);
                        }
                        Some(&local) => {
                            self.server_entities.remove(&server_entity);
                            self.world.destroy(local);
                        }
                        None => debug!("Delete for unknown entity {}", server_entity),
                    }
                }
            }
        }
    }

    /// Record this tick's input. Returns the message to send if it changed.
    pub fn record_input(&mut self, input: Input) -> Result<Option<ClientMessage>, SimError> {
        let player = self.player;
        self.world
            .input_histories
            .get_mut(player)
            .ok_or(SimError::MissingComponent(player, "InputHistory"))?
            .0
            .push(input);
        self.world.inputs.insert(player, input);

        if input == self.last_sent_input {
            return Ok(None);
        }
        let changes: Vec<_> = input.changes_from(&self.last_sent_input).collect();
        self.last_sent_input = input;

        let message = match changes.as_slice() {
            [(input_type, state)] => ClientMessage::InputChangeRequest(InputChangeRequest {
                tick: self.current_tick,
                input_type: *input_type,
                state: *state,
            }),
            _ => ClientMessage::ClientInput(ClientInput {
                tick: self.current_tick,
                input,
            }),
        };
        Ok(Some(message))
    }

    /// Reconcile with the server and move the player for this tick
    pub fn predict_player(&mut self, updates: &[PlayerUpdate]) -> Result<(), SimError> {
        let outcome = prediction::predict(
            &mut self.world,
            self.player,
            updates,
            self.current_tick,
            &mut self.last_player_update,
            &self.collision_locator,
        )?;
        if outcome.mispredicted {
            // The server's view of our input wins until we press something else
            if let Some(input) = self.world.inputs.get(self.player) {
                self.last_sent_input = *input;
            }
            Metrics::add(&self.metrics.mispredictions, 1);
            debug!(
                "Misprediction at tick {}, corrected from tick {:?}",
                self.current_tick, outcome.corrected_from
            );
        }
        Ok(())
    }

    /// Apply every NPC update up to `confirmed`, then extrapolate the rest
    pub fn replicate_npcs(&mut self, updates: Vec<NpcUpdate>, confirmed: Tick) -> Result<(), SimError> {
        for update in updates {
            let tick = update.tick;
            let result = self.npc_updates.push(update.states, tick);
            if !result.is_valid() {
                warn!(
                    "Dropping NPC update for tick {} ({:?}, {} from tick {})",
                    tick,
                    result.status,
                    result.diff,
                    self.npc_updates.current_tick()
                );
            }
        }

        let mut updated = FxHashSet::default();
        while confirmed.wrapping_sub(self.npc_updates.current_tick()) as i32 >= 0 {
            let batches: Vec<Vec<MovementState>> = self.npc_updates.drain_current().collect();
            for state in batches.into_iter().flatten() {
                let Some(&local) = self.server_entities.get(&state.entity) else {
                    continue;
                };
                if local == self.player {
                    continue;
                }
                if let Some(position) = self.world.positions.get(local).copied() {
                    self.world.previous_positions.insert(local, PreviousPosition(position.0));
                }
                apply_movement_state(&mut self.world, local, &state);
                updated.insert(local);
            }
            self.npc_updates.advance();
        }

        for entity in self.world.movers() {
            if entity == self.player || updated.contains(&entity) {
                continue;
            }
            extrapolate(&mut self.world, entity, &self.collision_locator)?;
        }
        Ok(())
    }
}

fn apply_movement_state(world: &mut World, entity: Entity, state: &MovementState) {
    world.positions.insert(entity, Position(state.position));
    world.velocities.insert(entity, Velocity(state.velocity));
    world.inputs.insert(entity, state.input);
    if let Some(collision) = world.collisions.get_mut(entity) {
        collision.update_world_bounds(state.position);
    }
}

/// Keep a replicated entity moving on its last known input
fn extrapolate(world: &mut World, entity: Entity, locator: &CollisionLocator) -> Result<(), SimError> {
    let World {
        positions,
        previous_positions,
        velocities,
        inputs,
        collisions,
        ..
    } = world;
    let (Some(input), Some(position), Some(velocity)) =
        (inputs.get(entity), positions.get_mut(entity), velocities.get_mut(entity))
    else {
        return Ok(());
    };
    let collision = collisions
        .get_mut(entity)
        .ok_or(SimError::MissingComponent(entity, "Collision"))?;
    previous_positions.insert(entity, PreviousPosition(position.0));
    movement::step(input, position, velocity, collision, locator);
    Ok(())
}
