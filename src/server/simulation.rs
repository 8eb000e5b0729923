//! Authoritative simulation state and the per-tick system order

use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::network::ServerNetwork;
use super::systems;
use crate::config::ServerConfig;
use crate::game::constants::world::WORLD_LEVELS;
use crate::game::registry::{Entity, World};
use crate::game::spatial::{CollisionLocator, EntityLocator};
use crate::game::tile_map::{SpriteDataMap, TileMap};
use crate::game::{SimError, Tick};
use crate::metrics::Metrics;
use crate::net::aoi::AoiConfig;
use crate::net::NetworkId;

pub struct ServerSimulation {
    pub world: World,
    pub tile_map: TileMap,
    pub sprites: SpriteDataMap,
    pub entity_locator: EntityLocator,
    pub collision_locator: CollisionLocator,
    pub aoi: AoiConfig,
    /// Tick being processed. Every tick before it is complete.
    pub current_tick: Tick,
    /// Entity of each connected client
    pub clients: HashMap<NetworkId, Entity>,
    pub metrics: Arc<Metrics>,
    pub rng: StdRng,
}

impl ServerSimulation {
    pub fn new(config: &ServerConfig, metrics: Arc<Metrics>) -> Result<Self, SimError> {
        Self::with_rng(config, metrics, StdRng::from_entropy())
    }

    /// Deterministic world generation and spawn points
    pub fn with_rng(config: &ServerConfig, metrics: Arc<Metrics>, mut rng: StdRng) -> Result<Self, SimError> {
        let tile_map = TileMap::generate(
            config.world_width_tiles,
            config.world_height_tiles,
            WORLD_LEVELS,
            config.crate_count,
            &mut rng,
        );
        let sprites = SpriteDataMap::with_defaults();

        let mut entity_locator = EntityLocator::new();
        entity_locator.set_grid_size(tile_map.extent())?;
        let mut collision_locator = CollisionLocator::new();
        collision_locator.set_grid_size(tile_map.extent())?;
        tile_map.sync_all_collision(&sprites, &mut collision_locator)?;

        info!(
            "Generated {}x{} tile map with {} collision volumes",
            config.world_width_tiles,
            config.world_height_tiles,
            collision_locator.len()
        );

        Ok(Self {
            world: World::new(),
            tile_map,
            sprites,
            entity_locator,
            collision_locator,
            aoi: AoiConfig { radius: config.aoi_radius },
            current_tick: 0,
            clients: HashMap::new(),
            metrics,
            rng,
        })
    }

    /// Last tick whose results may be sent to clients
    pub fn latest_processed(&self) -> Tick {
        self.current_tick.wrapping_sub(1)
    }

    /// Run one simulation tick
    pub fn tick(&mut self, network: &mut ServerNetwork) -> Result<(), SimError> {
        let start = Instant::now();

        let events = network.poll_connection_events();
        systems::connection::process_events(self, network, events)?;
        systems::input::process_dropped_inputs(self, network.poll_dropped_inputs())?;
        systems::input::apply_inputs(self, network)?;
        systems::input::process_tile_requests(self, network.poll_tile_requests())?;
        systems::movement::update(self)?;
        systems::client_update::update(self, network)?;
        self.world.movement_dirty.clear();

        self.current_tick = self.current_tick.wrapping_add(1);
        network.set_current_tick(self.current_tick);

        self.metrics.record_tick_time(start.elapsed());
        self.metrics
            .current_tick
            .store(self.current_tick as u64, Ordering::Relaxed);
        self.metrics
            .entity_count
            .store(self.world.entity_count() as u64, Ordering::Relaxed);
        Ok(())
    }
}
