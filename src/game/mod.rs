pub mod components;
pub mod constants;
pub mod movement;
pub mod registry;
pub mod spatial;
pub mod tick_loop;
pub mod tile_map;

use crate::game::registry::Entity;
use crate::game::spatial::SpatialError;
use crate::game::tile_map::{ChunkError, SpriteId};
use crate::net::{NetworkError, NetworkId};

pub type Tick = u32;

/// Invariant violations on the simulation thread.
///
/// None of these are recoverable in-process: they propagate to the run loop,
/// which logs them and terminates.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Entity {entity} for connection {network_id} is missing")]
    MissingClientEntity { network_id: NetworkId, entity: Entity },
    #[error("Entity {0} has no {1} component")]
    MissingComponent(Entity, &'static str),
    #[error("Unknown sprite id {0}")]
    UnknownSprite(SpriteId),
    #[error("Unknown sprite string id '{0}'")]
    UnknownSpriteName(String),
    #[error(
        "Input history too short: update for tick {update_tick} is {offset} ticks old at tick {current_tick} (history length {history_length})"
    )]
    HistoryTooShort {
        update_tick: Tick,
        current_tick: Tick,
        offset: u32,
        history_length: usize,
    },
    #[error("Movement update for tick {tick} arrived after an update for tick {previous_tick}")]
    UpdateOutOfOrder { tick: Tick, previous_tick: Tick },
    #[error("Movement update for tick {tick} is ahead of current tick {current_tick}")]
    UpdateFromFuture { tick: Tick, current_tick: Tick },
    #[error("Map chunk error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("Spatial error: {0}")]
    Spatial(#[from] SpatialError),
    #[error("Batch for connection {network_id} does not fit the wire limits: {source}")]
    OversizedBatch { network_id: NetworkId, source: NetworkError },
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}
