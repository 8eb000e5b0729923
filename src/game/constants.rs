/// Fixed-tick simulation constants
pub mod sim {
    /// Simulation tick rate in Hz
    pub const TICK_RATE: u32 = 30;
    /// Seconds per tick
    pub const TIMESTEP_S: f64 = 1.0 / TICK_RATE as f64;
    /// Tick duration in microseconds
    pub const TICK_DURATION_US: u64 = 1_000_000 / TICK_RATE as u64;
    /// Network heartbeat rate in Hz (send task)
    pub const NETWORK_TICK_RATE: u32 = 30;
    /// Upper bound on ticks processed in a single loop pass before the
    /// scheduler drops accumulated time
    pub const MAX_TICKS_PER_PASS: u32 = 8;
}

/// Movement integration constants
pub mod movement {
    use super::sim::TICK_RATE;

    /// Fixed timestep used by every integration step (prediction and replay alike)
    pub const TIMESTEP: f32 = 1.0 / TICK_RATE as f32;
    /// World units per second while an axis key is held
    pub const RUN_SPEED: f32 = 30.0;
    /// Player collision cylinder radius
    pub const PLAYER_RADIUS: f32 = 8.0;
    /// Player collision cylinder height
    pub const PLAYER_HEIGHT: f32 = 24.0;
    /// Tolerance for "ray starts inside volume" and float snapping after resolution
    pub const COLLISION_EPSILON: f32 = 0.001;
}

/// Tile map and grid geometry
pub mod world {
    /// Width (and depth) of a tile in world units
    pub const TILE_WORLD_WIDTH: f32 = 32.0;
    /// Height of one tile level in world units
    pub const TILE_WORLD_HEIGHT: f32 = 32.0;
    /// Width of a chunk in tiles
    pub const CHUNK_WIDTH: u32 = 16;
    /// Max number of layers stored per tile
    pub const MAX_TILE_LAYERS: usize = 4;
    /// Number of tile levels in the Z direction the grid covers
    pub const WORLD_LEVELS: u32 = 1;
    /// Default map size in tiles
    pub const DEFAULT_WIDTH_TILES: u32 = 64;
    pub const DEFAULT_HEIGHT_TILES: u32 = 64;
    /// Spatial grid cell width in tiles (x/y)
    pub const CELL_WIDTH_TILES: u32 = 4;
    /// Offset applied when flooring a volume's max edge so a volume exactly
    /// touching a cell boundary is not counted in the next cell
    pub const CELL_EXTENT_EPSILON: f32 = 0.0001;
    /// Max entries in a chunk snapshot palette
    pub const MAX_PALETTE_ENTRIES: usize = 255;
}

/// Network protocol constants
pub mod net {
    /// Max bytes handed to a single peer send call
    pub const MAX_WIRE_SIZE: usize = 1450;
    /// Messages smaller than this are received into the fixed small buffer
    pub const SMALL_MESSAGE_THRESHOLD: usize = MAX_WIRE_SIZE;
    /// Batch payloads at or above this size are lz4 compressed
    pub const COMPRESSION_THRESHOLD: usize = 512;
    /// Largest batch payload representable in the header size field
    pub const MAX_BATCH_SIZE: usize = 0x7FFF;
    /// Set in the header size field when the batch payload is compressed
    pub const COMPRESSED_FLAG: u16 = 0x8000;
    /// Largest single message payload accepted from a peer
    pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;
    /// Number of pooled large-message buffers per session
    pub const LARGE_BUFFER_POOL_SIZE: usize = 4;
    /// Receive timeout before a silent peer is dropped (ms)
    pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
    /// Poll interval for blocking receives (ms)
    pub const RECEIVE_POLL_MS: u64 = 50;
}

/// Tick synchronisation constants
pub mod sync {
    /// Tick-indexed sorter window (W)
    pub const SEQUENCER_WINDOW: usize = 10;
    /// Client-side replication window for NPC movement updates
    pub const REPLICATION_WINDOW: usize = 32;
    /// Length of the per-connection tick-diff history
    pub const TICKDIFF_HISTORY_LENGTH: usize = 20;
    /// Fresh samples required before an adjustment is considered
    pub const MIN_FRESH_DIFFS: usize = 3;
    /// Desired (receivedTick - expectedTick), i.e. inputs arrive this many ticks early
    pub const TICKDIFF_TARGET: i32 = 3;
    /// Inclusive acceptable band around the target
    pub const TICKDIFF_ACCEPTABLE_LOW: i32 = 1;
    pub const TICKDIFF_ACCEPTABLE_HIGH: i32 = 5;
    /// Length of the client input history ring buffer
    pub const INPUT_HISTORY_LENGTH: usize = 20;
}

/// Area-of-interest constants
pub mod aoi {
    /// Default AOI radius in world units
    pub const DEFAULT_RADIUS: f32 = 1600.0;
    /// Half-height of the AOI query cylinder
    pub const HALF_HEIGHT: f32 = 512.0;
    /// Chunks around the client's chunk that get streamed (1 = 3x3)
    pub const CHUNK_STREAM_RADIUS: u32 = 1;
}
