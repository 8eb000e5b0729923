//! Tile map, sprite metadata and palette-compressed chunk snapshots

use crate::game::constants::world::{CHUNK_WIDTH, MAX_PALETTE_ENTRIES, MAX_TILE_LAYERS, TILE_WORLD_WIDTH};
use crate::game::spatial::{BoundingBox, ChunkExtent, CollisionLocator, TileExtent, TilePosition};
use crate::game::SimError;
use crate::util::vec3::Vec3;
use hashbrown::HashMap;
use rand::Rng;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, error};

pub type SpriteId = u16;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChunkError {
    #[error("Chunk ({0}, {1}) ran out of palette entries")]
    PaletteExhausted(i32, i32),
    #[error("Tile {0:?} is outside the map")]
    TileOutOfBounds(TilePosition),
    #[error("Tile {0:?} has no free layer slot")]
    TooManyLayers(TilePosition),
    #[error("Malformed chunk snapshot: {0}")]
    MalformedSnapshot(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TileLayerType {
    Floor = 0,
    Wall = 1,
    Object = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileLayer {
    pub layer_type: TileLayerType,
    pub sprite_id: SpriteId,
}

impl TileLayer {
    pub const fn new(layer_type: TileLayerType, sprite_id: SpriteId) -> Self {
        Self { layer_type, sprite_id }
    }
}

pub type TileLayers = SmallVec<[TileLayer; MAX_TILE_LAYERS]>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tile {
    pub layers: TileLayers,
}

// ============================================================================
// Sprite Data
// ============================================================================

/// Metadata the simulation needs about a sprite
#[derive(Debug, Clone, PartialEq)]
pub struct SpriteData {
    pub numeric_id: SpriteId,
    pub string_id: String,
    pub collision_enabled: bool,
    /// Collision bounds relative to the tile's minimum corner
    pub model_bounds: BoundingBox,
}

/// Lookup of sprite metadata by numeric or string id
#[derive(Debug, Default)]
pub struct SpriteDataMap {
    sprites: HashMap<SpriteId, SpriteData>,
    string_ids: HashMap<String, SpriteId>,
}

pub mod sprites {
    use super::SpriteId;

    pub const GRASS: SpriteId = 1;
    pub const STONE_WALL: SpriteId = 2;
    pub const CRATE: SpriteId = 3;
}

impl SpriteDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in sprite set the default world is generated from
    pub fn with_defaults() -> Self {
        let full_tile = BoundingBox::new(Vec3::ZERO, Vec3::new(TILE_WORLD_WIDTH, TILE_WORLD_WIDTH, TILE_WORLD_WIDTH));
        let half = TILE_WORLD_WIDTH / 2.0;
        let quarter = TILE_WORLD_WIDTH / 4.0;

        let mut map = Self::new();
        map.insert(SpriteData {
            numeric_id: sprites::GRASS,
            string_id: "floor_grass".to_string(),
            collision_enabled: false,
            model_bounds: BoundingBox::default(),
        });
        map.insert(SpriteData {
            numeric_id: sprites::STONE_WALL,
            string_id: "wall_stone".to_string(),
            collision_enabled: true,
            model_bounds: full_tile,
        });
        map.insert(SpriteData {
            numeric_id: sprites::CRATE,
            string_id: "object_crate".to_string(),
            collision_enabled: true,
            model_bounds: BoundingBox::new(
                Vec3::new(quarter, quarter, 0.0),
                Vec3::new(quarter + half, quarter + half, half),
            ),
        });
        map
    }

    pub fn insert(&mut self, data: SpriteData) {
        self.string_ids.insert(data.string_id.clone(), data.numeric_id);
        self.sprites.insert(data.numeric_id, data);
    }

    /// Unknown ids are an invariant violation
    pub fn get(&self, numeric_id: SpriteId) -> Result<&SpriteData, SimError> {
        self.sprites.get(&numeric_id).ok_or(SimError::UnknownSprite(numeric_id))
    }

    pub fn get_by_string_id(&self, string_id: &str) -> Result<&SpriteData, SimError> {
        self.string_ids
            .get(string_id)
            .and_then(|id| self.sprites.get(id))
            .ok_or_else(|| SimError::UnknownSpriteName(string_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.sprites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sprites.is_empty()
    }
}

// ============================================================================
// Chunk Snapshots
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaletteEntry {
    pub layer_type: TileLayerType,
    pub sprite_id: SpriteId,
}

/// Tile layers of one chunk. Each tile stores a layer count followed (in
/// `indices`) by that many palette indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    pub chunk_x: i32,
    pub chunk_y: i32,
    pub chunk_z: i32,
    pub palette: Vec<PaletteEntry>,
    pub layer_counts: Vec<u8>,
    pub indices: Vec<u8>,
}

// ============================================================================
// Tile Map
// ============================================================================

#[derive(Debug, Clone)]
pub struct TileMap {
    extent: TileExtent,
    tiles: Vec<Tile>,
    dirty_tiles: FxHashSet<TilePosition>,
}

impl TileMap {
    pub fn new(width: u32, height: u32, levels: u32) -> Self {
        let extent = TileExtent::new(0, 0, 0, width as i32, height as i32, levels as i32);
        Self {
            extent,
            tiles: vec![Tile::default(); (width * height * levels) as usize],
            dirty_tiles: FxHashSet::default(),
        }
    }

    /// Grass everywhere, walls around the border and a scattering of crates
    pub fn generate(width: u32, height: u32, levels: u32, crate_count: usize, rng: &mut impl Rng) -> Self {
        let mut map = Self::new(width, height, levels);
        let floor = TileLayer::new(TileLayerType::Floor, sprites::GRASS);
        let wall = TileLayer::new(TileLayerType::Wall, sprites::STONE_WALL);

        for position in map.extent.positions().collect::<Vec<_>>() {
            let index = map.linear_index(position);
            let tile = &mut map.tiles[index];
            tile.layers.push(floor);
            let on_border = position.x == 0
                || position.y == 0
                || position.x == width as i32 - 1
                || position.y == height as i32 - 1;
            if on_border {
                tile.layers.push(wall);
            }
        }

        if width > 2 && height > 2 {
            for _ in 0..crate_count {
                let position = TilePosition::new(
                    rng.gen_range(1..width as i32 - 1),
                    rng.gen_range(1..height as i32 - 1),
                    0,
                );
                let index = map.linear_index(position);
                let tile = &mut map.tiles[index];
                if tile.layers.len() == 1 {
                    tile.layers.push(TileLayer::new(TileLayerType::Object, sprites::CRATE));
                }
            }
        }

        map
    }

    #[inline]
    pub fn extent(&self) -> TileExtent {
        self.extent
    }

    /// Chunks needed to cover the map
    pub fn chunk_extent(&self) -> ChunkExtent {
        let width = CHUNK_WIDTH as i32;
        ChunkExtent::new(
            0,
            0,
            0,
            (self.extent.x_length + width - 1) / width,
            (self.extent.y_length + width - 1) / width,
            self.extent.z_length,
        )
    }

    #[inline]
    fn linear_index(&self, position: TilePosition) -> usize {
        ((position.z * self.extent.y_length + position.y) * self.extent.x_length + position.x) as usize
    }

    pub fn get(&self, position: TilePosition) -> Option<&Tile> {
        if self.extent.contains(position) {
            Some(&self.tiles[self.linear_index(position)])
        } else {
            None
        }
    }

    fn get_mut(&mut self, position: TilePosition) -> Result<&mut Tile, ChunkError> {
        if !self.extent.contains(position) {
            return Err(ChunkError::TileOutOfBounds(position));
        }
        let index = self.linear_index(position);
        Ok(&mut self.tiles[index])
    }

    pub fn add_layer(&mut self, position: TilePosition, layer: TileLayer) -> Result<(), ChunkError> {
        let tile = self.get_mut(position)?;
        if tile.layers.len() >= MAX_TILE_LAYERS {
            return Err(ChunkError::TooManyLayers(position));
        }
        tile.layers.push(layer);
        self.dirty_tiles.insert(position);
        Ok(())
    }

    /// Replace every layer of a tile
    pub fn set_layers(&mut self, position: TilePosition, layers: &[TileLayer]) -> Result<(), ChunkError> {
        if layers.len() > MAX_TILE_LAYERS {
            return Err(ChunkError::TooManyLayers(position));
        }
        let tile = self.get_mut(position)?;
        tile.layers.clear();
        tile.layers.extend_from_slice(layers);
        self.dirty_tiles.insert(position);
        Ok(())
    }

    pub fn clear_tile(&mut self, position: TilePosition) -> Result<(), ChunkError> {
        self.set_layers(position, &[])
    }

    /// Tiles edited since the last call, sorted
    pub fn take_dirty_tiles(&mut self) -> Vec<TilePosition> {
        let mut dirty: Vec<TilePosition> = self.dirty_tiles.drain().collect();
        dirty.sort_unstable();
        dirty
    }

    pub fn has_dirty_tiles(&self) -> bool {
        !self.dirty_tiles.is_empty()
    }

    fn chunk_tiles(&self, chunk_x: i32, chunk_y: i32, chunk_z: i32) -> TileExtent {
        ChunkExtent::new(chunk_x, chunk_y, chunk_z, 1, 1, 1)
            .to_tile_extent()
            .intersection(&self.extent)
    }

    /// Palette-compress one chunk's tiles
    pub fn snapshot_chunk(&self, chunk_x: i32, chunk_y: i32, chunk_z: i32) -> Result<ChunkSnapshot, ChunkError> {
        let tiles = self.chunk_tiles(chunk_x, chunk_y, chunk_z);
        let mut palette: Vec<PaletteEntry> = Vec::new();
        let mut palette_lookup: HashMap<PaletteEntry, u8> = HashMap::new();
        let mut layer_counts = Vec::with_capacity((tiles.x_length * tiles.y_length).max(0) as usize);
        let mut indices = Vec::new();

        for position in tiles.positions() {
            let tile = &self.tiles[self.linear_index(position)];
            layer_counts.push(tile.layers.len() as u8);

            for layer in &tile.layers {
                let entry = PaletteEntry {
                    layer_type: layer.layer_type,
                    sprite_id: layer.sprite_id,
                };
                let index = match palette_lookup.get(&entry) {
                    Some(index) => *index,
                    None => {
                        if palette.len() >= MAX_PALETTE_ENTRIES {
                            error!("Palette exhausted while serializing chunk ({}, {})", chunk_x, chunk_y);
                            return Err(ChunkError::PaletteExhausted(chunk_x, chunk_y));
                        }
                        let index = palette.len() as u8;
                        palette.push(entry);
                        palette_lookup.insert(entry, index);
                        index
                    }
                };
                indices.push(index);
            }
        }

        Ok(ChunkSnapshot {
            chunk_x,
            chunk_y,
            chunk_z,
            palette,
            layer_counts,
            indices,
        })
    }

    /// Rewrite a chunk's tiles from a snapshot. Every rewritten tile is marked dirty.
    pub fn apply_snapshot(&mut self, snapshot: &ChunkSnapshot) -> Result<(), ChunkError> {
        let tiles = self.chunk_tiles(snapshot.chunk_x, snapshot.chunk_y, snapshot.chunk_z);
        let positions: Vec<TilePosition> = tiles.positions().collect();
        if positions.len() != snapshot.layer_counts.len() {
            return Err(ChunkError::MalformedSnapshot("layer count length mismatch"));
        }
        let total: usize = snapshot.layer_counts.iter().map(|count| *count as usize).sum();
        if total != snapshot.indices.len() {
            return Err(ChunkError::MalformedSnapshot("index count mismatch"));
        }

        let mut next_index = 0;
        for (position, count) in positions.into_iter().zip(&snapshot.layer_counts) {
            let count = *count as usize;
            if count > MAX_TILE_LAYERS {
                return Err(ChunkError::TooManyLayers(position));
            }

            let mut layers = TileLayers::new();
            for palette_index in &snapshot.indices[next_index..next_index + count] {
                let entry = snapshot
                    .palette
                    .get(*palette_index as usize)
                    .ok_or(ChunkError::MalformedSnapshot("palette index out of range"))?;
                layers.push(TileLayer::new(entry.layer_type, entry.sprite_id));
            }
            next_index += count;

            let index = self.linear_index(position);
            self.tiles[index].layers = layers;
            self.dirty_tiles.insert(position);
        }

        debug!("Applied chunk ({}, {}) snapshot", snapshot.chunk_x, snapshot.chunk_y);
        Ok(())
    }

    /// Re-register a tile's collision volumes: every wall or object layer whose
    /// sprite has collision enabled.
    pub fn sync_collision(
        &self,
        position: TilePosition,
        sprites: &SpriteDataMap,
        locator: &mut CollisionLocator,
    ) -> Result<(), SimError> {
        locator.clear_tile(position);
        let Some(tile) = self.get(position) else {
            return Ok(());
        };

        let tile_origin = position.world_bounds().min;
        for (layer_index, layer) in tile.layers.iter().enumerate() {
            if layer.layer_type == TileLayerType::Floor {
                continue;
            }
            let sprite = sprites.get(layer.sprite_id)?;
            if !sprite.collision_enabled {
                continue;
            }
            let volume = sprite.model_bounds.translated(tile_origin);
            // Out-of-bounds volumes are logged by the locator and left untracked
            let _ = locator.update_tile_layer(position, layer_index as u8, volume);
        }
        Ok(())
    }

    /// Register collision volumes for the whole map
    pub fn sync_all_collision(&self, sprites: &SpriteDataMap, locator: &mut CollisionLocator) -> Result<(), SimError> {
        for position in self.extent.positions() {
            self.sync_collision(position, sprites, locator)?;
        }
        Ok(())
    }
}
